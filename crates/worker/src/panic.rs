use std::any::Any;

use tokio::task::JoinError;

/// Renders a panic payload as text.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
	if let Some(msg) = payload.downcast_ref::<&'static str>() {
		(*msg).to_owned()
	} else if let Some(msg) = payload.downcast_ref::<String>() {
		msg.clone()
	} else {
		"non-string panic payload".to_owned()
	}
}

/// Extracts the panic message from a failed join, `None` if the task was cancelled.
pub fn join_error_panic_message(err: JoinError) -> Option<String> {
	err.try_into_panic().ok().map(|payload| panic_message(payload.as_ref()))
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn renders_str_and_string_payloads() {
		let payload = std::panic::catch_unwind(|| panic!("boom-str")).expect_err("panics");
		assert_eq!(panic_message(payload.as_ref()), "boom-str");

		let payload = std::panic::catch_unwind(|| panic!("{}", String::from("boom-string"))).expect_err("panics");
		assert_eq!(panic_message(payload.as_ref()), "boom-string");

		let payload = std::panic::catch_unwind(|| std::panic::panic_any(7_u32)).expect_err("panics");
		assert_eq!(panic_message(payload.as_ref()), "non-string panic payload");
	}

	#[tokio::test]
	#[allow(clippy::disallowed_methods)]
	async fn extracts_message_from_join_error() {
		let handle = tokio::spawn(async { panic!("boom-join") });
		let err = handle.await.expect_err("task panics");
		let msg = join_error_panic_message(err).expect("should be a panic");
		assert!(msg.contains("boom-join"), "expected 'boom-join', got: {msg}");
	}

	#[tokio::test]
	#[allow(clippy::disallowed_methods)]
	async fn returns_none_for_cancellation() {
		let handle = tokio::spawn(std::future::pending::<()>());
		handle.abort();
		let err = handle.await.expect_err("task aborted");
		assert!(join_error_panic_message(err).is_none(), "cancelled task should return None");
	}
}
