use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};

/// Queue advancement directive returned for each examined mailbox item.
///
/// The directive alone decides whether the examined item leaves the queue:
/// everything except [`TaskResult::Skip`] removes it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, FromRepr, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum TaskResult {
	/// Remove the item and continue with the next one.
	Resume = 0,
	/// Leave the item in place and continue past it.
	Skip = 1,
	/// Remove the item and end the current tier's round.
	Stop = 2,
	/// Remove the item and end the round of this tier and every tier after it.
	StopAll = 3,
}

crate::impl_enum_codec!(TaskResult, "task_result");

impl TaskResult {
	/// Whether the examined item leaves the queue.
	pub const fn removes_item(self) -> bool {
		!matches!(self, Self::Skip)
	}

	/// Whether the current tier's round ends after this item.
	pub const fn halts_round(self) -> bool {
		matches!(self, Self::Stop | Self::StopAll)
	}
}

#[cfg(test)]
mod tests {
	use strum::IntoEnumIterator;

	use super::*;
	use crate::codec::{CodecError, EnumCodec};

	#[test]
	fn name_round_trip_for_every_value() {
		for value in TaskResult::iter() {
			assert_eq!(TaskResult::from_name(value.name()), Ok(value));
			assert_eq!(value.to_string(), value.name());
		}
	}

	#[test]
	fn code_round_trip_for_every_value() {
		for value in TaskResult::iter() {
			assert_eq!(TaskResult::from_code(value.code()), Ok(value));
		}
		assert_eq!(TaskResult::StopAll.code(), 3);
		assert_eq!(TaskResult::Resume.code(), 0);
	}

	#[test]
	fn names_are_stable() {
		assert_eq!(TaskResult::Resume.name(), "resume");
		assert_eq!(TaskResult::Skip.name(), "skip");
		assert_eq!(TaskResult::Stop.name(), "stop");
		assert_eq!(TaskResult::StopAll.name(), "stop_all");
	}

	#[test]
	fn unknown_name_fails_without_a_value() {
		let previous = TaskResult::Skip;
		let mut out = previous;
		if let Ok(parsed) = TaskResult::from_name("Resume") {
			out = parsed;
		}
		assert_eq!(out, previous);
		assert_eq!(
			TaskResult::from_name("stopall"),
			Err(CodecError::UnknownName {
				kind: "task_result",
				name: "stopall".to_owned(),
			})
		);
		assert!(TaskResult::from_name("").is_err());
	}

	#[test]
	fn codes_outside_range_fail_distinguishably() {
		for code in 4..=u8::MAX {
			assert_eq!(TaskResult::from_code(code), Err(CodecError::UnknownCode { kind: "task_result", code }));
		}
	}

	#[test]
	fn only_skip_keeps_the_item() {
		assert!(TaskResult::Resume.removes_item());
		assert!(!TaskResult::Skip.removes_item());
		assert!(TaskResult::Stop.removes_item() && TaskResult::Stop.halts_round());
		assert!(TaskResult::StopAll.removes_item() && TaskResult::StopAll.halts_round());
		assert!(!TaskResult::Resume.halts_round());
	}
}
