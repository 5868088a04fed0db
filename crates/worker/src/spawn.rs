//! Task and thread spawning tagged with the runtime half that owns the work.

use std::future::Future;
use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime};
use tokio::task::JoinHandle;

/// Execution classes used for thread naming and observability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskClass {
	/// Scheduler worker threads draining actor mailboxes.
	ActorWorker,
	/// Async tasks driving one stream stage.
	StreamStage,
}

impl TaskClass {
	pub const fn as_str(self) -> &'static str {
		match self {
			Self::ActorWorker => "actor_worker",
			Self::StreamStage => "stream_stage",
		}
	}
}

static FALLBACK: OnceLock<Runtime> = OnceLock::new();

/// Current Tokio context, or a shared two-thread runtime built on first use.
fn handle() -> Handle {
	Handle::try_current().unwrap_or_else(|_| {
		FALLBACK
			.get_or_init(|| {
				Builder::new_multi_thread()
					.enable_all()
					.worker_threads(2)
					.thread_name("trellis-fallback")
					.build()
					.expect("trellis fallback runtime must build")
			})
			.handle()
			.clone()
	})
}

/// Spawns an async task tagged with its execution class.
///
/// Outside a Tokio context the task lands on the fallback runtime, so stream
/// stages can be launched from scheduler worker threads.
pub fn spawn<F>(class: TaskClass, fut: F) -> JoinHandle<F::Output>
where
	F: Future + Send + 'static,
	F::Output: Send + 'static,
{
	tracing::trace!(worker_class = class.as_str(), "worker.spawn");
	handle().spawn(fut)
}

/// Spawns a dedicated named OS thread tagged with its execution class.
pub fn spawn_named_thread<F, R>(class: TaskClass, name: impl Into<String>, f: F) -> std::io::Result<std::thread::JoinHandle<R>>
where
	F: FnOnce() -> R + Send + 'static,
	R: Send + 'static,
{
	let name = name.into();
	tracing::trace!(worker_class = class.as_str(), thread = %name, "worker.spawn_named_thread");
	std::thread::Builder::new().name(name).spawn(f)
}
