//! Fixed worker pool resuming ready actors in bounded quanta.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread;

use parking_lot::{Condvar, Mutex};
use serde::Deserialize;

use crate::actor::{ActorCell, ActorExit, ActorRef, ActorShared, Behavior, Resumable, Resumption};
use crate::budget::DrainBudget;
use crate::fault::{FaultBus, FaultReceiver};
use crate::id::{ActorId, IdClock};
use crate::mailbox::{ConsumptionPolicy, Mailbox};
use crate::registry::{ActorRecord, ActorTable};
use crate::{TaskClass, spawn_named_thread};

/// Worker pool configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
	/// Number of worker threads.
	pub workers: usize,
	/// Fairness quantum applied to every resumption.
	pub quantum: DrainBudget,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			workers: 4,
			quantum: DrainBudget::default(),
		}
	}
}

impl SchedulerConfig {
	/// Sets the worker thread count.
	///
	/// # Panics
	///
	/// Panics if `workers` is zero.
	#[must_use]
	pub fn workers(mut self, workers: usize) -> Self {
		assert!(workers > 0, "scheduler needs at least one worker");
		self.workers = workers;
		self
	}

	/// Sets the fairness quantum.
	///
	/// # Panics
	///
	/// Panics if the quantum allows no message or has a zero duration.
	#[must_use]
	pub fn quantum(mut self, quantum: DrainBudget) -> Self {
		if let Err(err) = quantum.check() {
			panic!("{err}");
		}
		self.quantum = quantum;
		self
	}
}

struct ReadyState {
	queue: VecDeque<ActorId>,
	shutdown: bool,
}

/// FIFO of actors waiting for a worker.
pub(crate) struct ReadyQueue {
	state: Mutex<ReadyState>,
	available: Condvar,
}

impl ReadyQueue {
	pub(crate) fn new() -> Self {
		Self {
			state: Mutex::new(ReadyState {
				queue: VecDeque::new(),
				shutdown: false,
			}),
			available: Condvar::new(),
		}
	}

	pub(crate) fn push(&self, id: ActorId) {
		let mut state = self.state.lock();
		if state.shutdown {
			return;
		}
		state.queue.push_back(id);
		drop(state);
		self.available.notify_one();
	}

	/// Blocks until an actor is ready. `None` once shut down.
	pub(crate) fn pop(&self) -> Option<ActorId> {
		let mut state = self.state.lock();
		loop {
			if state.shutdown {
				return None;
			}
			if let Some(id) = state.queue.pop_front() {
				return Some(id);
			}
			self.available.wait(&mut state);
		}
	}

	#[cfg(test)]
	pub(crate) fn try_pop(&self) -> Option<ActorId> {
		self.state.lock().queue.pop_front()
	}

	pub(crate) fn shutdown(&self) {
		let mut state = self.state.lock();
		state.shutdown = true;
		state.queue.clear();
		drop(state);
		self.available.notify_all();
	}

	pub(crate) fn is_shutdown(&self) -> bool {
		self.state.lock().shutdown
	}
}

struct SchedulerInner {
	config: SchedulerConfig,
	ready: Arc<ReadyQueue>,
	actors: ActorTable,
	ids: IdClock,
	faults: FaultBus,
}

impl SchedulerInner {
	fn retire(&self, cell: &dyn Resumable, exit: &ActorExit) {
		self.actors.remove(cell.id());
		if let Some(fault) = exit.fault() {
			self.faults.publish(cell.entity(), fault.clone());
		}
	}
}

/// Cooperative actor scheduler over a fixed pool of named OS threads.
///
/// Each actor runs on at most one worker at a time; different actors run in
/// parallel. An actor that still has work after its quantum goes to the back
/// of the ready queue.
pub struct Scheduler {
	inner: Arc<SchedulerInner>,
	workers: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Scheduler {
	/// Starts the worker pool with a fresh fault bus.
	pub fn start(config: SchedulerConfig) -> std::io::Result<Self> {
		Self::with_fault_bus(config, FaultBus::default())
	}

	/// Starts the worker pool publishing terminations to `faults`.
	///
	/// # Panics
	///
	/// Panics if `config.workers` is zero or the quantum is empty.
	pub fn with_fault_bus(config: SchedulerConfig, faults: FaultBus) -> std::io::Result<Self> {
		assert!(config.workers > 0, "scheduler needs at least one worker");
		if let Err(err) = config.quantum.check() {
			panic!("{err}");
		}
		let inner = Arc::new(SchedulerInner {
			ready: Arc::new(ReadyQueue::new()),
			actors: ActorTable::default(),
			ids: IdClock::new(),
			faults,
			config,
		});
		let scheduler = Self {
			inner: Arc::clone(&inner),
			workers: Mutex::new(Vec::with_capacity(inner.config.workers)),
		};

		for index in 0..inner.config.workers {
			let worker = Arc::clone(&inner);
			let handle = spawn_named_thread(TaskClass::ActorWorker, format!("trellis-worker-{index}"), move || run_worker(&worker, index))?;
			scheduler.workers.lock().push(handle);
		}
		tracing::debug!(
			workers = inner.config.workers,
			quantum = inner.config.quantum.max_messages,
			"worker.scheduler.start"
		);
		Ok(scheduler)
	}

	pub fn config(&self) -> &SchedulerConfig {
		&self.inner.config
	}

	/// Registers a new actor and queues it for its first run.
	pub fn spawn<B: Behavior>(&self, name: impl Into<Arc<str>>, policy: ConsumptionPolicy, behavior: B) -> ActorRef<B::Msg> {
		let inner = &self.inner;
		let id = ActorId(inner.ids.next());
		let name = name.into();
		let shared = Arc::new(ActorShared::new(id, Arc::clone(&name), Mailbox::new(policy), Arc::clone(&inner.ready)));
		let cell: Arc<dyn Resumable> = Arc::new(ActorCell::new(Arc::clone(&shared), behavior, inner.ids.clone()));

		inner.actors.insert(Arc::clone(&cell));
		tracing::debug!(actor = %name, id = id.0, "worker.actor.spawn");
		if inner.ready.is_shutdown() {
			inner.actors.remove(id);
			cell.abandon();
		} else {
			inner.ready.push(id);
		}
		ActorRef::new(shared)
	}

	/// Re-admits an idle or blocked actor. Returns whether it was enqueued.
	pub fn wake(&self, id: ActorId) -> bool {
		self.inner.actors.get(id).is_some_and(|cell| cell.wake())
	}

	/// Requests termination of a live actor. Returns `false` for unknown ids.
	pub fn terminate(&self, id: ActorId) -> bool {
		let Some(cell) = self.inner.actors.get(id) else {
			return false;
		};
		cell.kill();
		true
	}

	/// Subscribes to fault terminations of actors run by this scheduler.
	pub fn subscribe(&self) -> FaultReceiver {
		self.inner.faults.subscribe()
	}

	pub fn fault_bus(&self) -> &FaultBus {
		&self.inner.faults
	}

	/// Snapshots of live actors sorted by name.
	pub fn snapshots(&self) -> Vec<ActorRecord> {
		self.inner.actors.snapshots()
	}

	/// Number of live actors.
	pub fn len(&self) -> usize {
		self.inner.actors.len()
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Stops the workers and terminates every remaining actor with
	/// [`ActorExitKind::Shutdown`](crate::ActorExitKind::Shutdown).
	///
	/// Running drains finish first. Idempotent.
	pub fn shutdown(&self) {
		self.inner.ready.shutdown();
		let workers = std::mem::take(&mut *self.workers.lock());
		let current = thread::current().id();
		for handle in workers {
			if handle.thread().id() == current {
				continue;
			}
			if handle.join().is_err() {
				tracing::warn!("worker.scheduler.worker_panicked");
			}
		}

		let remaining = self.inner.actors.take_all();
		let abandoned = remaining.iter().filter(|cell| cell.abandon().is_some()).count();
		tracing::debug!(abandoned, "worker.scheduler.shutdown");
	}
}

impl Drop for Scheduler {
	fn drop(&mut self) {
		self.shutdown();
	}
}

fn run_worker(inner: &SchedulerInner, index: usize) {
	tracing::trace!(worker = index, "worker.scheduler.worker_start");
	while let Some(id) = inner.ready.pop() {
		let Some(cell) = inner.actors.get(id) else {
			continue;
		};
		match cell.resume(&inner.config.quantum) {
			Resumption::Requeue => inner.ready.push(id),
			Resumption::Parked | Resumption::Blocked | Resumption::Skipped => {}
			Resumption::Terminated(exit) => inner.retire(cell.as_ref(), &exit),
		}
	}
	tracing::trace!(worker = index, "worker.scheduler.worker_exit");
}
