//! Actor behaviors, references and the per-actor cells workers resume.
//!
//! An actor is one [`Mailbox`] plus one [`Behavior`]. Scheduling state lives
//! in an atomic so producers, `wake` and the resuming worker agree on who
//! enqueues the actor next: every `Idle`/`Blocked` -> `Ready` move is a
//! compare-and-swap and only its winner pushes onto the ready queue.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};
use tokio::sync::watch;

use crate::budget::{DrainBudget, DrainHalt};
use crate::fault::{Entity, Fault, QueueFault};
use crate::id::{ActorId, CorrelationId, IdClock};
use crate::mailbox::{Envelope, Mailbox, MailboxSendError};
use crate::panic::panic_message;
use crate::scheduler::ReadyQueue;
use crate::task_result::TaskResult;

/// Message handling logic run by the scheduler.
///
/// `handle` receives each examined envelope and returns the [`TaskResult`]
/// deciding whether it leaves the mailbox. An `Err` terminates the actor with
/// a [`QueueFault`]; so does a panic.
pub trait Behavior: Send + 'static {
	type Msg: Send + 'static;

	fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), String> {
		Ok(())
	}

	fn handle(&mut self, envelope: &mut Envelope<Self::Msg>, ctx: &mut ActorContext) -> Result<TaskResult, String>;

	fn on_stop(&mut self, _ctx: &mut ActorContext) {}
}

/// Per-actor execution context handed to every behavior hook.
#[derive(Debug)]
pub struct ActorContext {
	id: ActorId,
	name: Arc<str>,
	ids: IdClock,
	awaiting: Option<CorrelationId>,
	stop_requested: bool,
}

impl ActorContext {
	pub(crate) fn new(id: ActorId, name: Arc<str>, ids: IdClock) -> Self {
		Self {
			id,
			name,
			ids,
			awaiting: None,
			stop_requested: false,
		}
	}

	pub fn id(&self) -> ActorId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Mints a correlation id unique within the runtime.
	pub fn next_correlation(&self) -> CorrelationId {
		CorrelationId(self.ids.next())
	}

	/// Parks the actor until an envelope correlated with `id` arrives.
	///
	/// Returns the directive to hand back from [`Behavior::handle`]. While
	/// waiting the actor is `Blocked` and ordinary arrivals do not wake it;
	/// on the next run the behavior typically skips everything but the
	/// response.
	pub fn await_response(&mut self, id: CorrelationId) -> TaskResult {
		self.awaiting = Some(id);
		TaskResult::StopAll
	}

	/// Correlation the actor is still waiting for, if any.
	pub fn awaiting(&self) -> Option<CorrelationId> {
		self.awaiting
	}

	/// Requests a normal exit after the current envelope.
	pub fn stop(&mut self) -> TaskResult {
		self.stop_requested = true;
		TaskResult::StopAll
	}
}

/// Scheduling state of one actor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, FromRepr, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum ActorState {
	/// Parked with nothing fresh to process.
	Idle = 0,
	/// Queued for a worker.
	Ready = 1,
	/// Held by a worker.
	Running = 2,
	/// Waiting for a correlated response.
	Blocked = 3,
	Terminated = 4,
}

crate::impl_enum_codec!(ActorState, "actor_state");

/// Exit classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ActorExitKind {
	/// The behavior called [`ActorContext::stop`].
	Stopped,
	/// [`Scheduler::terminate`](crate::Scheduler::terminate) was called.
	Killed,
	StartupFailed,
	/// The behavior failed or panicked while handling a message.
	Faulted,
	/// The scheduler shut down first.
	Shutdown,
}

/// Exit summary published once per actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorExit {
	kind: ActorExitKind,
	fault: Option<Fault>,
}

impl ActorExit {
	pub(crate) fn new(kind: ActorExitKind, fault: Option<Fault>) -> Self {
		Self { kind, fault }
	}

	pub fn kind(&self) -> ActorExitKind {
		self.kind
	}

	pub fn fault(&self) -> Option<&Fault> {
		self.fault.as_ref()
	}

	pub fn is_failure(&self) -> bool {
		matches!(self.kind, ActorExitKind::StartupFailed | ActorExitKind::Faulted)
	}
}

/// State shared between an actor's cell and every [`ActorRef`] to it.
pub(crate) struct ActorShared<M> {
	id: ActorId,
	name: Arc<str>,
	mailbox: Mailbox<M>,
	state: AtomicU8,
	/// Awaited correlation id, [`CorrelationId::NONE`] when not blocked.
	awaiting: AtomicU64,
	kill: AtomicBool,
	ready: Arc<ReadyQueue>,
	exit: watch::Sender<Option<ActorExit>>,
}

impl<M> ActorShared<M> {
	pub(crate) fn new(id: ActorId, name: Arc<str>, mailbox: Mailbox<M>, ready: Arc<ReadyQueue>) -> Self {
		let (exit, _) = watch::channel(None);
		Self {
			id,
			name,
			mailbox,
			state: AtomicU8::new(ActorState::Ready as u8),
			awaiting: AtomicU64::new(CorrelationId::NONE),
			kill: AtomicBool::new(false),
			ready,
			exit,
		}
	}

	fn state(&self) -> ActorState {
		ActorState::from_repr(self.state.load(Ordering::SeqCst)).unwrap_or(ActorState::Terminated)
	}

	fn set_state(&self, state: ActorState) {
		self.state.store(state as u8, Ordering::SeqCst);
	}

	fn transition(&self, from: ActorState, to: ActorState) -> bool {
		self.state.compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst).is_ok()
	}

	fn schedule_from(&self, from: ActorState) -> bool {
		if self.transition(from, ActorState::Ready) {
			self.ready.push(self.id);
			return true;
		}
		false
	}

	fn deliver(&self, envelope: Envelope<M>) -> Result<(), MailboxSendError<M>> {
		let correlation = envelope.correlation;
		self.mailbox.push(envelope)?;

		let awaited = self.awaiting.load(Ordering::SeqCst);
		let answers = awaited != CorrelationId::NONE && correlation.is_some_and(|c| c.0 == awaited);
		if !(answers && self.schedule_from(ActorState::Blocked)) {
			self.schedule_from(ActorState::Idle);
		}
		Ok(())
	}
}

/// Cloneable handle for sending to one actor.
pub struct ActorRef<M> {
	shared: Arc<ActorShared<M>>,
}

impl<M> Clone for ActorRef<M> {
	fn clone(&self) -> Self {
		Self {
			shared: Arc::clone(&self.shared),
		}
	}
}

impl<M> std::fmt::Debug for ActorRef<M> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("ActorRef").field("id", &self.shared.id).field("name", &self.shared.name).finish()
	}
}

impl<M> ActorRef<M> {
	pub(crate) fn new(shared: Arc<ActorShared<M>>) -> Self {
		Self { shared }
	}

	pub fn id(&self) -> ActorId {
		self.shared.id
	}

	pub fn name(&self) -> &str {
		&self.shared.name
	}

	/// Sends a normal-priority anonymous message.
	pub fn tell(&self, msg: M) -> Result<(), MailboxSendError<M>> {
		self.send(Envelope::new(msg))
	}

	/// Sends a fully addressed envelope, waking the actor when appropriate.
	pub fn send(&self, envelope: Envelope<M>) -> Result<(), MailboxSendError<M>> {
		self.shared.deliver(envelope)
	}

	pub fn state(&self) -> ActorState {
		self.shared.state()
	}

	/// Messages queued for this actor.
	pub fn pending(&self) -> usize {
		self.shared.mailbox.len()
	}

	/// Exit summary once the actor has terminated.
	pub fn exit(&self) -> Option<ActorExit> {
		self.shared.exit.borrow().clone()
	}

	/// Waits until the actor terminates.
	pub async fn terminated(&self) -> ActorExit {
		let mut rx = self.shared.exit.subscribe();
		let exit = rx.wait_for(Option::is_some).await.ok().and_then(|exit| (*exit).clone());
		exit.unwrap_or_else(|| ActorExit::new(ActorExitKind::Shutdown, None))
	}
}

/// Outcome of one [`Resumable::resume`] call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resumption {
	/// Still has work; the worker pushes it back onto the ready queue.
	Requeue,
	/// Went idle. A later arrival re-admits it.
	Parked,
	/// Waiting for a correlated response.
	Blocked,
	/// Stale ready-queue entry; the actor was not in `Ready`.
	Skipped,
	Terminated(ActorExit),
}

/// Type-erased per-actor hook the scheduler's workers drive.
pub trait Resumable: Send + Sync {
	fn id(&self) -> ActorId;

	fn entity(&self) -> Entity;

	fn state(&self) -> ActorState;

	fn pending(&self) -> usize;

	/// Runs one bounded drain cycle. Callers must only resume `Ready` actors.
	fn resume(&self, budget: &DrainBudget) -> Resumption;

	/// Re-admits an idle or blocked actor. Returns whether it was enqueued.
	fn wake(&self) -> bool;

	/// Requests termination at the next scheduling point.
	fn kill(&self);

	/// Terminates an actor that will never be resumed again.
	fn abandon(&self) -> Option<ActorExit>;
}

struct CellInner<B> {
	behavior: B,
	ctx: ActorContext,
	started: bool,
}

/// One actor as owned by the scheduler.
pub(crate) struct ActorCell<B: Behavior> {
	shared: Arc<ActorShared<B::Msg>>,
	inner: Mutex<CellInner<B>>,
}

impl<B: Behavior> ActorCell<B> {
	pub(crate) fn new(shared: Arc<ActorShared<B::Msg>>, behavior: B, ids: IdClock) -> Self {
		let ctx = ActorContext::new(shared.id, Arc::clone(&shared.name), ids);
		Self {
			shared,
			inner: Mutex::new(CellInner {
				behavior,
				ctx,
				started: false,
			}),
		}
	}

	fn finish(&self, inner: &mut CellInner<B>, kind: ActorExitKind, fault: Option<Fault>) -> Resumption {
		let shared = &self.shared;
		let discarded = shared.mailbox.close();
		if inner.started {
			let CellInner { behavior, ctx, .. } = &mut *inner;
			if let Err(payload) = catch_unwind(AssertUnwindSafe(|| behavior.on_stop(ctx))) {
				tracing::warn!(actor = %shared.name, panic = %panic_message(payload.as_ref()), "worker.actor.on_stop_panicked");
			}
		}
		shared.awaiting.store(CorrelationId::NONE, Ordering::SeqCst);
		shared.set_state(ActorState::Terminated);

		let exit = ActorExit::new(kind, fault);
		shared.exit.send_replace(Some(exit.clone()));
		tracing::debug!(actor = %shared.name, id = shared.id.0, kind = ?kind, discarded, "worker.actor.exit");
		Resumption::Terminated(exit)
	}

	/// Parks after a drain, re-admitting the actor if work raced in.
	fn park(&self, state: ActorState, recheck: impl Fn() -> bool) -> Resumption {
		let shared = &self.shared;
		shared.set_state(state);
		if (recheck() || shared.kill.load(Ordering::SeqCst)) && shared.transition(state, ActorState::Ready) {
			return Resumption::Requeue;
		}
		match state {
			ActorState::Blocked => Resumption::Blocked,
			_ => Resumption::Parked,
		}
	}
}

impl<B: Behavior> Resumable for ActorCell<B> {
	fn id(&self) -> ActorId {
		self.shared.id
	}

	fn entity(&self) -> Entity {
		Entity::actor(self.shared.id, Arc::clone(&self.shared.name))
	}

	fn state(&self) -> ActorState {
		self.shared.state()
	}

	fn pending(&self) -> usize {
		self.shared.mailbox.len()
	}

	fn resume(&self, budget: &DrainBudget) -> Resumption {
		let shared = &self.shared;
		if !shared.transition(ActorState::Ready, ActorState::Running) {
			return Resumption::Skipped;
		}
		shared.awaiting.store(CorrelationId::NONE, Ordering::SeqCst);

		let mut guard = self.inner.lock();
		let inner = &mut *guard;
		if shared.kill.load(Ordering::SeqCst) {
			return self.finish(inner, ActorExitKind::Killed, None);
		}

		if !inner.started {
			let CellInner { behavior, ctx, .. } = &mut *inner;
			let started = catch_unwind(AssertUnwindSafe(|| behavior.on_start(ctx)));
			let fault = match started {
				Ok(Ok(())) => None,
				Ok(Err(message)) => Some(QueueFault::Failed(message)),
				Err(payload) => Some(QueueFault::Panicked(panic_message(payload.as_ref()))),
			};
			if let Some(fault) = fault {
				return self.finish(inner, ActorExitKind::StartupFailed, Some(fault.into()));
			}
			inner.started = true;
		}

		let was_awaiting = inner.ctx.awaiting.is_some();
		let (report, response_queued) = {
			let mut token = match shared.mailbox.acquire() {
				Ok(token) => token,
				Err(violation) => return self.finish(inner, ActorExitKind::Faulted, Some(violation.into())),
			};
			let CellInner { behavior, ctx, .. } = &mut *inner;
			let drained = catch_unwind(AssertUnwindSafe(|| {
				token.drain(budget, |envelope| {
					if ctx.awaiting.is_some() && envelope.correlation == ctx.awaiting {
						ctx.awaiting = None;
					}
					behavior.handle(envelope, ctx)
				})
			}));
			let report = match drained {
				Ok(report) => report,
				Err(payload) => {
					drop(token);
					let fault = QueueFault::Panicked(panic_message(payload.as_ref()));
					return self.finish(inner, ActorExitKind::Faulted, Some(fault.into()));
				}
			};
			let response_queued = inner.ctx.awaiting.is_some_and(|c| token.contains(|envelope| envelope.correlation == Some(c)));
			(report, response_queued)
		};

		tracing::trace!(
			actor = %shared.name,
			delivered = report.delivered,
			skipped = report.skipped,
			halt = ?report.halt,
			"worker.actor.drained"
		);

		// Items skipped while waiting deserve another look once the response is in.
		let more = report.unexamined || (was_awaiting && inner.ctx.awaiting.is_none() && report.skipped > 0);
		if let DrainHalt::Fault(message) = report.halt {
			return self.finish(inner, ActorExitKind::Faulted, Some(QueueFault::Failed(message).into()));
		}
		if inner.ctx.stop_requested {
			return self.finish(inner, ActorExitKind::Stopped, None);
		}
		if shared.kill.load(Ordering::SeqCst) {
			return self.finish(inner, ActorExitKind::Killed, None);
		}

		if let Some(awaited) = inner.ctx.awaiting {
			if response_queued {
				shared.set_state(ActorState::Ready);
				return Resumption::Requeue;
			}
			shared.awaiting.store(awaited.0, Ordering::SeqCst);
			tracing::trace!(actor = %shared.name, correlation = awaited.0, "worker.actor.blocked");
			return self.park(ActorState::Blocked, || shared.mailbox.fresh_contains(|envelope| envelope.correlation == Some(awaited)));
		}

		if more || shared.mailbox.has_fresh() {
			shared.set_state(ActorState::Ready);
			return Resumption::Requeue;
		}
		self.park(ActorState::Idle, || shared.mailbox.has_fresh())
	}

	fn wake(&self) -> bool {
		let shared = &self.shared;
		shared.schedule_from(ActorState::Blocked) || shared.schedule_from(ActorState::Idle)
	}

	fn kill(&self) {
		self.shared.kill.store(true, Ordering::SeqCst);
		self.wake();
	}

	fn abandon(&self) -> Option<ActorExit> {
		if self.shared.state() == ActorState::Terminated {
			return None;
		}
		let mut guard = self.inner.lock();
		match self.finish(&mut guard, ActorExitKind::Shutdown, None) {
			Resumption::Terminated(exit) => Some(exit),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests;
