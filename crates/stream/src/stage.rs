//! Synchronous stage state machines.
//!
//! A stage reacts to one input at a time (a batch, an end or abort marker, a
//! credit grant, a close request) and answers with [`Effects`] for the async
//! driver to put on the wire. Keeping the machines free of channels lets the
//! credit protocol be exercised step by step without a runtime.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

use strum::{Display, IntoStaticStr};
use trellis_worker::{Fault, ProtocolViolation};

use crate::batch::Batch;
use crate::credit::{CreditLedger, CreditWindow};
use crate::edge::InletId;
use crate::lifecycle::{Lifecycle, StageState};

mod sink;
mod source;
mod transform;

pub use sink::SinkStage;
pub use source::{PullFn, SourceStage};
pub use transform::TransformStage;

/// Pipeline-local stage identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StageId(pub u64);

impl fmt::Display for StageId {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "stage#{}", self.0)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum StageRole {
	/// No inlets, one outlet.
	Source,
	/// At least one inlet, one outlet.
	Transform,
	/// At least one inlet, no outlet.
	Sink,
}

/// One action for the driver to perform on the stage's edges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Effect<Out> {
	/// Send a credited batch downstream.
	Emit(Batch<Out>),
	/// Grant credit to the upstream wired to `inlet`.
	Grant { inlet: InletId, amount: u64 },
	/// Send the end-of-stream marker downstream.
	End,
	/// Ask the upstream wired to `inlet` to stop.
	CancelUpstream { inlet: InletId },
	/// Tell downstream this stage failed.
	AbortDownstream(String),
}

pub type Effects<Out> = Vec<Effect<Out>>;

/// Why a stage is asked to close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum CloseSignal {
	/// Downstream cancelled or went away.
	Downstream,
	/// The pipeline owner cancelled this stage.
	Local,
	/// Every upstream sender went away. Only inlets that never saw `End`
	/// count as lost; a stage whose inlets all ended keeps draining.
	UpstreamLost,
}

/// How a stage reached `Closed`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
	/// All input consumed and the end marker sent.
	Completed,
	/// Closed by a downstream or local cancel.
	Cancelled,
	/// An upstream aborted or vanished.
	UpstreamFailed(String),
	/// The stage itself faulted.
	Faulted(Fault),
}

impl CloseReason {
	pub fn is_failure(&self) -> bool {
		matches!(self, Self::UpstreamFailed(_) | Self::Faulted(_))
	}
}

/// Traffic counters kept by every stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StageStats {
	pub batches_in: u64,
	pub elements_in: u64,
	pub batches_out: u64,
	pub elements_out: u64,
	/// Credit granted to upstreams.
	pub credit_granted: u64,
	/// Credit received from downstream.
	pub credit_received: u64,
	/// Transitions into `Paused`.
	pub pauses: u64,
}

/// Final state of a closed stage.
#[derive(Debug)]
pub struct StageExit<S> {
	pub state: S,
	pub reason: CloseReason,
	pub stats: StageStats,
}

/// Hooks of a stage state machine.
///
/// Every hook returns the effects to apply, or the fault that terminates the
/// stage. After a fault the driver calls [`StageLogic::fail`] and stops.
pub trait StageLogic: Send + 'static {
	type In: Send + 'static;
	type Out: Send + 'static;
	type State: Send + 'static;

	fn role(&self) -> StageRole;

	fn stage_state(&self) -> StageState;

	fn on_start(&mut self) -> Result<Effects<Self::Out>, Fault>;

	fn on_batch(&mut self, inlet: InletId, batch: Batch<Self::In>) -> Result<Effects<Self::Out>, Fault>;

	fn on_end(&mut self, inlet: InletId) -> Result<Effects<Self::Out>, Fault>;

	fn on_abort(&mut self, inlet: InletId, cause: String) -> Result<Effects<Self::Out>, Fault>;

	fn on_credit(&mut self, amount: u64) -> Result<Effects<Self::Out>, Fault>;

	fn on_close(&mut self, signal: CloseSignal) -> Result<Effects<Self::Out>, Fault>;

	/// Whether [`StageLogic::produce`] should be called without waiting for input.
	fn wants_to_produce(&self) -> bool {
		false
	}

	fn produce(&mut self) -> Result<Effects<Self::Out>, Fault> {
		Ok(Vec::new())
	}

	/// Closes the stage after `fault`, returning the abort and cancel effects.
	fn fail(&mut self, fault: Fault) -> Effects<Self::Out>;

	fn is_closed(&self) -> bool {
		self.stage_state() == StageState::Closed
	}

	fn finish(self) -> StageExit<Self::State>;
}

/// Stage that accepts batches on wired inlets.
pub trait Downstream: StageLogic {
	/// Adds an inlet and returns its index.
	fn add_inlet(&mut self) -> InletId;

	fn inlet_count(&self) -> usize;

	/// Credit capacity of every inlet.
	fn inlet_capacity(&self) -> u64;
}

/// Stage that emits batches on a single outlet.
pub trait Upstream: StageLogic {
	/// Sizes the outlet ledger to the downstream inlet's capacity.
	fn connect_outlet(&mut self, capacity: u64);

	fn is_connected(&self) -> bool;
}

/// Lifecycle, counters and close bookkeeping shared by all roles.
#[derive(Debug)]
pub(crate) struct Core {
	name: Arc<str>,
	lifecycle: Lifecycle,
	pub(crate) stats: StageStats,
	reason: Option<CloseReason>,
}

impl Core {
	pub(crate) fn new(name: Arc<str>) -> Self {
		Self {
			name,
			lifecycle: Lifecycle::new(),
			stats: StageStats::default(),
			reason: None,
		}
	}

	pub(crate) fn name(&self) -> &str {
		&self.name
	}

	pub(crate) fn state(&self) -> StageState {
		self.lifecycle.state()
	}

	pub(crate) fn is_live(&self) -> bool {
		self.state().is_live()
	}

	pub(crate) fn ensure_open(&self, operation: &'static str) -> Result<(), ProtocolViolation> {
		self.lifecycle.ensure_open(operation)
	}

	pub(crate) fn start(&mut self) -> Result<(), ProtocolViolation> {
		self.lifecycle.transition(StageState::Running)
	}

	pub(crate) fn set_paused(&mut self, paused: bool) -> Result<(), ProtocolViolation> {
		match (self.state(), paused) {
			(StageState::Running, true) => {
				self.lifecycle.transition(StageState::Paused)?;
				self.stats.pauses += 1;
				tracing::trace!(stage = %self.name, "stream.stage.paused");
			}
			(StageState::Paused, false) => {
				self.lifecycle.transition(StageState::Running)?;
				tracing::trace!(stage = %self.name, "stream.stage.resumed");
			}
			_ => {}
		}
		Ok(())
	}

	/// Moves through `Closing` into `Closed`.
	pub(crate) fn close(&mut self, reason: CloseReason) -> Result<(), ProtocolViolation> {
		if self.state() != StageState::Closing {
			self.lifecycle.transition(StageState::Closing)?;
		}
		self.lifecycle.transition(StageState::Closed)?;
		tracing::debug!(stage = %self.name, reason = ?reason, "stream.stage.closed");
		self.reason = Some(reason);
		Ok(())
	}

	/// Records a fault close. Already-closed stages keep their first reason.
	pub(crate) fn close_faulted(&mut self, fault: Fault) {
		tracing::warn!(stage = %self.name, fault = %fault, "stream.stage.fault");
		if self.state() != StageState::Closed {
			let _ = self.close(CloseReason::Faulted(fault));
		}
	}

	pub(crate) fn reason(&mut self) -> CloseReason {
		self.reason.take().unwrap_or(CloseReason::Cancelled)
	}
}

/// Sending side of a stage: credit ledger plus batches awaiting credit.
#[derive(Debug)]
pub(crate) struct Outlet<Out> {
	ledger: Option<CreditLedger>,
	min_batch: u64,
	pending: VecDeque<Batch<Out>>,
}

impl<Out> Outlet<Out> {
	pub(crate) fn new(min_batch: u64) -> Self {
		Self {
			ledger: None,
			min_batch,
			pending: VecDeque::new(),
		}
	}

	pub(crate) fn connect(&mut self, capacity: u64) {
		self.ledger = Some(CreditLedger::new(capacity));
		self.min_batch = self.min_batch.min(capacity);
	}

	pub(crate) fn is_connected(&self) -> bool {
		self.ledger.is_some()
	}

	fn ledger(&mut self) -> Result<&mut CreditLedger, ProtocolViolation> {
		self.ledger.as_mut().ok_or(ProtocolViolation::NoOutlet { operation: "emit" })
	}

	pub(crate) fn available(&self) -> u64 {
		self.ledger.as_ref().map_or(0, CreditLedger::available)
	}

	pub(crate) fn has_pending(&self) -> bool {
		!self.pending.is_empty()
	}

	/// Whether new output must wait for credit.
	pub(crate) fn is_blocked(&self) -> bool {
		self.has_pending() || self.available() < self.min_batch
	}

	/// Queues one batch as produced. Oversized batches fail on flush.
	pub(crate) fn push(&mut self, batch: Batch<Out>) {
		if !batch.is_empty() {
			self.pending.push_back(batch);
		}
	}

	/// Queues processed output cut into capacity-sized batches.
	pub(crate) fn push_chunked(&mut self, mut items: Vec<Out>) {
		let capacity = self.ledger.as_ref().map_or(u64::MAX, CreditLedger::capacity);
		let chunk = usize::try_from(capacity).unwrap_or(usize::MAX);
		while items.len() > chunk {
			let rest = items.split_off(chunk);
			self.push(Batch::from(items));
			items = rest;
		}
		self.push(Batch::from(items));
	}

	pub(crate) fn grant(&mut self, core: &mut Core, amount: u64) -> Result<(), ProtocolViolation> {
		self.ledger()?.grant(amount)?;
		core.stats.credit_received += amount;
		Ok(())
	}

	/// Emits pending batches in order while credit covers them.
	///
	/// With `limit`, at most that many batches leave and the `min_batch`
	/// threshold is ignored.
	pub(crate) fn flush(&mut self, core: &mut Core, effects: &mut Effects<Out>, limit: Option<usize>) -> Result<usize, ProtocolViolation> {
		let threshold = if limit.is_some() { 0 } else { self.min_batch };
		let mut emitted = 0;
		while let Some(front) = self.pending.front() {
			if limit.is_some_and(|limit| emitted >= limit) {
				break;
			}
			let len = front.len() as u64;
			let ledger = self.ledger()?;
			let covered = ledger.fits(len) && ledger.available() >= threshold;
			if !covered && len <= ledger.capacity() {
				break;
			}
			ledger.debit(len)?;
			let Some(batch) = self.pending.pop_front() else { break };
			core.stats.batches_out += 1;
			core.stats.elements_out += len;
			effects.push(Effect::Emit(batch));
			emitted += 1;
		}
		Ok(emitted)
	}

	/// Syncs `Running`/`Paused` with whether output is blocked on credit.
	pub(crate) fn settle(&self, core: &mut Core) -> Result<(), ProtocolViolation> {
		core.set_paused(self.is_blocked())
	}

	/// Drops everything not yet emitted. Returns the element count.
	pub(crate) fn discard(&mut self) -> usize {
		self.pending.drain(..).map(|batch| batch.len()).sum()
	}
}

/// Receiving side of a stage: one credit window per inlet and a shared
/// arrival-ordered buffer.
#[derive(Debug)]
pub(crate) struct Inlets<In> {
	capacity: u64,
	low_watermark: u64,
	windows: Vec<CreditWindow>,
	ended: Vec<bool>,
	queue: VecDeque<(InletId, Batch<In>)>,
}

impl<In> Inlets<In> {
	pub(crate) fn new(capacity: u64, low_watermark: u64) -> Self {
		Self {
			capacity,
			low_watermark,
			windows: Vec::new(),
			ended: Vec::new(),
			queue: VecDeque::new(),
		}
	}

	pub(crate) fn add(&mut self) -> InletId {
		self.windows.push(CreditWindow::new(self.capacity, self.low_watermark));
		self.ended.push(false);
		self.windows.len() - 1
	}

	pub(crate) fn len(&self) -> usize {
		self.windows.len()
	}

	pub(crate) fn capacity(&self) -> u64 {
		self.capacity
	}

	fn check(&self, inlet: InletId) -> Result<(), ProtocolViolation> {
		match self.ended.get(inlet) {
			None => Err(ProtocolViolation::UnknownInlet { inlet }),
			Some(true) => Err(ProtocolViolation::DataAfterEnd { inlet }),
			Some(false) => Ok(()),
		}
	}

	pub(crate) fn initial_grants<Out>(&mut self, core: &mut Core, effects: &mut Effects<Out>) {
		for (inlet, window) in self.windows.iter_mut().enumerate() {
			let amount = window.initial_grant();
			core.stats.credit_granted += amount;
			effects.push(Effect::Grant { inlet, amount });
		}
	}

	pub(crate) fn receive(&mut self, core: &mut Core, inlet: InletId, batch: Batch<In>) -> Result<(), ProtocolViolation> {
		self.check(inlet)?;
		let len = batch.len() as u64;
		self.windows[inlet].receive(len)?;
		core.stats.batches_in += 1;
		core.stats.elements_in += len;
		self.queue.push_back((inlet, batch));
		Ok(())
	}

	pub(crate) fn end(&mut self, inlet: InletId) -> Result<(), ProtocolViolation> {
		self.check(inlet)?;
		self.ended[inlet] = true;
		Ok(())
	}

	pub(crate) fn next(&mut self) -> Option<(InletId, Batch<In>)> {
		self.queue.pop_front()
	}

	/// Releases buffer space for a processed batch and grants it back when
	/// the window asks for it.
	pub(crate) fn consumed<Out>(&mut self, core: &mut Core, inlet: InletId, len: u64, effects: &mut Effects<Out>) {
		let window = &mut self.windows[inlet];
		window.consume(len);
		if self.ended[inlet] {
			return;
		}
		if let Some(amount) = window.replenish() {
			core.stats.credit_granted += amount;
			effects.push(Effect::Grant { inlet, amount });
		}
	}

	/// Every upstream has sent `End` or `Abort`, or was cancelled.
	pub(crate) fn all_ended(&self) -> bool {
		self.ended.iter().all(|ended| *ended)
	}

	/// Every inlet ended and nothing is buffered.
	pub(crate) fn is_drained(&self) -> bool {
		self.queue.is_empty() && self.all_ended()
	}

	/// Cancels every upstream still sending, marking its inlet ended.
	pub(crate) fn cancel_open<Out>(&mut self, effects: &mut Effects<Out>) {
		for (inlet, ended) in self.ended.iter_mut().enumerate() {
			if !*ended {
				*ended = true;
				effects.push(Effect::CancelUpstream { inlet });
			}
		}
	}

	/// Drops buffered input. Returns the element count.
	pub(crate) fn discard(&mut self) -> usize {
		self.queue.drain(..).map(|(_, batch)| batch.len()).sum()
	}
}
