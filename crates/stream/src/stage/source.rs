use std::convert::Infallible;
use std::sync::Arc;

use trellis_worker::{CallbackFault, Fault, ProtocolViolation};

use super::{CloseReason, CloseSignal, Core, Effect, Effects, Outlet, StageExit, StageLogic, StageRole, Upstream};
use crate::batch::Batch;
use crate::config::StageConfig;
use crate::edge::InletId;
use crate::lifecycle::StageState;

/// Pull callback of a source: the next batch, or `None` when exhausted.
pub type PullFn<S, Out> = dyn FnMut(&mut S) -> Result<Option<Vec<Out>>, String> + Send;

/// Stage with no inlets that pulls batches from a callback.
///
/// At most one batch is pulled per [`StageLogic::produce`] call, and only
/// while the outlet holds at least `min_batch` credit and nothing is pending.
/// Pulled batches are emitted whole; empty ones are dropped.
pub struct SourceStage<S, Out> {
	core: Core,
	state: S,
	pull: Box<PullFn<S, Out>>,
	outlet: Outlet<Out>,
	exhausted: bool,
}

impl<S, Out> SourceStage<S, Out> {
	pub fn new<F>(name: impl Into<Arc<str>>, config: StageConfig, state: S, pull: F) -> Self
	where
		F: FnMut(&mut S) -> Result<Option<Vec<Out>>, String> + Send + 'static,
	{
		let config = config.validated();
		Self {
			core: Core::new(name.into()),
			state,
			pull: Box::new(pull),
			outlet: Outlet::new(config.min_batch),
			exhausted: false,
		}
	}

	pub fn state(&self) -> &S {
		&self.state
	}

	/// Credit currently available on the outlet.
	pub fn available(&self) -> u64 {
		self.outlet.available()
	}

	/// Sends the end marker once the source is exhausted and fully flushed.
	fn complete_if_done(&mut self, effects: &mut Effects<Out>) -> Result<(), ProtocolViolation> {
		if self.exhausted && !self.outlet.has_pending() && self.core.is_live() {
			effects.push(Effect::End);
			self.core.close(CloseReason::Completed)?;
		}
		Ok(())
	}
}

impl<S, Out> std::fmt::Debug for SourceStage<S, Out> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SourceStage")
			.field("name", &self.core.name())
			.field("state", &self.core.state())
			.field("available", &self.outlet.available())
			.field("exhausted", &self.exhausted)
			.finish_non_exhaustive()
	}
}

impl<S, Out> StageLogic for SourceStage<S, Out>
where
	S: Send + 'static,
	Out: Send + 'static,
{
	type In = Infallible;
	type Out = Out;
	type State = S;

	fn role(&self) -> StageRole {
		StageRole::Source
	}

	fn stage_state(&self) -> StageState {
		self.core.state()
	}

	fn on_start(&mut self) -> Result<Effects<Out>, Fault> {
		self.core.start()?;
		self.outlet.settle(&mut self.core)?;
		Ok(Vec::new())
	}

	fn on_batch(&mut self, inlet: InletId, _batch: Batch<Infallible>) -> Result<Effects<Out>, Fault> {
		Err(ProtocolViolation::UnknownInlet { inlet }.into())
	}

	fn on_end(&mut self, inlet: InletId) -> Result<Effects<Out>, Fault> {
		Err(ProtocolViolation::UnknownInlet { inlet }.into())
	}

	fn on_abort(&mut self, inlet: InletId, _cause: String) -> Result<Effects<Out>, Fault> {
		Err(ProtocolViolation::UnknownInlet { inlet }.into())
	}

	fn on_credit(&mut self, amount: u64) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_credit")?;
		let mut effects = Vec::new();
		self.outlet.grant(&mut self.core, amount)?;
		if self.core.is_live() {
			self.outlet.flush(&mut self.core, &mut effects, None)?;
			self.outlet.settle(&mut self.core)?;
			self.complete_if_done(&mut effects)?;
		}
		Ok(effects)
	}

	fn on_close(&mut self, signal: CloseSignal) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_close")?;
		let mut effects = Vec::new();
		if self.core.state() != StageState::Initializing {
			self.outlet.flush(&mut self.core, &mut effects, Some(1))?;
		}
		let dropped = self.outlet.discard();
		if signal == CloseSignal::Local {
			effects.push(Effect::End);
		}
		tracing::debug!(stage = %self.core.name(), %signal, dropped, "stream.stage.cancelled");
		self.core.close(CloseReason::Cancelled)?;
		Ok(effects)
	}

	fn wants_to_produce(&self) -> bool {
		self.core.state() == StageState::Running && !self.exhausted && !self.outlet.is_blocked()
	}

	fn produce(&mut self) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("produce")?;
		let mut effects = Vec::new();
		match (self.pull)(&mut self.state) {
			Ok(Some(items)) => {
				self.outlet.push(Batch::from(items));
				self.outlet.flush(&mut self.core, &mut effects, None)?;
			}
			Ok(None) => self.exhausted = true,
			Err(message) => return Err(CallbackFault { message, processed: 0 }.into()),
		}
		self.outlet.settle(&mut self.core)?;
		self.complete_if_done(&mut effects)?;
		Ok(effects)
	}

	fn fail(&mut self, fault: Fault) -> Effects<Out> {
		let cause = fault.to_string();
		self.outlet.discard();
		self.core.close_faulted(fault);
		vec![Effect::AbortDownstream(cause)]
	}

	fn finish(mut self) -> StageExit<S> {
		StageExit {
			reason: self.core.reason(),
			stats: self.core.stats,
			state: self.state,
		}
	}
}

impl<S, Out> Upstream for SourceStage<S, Out>
where
	S: Send + 'static,
	Out: Send + 'static,
{
	fn connect_outlet(&mut self, capacity: u64) {
		self.outlet.connect(capacity);
	}

	fn is_connected(&self) -> bool {
		self.outlet.is_connected()
	}
}
