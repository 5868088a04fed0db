use std::sync::Arc;

use trellis_worker::{Fault, ProtocolViolation};

use super::{CloseReason, CloseSignal, Core, Downstream, Effect, Effects, Inlets, Outlet, StageExit, StageLogic, StageRole, Upstream};
use crate::batch::Batch;
use crate::config::StageConfig;
use crate::dispatch::{Dispatch, Emitter};
use crate::edge::InletId;
use crate::lifecycle::StageState;

/// Stage that processes batches from its inlets and emits the output.
///
/// Input is processed in arrival order across inlets, one batch at a time,
/// and only while the outlet is not waiting for credit. Output is cut into
/// batches no larger than the outlet capacity.
pub struct TransformStage<S, In, Out> {
	core: Core,
	state: S,
	processor: Box<dyn Dispatch<S, In, Out>>,
	inlets: Inlets<In>,
	outlet: Outlet<Out>,
}

impl<S, In, Out> TransformStage<S, In, Out> {
	pub fn new<D>(name: impl Into<Arc<str>>, config: StageConfig, state: S, processor: D) -> Self
	where
		D: Dispatch<S, In, Out> + 'static,
	{
		let config = config.validated();
		Self {
			core: Core::new(name.into()),
			state,
			processor: Box::new(processor),
			inlets: Inlets::new(config.capacity, config.low_watermark),
			outlet: Outlet::new(config.min_batch),
		}
	}

	pub fn state(&self) -> &S {
		&self.state
	}

	/// Processes buffered input until it runs out or output backs up.
	fn pump(&mut self, effects: &mut Effects<Out>) -> Result<(), Fault> {
		while !self.outlet.is_blocked() {
			let Some((inlet, batch)) = self.inlets.next() else { break };
			let len = batch.len() as u64;
			let mut out = Emitter::new();
			let dispatched = self.processor.dispatch(&mut self.state, batch, &mut out);
			self.inlets.consumed(&mut self.core, inlet, len, effects);
			dispatched?;
			self.outlet.push_chunked(out.take());
			self.outlet.flush(&mut self.core, effects, None)?;
		}
		self.outlet.settle(&mut self.core)?;
		self.complete_if_done(effects)?;
		Ok(())
	}

	/// Cancels the remaining upstreams and forwards the failure downstream.
	fn upstream_failed(&mut self, cause: String) -> Result<Effects<Out>, ProtocolViolation> {
		let mut effects = Vec::new();
		self.inlets.cancel_open(&mut effects);
		self.inlets.discard();
		self.outlet.discard();
		effects.push(Effect::AbortDownstream(format!("upstream failed: {cause}")));
		self.core.close(CloseReason::UpstreamFailed(cause))?;
		Ok(effects)
	}

	fn complete_if_done(&mut self, effects: &mut Effects<Out>) -> Result<(), ProtocolViolation> {
		if self.inlets.is_drained() && !self.outlet.has_pending() && self.core.is_live() {
			effects.push(Effect::End);
			self.core.close(CloseReason::Completed)?;
		}
		Ok(())
	}
}

impl<S, In, Out> std::fmt::Debug for TransformStage<S, In, Out> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("TransformStage")
			.field("name", &self.core.name())
			.field("state", &self.core.state())
			.field("inlets", &self.inlets.len())
			.field("mode", &self.processor.mode())
			.finish_non_exhaustive()
	}
}

impl<S, In, Out> StageLogic for TransformStage<S, In, Out>
where
	S: Send + 'static,
	In: Send + 'static,
	Out: Send + 'static,
{
	type In = In;
	type Out = Out;
	type State = S;

	fn role(&self) -> StageRole {
		StageRole::Transform
	}

	fn stage_state(&self) -> StageState {
		self.core.state()
	}

	fn on_start(&mut self) -> Result<Effects<Out>, Fault> {
		self.core.start()?;
		let mut effects = Vec::new();
		self.inlets.initial_grants(&mut self.core, &mut effects);
		self.outlet.settle(&mut self.core)?;
		Ok(effects)
	}

	fn on_batch(&mut self, inlet: InletId, batch: Batch<In>) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_batch")?;
		self.inlets.receive(&mut self.core, inlet, batch)?;
		let mut effects = Vec::new();
		self.pump(&mut effects)?;
		Ok(effects)
	}

	fn on_end(&mut self, inlet: InletId) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_end")?;
		self.inlets.end(inlet)?;
		let mut effects = Vec::new();
		self.pump(&mut effects)?;
		Ok(effects)
	}

	fn on_abort(&mut self, inlet: InletId, cause: String) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_abort")?;
		self.inlets.end(inlet)?;
		tracing::debug!(stage = %self.core.name(), inlet, %cause, "stream.stage.upstream_failed");
		Ok(self.upstream_failed(cause)?)
	}

	fn on_credit(&mut self, amount: u64) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_credit")?;
		self.outlet.grant(&mut self.core, amount)?;
		let mut effects = Vec::new();
		if self.core.is_live() {
			self.outlet.flush(&mut self.core, &mut effects, None)?;
			self.pump(&mut effects)?;
		}
		Ok(effects)
	}

	fn on_close(&mut self, signal: CloseSignal) -> Result<Effects<Out>, Fault> {
		self.core.ensure_open("on_close")?;
		if signal == CloseSignal::UpstreamLost {
			if self.inlets.all_ended() {
				return Ok(Vec::new());
			}
			return Ok(self.upstream_failed("upstream disconnected".to_owned())?);
		}
		let mut effects = Vec::new();
		if self.core.state() != StageState::Initializing {
			self.outlet.flush(&mut self.core, &mut effects, Some(1))?;
		}
		let dropped = self.outlet.discard() + self.inlets.discard();
		self.inlets.cancel_open(&mut effects);
		if signal == CloseSignal::Local {
			effects.push(Effect::End);
		}
		tracing::debug!(stage = %self.core.name(), %signal, dropped, "stream.stage.cancelled");
		self.core.close(CloseReason::Cancelled)?;
		Ok(effects)
	}

	fn fail(&mut self, fault: Fault) -> Effects<Out> {
		let mut effects = Vec::new();
		self.inlets.cancel_open(&mut effects);
		self.inlets.discard();
		self.outlet.discard();
		effects.push(Effect::AbortDownstream(fault.to_string()));
		self.core.close_faulted(fault);
		effects
	}

	fn finish(mut self) -> StageExit<S> {
		StageExit {
			reason: self.core.reason(),
			stats: self.core.stats,
			state: self.state,
		}
	}
}

impl<S, In, Out> Downstream for TransformStage<S, In, Out>
where
	S: Send + 'static,
	In: Send + 'static,
	Out: Send + 'static,
{
	fn add_inlet(&mut self) -> InletId {
		self.inlets.add()
	}

	fn inlet_count(&self) -> usize {
		self.inlets.len()
	}

	fn inlet_capacity(&self) -> u64 {
		self.inlets.capacity()
	}
}

impl<S, In, Out> Upstream for TransformStage<S, In, Out>
where
	S: Send + 'static,
	In: Send + 'static,
	Out: Send + 'static,
{
	fn connect_outlet(&mut self, capacity: u64) {
		self.outlet.connect(capacity);
	}

	fn is_connected(&self) -> bool {
		self.outlet.is_connected()
	}
}
