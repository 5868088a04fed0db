use std::convert::Infallible;
use std::sync::Arc;

use trellis_worker::{Fault, ProtocolViolation};

use super::{CloseReason, CloseSignal, Core, Downstream, Effects, Inlets, StageExit, StageLogic, StageRole};
use crate::batch::Batch;
use crate::config::StageConfig;
use crate::dispatch::{Dispatch, Emitter};
use crate::edge::InletId;
use crate::lifecycle::StageState;

/// Terminal stage consuming every batch it is granted.
///
/// Completes only after the end marker arrived on every inlet and all
/// buffered batches were processed.
pub struct SinkStage<S, In> {
	core: Core,
	state: S,
	processor: Box<dyn Dispatch<S, In, Infallible>>,
	inlets: Inlets<In>,
}

impl<S, In> SinkStage<S, In> {
	pub fn new<D>(name: impl Into<Arc<str>>, config: StageConfig, state: S, processor: D) -> Self
	where
		D: Dispatch<S, In, Infallible> + 'static,
	{
		let config = config.validated();
		Self {
			core: Core::new(name.into()),
			state,
			processor: Box::new(processor),
			inlets: Inlets::new(config.capacity, config.low_watermark),
		}
	}

	pub fn state(&self) -> &S {
		&self.state
	}

	fn pump(&mut self, effects: &mut Effects<Infallible>) -> Result<(), Fault> {
		let mut sink = Emitter::new();
		while let Some((inlet, batch)) = self.inlets.next() {
			let len = batch.len() as u64;
			let dispatched = self.processor.dispatch(&mut self.state, batch, &mut sink);
			self.inlets.consumed(&mut self.core, inlet, len, effects);
			dispatched?;
		}
		self.complete_if_done()?;
		Ok(())
	}

	fn complete_if_done(&mut self) -> Result<(), ProtocolViolation> {
		if self.inlets.is_drained() && self.core.is_live() {
			self.core.close(CloseReason::Completed)?;
		}
		Ok(())
	}
}

impl<S, In> std::fmt::Debug for SinkStage<S, In> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("SinkStage")
			.field("name", &self.core.name())
			.field("state", &self.core.state())
			.field("inlets", &self.inlets.len())
			.field("mode", &self.processor.mode())
			.finish_non_exhaustive()
	}
}

impl<S, In> StageLogic for SinkStage<S, In>
where
	S: Send + 'static,
	In: Send + 'static,
{
	type In = In;
	type Out = Infallible;
	type State = S;

	fn role(&self) -> StageRole {
		StageRole::Sink
	}

	fn stage_state(&self) -> StageState {
		self.core.state()
	}

	fn on_start(&mut self) -> Result<Effects<Infallible>, Fault> {
		self.core.start()?;
		let mut effects = Vec::new();
		self.inlets.initial_grants(&mut self.core, &mut effects);
		Ok(effects)
	}

	fn on_batch(&mut self, inlet: InletId, batch: Batch<In>) -> Result<Effects<Infallible>, Fault> {
		self.core.ensure_open("on_batch")?;
		self.inlets.receive(&mut self.core, inlet, batch)?;
		let mut effects = Vec::new();
		self.pump(&mut effects)?;
		Ok(effects)
	}

	fn on_end(&mut self, inlet: InletId) -> Result<Effects<Infallible>, Fault> {
		self.core.ensure_open("on_end")?;
		self.inlets.end(inlet)?;
		let mut effects = Vec::new();
		self.pump(&mut effects)?;
		Ok(effects)
	}

	fn on_abort(&mut self, inlet: InletId, cause: String) -> Result<Effects<Infallible>, Fault> {
		self.core.ensure_open("on_abort")?;
		self.inlets.end(inlet)?;
		tracing::debug!(stage = %self.core.name(), inlet, %cause, "stream.stage.upstream_failed");
		let mut effects = Vec::new();
		self.inlets.cancel_open(&mut effects);
		self.inlets.discard();
		self.core.close(CloseReason::UpstreamFailed(cause))?;
		Ok(effects)
	}

	fn on_credit(&mut self, _amount: u64) -> Result<Effects<Infallible>, Fault> {
		Err(ProtocolViolation::NoOutlet { operation: "on_credit" }.into())
	}

	fn on_close(&mut self, signal: CloseSignal) -> Result<Effects<Infallible>, Fault> {
		self.core.ensure_open("on_close")?;
		if signal == CloseSignal::UpstreamLost && self.inlets.all_ended() {
			return Ok(Vec::new());
		}
		let mut effects = Vec::new();
		self.inlets.cancel_open(&mut effects);
		let dropped = self.inlets.discard();
		tracing::debug!(stage = %self.core.name(), %signal, dropped, "stream.stage.cancelled");
		let reason = match signal {
			CloseSignal::UpstreamLost => CloseReason::UpstreamFailed("upstream disconnected".to_owned()),
			CloseSignal::Downstream | CloseSignal::Local => CloseReason::Cancelled,
		};
		self.core.close(reason)?;
		Ok(effects)
	}

	fn fail(&mut self, fault: Fault) -> Effects<Infallible> {
		let mut effects = Vec::new();
		self.inlets.cancel_open(&mut effects);
		self.inlets.discard();
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

impl<S, In> Downstream for SinkStage<S, In>
where
	S: Send + 'static,
	In: Send + 'static,
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
