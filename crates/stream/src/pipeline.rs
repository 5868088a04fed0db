//! Stage construction, edge wiring and launch.

use std::convert::Infallible;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use trellis_worker::{Entity, Fault, FaultBus, FaultReceiver, IdClock, TaskClass, join_error_panic_message};

use crate::config::StageConfig;
use crate::dispatch::Dispatch;
use crate::driver::{StageIo, drive};
use crate::edge::{self, ControlReceiver, ControlSender, DataReceiver, EdgeSender, StageSignal};
use crate::stage::{Downstream, SinkStage, SourceStage, StageExit, StageId, StageLogic, StageRole, TransformStage, Upstream};

/// Wiring or launch misuse.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
	/// A stage has a single outlet and it is already wired.
	#[error("stage {stage} already has a downstream")]
	OutletTaken { stage: Arc<str> },
	/// The stage's role requires an edge that was never wired.
	#[error("stage {stage} has no {missing}")]
	Unwired { stage: Arc<str>, missing: &'static str },
}

/// Factory for stages sharing an id space and a fault bus.
#[derive(Debug, Clone, Default)]
pub struct Pipeline {
	ids: IdClock,
	faults: FaultBus,
}

impl Pipeline {
	pub fn new() -> Self {
		Self::default()
	}

	/// Publishes stage faults to `faults`, e.g. a scheduler's bus.
	pub fn with_fault_bus(faults: FaultBus) -> Self {
		Self { ids: IdClock::new(), faults }
	}

	pub fn subscribe(&self) -> FaultReceiver {
		self.faults.subscribe()
	}

	pub fn fault_bus(&self) -> &FaultBus {
		&self.faults
	}

	/// A stage pulling batches from `pull` until it returns `None`.
	pub fn source<S, Out, F>(&self, name: impl Into<Arc<str>>, config: StageConfig, state: S, pull: F) -> StageBuilder<SourceStage<S, Out>>
	where
		S: Send + 'static,
		Out: Send + 'static,
		F: FnMut(&mut S) -> Result<Option<Vec<Out>>, String> + Send + 'static,
	{
		let name = name.into();
		self.builder(Arc::clone(&name), SourceStage::new(name, config, state, pull))
	}

	pub fn transform<S, In, Out, D>(&self, name: impl Into<Arc<str>>, config: StageConfig, state: S, processor: D) -> StageBuilder<TransformStage<S, In, Out>>
	where
		S: Send + 'static,
		In: Send + 'static,
		Out: Send + 'static,
		D: Dispatch<S, In, Out> + 'static,
	{
		let name = name.into();
		self.builder(Arc::clone(&name), TransformStage::new(name, config, state, processor))
	}

	pub fn sink<S, In, D>(&self, name: impl Into<Arc<str>>, config: StageConfig, state: S, processor: D) -> StageBuilder<SinkStage<S, In>>
	where
		S: Send + 'static,
		In: Send + 'static,
		D: Dispatch<S, In, Infallible> + 'static,
	{
		let name = name.into();
		self.builder(Arc::clone(&name), SinkStage::new(name, config, state, processor))
	}

	/// Wraps a custom state machine.
	pub fn stage<L: StageLogic>(&self, name: impl Into<Arc<str>>, logic: L) -> StageBuilder<L> {
		self.builder(name.into(), logic)
	}

	fn builder<L: StageLogic>(&self, name: Arc<str>, logic: L) -> StageBuilder<L> {
		StageBuilder {
			id: StageId(self.ids.next()),
			name,
			logic,
			inbox: None,
			upstreams: Vec::new(),
			outlet: None,
			control: None,
			faults: self.faults.clone(),
		}
	}

	/// Connects `upstream`'s outlet to a new inlet of `downstream`.
	///
	/// The edge capacity is the downstream stage's configured capacity.
	pub fn wire<U, D>(&self, upstream: &mut StageBuilder<U>, downstream: &mut StageBuilder<D>) -> Result<(), WireError>
	where
		U: Upstream,
		D: Downstream + StageLogic<In = U::Out>,
	{
		if upstream.outlet.is_some() {
			return Err(WireError::OutletTaken {
				stage: Arc::clone(&upstream.name),
			});
		}
		let inlet = downstream.logic.add_inlet();
		let (tx, _) = downstream.inbox.get_or_insert_with(|| {
			let (tx, rx) = edge::data_channel();
			(tx, Some(rx))
		});
		let (control, control_rx) = edge::control_channel();
		downstream.upstreams.push(control);
		upstream.outlet = Some(EdgeSender::new(inlet, tx.clone()));
		upstream.control = Some(control_rx);
		upstream.logic.connect_outlet(downstream.logic.inlet_capacity());
		tracing::debug!(
			upstream = %upstream.name,
			downstream = %downstream.name,
			inlet,
			capacity = downstream.logic.inlet_capacity(),
			"stream.pipeline.wire"
		);
		Ok(())
	}
}

/// A stage under construction together with its channel ends.
pub struct StageBuilder<L: StageLogic> {
	id: StageId,
	name: Arc<str>,
	logic: L,
	/// Shared data channel for all inlets; the sender only mints edge senders.
	inbox: Option<(mpsc::UnboundedSender<StageSignal<L::In>>, Option<DataReceiver<L::In>>)>,
	upstreams: Vec<ControlSender>,
	outlet: Option<EdgeSender<L::Out>>,
	control: Option<ControlReceiver>,
	faults: FaultBus,
}

impl<L: StageLogic> std::fmt::Debug for StageBuilder<L> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("StageBuilder")
			.field("id", &self.id)
			.field("name", &self.name)
			.field("role", &self.logic.role())
			.field("inlets", &self.upstreams.len())
			.field("wired_outlet", &self.outlet.is_some())
			.finish_non_exhaustive()
	}
}

impl<L: StageLogic> StageBuilder<L> {
	pub fn id(&self) -> StageId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	pub fn logic(&self) -> &L {
		&self.logic
	}

	/// Spawns the stage on its own task.
	///
	/// Sources and transforms need a wired outlet; transforms and sinks need
	/// at least one wired inlet.
	pub fn launch(self) -> Result<StageHandle<L::State>, WireError> {
		let role = self.logic.role();
		if role != StageRole::Sink && self.outlet.is_none() {
			return Err(WireError::Unwired {
				stage: self.name,
				missing: "outlet",
			});
		}
		if role != StageRole::Source && self.upstreams.is_empty() {
			return Err(WireError::Unwired { stage: self.name, missing: "inlet" });
		}

		let data = self.inbox.and_then(|(_, rx)| rx);
		let io = StageIo {
			data,
			control: self.control,
			outlet: self.outlet,
			upstreams: self.upstreams,
		};
		let cancel = CancellationToken::new();
		let entity = Entity::stage(self.id.0, Arc::clone(&self.name));
		tracing::debug!(stage = %entity, %role, "stream.pipeline.launch");
		let join = trellis_worker::spawn(TaskClass::StreamStage, drive(self.logic, io, cancel.clone(), entity, self.faults));
		Ok(StageHandle {
			id: self.id,
			name: self.name,
			cancel,
			join,
		})
	}
}

/// Owner's handle to a running stage.
#[derive(Debug)]
pub struct StageHandle<S> {
	id: StageId,
	name: Arc<str>,
	cancel: CancellationToken,
	join: JoinHandle<StageExit<S>>,
}

impl<S> StageHandle<S> {
	pub fn id(&self) -> StageId {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}

	/// Closes the stage locally: one final flush, then end of stream.
	pub fn cancel(&self) {
		self.cancel.cancel();
	}

	pub fn cancellation_token(&self) -> CancellationToken {
		self.cancel.clone()
	}

	pub fn is_finished(&self) -> bool {
		self.join.is_finished()
	}

	/// Waits for the stage to close.
	///
	/// Hook faults are reported in [`StageExit::reason`]; only a driver task
	/// that panicked or was aborted yields an error.
	pub async fn join(self) -> Result<StageExit<S>, Fault> {
		self.join
			.await
			.map_err(|err| Fault::Panicked(join_error_panic_message(err).unwrap_or_else(|| "stage task aborted".to_owned())))
	}
}
