#![cfg_attr(test, allow(unused_crate_dependencies))]
//! Credit-based backpressured stream stages.
//!
//! A pipeline is a graph of stages joined by edges:
//! * [`SourceStage`] pulls batches from a callback
//! * [`TransformStage`] and [`SinkStage`] run a [`Processor`] element-wise or batch-wise
//! * [`CreditLedger`] / [`CreditWindow`] keep each edge within the downstream's capacity
//!
//! Stages are synchronous state machines ([`StageLogic`]); [`Pipeline`] wires
//! them and drives each on its own task, reporting faults on the shared
//! [`FaultBus`](trellis_worker::FaultBus).

pub mod batch;
pub mod config;
pub mod credit;
pub mod dispatch;
mod driver;
pub mod edge;
pub mod lifecycle;
pub mod pipeline;
pub mod stage;

pub use batch::Batch;
pub use config::StageConfig;
pub use credit::{CreditLedger, CreditWindow};
pub use dispatch::{Dispatch, Dispatched, Emitter, ProcessMode, Processor};
pub use edge::{Control, ControlSender, EdgeSender, InletId, StageSignal};
pub use lifecycle::{Lifecycle, StageState};
pub use pipeline::{Pipeline, StageBuilder, StageHandle, WireError};
pub use stage::{
	CloseReason, CloseSignal, Downstream, Effect, Effects, PullFn, SinkStage, SourceStage, StageExit, StageId, StageLogic, StageRole, StageStats, TransformStage,
	Upstream,
};
