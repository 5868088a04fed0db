#![cfg_attr(test, allow(unused_crate_dependencies))]
//! Actor mailboxes and cooperative scheduling.
//!
//! This crate provides the message-consumption core of the runtime:
//! * [`TaskResult`]: the four-valued directive every mailbox drain obeys
//! * [`Mailbox`]: tiered multi-producer/single-consumer inbox guarded by a [`ConsumerToken`]
//! * [`Scheduler`]: fixed worker pool resuming actors in bounded [`DrainBudget`] quanta
//! * [`FaultBus`]: broadcast of [`FaultEvent`]s for supervising owners
//!
//! Spawn helpers and [`TaskClass`] are shared with the stream crate so both
//! halves of the runtime classify their work the same way.

pub mod actor;
pub mod budget;
pub mod codec;
pub mod fault;
pub mod id;
pub mod mailbox;
mod panic;
pub mod registry;
pub mod scheduler;
mod spawn;
pub mod task_result;

pub use actor::{ActorContext, ActorExit, ActorExitKind, ActorRef, ActorState, Behavior};
pub use budget::{DrainBudget, DrainHalt, DrainReport};
pub use codec::{CodecError, EnumCodec};
pub use fault::{CallbackFault, Entity, EntityKind, Fault, FaultBus, FaultEvent, FaultReceiver, ProtocolViolation, QueueFault};
pub use id::{ActorId, CorrelationId, IdClock};
pub use mailbox::{ConsumerToken, ConsumptionPolicy, Envelope, Mailbox, MailboxSendError, Priority, TierSpec};
pub use panic::{join_error_panic_message, panic_message};
pub use registry::ActorRecord;
pub use scheduler::{Scheduler, SchedulerConfig};
pub use spawn::{TaskClass, spawn, spawn_named_thread};
pub use task_result::TaskResult;
