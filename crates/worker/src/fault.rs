//! Fault taxonomy and the broadcast channel owners watch for terminations.

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::broadcast;

use crate::codec::CodecError;
use crate::id::ActorId;

/// Kind of runtime entity a fault is attributed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
	Actor,
	Stage,
}

/// Identity of the entity that faulted.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Entity {
	kind: EntityKind,
	id: u64,
	name: Arc<str>,
}

impl Entity {
	pub fn actor(id: ActorId, name: impl Into<Arc<str>>) -> Self {
		Self {
			kind: EntityKind::Actor,
			id: id.0,
			name: name.into(),
		}
	}

	pub fn stage(id: u64, name: impl Into<Arc<str>>) -> Self {
		Self {
			kind: EntityKind::Stage,
			id,
			name: name.into(),
		}
	}

	pub fn kind(&self) -> EntityKind {
		self.kind
	}

	pub fn id(&self) -> u64 {
		self.id
	}

	pub fn name(&self) -> &str {
		&self.name
	}
}

impl fmt::Display for Entity {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self.kind {
			EntityKind::Actor => write!(f, "actor#{}({})", self.id, self.name),
			EntityKind::Stage => write!(f, "stage#{}({})", self.id, self.name),
		}
	}
}

/// Misuse of a queue, ledger or lifecycle. Always fatal to the owner.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolViolation {
	/// Upstream tried to emit more elements than it holds credit for.
	#[error("emission of {requested} element(s) exceeds available credit {available}")]
	CreditOverrun { requested: u64, available: u64 },
	/// A batch larger than the edge capacity can never be covered by credit.
	#[error("batch of {len} element(s) exceeds edge capacity {capacity}")]
	BatchExceedsCapacity { len: u64, capacity: u64 },
	/// A grant would push available credit past the edge capacity.
	#[error("grant of {amount} overflows capacity {capacity} with {available} available")]
	GrantOverflow { amount: u64, available: u64, capacity: u64 },
	/// A second consumer tried to drain a mailbox.
	#[error("mailbox already has an active consumer")]
	DoubleConsume,
	/// An operation reached an entity that already closed.
	#[error("{operation} after close")]
	AfterClosed { operation: &'static str },
	/// A lifecycle transition outside the allowed graph.
	#[error("illegal transition {from} -> {to}")]
	IllegalTransition { from: &'static str, to: &'static str },
	/// Data arrived on an inlet after its end-of-stream marker.
	#[error("data on inlet {inlet} after end of stream")]
	DataAfterEnd { inlet: usize },
	/// A signal referenced an inlet the stage does not have.
	#[error("unknown inlet {inlet}")]
	UnknownInlet { inlet: usize },
	/// Outlet traffic reached a stage with no wired outlet.
	#[error("{operation} without a wired outlet")]
	NoOutlet { operation: &'static str },
}

/// A user processing function failed while handling a batch.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("processing callback failed after {processed} element(s): {message}")]
pub struct CallbackFault {
	/// Failure text returned by the callback.
	pub message: String,
	/// Elements fully processed before the failure.
	pub processed: usize,
}

/// A mailbox consumption callback signalled a fatal error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum QueueFault {
	#[error("behavior failed: {0}")]
	Failed(String),
	#[error("behavior panicked: {0}")]
	Panicked(String),
}

/// Any fault that terminates an actor or a stage.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Fault {
	#[error("protocol violation: {0}")]
	Protocol(#[from] ProtocolViolation),
	#[error(transparent)]
	Callback(#[from] CallbackFault),
	#[error("queue fault: {0}")]
	Queue(#[from] QueueFault),
	#[error(transparent)]
	Codec(#[from] CodecError),
	#[error("task panicked: {0}")]
	Panicked(String),
}

/// A terminated entity together with the cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
	pub entity: Entity,
	pub cause: Fault,
}

pub type FaultReceiver = broadcast::Receiver<FaultEvent>;

/// Cloneable publisher of [`FaultEvent`]s.
///
/// Publishing never blocks. Events are dropped when nobody subscribes.
#[derive(Debug, Clone)]
pub struct FaultBus {
	tx: broadcast::Sender<FaultEvent>,
}

impl Default for FaultBus {
	fn default() -> Self {
		Self::new(128)
	}
}

impl FaultBus {
	/// Creates a bus retaining up to `buffer` undelivered events per subscriber.
	///
	/// # Panics
	///
	/// Panics if `buffer` is zero.
	pub fn new(buffer: usize) -> Self {
		assert!(buffer > 0, "fault buffer size must be > 0");
		let (tx, _) = broadcast::channel(buffer);
		Self { tx }
	}

	/// Subscribes to faults published after this call.
	pub fn subscribe(&self) -> FaultReceiver {
		self.tx.subscribe()
	}

	/// Logs and broadcasts one fault.
	pub fn publish(&self, entity: Entity, cause: Fault) {
		tracing::warn!(entity = %entity, cause = %cause, "worker.fault");
		let _ = self.tx.send(FaultEvent { entity, cause });
	}
}
