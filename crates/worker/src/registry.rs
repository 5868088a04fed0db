use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::actor::{ActorState, Resumable};
use crate::id::ActorId;

/// Snapshot of one live actor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActorRecord {
	pub id: ActorId,
	pub name: String,
	pub state: ActorState,
	pub pending: usize,
}

/// Live actors keyed by id, as seen by the scheduler's workers.
#[derive(Default, Clone)]
pub(crate) struct ActorTable {
	inner: Arc<RwLock<HashMap<ActorId, Arc<dyn Resumable>>>>,
}

impl ActorTable {
	pub(crate) fn insert(&self, cell: Arc<dyn Resumable>) {
		self.inner.write().insert(cell.id(), cell);
	}

	pub(crate) fn get(&self, id: ActorId) -> Option<Arc<dyn Resumable>> {
		self.inner.read().get(&id).cloned()
	}

	pub(crate) fn remove(&self, id: ActorId) -> Option<Arc<dyn Resumable>> {
		self.inner.write().remove(&id)
	}

	/// Empties the table, returning every actor still registered.
	pub(crate) fn take_all(&self) -> Vec<Arc<dyn Resumable>> {
		self.inner.write().drain().map(|(_, cell)| cell).collect()
	}

	pub(crate) fn len(&self) -> usize {
		self.inner.read().len()
	}

	/// Returns snapshots sorted by name, then id.
	pub(crate) fn snapshots(&self) -> Vec<ActorRecord> {
		let mut records: Vec<_> = self
			.inner
			.read()
			.values()
			.map(|cell| ActorRecord {
				id: cell.id(),
				name: cell.entity().name().to_owned(),
				state: cell.state(),
				pending: cell.pending(),
			})
			.collect();
		records.sort_by(|a, b| a.name.cmp(&b.name).then(a.id.cmp(&b.id)));
		records
	}
}
