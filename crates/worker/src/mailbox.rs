//! Tiered multi-producer, single-consumer actor mailbox.
//!
//! Producers append to a shared inbox under a short lock. Consumer-side
//! storage is a slab-backed linked list per tier, owned by whichever
//! [`ConsumerToken`] is alive, so at most one drain runs at a time and no lock
//! is held while consumption callbacks execute.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

use parking_lot::Mutex;
use serde::Deserialize;
use slab::Slab;

use crate::budget::{DrainBudget, DrainHalt, DrainReport};
use crate::fault::ProtocolViolation;
use crate::id::{ActorId, CorrelationId};
use crate::task_result::TaskResult;

/// Priority tier an envelope is queued under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
	/// Control traffic drained before normal messages.
	Urgent,
	#[default]
	Normal,
}

/// One queued message plus its routing metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope<M> {
	pub payload: M,
	pub sender: Option<ActorId>,
	pub priority: Priority,
	pub correlation: Option<CorrelationId>,
}

impl<M> Envelope<M> {
	/// Wraps a payload as a normal-priority, anonymous message.
	pub fn new(payload: M) -> Self {
		Self {
			payload,
			sender: None,
			priority: Priority::Normal,
			correlation: None,
		}
	}

	#[must_use]
	pub fn from_sender(mut self, sender: ActorId) -> Self {
		self.sender = Some(sender);
		self
	}

	#[must_use]
	pub fn urgent(mut self) -> Self {
		self.priority = Priority::Urgent;
		self
	}

	/// Tags the envelope as the response to (or request of) `id`.
	#[must_use]
	pub fn correlated(mut self, id: CorrelationId) -> Self {
		self.correlation = Some(id);
		self
	}

	pub fn into_payload(self) -> M {
		self.payload
	}
}

/// One tier of a consumption policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct TierSpec {
	pub priority: Priority,
	/// Multiplier applied to the drain budget's message count for this tier.
	pub weight: usize,
}

/// Ordered tiers a mailbox drains, highest priority first.
///
/// Envelopes whose priority has no dedicated tier fall into the last tier.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(try_from = "Vec<TierSpec>")]
pub struct ConsumptionPolicy {
	tiers: Vec<TierSpec>,
}

impl Default for ConsumptionPolicy {
	fn default() -> Self {
		Self::tiered()
	}
}

impl TryFrom<Vec<TierSpec>> for ConsumptionPolicy {
	type Error = String;

	fn try_from(tiers: Vec<TierSpec>) -> Result<Self, Self::Error> {
		if tiers.is_empty() {
			return Err("consumption policy needs at least one tier".to_owned());
		}
		if tiers.iter().any(|t| t.weight == 0) {
			return Err("tier weight must be > 0".to_owned());
		}
		Ok(Self { tiers })
	}
}

impl ConsumptionPolicy {
	/// Builds a policy from explicit tiers.
	///
	/// # Panics
	///
	/// Panics if `tiers` is empty or any weight is zero.
	pub fn new(tiers: Vec<TierSpec>) -> Self {
		match Self::try_from(tiers) {
			Ok(policy) => policy,
			Err(err) => panic!("{err}"),
		}
	}

	/// One FIFO tier; urgent envelopes share it with normal ones.
	pub fn single() -> Self {
		Self::new(vec![TierSpec {
			priority: Priority::Normal,
			weight: 1,
		}])
	}

	/// Urgent tier (double weight) ahead of the normal tier.
	pub fn tiered() -> Self {
		Self::new(vec![
			TierSpec {
				priority: Priority::Urgent,
				weight: 2,
			},
			TierSpec {
				priority: Priority::Normal,
				weight: 1,
			},
		])
	}

	pub fn tiers(&self) -> &[TierSpec] {
		&self.tiers
	}

	fn tier_index(&self, priority: Priority) -> usize {
		self.tiers.iter().position(|t| t.priority == priority).unwrap_or(self.tiers.len() - 1)
	}
}

/// Error returned when pushing into a closed mailbox. Hands the envelope back.
#[derive(Debug, PartialEq, Eq)]
pub enum MailboxSendError<M> {
	Closed(Envelope<M>),
}

impl<M> MailboxSendError<M> {
	pub fn into_envelope(self) -> Envelope<M> {
		match self {
			Self::Closed(envelope) => envelope,
		}
	}
}

impl<M> fmt::Display for MailboxSendError<M> {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::Closed(_) => write!(f, "mailbox closed"),
		}
	}
}

impl<M: fmt::Debug> std::error::Error for MailboxSendError<M> {}

struct Node<M> {
	envelope: Envelope<M>,
	next: Option<usize>,
}

/// Singly linked FIFO whose nodes live in a slab arena.
struct TierQueue<M> {
	nodes: Slab<Node<M>>,
	head: Option<usize>,
	tail: Option<usize>,
}

impl<M> TierQueue<M> {
	fn new() -> Self {
		Self {
			nodes: Slab::new(),
			head: None,
			tail: None,
		}
	}

	fn len(&self) -> usize {
		self.nodes.len()
	}

	fn is_empty(&self) -> bool {
		self.nodes.is_empty()
	}

	fn push_back(&mut self, envelope: Envelope<M>) {
		let key = self.nodes.insert(Node { envelope, next: None });
		match self.tail {
			Some(tail) => self.nodes[tail].next = Some(key),
			None => self.head = Some(key),
		}
		self.tail = Some(key);
	}

	/// Unlinks `key`, whose predecessor is `prev`.
	fn unlink(&mut self, prev: Option<usize>, key: usize) -> Envelope<M> {
		let node = self.nodes.remove(key);
		match prev {
			Some(prev) => self.nodes[prev].next = node.next,
			None => self.head = node.next,
		}
		if self.tail == Some(key) {
			self.tail = prev;
		}
		node.envelope
	}

	fn iter(&self) -> impl Iterator<Item = &Envelope<M>> + '_ {
		let mut cursor = self.head;
		std::iter::from_fn(move || {
			let key = cursor?;
			let node = &self.nodes[key];
			cursor = node.next;
			Some(&node.envelope)
		})
	}

	fn clear(&mut self) -> usize {
		let len = self.nodes.len();
		self.nodes.clear();
		self.head = None;
		self.tail = None;
		len
	}
}

struct Inbox<M> {
	queue: VecDeque<Envelope<M>>,
	closed: bool,
}

/// Per-actor inbox: many producers, one consumer at a time.
pub struct Mailbox<M> {
	policy: ConsumptionPolicy,
	inbox: Mutex<Inbox<M>>,
	consumer: Mutex<Option<Vec<TierQueue<M>>>>,
	/// Items pushed but not yet moved to the consumer tiers.
	fresh: AtomicUsize,
	/// Items anywhere in the mailbox.
	pending: AtomicUsize,
}

impl<M> Mailbox<M> {
	/// Creates an empty mailbox draining according to `policy`.
	pub fn new(policy: ConsumptionPolicy) -> Self {
		let tiers = policy.tiers.iter().map(|_| TierQueue::new()).collect();
		Self {
			policy,
			inbox: Mutex::new(Inbox {
				queue: VecDeque::new(),
				closed: false,
			}),
			consumer: Mutex::new(Some(tiers)),
			fresh: AtomicUsize::new(0),
			pending: AtomicUsize::new(0),
		}
	}

	pub fn policy(&self) -> &ConsumptionPolicy {
		&self.policy
	}

	/// Enqueues one envelope. Safe from any number of threads.
	pub fn push(&self, envelope: Envelope<M>) -> Result<(), MailboxSendError<M>> {
		let mut inbox = self.inbox.lock();
		if inbox.closed {
			return Err(MailboxSendError::Closed(envelope));
		}
		inbox.queue.push_back(envelope);
		self.fresh.fetch_add(1, Ordering::SeqCst);
		self.pending.fetch_add(1, Ordering::SeqCst);
		Ok(())
	}

	/// Takes the exclusive consumer role until the token drops.
	pub fn acquire(&self) -> Result<ConsumerToken<'_, M>, ProtocolViolation> {
		let tiers = self.consumer.lock().take().ok_or(ProtocolViolation::DoubleConsume)?;
		Ok(ConsumerToken { mailbox: self, tiers })
	}

	/// Rejects further pushes and discards queued items without delivering them.
	///
	/// Items held by a live token are discarded when that token drops.
	/// Returns the number of items discarded now.
	pub fn close(&self) -> usize {
		let dropped = {
			let mut inbox = self.inbox.lock();
			inbox.closed = true;
			std::mem::take(&mut inbox.queue)
		};
		let mut discarded = dropped.len();
		self.fresh.fetch_sub(discarded, Ordering::SeqCst);
		if let Some(tiers) = self.consumer.lock().as_mut() {
			discarded += tiers.iter_mut().map(TierQueue::clear).sum::<usize>();
		}
		self.pending.fetch_sub(discarded, Ordering::SeqCst);
		discarded
	}

	pub fn is_closed(&self) -> bool {
		self.inbox.lock().closed
	}

	/// Items queued anywhere in the mailbox, skipped ones included.
	pub fn len(&self) -> usize {
		self.pending.load(Ordering::SeqCst)
	}

	pub fn is_empty(&self) -> bool {
		self.len() == 0
	}

	/// Whether items arrived since the last drain picked up the inbox.
	pub fn has_fresh(&self) -> bool {
		self.fresh.load(Ordering::SeqCst) > 0
	}

	/// Scans only items that no drain has picked up yet.
	pub fn fresh_contains(&self, pred: impl Fn(&Envelope<M>) -> bool) -> bool {
		self.inbox.lock().queue.iter().any(pred)
	}
}

/// Exclusive right to consume one mailbox.
///
/// Owns the consumer-side tiers while alive and hands them back on drop.
pub struct ConsumerToken<'a, M> {
	mailbox: &'a Mailbox<M>,
	tiers: Vec<TierQueue<M>>,
}

impl<M> Drop for ConsumerToken<'_, M> {
	fn drop(&mut self) {
		let mailbox = self.mailbox;
		let mut slot = mailbox.consumer.lock();
		if mailbox.is_closed() {
			self.discard();
		}
		*slot = Some(std::mem::take(&mut self.tiers));
	}
}

impl<M> ConsumerToken<'_, M> {
	fn fetch_fresh(&mut self) {
		let arrived = std::mem::take(&mut self.mailbox.inbox.lock().queue);
		self.mailbox.fresh.fetch_sub(arrived.len(), Ordering::SeqCst);
		for envelope in arrived {
			let tier = self.mailbox.policy.tier_index(envelope.priority);
			self.tiers[tier].push_back(envelope);
		}
	}

	/// Runs one consumption cycle.
	///
	/// Tiers are visited in policy order. Each examined item is handed to
	/// `callback` and its [`TaskResult`] decides removal and continuation; a
	/// callback error removes the item and ends the cycle like `StopAll`.
	pub fn drain<E, F>(&mut self, budget: &DrainBudget, mut callback: F) -> DrainReport<E>
	where
		F: FnMut(&mut Envelope<M>) -> Result<TaskResult, E>,
	{
		self.fetch_fresh();
		let mailbox = self.mailbox;
		let deadline = budget.deadline_from(Instant::now());
		let mut report = DrainReport::new();
		let mut exhausted = false;
		let mut stopped = false;
		let mut examined = 0usize;
		// Tier and first unexamined node when the whole cycle was cut short.
		let mut cut: Option<(usize, Option<usize>)> = None;

		'tiers: for index in 0..self.tiers.len() {
			let limit = budget.max_messages.max(1).saturating_mul(mailbox.policy.tiers[index].weight);
			let tier = &mut self.tiers[index];
			let mut removed = 0usize;
			let mut prev = None;
			let mut cursor = tier.head;

			while let Some(key) = cursor {
				if removed >= limit {
					exhausted = true;
					report.unexamined = true;
					continue 'tiers;
				}
				// The first item is examined even past the deadline.
				if examined > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
					exhausted = true;
					cut = Some((index, Some(key)));
					break 'tiers;
				}

				let verdict = callback(&mut tier.nodes[key].envelope);
				examined += 1;
				let next = tier.nodes[key].next;
				let verdict = match verdict {
					Ok(verdict) => verdict,
					Err(err) => {
						drop(tier.unlink(prev, key));
						mailbox.pending.fetch_sub(1, Ordering::SeqCst);
						report.delivered += 1;
						report.halt = DrainHalt::Fault(err);
						cut = Some((index, next));
						break 'tiers;
					}
				};

				match verdict {
					TaskResult::Resume => {
						drop(tier.unlink(prev, key));
						mailbox.pending.fetch_sub(1, Ordering::SeqCst);
						report.delivered += 1;
						removed += 1;
					}
					TaskResult::Skip => {
						report.skipped += 1;
						prev = Some(key);
					}
					TaskResult::Stop => {
						drop(tier.unlink(prev, key));
						mailbox.pending.fetch_sub(1, Ordering::SeqCst);
						report.delivered += 1;
						stopped = true;
						report.unexamined |= next.is_some();
						continue 'tiers;
					}
					TaskResult::StopAll => {
						drop(tier.unlink(prev, key));
						mailbox.pending.fetch_sub(1, Ordering::SeqCst);
						report.delivered += 1;
						report.halt = DrainHalt::StopAll;
						cut = Some((index, next));
						break 'tiers;
					}
				}
				cursor = next;
			}
		}

		if let Some((index, rest)) = cut {
			report.unexamined |= rest.is_some() || self.tiers[index + 1..].iter().any(|t| !t.is_empty());
		}
		if matches!(report.halt, DrainHalt::Drained) {
			report.halt = if exhausted {
				DrainHalt::QuantumExhausted
			} else if stopped {
				DrainHalt::Stop
			} else {
				DrainHalt::Drained
			};
		}
		report
	}

	/// Whether any queued item matches, including arrivals not yet drained.
	pub fn contains(&self, pred: impl Fn(&Envelope<M>) -> bool) -> bool {
		self.tiers.iter().any(|t| t.iter().any(&pred)) || self.mailbox.fresh_contains(&pred)
	}

	/// Items still queued, arrivals since the last drain included.
	pub fn len(&mut self) -> usize {
		self.fetch_fresh();
		self.tiers.iter().map(TierQueue::len).sum()
	}

	pub fn is_empty(&mut self) -> bool {
		self.len() == 0
	}

	/// Everything still queued, in the order the next drain examines it.
	pub fn queued(&mut self) -> impl Iterator<Item = &Envelope<M>> + '_ {
		self.fetch_fresh();
		self.tiers.iter().flat_map(TierQueue::iter)
	}

	/// Drops every queued item without delivering it.
	pub fn discard(&mut self) -> usize {
		self.fetch_fresh();
		let discarded = self.tiers.iter_mut().map(TierQueue::clear).sum();
		self.mailbox.pending.fetch_sub(discarded, Ordering::SeqCst);
		discarded
	}
}
