use std::time::{Duration, Instant};

use serde::Deserialize;

/// Fairness quantum bounding one mailbox drain.
///
/// `max_messages` counts removed items per tier round (scaled by the tier
/// weight); `max_duration` bounds the whole cycle, skipped items included.
///
/// A cycle always examines at least one item, so even a budget whose
/// deadline has already passed makes progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "BudgetFields")]
pub struct DrainBudget {
	pub max_messages: usize,
	pub max_duration: Option<Duration>,
}

impl Default for DrainBudget {
	fn default() -> Self {
		Self {
			max_messages: 32,
			max_duration: None,
		}
	}
}

#[derive(Deserialize)]
#[serde(default)]
struct BudgetFields {
	max_messages: usize,
	max_duration: Option<Duration>,
}

impl Default for BudgetFields {
	fn default() -> Self {
		let DrainBudget { max_messages, max_duration } = DrainBudget::default();
		Self { max_messages, max_duration }
	}
}

impl TryFrom<BudgetFields> for DrainBudget {
	type Error = String;

	fn try_from(fields: BudgetFields) -> Result<Self, Self::Error> {
		let budget = Self {
			max_messages: fields.max_messages,
			max_duration: fields.max_duration,
		};
		budget.check()?;
		Ok(budget)
	}
}

impl DrainBudget {
	/// Budget bounded only by a message count.
	///
	/// # Panics
	///
	/// Panics if `max_messages` is zero.
	#[must_use]
	pub fn messages(max_messages: usize) -> Self {
		assert!(max_messages > 0, "drain budget must allow at least one message");
		Self {
			max_messages,
			max_duration: None,
		}
	}

	/// Adds a wall-clock bound to the budget.
	///
	/// # Panics
	///
	/// Panics if `duration` is zero.
	#[must_use]
	pub fn with_duration(mut self, duration: Duration) -> Self {
		assert!(!duration.is_zero(), "drain budget duration must be > 0");
		self.max_duration = Some(duration);
		self
	}

	/// Rejects budgets that would never let a tier remove anything.
	pub fn check(&self) -> Result<(), String> {
		if self.max_messages == 0 {
			return Err("drain budget must allow at least one message".to_owned());
		}
		if self.max_duration.is_some_and(|d| d.is_zero()) {
			return Err("drain budget duration must be > 0".to_owned());
		}
		Ok(())
	}

	pub(crate) fn deadline_from(&self, start: Instant) -> Option<Instant> {
		self.max_duration.map(|d| start + d)
	}
}

/// Why a drain cycle ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DrainHalt<E> {
	/// Every tier was scanned to its end.
	Drained,
	/// A tier limit or the cycle deadline was reached.
	QuantumExhausted,
	/// At least one tier round ended with [`TaskResult::Stop`](crate::TaskResult::Stop).
	Stop,
	/// The cycle ended with [`TaskResult::StopAll`](crate::TaskResult::StopAll).
	StopAll,
	/// The callback failed; handled as an implicit stop-all.
	Fault(E),
}

/// Summary of one drain cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DrainReport<E> {
	/// Items removed from the mailbox, the faulting item included.
	pub delivered: usize,
	/// Items examined and left in place.
	pub skipped: usize,
	/// Items that were never examined because a round ended early.
	pub unexamined: bool,
	pub halt: DrainHalt<E>,
}

impl<E> DrainReport<E> {
	pub(crate) fn new() -> Self {
		Self {
			delivered: 0,
			skipped: 0,
			unexamined: false,
			halt: DrainHalt::Drained,
		}
	}

	/// Whether the callback failed during this cycle.
	pub fn is_fault(&self) -> bool {
		matches!(self.halt, DrainHalt::Fault(_))
	}

	/// Takes the callback failure, if any.
	pub fn into_fault(self) -> Option<E> {
		match self.halt {
			DrainHalt::Fault(err) => Some(err),
			_ => None,
		}
	}
}
