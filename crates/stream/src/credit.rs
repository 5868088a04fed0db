//! Per-edge credit accounting.
//!
//! Each edge has two halves. The upstream stage owns a [`CreditLedger`] and
//! debits it for every emitted batch; the downstream stage owns a
//! [`CreditWindow`] and decides when to grant more. Grants and data travel
//! as messages, so neither half touches the other's counters.

use trellis_worker::ProtocolViolation;

/// Upstream view of one edge: how many elements may still be emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditLedger {
	capacity: u64,
	available: u64,
	granted_total: u64,
	emitted_total: u64,
}

impl CreditLedger {
	/// Creates a ledger with no credit.
	///
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	pub fn new(capacity: u64) -> Self {
		assert!(capacity > 0, "edge capacity must be > 0");
		Self {
			capacity,
			available: 0,
			granted_total: 0,
			emitted_total: 0,
		}
	}

	/// Adds downstream-granted headroom.
	pub fn grant(&mut self, amount: u64) -> Result<(), ProtocolViolation> {
		let available = self.available.checked_add(amount).filter(|total| *total <= self.capacity).ok_or(ProtocolViolation::GrantOverflow {
			amount,
			available: self.available,
			capacity: self.capacity,
		})?;
		self.available = available;
		self.granted_total += amount;
		Ok(())
	}

	/// Debits credit for one whole batch.
	pub fn debit(&mut self, len: u64) -> Result<(), ProtocolViolation> {
		if len > self.capacity {
			return Err(ProtocolViolation::BatchExceedsCapacity { len, capacity: self.capacity });
		}
		if len > self.available {
			return Err(ProtocolViolation::CreditOverrun {
				requested: len,
				available: self.available,
			});
		}
		self.available -= len;
		self.emitted_total += len;
		Ok(())
	}

	/// Whether a batch of `len` elements can be emitted right now.
	pub fn fits(&self, len: u64) -> bool {
		len <= self.available
	}

	pub fn available(&self) -> u64 {
		self.available
	}

	pub fn capacity(&self) -> u64 {
		self.capacity
	}

	pub fn granted_total(&self) -> u64 {
		self.granted_total
	}

	pub fn emitted_total(&self) -> u64 {
		self.emitted_total
	}
}

/// Downstream view of one inlet: credit handed out and elements held.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditWindow {
	capacity: u64,
	low_watermark: u64,
	/// Granted but not yet received.
	outstanding: u64,
	/// Received but not yet processed.
	buffered: u64,
}

impl CreditWindow {
	/// # Panics
	///
	/// Panics if `capacity` is zero or `low_watermark` exceeds it.
	pub fn new(capacity: u64, low_watermark: u64) -> Self {
		assert!(capacity > 0, "edge capacity must be > 0");
		assert!(low_watermark <= capacity, "low watermark must not exceed capacity");
		Self {
			capacity,
			low_watermark,
			outstanding: 0,
			buffered: 0,
		}
	}

	/// Full headroom, granted when the stage starts.
	pub fn initial_grant(&mut self) -> u64 {
		let amount = self.headroom();
		self.outstanding += amount;
		amount
	}

	/// Accounts for an arriving batch.
	pub fn receive(&mut self, len: u64) -> Result<(), ProtocolViolation> {
		if len > self.outstanding {
			return Err(ProtocolViolation::CreditOverrun {
				requested: len,
				available: self.outstanding,
			});
		}
		self.outstanding -= len;
		self.buffered += len;
		Ok(())
	}

	/// Accounts for elements handed to the processing callback.
	pub fn consume(&mut self, len: u64) {
		self.buffered = self.buffered.saturating_sub(len);
	}

	/// Grants the free headroom once buffered data is drained or upstream
	/// runs low on credit.
	pub fn replenish(&mut self) -> Option<u64> {
		let amount = self.headroom();
		if amount == 0 || (self.buffered > 0 && self.outstanding >= self.low_watermark) {
			return None;
		}
		self.outstanding += amount;
		Some(amount)
	}

	pub fn outstanding(&self) -> u64 {
		self.outstanding
	}

	pub fn buffered(&self) -> u64 {
		self.buffered
	}

	fn headroom(&self) -> u64 {
		self.capacity - self.outstanding - self.buffered
	}
}
