use serde::Deserialize;

/// Per-stage edge sizing.
///
/// `capacity` bounds both the credit a stage grants on each inlet and the
/// largest batch it may emit. Grants happen once buffered data drained or
/// upstream credit falls below `low_watermark`; emission waits until at
/// least `min_batch` credit is available.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct StageConfig {
	pub capacity: u64,
	pub low_watermark: u64,
	pub min_batch: u64,
}

impl Default for StageConfig {
	fn default() -> Self {
		Self {
			capacity: 64,
			low_watermark: 16,
			min_batch: 1,
		}
	}
}

impl StageConfig {
	/// # Panics
	///
	/// Panics if `capacity` is zero.
	#[must_use]
	pub fn capacity(mut self, capacity: u64) -> Self {
		assert!(capacity > 0, "stage capacity must be > 0");
		self.capacity = capacity;
		self.low_watermark = self.low_watermark.min(capacity);
		self.min_batch = self.min_batch.min(capacity);
		self
	}

	/// # Panics
	///
	/// Panics if `low_watermark` exceeds the capacity.
	#[must_use]
	pub fn low_watermark(mut self, low_watermark: u64) -> Self {
		assert!(low_watermark <= self.capacity, "low watermark must not exceed capacity");
		self.low_watermark = low_watermark;
		self
	}

	/// # Panics
	///
	/// Panics if `min_batch` is zero or exceeds the capacity.
	#[must_use]
	pub fn min_batch(mut self, min_batch: u64) -> Self {
		assert!(min_batch > 0, "min batch must be > 0");
		assert!(min_batch <= self.capacity, "min batch must not exceed capacity");
		self.min_batch = min_batch;
		self
	}

	/// Rechecks the setter invariants, for configs built by deserialization.
	///
	/// # Panics
	///
	/// Panics on a zero capacity, a zero min batch, or either bound above
	/// the capacity.
	pub(crate) fn validated(self) -> Self {
		Self::default().capacity(self.capacity).low_watermark(self.low_watermark).min_batch(self.min_batch)
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn defaults_and_partial_deserialization() {
		assert_eq!(
			StageConfig::default(),
			StageConfig {
				capacity: 64,
				low_watermark: 16,
				min_batch: 1,
			}
		);
		let config: StageConfig = serde_json::from_str(r#"{"capacity": 8, "low_watermark": 3}"#).expect("config");
		assert_eq!(config, StageConfig::default().capacity(8).low_watermark(3));
	}

	#[test]
	fn shrinking_capacity_clamps_the_bounds() {
		let config = StageConfig::default().capacity(4);
		assert_eq!((config.low_watermark, config.min_batch), (4, 1));
	}

	#[test]
	#[should_panic(expected = "min batch must not exceed capacity")]
	fn min_batch_above_capacity_is_rejected() {
		let _ = StageConfig::default().capacity(4).min_batch(5);
	}

	#[test]
	#[should_panic(expected = "stage capacity must be > 0")]
	fn deserialized_zero_capacity_is_rejected_on_validation() {
		let config: StageConfig = serde_json::from_str(r#"{"capacity": 0}"#).expect("config");
		let _ = config.validated();
	}
}
