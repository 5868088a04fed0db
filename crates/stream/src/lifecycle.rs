use strum::{Display, EnumIter, EnumString, FromRepr, IntoStaticStr};
use trellis_worker::ProtocolViolation;

/// Externally visible stage lifecycle.
///
/// `Initializing -> Running <-> Paused -> Closing -> Closed`. Closing is
/// reachable from every live state and `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumString, IntoStaticStr, FromRepr, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[repr(u8)]
pub enum StageState {
	Initializing = 0,
	Running = 1,
	/// Waiting for a credit grant.
	Paused = 2,
	/// Flushing and propagating the close.
	Closing = 3,
	Closed = 4,
}

trellis_worker::impl_enum_codec!(StageState, "stage_state");

impl StageState {
	pub const fn is_live(self) -> bool {
		matches!(self, Self::Running | Self::Paused)
	}

	const fn allows(self, to: Self) -> bool {
		use StageState::*;
		matches!(
			(self, to),
			(Initializing, Running | Closing) | (Running, Paused | Closing) | (Paused, Running | Paused | Closing) | (Closing, Closed)
		)
	}
}

/// Validated holder of a [`StageState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
	state: StageState,
}

impl Default for Lifecycle {
	fn default() -> Self {
		Self {
			state: StageState::Initializing,
		}
	}
}

impl Lifecycle {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn state(&self) -> StageState {
		self.state
	}

	/// Moves to `to`, rejecting anything outside the lifecycle graph.
	pub fn transition(&mut self, to: StageState) -> Result<(), ProtocolViolation> {
		if self.state == StageState::Closed {
			return Err(ProtocolViolation::AfterClosed { operation: to.into() });
		}
		if !self.state.allows(to) {
			return Err(ProtocolViolation::IllegalTransition {
				from: self.state.into(),
				to: to.into(),
			});
		}
		self.state = to;
		Ok(())
	}

	/// Fails with [`ProtocolViolation::AfterClosed`] once the stage closed.
	pub fn ensure_open(&self, operation: &'static str) -> Result<(), ProtocolViolation> {
		if self.state == StageState::Closed {
			return Err(ProtocolViolation::AfterClosed { operation });
		}
		Ok(())
	}
}
