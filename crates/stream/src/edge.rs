//! Channels carrying data downstream and credit upstream.
//!
//! Every stage with inlets owns one data receiver shared by all of them;
//! signals carry the inlet index they arrived on. Every stage with an outlet
//! owns one control receiver fed by its single downstream. A remote transport
//! presents decoded traffic through these same types.

use tokio::sync::mpsc;

use crate::batch::Batch;

/// Index of an inlet within its stage, in wiring order.
pub type InletId = usize;

/// Downstream-bound traffic on one edge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StageSignal<T> {
	/// A credited batch.
	Batch { inlet: InletId, batch: Batch<T> },
	/// No data follows on this inlet.
	End { inlet: InletId },
	/// Upstream faulted; no data follows and nothing should be finalized.
	Abort { inlet: InletId, cause: String },
}

impl<T> StageSignal<T> {
	pub fn inlet(&self) -> InletId {
		match self {
			Self::Batch { inlet, .. } | Self::End { inlet } | Self::Abort { inlet, .. } => *inlet,
		}
	}
}

/// Upstream-bound traffic on one edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
	/// Additional buffer headroom granted by downstream.
	Credit(u64),
	/// Downstream closed; stop producing.
	Cancel,
}

pub(crate) type DataReceiver<T> = mpsc::UnboundedReceiver<StageSignal<T>>;
pub(crate) type ControlReceiver = mpsc::UnboundedReceiver<Control>;

/// Upstream end of a data edge, bound to one downstream inlet.
#[derive(Debug)]
pub struct EdgeSender<T> {
	inlet: InletId,
	tx: mpsc::UnboundedSender<StageSignal<T>>,
}

impl<T> Clone for EdgeSender<T> {
	fn clone(&self) -> Self {
		Self {
			inlet: self.inlet,
			tx: self.tx.clone(),
		}
	}
}

impl<T> EdgeSender<T> {
	pub(crate) fn new(inlet: InletId, tx: mpsc::UnboundedSender<StageSignal<T>>) -> Self {
		Self { inlet, tx }
	}

	pub fn inlet(&self) -> InletId {
		self.inlet
	}

	/// Returns `false` once the downstream stage is gone.
	pub fn batch(&self, batch: Batch<T>) -> bool {
		self.tx.send(StageSignal::Batch { inlet: self.inlet, batch }).is_ok()
	}

	pub fn end(&self) -> bool {
		self.tx.send(StageSignal::End { inlet: self.inlet }).is_ok()
	}

	pub fn abort(&self, cause: impl Into<String>) -> bool {
		self.tx
			.send(StageSignal::Abort {
				inlet: self.inlet,
				cause: cause.into(),
			})
			.is_ok()
	}

	pub fn is_closed(&self) -> bool {
		self.tx.is_closed()
	}
}

/// Downstream end of a control edge.
#[derive(Debug, Clone)]
pub struct ControlSender {
	tx: mpsc::UnboundedSender<Control>,
}

impl ControlSender {
	pub(crate) fn new(tx: mpsc::UnboundedSender<Control>) -> Self {
		Self { tx }
	}

	pub fn grant(&self, amount: u64) -> bool {
		self.tx.send(Control::Credit(amount)).is_ok()
	}

	pub fn cancel(&self) -> bool {
		self.tx.send(Control::Cancel).is_ok()
	}
}

pub(crate) fn data_channel<T>() -> (mpsc::UnboundedSender<StageSignal<T>>, DataReceiver<T>) {
	mpsc::unbounded_channel()
}

pub(crate) fn control_channel() -> (ControlSender, ControlReceiver) {
	let (tx, rx) = mpsc::unbounded_channel();
	(ControlSender::new(tx), rx)
}
