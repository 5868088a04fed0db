//! Per-element or per-batch invocation of stage processing callbacks.
//!
//! The mode is fixed when a [`Processor`] is built and never inspected from
//! element types: the constructor used is the tag.

use std::convert::Infallible;

use strum::{Display, IntoStaticStr};
use trellis_worker::CallbackFault;

use crate::batch::Batch;

/// How a stage's callback consumes an incoming batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, IntoStaticStr)]
#[strum(serialize_all = "snake_case")]
pub enum ProcessMode {
	/// One call per element, in arrival order.
	ElementWise,
	/// One call per batch, empty batches included.
	BatchWise,
}

/// Output collector handed to processing callbacks.
#[derive(Debug)]
pub struct Emitter<Out> {
	items: Vec<Out>,
}

impl<Out> Default for Emitter<Out> {
	fn default() -> Self {
		Self { items: Vec::new() }
	}
}

impl<Out> Emitter<Out> {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn emit(&mut self, item: Out) {
		self.items.push(item);
	}

	pub fn emit_all(&mut self, items: impl IntoIterator<Item = Out>) {
		self.items.extend(items);
	}

	pub fn len(&self) -> usize {
		self.items.len()
	}

	pub fn is_empty(&self) -> bool {
		self.items.is_empty()
	}

	pub(crate) fn truncate(&mut self, len: usize) {
		self.items.truncate(len);
	}

	pub(crate) fn take(&mut self) -> Vec<Out> {
		std::mem::take(&mut self.items)
	}
}

/// Accounting for one successful dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Dispatched {
	/// Callback invocations made.
	pub invocations: usize,
	/// Elements in the dispatched batch.
	pub elements: usize,
}

/// Applies a stage's processing logic to one batch.
///
/// On failure nothing the batch produced may remain in `out`; state changes
/// already made by earlier elements stay.
pub trait Dispatch<S, In, Out>: Send {
	fn mode(&self) -> ProcessMode;

	fn dispatch(&mut self, state: &mut S, batch: Batch<In>, out: &mut Emitter<Out>) -> Result<Dispatched, CallbackFault>;
}

type ElementFn<S, In, Out> = dyn FnMut(&mut S, In, &mut Emitter<Out>) -> Result<(), String> + Send;
type BatchFn<S, In, Out> = dyn FnMut(&mut S, &mut Vec<In>, &mut Emitter<Out>) -> Result<(), String> + Send;
type BatchRefFn<S, In, Out> = dyn FnMut(&mut S, &[In], &mut Emitter<Out>) -> Result<(), String> + Send;

enum Callback<S, In, Out> {
	Element(Box<ElementFn<S, In, Out>>),
	Batch(Box<BatchFn<S, In, Out>>),
	BatchRef(Box<BatchRefFn<S, In, Out>>),
}

/// Processing callback plus its declared [`ProcessMode`].
pub struct Processor<S, In, Out> {
	callback: Callback<S, In, Out>,
}

impl<S, In, Out> std::fmt::Debug for Processor<S, In, Out> {
	fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
		f.debug_struct("Processor").field("mode", &self.mode()).finish_non_exhaustive()
	}
}

impl<S, In, Out> Processor<S, In, Out> {
	/// Calls `f` once per element. A failing call aborts the rest of the batch.
	pub fn element_wise<F>(f: F) -> Self
	where
		F: FnMut(&mut S, In, &mut Emitter<Out>) -> Result<(), String> + Send + 'static,
	{
		Self {
			callback: Callback::Element(Box::new(f)),
		}
	}

	/// Calls `f` once per batch with mutable access to its elements.
	pub fn batch_wise<F>(f: F) -> Self
	where
		F: FnMut(&mut S, &mut Vec<In>, &mut Emitter<Out>) -> Result<(), String> + Send + 'static,
	{
		Self {
			callback: Callback::Batch(Box::new(f)),
		}
	}

	/// Calls `f` once per batch with read-only access to its elements.
	pub fn batch_wise_ref<F>(f: F) -> Self
	where
		F: FnMut(&mut S, &[In], &mut Emitter<Out>) -> Result<(), String> + Send + 'static,
	{
		Self {
			callback: Callback::BatchRef(Box::new(f)),
		}
	}

	pub fn mode(&self) -> ProcessMode {
		match self.callback {
			Callback::Element(_) => ProcessMode::ElementWise,
			Callback::Batch(_) | Callback::BatchRef(_) => ProcessMode::BatchWise,
		}
	}
}

/// Sink-side constructors: callbacks that consume without emitting.
impl<S, In> Processor<S, In, Infallible> {
	pub fn for_each<F>(mut f: F) -> Self
	where
		F: FnMut(&mut S, In) -> Result<(), String> + Send + 'static,
	{
		Self::element_wise(move |state, item, _| f(state, item))
	}

	pub fn for_batch<F>(mut f: F) -> Self
	where
		F: FnMut(&mut S, &mut Vec<In>) -> Result<(), String> + Send + 'static,
	{
		Self::batch_wise(move |state, items, _| f(state, items))
	}

	pub fn for_batch_ref<F>(mut f: F) -> Self
	where
		F: FnMut(&mut S, &[In]) -> Result<(), String> + Send + 'static,
	{
		Self::batch_wise_ref(move |state, items, _| f(state, items))
	}
}

impl<S, In, Out> Dispatch<S, In, Out> for Processor<S, In, Out> {
	fn mode(&self) -> ProcessMode {
		Processor::mode(self)
	}

	fn dispatch(&mut self, state: &mut S, batch: Batch<In>, out: &mut Emitter<Out>) -> Result<Dispatched, CallbackFault> {
		let mark = out.len();
		let elements = batch.len();
		let result = match &mut self.callback {
			Callback::Element(f) => {
				let mut processed = 0;
				let mut outcome = Ok(());
				for item in batch {
					if let Err(message) = f(state, item, out) {
						outcome = Err(CallbackFault { message, processed });
						break;
					}
					processed += 1;
				}
				outcome.map(|()| Dispatched {
					invocations: processed,
					elements,
				})
			}
			Callback::Batch(f) => {
				let mut items = batch.into_vec();
				f(state, &mut items, out)
					.map(|()| Dispatched { invocations: 1, elements })
					.map_err(|message| CallbackFault { message, processed: 0 })
			}
			Callback::BatchRef(f) => {
				f(state, batch.as_slice(), out)
					.map(|()| Dispatched { invocations: 1, elements })
					.map_err(|message| CallbackFault { message, processed: 0 })
			}
		};
		if result.is_err() {
			out.truncate(mark);
		}
		result
	}
}
