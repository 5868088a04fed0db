//! Async task running one stage state machine against its edges.

use std::panic::{AssertUnwindSafe, catch_unwind};

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TryRecvError;
use tokio_util::sync::CancellationToken;
use trellis_worker::{Entity, Fault, FaultBus, panic_message};

use crate::edge::{Control, ControlReceiver, ControlSender, DataReceiver, EdgeSender, StageSignal};
use crate::stage::{CloseSignal, Effect, Effects, StageExit, StageLogic};

/// Channel ends owned by one running stage.
pub(crate) struct StageIo<In, Out> {
	pub(crate) data: Option<DataReceiver<In>>,
	pub(crate) control: Option<ControlReceiver>,
	pub(crate) outlet: Option<EdgeSender<Out>>,
	/// Control senders indexed by inlet.
	pub(crate) upstreams: Vec<ControlSender>,
}

enum Event<In> {
	Cancelled,
	Control(Option<Control>),
	Data(Option<StageSignal<In>>),
}

async fn recv<T>(rx: Option<&mut mpsc::UnboundedReceiver<T>>) -> Option<T> {
	match rx {
		Some(rx) => rx.recv().await,
		None => std::future::pending().await,
	}
}

impl<In, Out> StageIo<In, Out> {
	/// Already-queued control traffic, checked before producing more output.
	fn poll_now(&mut self, cancel: &CancellationToken) -> Option<Event<In>> {
		if cancel.is_cancelled() {
			return Some(Event::Cancelled);
		}
		let control = self.control.as_mut()?;
		match control.try_recv() {
			Ok(control) => Some(Event::Control(Some(control))),
			Err(TryRecvError::Disconnected) => Some(Event::Control(None)),
			Err(TryRecvError::Empty) => None,
		}
	}

	async fn next_event(&mut self, cancel: &CancellationToken) -> Event<In> {
		tokio::select! {
			biased;
			() = cancel.cancelled() => Event::Cancelled,
			control = recv(self.control.as_mut()) => Event::Control(control),
			signal = recv(self.data.as_mut()) => Event::Data(signal),
		}
	}

	/// Puts effects on the wire. Returns `false` if downstream is gone.
	fn apply(&self, effects: Effects<Out>) -> bool {
		let mut delivered = true;
		for effect in effects {
			match effect {
				Effect::Emit(batch) => delivered &= self.outlet.as_ref().is_some_and(|outlet| outlet.batch(batch)),
				Effect::End => delivered &= self.outlet.as_ref().is_some_and(EdgeSender::end),
				Effect::AbortDownstream(cause) => {
					if let Some(outlet) = &self.outlet {
						outlet.abort(cause);
					}
				}
				// An upstream that already finished no longer listens.
				Effect::Grant { inlet, amount } => {
					if let Some(upstream) = self.upstreams.get(inlet) {
						upstream.grant(amount);
					}
				}
				Effect::CancelUpstream { inlet } => {
					if let Some(upstream) = self.upstreams.get(inlet) {
						upstream.cancel();
					}
				}
			}
		}
		delivered
	}
}

/// Sends an abort downstream if the driver unwinds or is dropped mid-run.
struct AbortOnDrop<Out> {
	outlet: Option<EdgeSender<Out>>,
}

impl<Out> AbortOnDrop<Out> {
	fn disarm(&mut self) {
		self.outlet = None;
	}
}

impl<Out> Drop for AbortOnDrop<Out> {
	fn drop(&mut self) {
		if let Some(outlet) = self.outlet.take() {
			outlet.abort("stage task ended unexpectedly");
		}
	}
}

fn guarded<T>(hook: impl FnOnce() -> Result<T, Fault>) -> Result<T, Fault> {
	catch_unwind(AssertUnwindSafe(hook)).unwrap_or_else(|payload| Err(Fault::Panicked(panic_message(payload.as_ref()))))
}

fn apply_or_close<L: StageLogic>(logic: &mut L, io: &StageIo<L::In, L::Out>, effects: Effects<L::Out>) -> Result<(), Fault> {
	if !io.apply(effects) && !logic.is_closed() {
		let effects = guarded(|| logic.on_close(CloseSignal::Downstream))?;
		io.apply(effects);
	}
	Ok(())
}

async fn run<L: StageLogic>(logic: &mut L, io: &mut StageIo<L::In, L::Out>, cancel: &CancellationToken) -> Result<(), Fault> {
	let effects = guarded(|| logic.on_start())?;
	apply_or_close(logic, io, effects)?;

	while !logic.is_closed() {
		let event = match io.poll_now(cancel) {
			Some(event) => event,
			None if logic.wants_to_produce() => {
				let effects = guarded(|| logic.produce())?;
				apply_or_close(logic, io, effects)?;
				tokio::task::yield_now().await;
				continue;
			}
			None => io.next_event(cancel).await,
		};

		let effects = match event {
			Event::Cancelled => guarded(|| logic.on_close(CloseSignal::Local))?,
			Event::Control(Some(Control::Credit(amount))) => guarded(|| logic.on_credit(amount))?,
			Event::Control(Some(Control::Cancel)) => guarded(|| logic.on_close(CloseSignal::Downstream))?,
			Event::Control(None) => {
				io.control = None;
				guarded(|| logic.on_close(CloseSignal::Downstream))?
			}
			Event::Data(Some(StageSignal::Batch { inlet, batch })) => guarded(|| logic.on_batch(inlet, batch))?,
			Event::Data(Some(StageSignal::End { inlet })) => guarded(|| logic.on_end(inlet))?,
			Event::Data(Some(StageSignal::Abort { inlet, cause })) => guarded(|| logic.on_abort(inlet, cause))?,
			// Ended inlets are not lost; the stage keeps serving credit
			// until its backlog drains.
			Event::Data(None) => {
				io.data = None;
				guarded(|| logic.on_close(CloseSignal::UpstreamLost))?
			}
		};
		apply_or_close(logic, io, effects)?;
	}
	Ok(())
}

/// Runs `logic` until it closes and returns its exit.
///
/// Faults raised by hooks, panics included, close the stage through
/// [`StageLogic::fail`] and are published on `faults`.
pub(crate) async fn drive<L: StageLogic>(mut logic: L, mut io: StageIo<L::In, L::Out>, cancel: CancellationToken, entity: Entity, faults: FaultBus) -> StageExit<L::State> {
	let mut guard = AbortOnDrop { outlet: io.outlet.clone() };
	tracing::debug!(stage = %entity, role = %logic.role(), "stream.stage.start");

	if let Err(fault) = run(&mut logic, &mut io, &cancel).await {
		let effects = logic.fail(fault.clone());
		io.apply(effects);
		faults.publish(entity.clone(), fault);
	}
	guard.disarm();

	let exit = logic.finish();
	tracing::debug!(
		stage = %entity,
		reason = ?exit.reason,
		batches_in = exit.stats.batches_in,
		batches_out = exit.stats.batches_out,
		"stream.stage.exit"
	);
	exit
}
