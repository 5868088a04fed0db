use std::sync::atomic::AtomicBool;

use pretty_assertions::assert_eq;

use super::*;
use crate::codec::{CodecError, EnumCodec};
use crate::mailbox::ConsumptionPolicy;

#[derive(Clone, Default)]
struct Probe {
	seen: Arc<Mutex<Vec<u32>>>,
	stopped: Arc<AtomicBool>,
}

impl Probe {
	fn seen(&self) -> Vec<u32> {
		self.seen.lock().clone()
	}

	fn stopped(&self) -> bool {
		self.stopped.load(Ordering::SeqCst)
	}
}

#[derive(Default)]
struct Recorder {
	probe: Probe,
	start_error: Option<&'static str>,
	fail_on: Option<u32>,
	panic_on: Option<u32>,
	stop_on: Option<u32>,
}

impl Behavior for Recorder {
	type Msg = u32;

	fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), String> {
		match self.start_error {
			Some(err) => Err(err.to_owned()),
			None => Ok(()),
		}
	}

	fn handle(&mut self, envelope: &mut Envelope<u32>, ctx: &mut ActorContext) -> Result<TaskResult, String> {
		let value = envelope.payload;
		self.probe.seen.lock().push(value);
		if self.fail_on == Some(value) {
			return Err(format!("bad message {value}"));
		}
		if self.panic_on == Some(value) {
			panic!("kaboom");
		}
		if self.stop_on == Some(value) {
			return Ok(ctx.stop());
		}
		Ok(TaskResult::Resume)
	}

	fn on_stop(&mut self, _ctx: &mut ActorContext) {
		self.probe.stopped.store(true, Ordering::SeqCst);
	}
}

struct Harness<B: Behavior> {
	ready: Arc<ReadyQueue>,
	actor: ActorRef<B::Msg>,
	cell: ActorCell<B>,
}

fn harness<B: Behavior>(behavior: B) -> Harness<B> {
	let ready = Arc::new(ReadyQueue::new());
	let shared = Arc::new(ActorShared::new(ActorId(1), "probe".into(), Mailbox::new(ConsumptionPolicy::default()), Arc::clone(&ready)));
	let cell = ActorCell::new(Arc::clone(&shared), behavior, IdClock::new());
	Harness {
		ready,
		actor: ActorRef::new(shared),
		cell,
	}
}

fn terminated(resumption: Resumption) -> ActorExit {
	match resumption {
		Resumption::Terminated(exit) => exit,
		other => panic!("expected termination, got {other:?}"),
	}
}

#[test]
fn fault_on_third_of_five_terminates_and_discards_the_rest() {
	let probe = Probe::default();
	let h = harness(Recorder {
		probe: probe.clone(),
		fail_on: Some(3),
		..Recorder::default()
	});
	for value in 1..=5 {
		h.actor.tell(value).expect("open mailbox");
	}

	let exit = terminated(h.cell.resume(&DrainBudget::default()));
	assert_eq!(exit.kind(), ActorExitKind::Faulted);
	assert!(exit.is_failure());
	assert_eq!(exit.fault(), Some(&Fault::Queue(QueueFault::Failed("bad message 3".into()))));
	assert_eq!(probe.seen(), vec![1, 2, 3]);
	assert!(probe.stopped());

	assert_eq!(h.actor.state(), ActorState::Terminated);
	assert_eq!(h.actor.pending(), 0);
	assert_eq!(h.actor.exit(), Some(exit));
	assert!(h.actor.tell(6).is_err());
}

#[test]
fn empty_mailbox_parks_and_an_arrival_readmits() {
	let probe = Probe::default();
	let h = harness(Recorder {
		probe: probe.clone(),
		..Recorder::default()
	});

	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Parked);
	assert_eq!(h.actor.state(), ActorState::Idle);
	assert_eq!(h.ready.try_pop(), None);

	h.actor.tell(7).expect("open mailbox");
	assert_eq!(h.actor.state(), ActorState::Ready);
	assert_eq!(h.ready.try_pop(), Some(ActorId(1)));
	h.actor.tell(8).expect("open mailbox");
	assert_eq!(h.ready.try_pop(), None, "ready actors are enqueued once");

	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Parked);
	assert_eq!(probe.seen(), vec![7, 8]);
}

#[test]
fn quantum_exhaustion_requeues_until_drained() {
	let probe = Probe::default();
	let h = harness(Recorder {
		probe: probe.clone(),
		..Recorder::default()
	});
	for value in 1..=5 {
		h.actor.tell(value).expect("open mailbox");
	}

	let budget = DrainBudget::messages(2);
	assert_eq!(h.cell.resume(&budget), Resumption::Requeue);
	assert_eq!(h.actor.state(), ActorState::Ready);
	assert_eq!(probe.seen(), vec![1, 2]);
	assert_eq!(h.cell.resume(&budget), Resumption::Requeue);
	assert_eq!(h.cell.resume(&budget), Resumption::Parked);
	assert_eq!(probe.seen(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn resume_outside_ready_is_skipped() {
	let h = harness(Recorder::default());
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Parked);
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Skipped);
}

#[test]
fn panic_in_handler_becomes_a_queue_fault() {
	let probe = Probe::default();
	let h = harness(Recorder {
		probe: probe.clone(),
		panic_on: Some(2),
		..Recorder::default()
	});
	for value in 1..=3 {
		h.actor.tell(value).expect("open mailbox");
	}

	let exit = terminated(h.cell.resume(&DrainBudget::default()));
	assert_eq!(exit.kind(), ActorExitKind::Faulted);
	assert_eq!(exit.fault(), Some(&Fault::Queue(QueueFault::Panicked("kaboom".into()))));
	assert_eq!(probe.seen(), vec![1, 2]);
	assert_eq!(h.actor.pending(), 0);
}

#[test]
fn startup_failure_skips_on_stop_and_discards_messages() {
	let probe = Probe::default();
	let h = harness(Recorder {
		probe: probe.clone(),
		start_error: Some("no config"),
		..Recorder::default()
	});
	h.actor.tell(1).expect("open mailbox");

	let exit = terminated(h.cell.resume(&DrainBudget::default()));
	assert_eq!(exit.kind(), ActorExitKind::StartupFailed);
	assert_eq!(exit.fault(), Some(&Fault::Queue(QueueFault::Failed("no config".into()))));
	assert!(probe.seen().is_empty());
	assert!(!probe.stopped());
	assert_eq!(h.actor.pending(), 0);
}

#[test]
fn stop_request_exits_normally() {
	let probe = Probe::default();
	let h = harness(Recorder {
		probe: probe.clone(),
		stop_on: Some(2),
		..Recorder::default()
	});
	for value in 1..=3 {
		h.actor.tell(value).expect("open mailbox");
	}

	let exit = terminated(h.cell.resume(&DrainBudget::default()));
	assert_eq!(exit.kind(), ActorExitKind::Stopped);
	assert_eq!(exit.fault(), None);
	assert!(!exit.is_failure());
	assert_eq!(probe.seen(), vec![1, 2]);
	assert!(probe.stopped());
	assert_eq!(h.actor.pending(), 0);
}

#[test]
fn kill_readmits_an_idle_actor_and_terminates_it() {
	let h = harness(Recorder::default());
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Parked);

	h.cell.kill();
	assert_eq!(h.actor.state(), ActorState::Ready);
	assert_eq!(h.ready.try_pop(), Some(ActorId(1)));
	assert_eq!(terminated(h.cell.resume(&DrainBudget::default())).kind(), ActorExitKind::Killed);
}

#[test]
fn abandon_terminates_once() {
	let h = harness(Recorder::default());
	let exit = h.cell.abandon().expect("live actor");
	assert_eq!(exit.kind(), ActorExitKind::Shutdown);
	assert_eq!(h.cell.abandon(), None);
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Skipped);
}

#[derive(Debug)]
enum Ask {
	Start,
	Other(u32),
	Reply(u32),
}

#[derive(Default)]
struct Waiter {
	log: Arc<Mutex<Vec<String>>>,
	pending: Arc<Mutex<Option<CorrelationId>>>,
}

impl Behavior for Waiter {
	type Msg = Ask;

	fn handle(&mut self, envelope: &mut Envelope<Ask>, ctx: &mut ActorContext) -> Result<TaskResult, String> {
		if ctx.awaiting().is_some() {
			return Ok(TaskResult::Skip);
		}
		match envelope.payload {
			Ask::Start => {
				let correlation = ctx.next_correlation();
				*self.pending.lock() = Some(correlation);
				return Ok(ctx.await_response(correlation));
			}
			Ask::Other(value) => self.log.lock().push(format!("other {value}")),
			Ask::Reply(value) => self.log.lock().push(format!("reply {value}")),
		}
		Ok(TaskResult::Resume)
	}
}

#[test]
fn blocked_actor_wakes_only_for_its_correlated_response() {
	let waiter = Waiter::default();
	let log = Arc::clone(&waiter.log);
	let pending = Arc::clone(&waiter.pending);
	let h = harness(waiter);

	h.actor.tell(Ask::Start).expect("open mailbox");
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Blocked);
	assert_eq!(h.actor.state(), ActorState::Blocked);
	let correlation = pending.lock().expect("correlation minted");

	h.actor.tell(Ask::Other(1)).expect("open mailbox");
	h.actor.send(Envelope::new(Ask::Reply(9)).correlated(CorrelationId(correlation.0 + 100))).expect("open mailbox");
	assert_eq!(h.actor.state(), ActorState::Blocked);
	assert_eq!(h.ready.try_pop(), None);

	h.actor.send(Envelope::new(Ask::Reply(42)).correlated(correlation)).expect("open mailbox");
	assert_eq!(h.actor.state(), ActorState::Ready);
	assert_eq!(h.ready.try_pop(), Some(ActorId(1)));

	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Requeue);
	assert_eq!(*log.lock(), vec!["reply 42".to_owned()]);
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Parked);
	assert_eq!(*log.lock(), vec!["reply 42".to_owned(), "other 1".to_owned(), "reply 9".to_owned()]);
}

#[test]
fn response_queued_before_blocking_requeues_immediately() {
	let waiter = Waiter::default();
	let log = Arc::clone(&waiter.log);
	let h = harness(waiter);

	// Correlation ids come from a fresh clock, so the first one minted is 1.
	h.actor.tell(Ask::Start).expect("open mailbox");
	h.actor.send(Envelope::new(Ask::Reply(5)).correlated(CorrelationId(1))).expect("open mailbox");

	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Requeue);
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Parked);
	assert_eq!(*log.lock(), vec!["reply 5".to_owned()]);
}

#[test]
fn wake_readmits_a_blocked_actor() {
	let h = harness(Waiter::default());
	h.actor.tell(Ask::Start).expect("open mailbox");
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Blocked);

	assert!(h.cell.wake());
	assert!(!h.cell.wake(), "already ready");
	assert_eq!(h.ready.try_pop(), Some(ActorId(1)));
	assert_eq!(h.cell.resume(&DrainBudget::default()), Resumption::Blocked);
}

#[test]
fn actor_state_codec_round_trips() {
	assert_eq!(ActorState::Blocked.name(), "blocked");
	assert_eq!(ActorState::from_name("terminated"), Ok(ActorState::Terminated));
	assert_eq!(ActorState::from_code(ActorState::Running.code()), Ok(ActorState::Running));
	assert_eq!(ActorState::from_code(5), Err(CodecError::UnknownCode { kind: "actor_state", code: 5 }));
}
