#![allow(unused_crate_dependencies)]

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use trellis_worker::{
	ActorContext, ActorExitKind, ActorRef, ActorState, Behavior, ConsumptionPolicy, CorrelationId, DrainBudget, EntityKind, Envelope, Fault, QueueFault,
	Scheduler, SchedulerConfig, TaskResult,
};

const WAIT: Duration = Duration::from_secs(5);

async fn wait_until(mut condition: impl FnMut() -> bool) {
	tokio::time::timeout(WAIT, async {
		while !condition() {
			tokio::time::sleep(Duration::from_millis(1)).await;
		}
	})
	.await
	.expect("condition not reached in time");
}

struct Collect {
	seen: Arc<Mutex<Vec<u32>>>,
	fail_on: Option<u32>,
}

impl Behavior for Collect {
	type Msg = u32;

	fn handle(&mut self, envelope: &mut Envelope<u32>, _ctx: &mut ActorContext) -> Result<TaskResult, String> {
		self.seen.lock().push(envelope.payload);
		if self.fail_on == Some(envelope.payload) {
			return Err(format!("bad message {}", envelope.payload));
		}
		Ok(TaskResult::Resume)
	}
}

#[tokio::test]
async fn fault_on_third_message_terminates_and_is_published() {
	let _ = tracing_subscriber::fmt().with_test_writer().try_init();
	let scheduler = Scheduler::start(SchedulerConfig::default().workers(2)).expect("scheduler");
	let mut faults = scheduler.subscribe();
	let seen = Arc::new(Mutex::new(Vec::new()));
	let actor = scheduler.spawn(
		"collector",
		ConsumptionPolicy::single(),
		Collect {
			seen: Arc::clone(&seen),
			fail_on: Some(3),
		},
	);
	for value in 1..=5 {
		// Later sends may already find the mailbox closed.
		let _ = actor.tell(value);
	}

	let exit = tokio::time::timeout(WAIT, actor.terminated()).await.expect("actor terminates");
	assert_eq!(exit.kind(), ActorExitKind::Faulted);
	assert_eq!(*seen.lock(), vec![1, 2, 3]);
	assert_eq!(actor.state(), ActorState::Terminated);
	assert_eq!(actor.pending(), 0);

	let event = tokio::time::timeout(WAIT, faults.recv()).await.expect("fault in time").expect("fault event");
	assert_eq!(event.entity.kind(), EntityKind::Actor);
	assert_eq!(event.entity.name(), "collector");
	assert_eq!(event.cause, Fault::Queue(QueueFault::Failed("bad message 3".into())));

	wait_until(|| scheduler.is_empty()).await;
	scheduler.shutdown();
}

#[tokio::test]
async fn expired_deadline_quantum_still_makes_progress() {
	let config: SchedulerConfig = serde_json::from_str(r#"{"workers": 1, "quantum": {"max_messages": 1, "max_duration": {"secs": 0, "nanos": 1}}}"#).expect("config");
	let scheduler = Scheduler::start(config).expect("scheduler");
	let seen = Arc::new(Mutex::new(Vec::new()));
	let actor = scheduler.spawn(
		"tight",
		ConsumptionPolicy::single(),
		Collect {
			seen: Arc::clone(&seen),
			fail_on: None,
		},
	);
	for value in 0..3 {
		actor.tell(value).expect("open mailbox");
	}

	wait_until(|| seen.lock().len() == 3).await;
	wait_until(|| actor.state() == ActorState::Idle).await;
	assert_eq!(*seen.lock(), vec![0, 1, 2]);
	scheduler.shutdown();
}

struct Exclusive {
	in_flight: Arc<AtomicBool>,
	overlaps: Arc<AtomicUsize>,
	seen: Arc<Mutex<Vec<(usize, u32)>>>,
}

impl Behavior for Exclusive {
	type Msg = (usize, u32);

	fn handle(&mut self, envelope: &mut Envelope<(usize, u32)>, _ctx: &mut ActorContext) -> Result<TaskResult, String> {
		if self.in_flight.swap(true, Ordering::SeqCst) {
			self.overlaps.fetch_add(1, Ordering::SeqCst);
		}
		self.seen.lock().push(envelope.payload);
		std::thread::yield_now();
		self.in_flight.store(false, Ordering::SeqCst);
		Ok(TaskResult::Resume)
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[allow(clippy::disallowed_methods)]
async fn actors_run_sequentially_and_keep_per_producer_order() {
	const ACTORS: usize = 6;
	const PRODUCERS: usize = 3;
	const PER_PRODUCER: u32 = 200;

	let scheduler = Scheduler::start(SchedulerConfig::default().workers(4).quantum(DrainBudget::messages(8))).expect("scheduler");
	let overlaps = Arc::new(AtomicUsize::new(0));
	let mut actors = Vec::new();
	for index in 0..ACTORS {
		let seen = Arc::new(Mutex::new(Vec::new()));
		let actor = scheduler.spawn(
			format!("exclusive-{index}"),
			ConsumptionPolicy::default(),
			Exclusive {
				in_flight: Arc::new(AtomicBool::new(false)),
				overlaps: Arc::clone(&overlaps),
				seen: Arc::clone(&seen),
			},
		);
		actors.push((actor, seen));
	}

	let refs: Vec<ActorRef<(usize, u32)>> = actors.iter().map(|(actor, _)| actor.clone()).collect();
	let producers: Vec<_> = (0..PRODUCERS)
		.map(|producer| {
			let refs = refs.clone();
			tokio::spawn(async move {
				for seq in 0..PER_PRODUCER {
					for actor in &refs {
						actor.tell((producer, seq)).expect("open mailbox");
					}
					if seq % 16 == 0 {
						tokio::task::yield_now().await;
					}
				}
			})
		})
		.collect();
	for producer in producers {
		producer.await.expect("producer task");
	}

	let total = PRODUCERS * PER_PRODUCER as usize;
	wait_until(|| actors.iter().all(|(_, seen)| seen.lock().len() == total)).await;

	assert_eq!(overlaps.load(Ordering::SeqCst), 0, "an actor ran on two workers at once");
	for (_, seen) in &actors {
		let seen = seen.lock();
		for producer in 0..PRODUCERS {
			let order: Vec<u32> = seen.iter().filter(|(p, _)| *p == producer).map(|(_, seq)| *seq).collect();
			assert_eq!(order, (0..PER_PRODUCER).collect::<Vec<_>>());
		}
	}
	scheduler.shutdown();
}

struct Gated {
	gate: Option<std::sync::mpsc::Receiver<()>>,
	label: &'static str,
	log: Arc<Mutex<Vec<String>>>,
}

impl Behavior for Gated {
	type Msg = u32;

	fn on_start(&mut self, _ctx: &mut ActorContext) -> Result<(), String> {
		if let Some(gate) = self.gate.take() {
			gate.recv().map_err(|err| err.to_string())?;
		}
		Ok(())
	}

	fn handle(&mut self, envelope: &mut Envelope<u32>, _ctx: &mut ActorContext) -> Result<TaskResult, String> {
		self.log.lock().push(format!("{}{}", self.label, envelope.payload));
		Ok(TaskResult::Resume)
	}
}

#[tokio::test]
async fn busy_actor_yields_after_its_quantum() {
	let scheduler = Scheduler::start(SchedulerConfig::default().workers(1).quantum(DrainBudget::messages(2))).expect("scheduler");
	let log = Arc::new(Mutex::new(Vec::new()));
	let (release, gate) = std::sync::mpsc::channel();

	let busy = scheduler.spawn(
		"busy",
		ConsumptionPolicy::single(),
		Gated {
			gate: Some(gate),
			label: "a",
			log: Arc::clone(&log),
		},
	);
	for value in 0..6 {
		busy.tell(value).expect("open mailbox");
	}
	let quiet = scheduler.spawn(
		"quiet",
		ConsumptionPolicy::single(),
		Gated {
			gate: None,
			label: "b",
			log: Arc::clone(&log),
		},
	);
	quiet.tell(0).expect("open mailbox");
	release.send(()).expect("gate open");

	wait_until(|| log.lock().len() == 7).await;
	assert_eq!(*log.lock(), vec!["a0", "a1", "b0", "a2", "a3", "a4", "a5"]);
	scheduler.shutdown();
}

#[derive(Debug)]
enum Client {
	Start,
	Other(u32),
	Reply(u32),
}

struct Requester {
	server: ActorRef<Server>,
	log: Arc<Mutex<Vec<String>>>,
}

impl Behavior for Requester {
	type Msg = Client;

	fn handle(&mut self, envelope: &mut Envelope<Client>, ctx: &mut ActorContext) -> Result<TaskResult, String> {
		if ctx.awaiting().is_some() {
			return Ok(TaskResult::Skip);
		}
		match envelope.payload {
			Client::Start => {
				let correlation = ctx.next_correlation();
				self.server.tell(Server::Request { correlation }).map_err(|err| err.to_string())?;
				self.log.lock().push("start".into());
				return Ok(ctx.await_response(correlation));
			}
			Client::Other(value) => self.log.lock().push(format!("other {value}")),
			Client::Reply(value) => self.log.lock().push(format!("reply {value}")),
		}
		Ok(TaskResult::Resume)
	}
}

#[derive(Debug)]
enum Server {
	Request { correlation: CorrelationId },
	Release(ActorRef<Client>),
}

#[derive(Default)]
struct Responder {
	held: Option<CorrelationId>,
}

impl Behavior for Responder {
	type Msg = Server;

	fn handle(&mut self, envelope: &mut Envelope<Server>, ctx: &mut ActorContext) -> Result<TaskResult, String> {
		match &envelope.payload {
			Server::Request { correlation } => self.held = Some(*correlation),
			Server::Release(client) => {
				let correlation = self.held.take().ok_or("release before request")?;
				let reply = Envelope::new(Client::Reply(42)).from_sender(ctx.id()).correlated(correlation);
				client.send(reply).map_err(|err| err.to_string())?;
			}
		}
		Ok(TaskResult::Resume)
	}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn selective_receive_blocks_until_the_correlated_reply() {
	let scheduler = Scheduler::start(SchedulerConfig::default().workers(2)).expect("scheduler");
	let log = Arc::new(Mutex::new(Vec::new()));
	let server = scheduler.spawn("server", ConsumptionPolicy::default(), Responder::default());
	let client = scheduler.spawn(
		"client",
		ConsumptionPolicy::default(),
		Requester {
			server: server.clone(),
			log: Arc::clone(&log),
		},
	);

	client.tell(Client::Start).expect("open mailbox");
	client.tell(Client::Other(1)).expect("open mailbox");
	client.tell(Client::Other(2)).expect("open mailbox");
	wait_until(|| client.state() == ActorState::Blocked).await;
	assert_eq!(*log.lock(), vec!["start".to_owned()]);
	assert_eq!(client.pending(), 2);

	server.tell(Server::Release(client.clone())).expect("open mailbox");
	wait_until(|| log.lock().len() == 4).await;
	assert_eq!(*log.lock(), vec!["start", "reply 42", "other 1", "other 2"]);
	wait_until(|| client.state() == ActorState::Idle).await;

	let names: Vec<_> = scheduler.snapshots().into_iter().map(|record| record.name).collect();
	assert_eq!(names, vec!["client", "server"]);
	scheduler.shutdown();
}

#[tokio::test]
async fn terminate_and_shutdown_report_exits() {
	let scheduler = Scheduler::start(SchedulerConfig::default().workers(1)).expect("scheduler");
	let seen = Arc::new(Mutex::new(Vec::new()));
	let doomed = scheduler.spawn(
		"doomed",
		ConsumptionPolicy::single(),
		Collect {
			seen: Arc::clone(&seen),
			fail_on: None,
		},
	);
	let survivor = scheduler.spawn(
		"survivor",
		ConsumptionPolicy::single(),
		Collect {
			seen: Arc::clone(&seen),
			fail_on: None,
		},
	);
	wait_until(|| doomed.state() == ActorState::Idle && survivor.state() == ActorState::Idle).await;

	assert!(scheduler.terminate(doomed.id()));
	let exit = tokio::time::timeout(WAIT, doomed.terminated()).await.expect("killed");
	assert_eq!(exit.kind(), ActorExitKind::Killed);
	assert!(doomed.tell(1).is_err());
	wait_until(|| scheduler.len() == 1).await;
	assert!(!scheduler.terminate(doomed.id()));

	scheduler.shutdown();
	assert_eq!(survivor.exit().map(|exit| exit.kind()), Some(ActorExitKind::Shutdown));
	assert!(survivor.tell(1).is_err());
	assert!(scheduler.is_empty());
}
