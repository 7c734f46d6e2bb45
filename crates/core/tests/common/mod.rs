#![allow(dead_code)]

use tempfile::TempDir;
use vmbackup::fake::FakeWorld;
use vmbackup::{Phase, QuiesceSettings, Quiescer};
use vmbackup_protocol::{EventName, HostEvent, StartArgs};
use vmbackup_runtime::{FakeTransportBuilder, FakeTransportController};

pub struct Harness {
	pub quiescer: Quiescer,
	pub world: FakeWorld,
	pub host: FakeTransportController,
	pub dir: TempDir,
}

impl Harness {
	pub fn new() -> Self {
		Self::with_settings(|settings| settings)
	}

	pub fn with_settings(configure: impl FnOnce(QuiesceSettings) -> QuiesceSettings) -> Self {
		let _ = tracing_subscriber::fmt().with_test_writer().with_max_level(tracing::Level::DEBUG).try_init();

		let dir = tempfile::tempdir().unwrap();
		let settings = configure(QuiesceSettings::default().with_config_dir(dir.path()));
		let (transport, host) = FakeTransportBuilder::new().build();
		let world = FakeWorld::new();
		let quiescer = Quiescer::new(settings, Box::new(transport), Box::new(world.provider()), Box::new(world.scripts()));
		Self { quiescer, world, host, dir }
	}

	pub fn start(&mut self, args: &str) {
		let reply = self.quiescer.start(StartArgs::parse(args));
		assert!(reply.ok, "start rejected: {}", reply.message);
	}

	pub fn poll(&mut self) {
		assert!(self.quiescer.poll_once(), "no poll scheduled");
	}

	/// Polls until the session reaches `phase`; panics after `max` polls.
	pub fn poll_until(&mut self, phase: Phase, max: usize) {
		for _ in 0..max {
			if self.quiescer.phase() == phase {
				return;
			}
			self.poll();
		}
		assert_eq!(self.quiescer.phase(), phase, "phase not reached within {max} polls");
	}

	/// Polls until the session is gone and returns how many polls it took.
	pub fn poll_until_idle(&mut self, max: usize) -> usize {
		for polls in 0..max {
			if !self.quiescer.is_running() {
				return polls;
			}
			self.poll();
		}
		assert!(!self.quiescer.is_running(), "session still {} after {max} polls", self.quiescer.phase());
		max
	}

	pub fn events(&self) -> Vec<HostEvent> {
		self.host.sent().into_iter().filter(|event| event.event != EventName::KeepAlive).collect()
	}

	pub fn event_names(&self) -> Vec<EventName> {
		self.events().into_iter().map(|event| event.event).collect()
	}

	/// Every launched operation was released exactly once and nothing is left scheduled.
	pub fn assert_clean(&self) {
		for op in self.world.ops() {
			assert_eq!(op.releases, 1, "{} released {} times", op.name, op.releases);
		}
		assert_eq!(self.quiescer.pending_timers(), 0);
	}
}
