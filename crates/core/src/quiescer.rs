//! Driver that owns the collaborators and at most one backup session.

use std::time::Instant;

use tracing::{debug, info, warn};
use vmbackup_protocol::{Command, CommandReply, EventName, HostEvent, SessionSnapshot, StartArgs, StatusCode};
use vmbackup_runtime::HostTransport;

use crate::channel::{EventChannel, SendMode};
use crate::config::{self, QuiesceSettings};
use crate::error::{BackupError, Result};
use crate::provider::{ProviderAdapter, QuiesceProvider};
use crate::scripts::{ScriptRunner, ScriptSubsystem};
use crate::session::{AbortCause, BackupSession, Cx, Flow, Phase};
use crate::timers::{TimerKind, Timers};

/// Runs backup cycles on behalf of the host.
///
/// The quiescer never blocks and never reads the clock on its own initiative.
/// Its owner waits until [`Quiescer::next_deadline`] and then calls
/// [`Quiescer::tick`], or steps virtual time with [`Quiescer::fire_next`].
pub struct Quiescer {
	settings: QuiesceSettings,
	now: Instant,
	timers: Timers,
	channel: EventChannel,
	provider: ProviderAdapter,
	scripts: Box<dyn ScriptSubsystem>,
	session: Option<BackupSession>,
}

impl Quiescer {
	pub fn new(
		settings: QuiesceSettings,
		transport: Box<dyn HostTransport>,
		provider: Box<dyn QuiesceProvider>,
		scripts: Box<dyn ScriptSubsystem>,
	) -> Self {
		let channel = EventChannel::new(transport, settings.keep_alive_interval());
		Self {
			settings,
			now: Instant::now(),
			timers: Timers::new(),
			channel,
			provider: ProviderAdapter::new(provider),
			scripts,
			session: None,
		}
	}

	/// Quiescer running the hook scripts found in the configured scripts directory.
	pub fn with_script_runner(settings: QuiesceSettings, transport: Box<dyn HostTransport>, provider: Box<dyn QuiesceProvider>) -> Self {
		let scripts = ScriptRunner::new(settings.scripts_dir());
		Self::new(settings, transport, provider, Box::new(scripts))
	}

	pub fn settings(&self) -> &QuiesceSettings {
		&self.settings
	}

	pub fn session(&self) -> Option<&BackupSession> {
		self.session.as_ref()
	}

	pub fn phase(&self) -> Phase {
		self.session.as_ref().map_or(Phase::Idle, BackupSession::phase)
	}

	pub fn is_running(&self) -> bool {
		self.session.is_some()
	}

	pub fn pending_timers(&self) -> usize {
		self.timers.len()
	}

	pub fn now(&self) -> Instant {
		self.now
	}

	pub fn status(&self) -> SessionSnapshot {
		match self.session.as_ref() {
			Some(session) => session.snapshot(),
			None => SessionSnapshot {
				phase: Phase::Idle.as_str().to_string(),
				..SessionSnapshot::default()
			},
		}
	}

	/// Moves the clock forward to `now`. Commands schedule their timers from this clock.
	pub fn advance_clock(&mut self, now: Instant) {
		self.now = self.now.max(now);
	}

	fn parts(&mut self) -> (Option<&mut BackupSession>, Cx<'_>) {
		let Self {
			settings,
			now,
			timers,
			channel,
			provider,
			scripts,
			session,
		} = self;
		let cx = Cx {
			now: *now,
			timers,
			channel,
			provider,
			scripts: &mut **scripts,
			settings,
		};
		(session.as_mut(), cx)
	}

	pub fn dispatch(&mut self, command: Command) -> CommandReply {
		debug!(target = "vmbackup.session", command = command.verb(), "host command");
		match command {
			Command::Start(args) => self.start(args),
			Command::Abort => self.abort(),
			Command::SnapshotDone => self.snapshot_done(),
		}
	}

	/// Starts a backup cycle. The reply only says whether the cycle began; its
	/// outcome arrives as events.
	pub fn start(&mut self, args: StartArgs) -> CommandReply {
		match self.try_start(args) {
			Ok(()) => CommandReply::ok(),
			Err(err) => {
				warn!(target = "vmbackup.session", error = %err, "backup start rejected");
				CommandReply::fail(err.reply_message())
			}
		}
	}

	fn try_start(&mut self, args: StartArgs) -> Result<()> {
		if self.session.is_some() {
			return Err(BackupError::AlreadyRunning);
		}
		let excluded = config::load_exclusions(&self.settings.exclusion_path())?;
		info!(
			target = "vmbackup.session",
			generate_manifests = args.generate_manifests,
			volumes = ?args.volumes,
			excluded = excluded.len(),
			"starting backup"
		);

		self.provider.begin_session();
		let mut session = BackupSession::new(args, excluded);
		let (_, mut cx) = self.parts();
		session.notify(&mut cx, SendMode::Strict, HostEvent::bare(EventName::Reset));
		if let Err(err) = session.launch_freeze_scripts(&mut cx) {
			let event = HostEvent::new(EventName::RequestorError, StatusCode::ScriptError, "Error when starting backup scripts.");
			session.notify(&mut cx, SendMode::Tolerant, event);
			session.discard(&mut cx);
			return Err(err.into());
		}
		session.schedule_poll(&mut cx);
		self.session = Some(session);
		Ok(())
	}

	pub fn abort(&mut self) -> CommandReply {
		let (session, mut cx) = self.parts();
		let Some(session) = session else {
			return CommandReply::fail(BackupError::NotRunning.to_string());
		};
		session.begin_abort(&mut cx, AbortCause::Remote);
		session.expedite(&mut cx);
		CommandReply::ok()
	}

	pub fn snapshot_done(&mut self) -> CommandReply {
		let (session, mut cx) = self.parts();
		let Some(session) = session else {
			return CommandReply::fail(BackupError::NotRunning.to_string());
		};
		match session.acknowledge_snapshot() {
			Ok(()) => {
				session.expedite(&mut cx);
				CommandReply::ok()
			}
			Err(err) => {
				warn!(target = "vmbackup.session", error = %err, "snapshot acknowledgement rejected");
				CommandReply::fail(err.to_string())
			}
		}
	}

	pub fn next_deadline(&self) -> Option<Instant> {
		self.timers.next_deadline()
	}

	/// Fires every timer due at `now`. Returns how many fired.
	pub fn tick(&mut self, now: Instant) -> usize {
		let mut fired = 0;
		while let Some(expired) = self.timers.pop_due(now) {
			self.advance_clock(expired.deadline);
			self.fire(expired.payload);
			fired += 1;
		}
		self.advance_clock(now);
		fired
	}

	/// Jumps the clock to the earliest timer and fires it.
	pub fn fire_next(&mut self) -> Option<TimerKind> {
		let expired = self.timers.pop_next()?;
		self.advance_clock(expired.deadline);
		self.fire(expired.payload);
		Some(expired.payload)
	}

	/// Fires timers in order until one poll has run. Returns `false` when no poll is scheduled.
	pub fn poll_once(&mut self) -> bool {
		while let Some(kind) = self.fire_next() {
			if kind == TimerKind::Poll {
				return true;
			}
		}
		false
	}

	fn fire(&mut self, kind: TimerKind) {
		let (session, mut cx) = self.parts();
		let Some(session) = session else {
			debug!(target = "vmbackup.session", ?kind, "timer fired without a session");
			return;
		};
		match kind {
			TimerKind::KeepAlive => session.keep_alive(&mut cx),
			TimerKind::Poll => {
				if session.poll(&mut cx) == Flow::Finalize {
					self.finalize();
				}
			}
		}
	}

	fn finalize(&mut self) {
		let Some(session) = self.session.take() else {
			return;
		};
		let (_, mut cx) = self.parts();
		session.finalize(&mut cx);
	}

	/// Ends any running cycle and releases the provider.
	pub fn shutdown(&mut self) {
		if self.session.is_some() {
			warn!(target = "vmbackup.session", phase = %self.phase(), "shutting down with a backup in progress");
			self.finalize();
		}
		self.provider.release();
	}
}
