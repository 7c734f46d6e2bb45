//! The backup session and its phase transitions.
//!
//! A session is driven entirely by its poll timer. Each poll queries the
//! operation in flight, releases it once terminal, and then keeps taking steps
//! until a new operation is in flight, the session has to wait for the host, or
//! the cycle is over.
//!
//! Forward steps registered when an operation was launched only run if nothing
//! went wrong. Once the host aborts, the channel breaks, or a step fails, the
//! session routes through recovery instead: undo a completed freeze, run the
//! freeze-fail scripts over whatever the freeze batch launched, and finish.

use std::fmt;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};
use vmbackup_protocol::{EventName, HostEvent, SessionSnapshot, StartArgs, StatusCode};
use vmbackup_runtime::TimerId;

use crate::channel::{ChannelState, EventChannel, RpcStatus, SendMode};
use crate::config::QuiesceSettings;
use crate::error::{BackupError, ScriptError};
use crate::manifest::{self, Manifest};
use crate::operation::{AsyncOperation, OpStatus, OperationKind};
use crate::provider::ProviderAdapter;
use crate::scripts::{ScriptPhase, ScriptSubsystem};
use crate::timers::{TimerKind, Timers};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
	Idle,
	RunningFreezeScripts,
	EnablingProvider,
	ProviderActive,
	RunningThawScripts,
	RunningFreezeFailScripts,
}

impl Phase {
	pub fn as_str(self) -> &'static str {
		match self {
			Phase::Idle => "idle",
			Phase::RunningFreezeScripts => "running-freeze-scripts",
			Phase::EnablingProvider => "enabling-provider",
			Phase::ProviderActive => "provider-active",
			Phase::RunningThawScripts => "running-thaw-scripts",
			Phase::RunningFreezeFailScripts => "running-freeze-fail-scripts",
		}
	}
}

impl fmt::Display for Phase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
	/// The host sent an abort command.
	Remote,
	/// A required event could not be delivered.
	ChannelFailure,
}

/// The next thing a poll does once nothing is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Step {
	Wait,
	EnableProvider,
	EnterProviderActive,
	RequestThaw,
	RequestUndo,
	AbortProvider,
	RunThawScripts,
	RunFreezeFailScripts,
	Finalize,
}

/// Result of one poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Flow {
	Continue,
	Finalize,
}

/// Collaborators a session borrows from its driver for one step.
pub(crate) struct Cx<'a> {
	pub(crate) now: Instant,
	pub(crate) timers: &'a mut Timers,
	pub(crate) channel: &'a mut EventChannel,
	pub(crate) provider: &'a mut ProviderAdapter,
	pub(crate) scripts: &'a mut (dyn ScriptSubsystem + 'static),
	pub(crate) settings: &'a QuiesceSettings,
}

struct InFlight {
	op: Box<dyn AsyncOperation>,
	/// Set once an abort reached this operation.
	interrupted: bool,
	polls_since_interrupt: u32,
}

pub struct BackupSession {
	phase: Phase,
	channel: ChannelState,
	current: Option<InFlight>,
	pending: Option<Step>,
	generate_manifests: bool,
	volumes: Option<String>,
	disabled_targets: Vec<String>,
	provider_active: bool,
	/// The freeze operation reported `Finished`.
	freeze_finished: bool,
	snapshot_acknowledged: bool,
	thaw_requested: bool,
	undo_requested: bool,
	client_aborted: bool,
	channel_failed: bool,
	provider_failed: bool,
	scripts_failed: bool,
	force_requeue: bool,
	manifest_path: Option<PathBuf>,
	manifest_retry: bool,
	poll_timer: Option<TimerId>,
}

impl BackupSession {
	pub(crate) fn new(args: StartArgs, disabled_targets: Vec<String>) -> Self {
		Self {
			phase: Phase::Idle,
			channel: ChannelState::default(),
			current: None,
			pending: None,
			generate_manifests: args.generate_manifests,
			volumes: args.volumes,
			disabled_targets,
			provider_active: false,
			freeze_finished: false,
			snapshot_acknowledged: false,
			thaw_requested: false,
			undo_requested: false,
			client_aborted: false,
			channel_failed: false,
			provider_failed: false,
			scripts_failed: false,
			force_requeue: false,
			manifest_path: None,
			manifest_retry: false,
			poll_timer: None,
		}
	}

	pub fn phase(&self) -> Phase {
		self.phase
	}

	pub fn rpc_status(&self) -> RpcStatus {
		self.channel.rpc_status()
	}

	pub fn provider_active(&self) -> bool {
		self.provider_active
	}

	pub fn snapshot_acknowledged(&self) -> bool {
		self.snapshot_acknowledged
	}

	pub fn client_aborted(&self) -> bool {
		self.client_aborted
	}

	pub fn provider_failed(&self) -> bool {
		self.provider_failed
	}

	pub fn generate_manifests(&self) -> bool {
		self.generate_manifests
	}

	pub fn volumes(&self) -> Option<&str> {
		self.volumes.as_deref()
	}

	pub fn disabled_targets(&self) -> &[String] {
		&self.disabled_targets
	}

	pub fn current_operation(&self) -> Option<&str> {
		self.current.as_ref().map(|flight| flight.op.name())
	}

	pub fn keep_alive_timer(&self) -> Option<TimerId> {
		self.channel.keep_alive_timer()
	}

	pub fn poll_timer(&self) -> Option<TimerId> {
		self.poll_timer
	}

	/// Delay before the next poll. Slower while the provider simply holds the freeze.
	pub fn poll_interval(&self, settings: &QuiesceSettings) -> Duration {
		if self.phase == Phase::ProviderActive && self.current.is_none() {
			settings.idle_poll_interval()
		} else {
			settings.poll_interval()
		}
	}

	pub fn snapshot(&self) -> SessionSnapshot {
		SessionSnapshot {
			active: true,
			phase: self.phase.as_str().to_string(),
			rpc_status: Some(self.rpc_status().as_str().to_string()),
			current_operation: self.current_operation().map(str::to_string),
			provider_active: self.provider_active,
			snapshot_acknowledged: self.snapshot_acknowledged,
			client_aborted: self.client_aborted,
			provider_failed: self.provider_failed,
			disabled_targets: self.disabled_targets.clone(),
		}
	}

	fn aborting(&self) -> bool {
		self.client_aborted || self.channel_failed
	}

	pub(crate) fn notify(&mut self, cx: &mut Cx<'_>, mode: SendMode, event: HostEvent) -> bool {
		cx.channel.send(&mut self.channel, cx.timers, cx.now, mode, event)
	}

	pub(crate) fn keep_alive(&mut self, cx: &mut Cx<'_>) {
		self.channel.keep_alive_fired();
		self.notify(cx, SendMode::Tolerant, HostEvent::bare(EventName::KeepAlive));
	}

	pub(crate) fn schedule_poll(&mut self, cx: &mut Cx<'_>) {
		if let Some(id) = self.poll_timer.take() {
			cx.timers.remove(id);
		}
		let delay = if std::mem::take(&mut self.force_requeue) { Duration::ZERO } else { self.poll_interval(cx.settings) };
		self.poll_timer = Some(cx.timers.add(cx.now, delay, TimerKind::Poll));
	}

	/// Moves the next poll up to now.
	pub(crate) fn expedite(&mut self, cx: &mut Cx<'_>) {
		self.force_requeue = true;
		self.schedule_poll(cx);
	}

	fn set_phase(&mut self, phase: Phase) {
		if self.phase != phase {
			debug!(target = "vmbackup.session", from = %self.phase, to = %phase, "phase change");
			self.phase = phase;
		}
	}

	fn launch(&mut self, op: Box<dyn AsyncOperation>, then: Option<Step>) {
		if let Some(mut previous) = self.current.take() {
			warn!(target = "vmbackup.session", op = previous.op.name(), "replacing an unreleased operation");
			previous.op.cancel();
			previous.op.release();
		}
		debug!(target = "vmbackup.session", op = op.name(), phase = %self.phase, "operation started");
		self.current = Some(InFlight {
			op,
			interrupted: false,
			polls_since_interrupt: 0,
		});
		self.pending = then;
	}

	pub(crate) fn launch_freeze_scripts(&mut self, cx: &mut Cx<'_>) -> Result<(), ScriptError> {
		self.set_phase(Phase::RunningFreezeScripts);
		let op = cx.scripts.run_scripts(ScriptPhase::Freeze)?;
		self.launch(op, Some(Step::EnableProvider));
		Ok(())
	}

	pub(crate) fn acknowledge_snapshot(&mut self) -> Result<(), BackupError> {
		match self.phase {
			Phase::EnablingProvider | Phase::ProviderActive => {
				if self.snapshot_acknowledged {
					debug!(target = "vmbackup.session", "duplicate snapshot acknowledgement");
				}
				self.snapshot_acknowledged = true;
				Ok(())
			}
			phase => Err(BackupError::InvalidState {
				phase,
				action: "snapshot acknowledgement",
			}),
		}
	}

	/// Starts the abort path. Forward work in flight is canceled and thaw or undo is left to finish. A
	/// freeze held with nothing in flight is undone right away.
	pub(crate) fn begin_abort(&mut self, cx: &mut Cx<'_>, cause: AbortCause) {
		let event = match cause {
			AbortCause::Remote if !self.client_aborted => {
				self.client_aborted = true;
				(SendMode::Strict, HostEvent::new(EventName::RequestorAbort, StatusCode::RemoteAbort, "Remote abort."))
			}
			AbortCause::ChannelFailure if !self.channel_failed => {
				self.channel_failed = true;
				(SendMode::Tolerant, HostEvent::new(EventName::RequestorError, StatusCode::UnexpectedError, "Host channel failure."))
			}
			_ => {
				debug!(target = "vmbackup.session", ?cause, "abort already in progress");
				return;
			}
		};
		info!(target = "vmbackup.session", ?cause, phase = %self.phase, "aborting backup");
		self.channel.ignore_failures();

		if let Some(flight) = self.current.as_mut() {
			if !flight.interrupted {
				flight.interrupted = true;
				if flight.op.kind().cancel_on_abort() {
					debug!(target = "vmbackup.session", op = flight.op.name(), "canceling operation");
					flight.op.cancel();
				}
			}
		} else if self.phase == Phase::ProviderActive && self.provider_active {
			self.request_undo(cx);
			if let Some(flight) = self.current.as_mut() {
				flight.interrupted = true;
			}
		}

		let (mode, event) = event;
		self.notify(cx, mode, event);
	}

	/// One iteration of the state machine.
	pub(crate) fn poll(&mut self, cx: &mut Cx<'_>) -> Flow {
		self.poll_timer = None;
		if self.channel.rpc_status() == RpcStatus::Error {
			self.begin_abort(cx, AbortCause::ChannelFailure);
		}

		let idle = match self.query_current(cx.settings.cancel_grace_polls) {
			None => true,
			Some(OpStatus::Pending) => {
				self.schedule_poll(cx);
				return Flow::Continue;
			}
			Some(status) => {
				self.complete_current(cx, status);
				false
			}
		};

		if idle && self.phase == Phase::ProviderActive {
			self.supervise(cx);
		}

		while self.current.is_none() {
			let step = self.next_step();
			if step == Step::Wait {
				break;
			}
			// A failed strict send is turned into abort routing first.
			if self.channel.rpc_status() == RpcStatus::Error {
				debug!(target = "vmbackup.session", ?step, "channel failed; deferring step to next poll");
				self.pending = Some(step);
				self.force_requeue = true;
				break;
			}
			if step == Step::Finalize {
				return Flow::Finalize;
			}
			self.apply(cx, step);
		}

		self.schedule_poll(cx);
		Flow::Continue
	}

	/// Status of the operation in flight, with interrupted operations given a bounded grace period.
	fn query_current(&mut self, grace_polls: u32) -> Option<OpStatus> {
		let flight = self.current.as_mut()?;
		let status = flight.op.query();
		if status.is_terminal() || !flight.interrupted {
			return Some(status);
		}

		flight.polls_since_interrupt += 1;
		if flight.polls_since_interrupt <= grace_polls {
			return Some(OpStatus::Pending);
		}
		warn!(
			target = "vmbackup.session",
			op = flight.op.name(),
			polls = flight.polls_since_interrupt,
			"operation still running after abort; releasing it"
		);
		if !flight.op.kind().cancel_on_abort() {
			flight.op.cancel();
		}
		Some(OpStatus::Canceled)
	}

	fn complete_current(&mut self, cx: &mut Cx<'_>, status: OpStatus) {
		let Some(flight) = self.current.take() else {
			return;
		};
		let name = flight.op.name().to_string();
		let kind = flight.op.kind();
		let failure = flight.op.failure();
		flight.op.release();
		debug!(target = "vmbackup.session", op = %name, ?status, phase = %self.phase, "operation completed");

		let succeeded = status == OpStatus::Finished;
		match kind {
			OperationKind::ScriptBatch(ScriptPhase::Freeze) => {
				if !succeeded {
					self.scripts_failed = true;
					self.report_failure(cx, SendMode::Strict, StatusCode::ScriptError, &name, failure);
				}
			}
			OperationKind::ProviderFreeze => {
				self.freeze_finished = succeeded;
				if !succeeded {
					self.provider_failed = true;
					self.report_failure(cx, SendMode::Strict, StatusCode::SyncError, &name, failure);
				}
			}
			OperationKind::ProviderThaw => {
				self.provider_active = false;
				if !succeeded {
					self.provider_failed = true;
					self.report_failure(cx, SendMode::Strict, StatusCode::SyncError, &name, failure);
				}
			}
			OperationKind::ProviderUndo => {
				self.provider_active = false;
				if !succeeded {
					warn!(target = "vmbackup.provider", op = %name, ?status, detail = ?failure, "undo did not complete");
				}
			}
			OperationKind::ScriptBatch(ScriptPhase::Thaw) => {
				if !succeeded {
					self.scripts_failed = true;
					self.report_failure(cx, SendMode::Tolerant, StatusCode::ScriptError, &name, failure);
				}
			}
			OperationKind::ScriptBatch(ScriptPhase::FreezeFailed) => {
				if !succeeded {
					warn!(target = "vmbackup.scripts", op = %name, ?status, detail = ?failure, "freeze-fail scripts did not complete");
				}
			}
		}
	}

	fn report_failure(&mut self, cx: &mut Cx<'_>, mode: SendMode, code: StatusCode, name: &str, failure: Option<String>) {
		if self.aborting() {
			return;
		}
		let event = match failure {
			Some(detail) => HostEvent::new(EventName::RequestorError, code, detail),
			None => {
				let err = BackupError::UnexpectedOperationFailure { operation: name.to_string() };
				HostEvent::new(EventName::RequestorError, err.status_code(), err.to_string())
			}
		};
		self.notify(cx, mode, event);
	}

	/// Work done on idle polls while the provider holds the freeze.
	fn supervise(&mut self, cx: &mut Cx<'_>) {
		if self.aborting() {
			return;
		}
		if std::mem::take(&mut self.manifest_retry) {
			self.send_manifest(cx);
		}
		if !self.provider_active || self.provider_failed || self.thaw_requested {
			return;
		}
		if let Err(err) = cx.provider.check() {
			warn!(target = "vmbackup.provider", error = %err, "provider failed while frozen");
			self.provider_failed = true;
			self.notify(cx, SendMode::Strict, HostEvent::new(EventName::RequestorError, StatusCode::SyncError, err.to_string()));
		}
	}

	pub(crate) fn next_step(&mut self) -> Step {
		if self.aborting() || self.provider_failed || self.scripts_failed {
			self.pending = None;
			return self.recovery_step();
		}
		if let Some(step) = self.pending.take() {
			return step;
		}
		match self.phase {
			Phase::ProviderActive if self.provider_active && self.snapshot_acknowledged && !self.thaw_requested => Step::RequestThaw,
			Phase::RunningThawScripts | Phase::RunningFreezeFailScripts => Step::Finalize,
			_ => Step::Wait,
		}
	}

	fn recovery_step(&self) -> Step {
		match self.phase {
			Phase::Idle | Phase::RunningThawScripts | Phase::RunningFreezeFailScripts => Step::Finalize,
			Phase::RunningFreezeScripts => Step::RunFreezeFailScripts,
			Phase::EnablingProvider if self.provider_active && self.freeze_finished => Step::RequestUndo,
			Phase::EnablingProvider if self.provider_active => Step::AbortProvider,
			Phase::ProviderActive if self.provider_active => Step::RequestUndo,
			Phase::EnablingProvider | Phase::ProviderActive => Step::RunFreezeFailScripts,
		}
	}

	fn apply(&mut self, cx: &mut Cx<'_>, step: Step) {
		debug!(target = "vmbackup.session", ?step, phase = %self.phase, "step");
		match step {
			Step::EnableProvider => self.enable_provider(cx),
			Step::EnterProviderActive => self.enter_provider_active(cx),
			Step::RequestThaw => self.request_thaw(cx),
			Step::RequestUndo => self.request_undo(cx),
			Step::AbortProvider => {
				cx.provider.abort();
				self.provider_active = false;
			}
			Step::RunThawScripts => self.run_scripts(cx, ScriptPhase::Thaw),
			Step::RunFreezeFailScripts => self.run_scripts(cx, ScriptPhase::FreezeFailed),
			Step::Wait | Step::Finalize => {}
		}
	}

	fn enable_provider(&mut self, cx: &mut Cx<'_>) {
		match cx.provider.start(self.volumes.as_deref(), &self.disabled_targets) {
			Ok(op) => {
				self.provider_active = true;
				self.set_phase(Phase::EnablingProvider);
				self.launch(op, Some(Step::EnterProviderActive));
			}
			Err(err) => {
				warn!(target = "vmbackup.provider", error = %err, "provider failed to start");
				self.provider_failed = true;
				let event = HostEvent::new(EventName::RequestorError, StatusCode::SyncError, "Error when enabling the sync provider.");
				self.notify(cx, SendMode::Strict, event);
			}
		}
	}

	fn enter_provider_active(&mut self, cx: &mut Cx<'_>) {
		self.set_phase(Phase::ProviderActive);
		info!(target = "vmbackup.session", provider = cx.provider.name(), "filesystems quiesced");
		if self.generate_manifests {
			self.write_manifest(cx);
		}
	}

	fn write_manifest(&mut self, cx: &mut Cx<'_>) {
		let manifest = Manifest::new(cx.provider.name(), self.volumes.clone(), self.disabled_targets.clone());
		match manifest::write_manifest(&cx.settings.manifest_dir(), &manifest) {
			Ok(path) => {
				self.manifest_path = Some(path);
				if !self.send_manifest(cx) {
					self.manifest_retry = true;
				}
			}
			Err(err) => warn!(target = "vmbackup.session", error = %err, "failed to write manifest"),
		}
	}

	fn send_manifest(&mut self, cx: &mut Cx<'_>) -> bool {
		let Some(path) = self.manifest_path.as_ref() else {
			return false;
		};
		let event = HostEvent::new(EventName::GenericManifest, StatusCode::Success, path.display().to_string());
		self.notify(cx, SendMode::Tolerant, event)
	}

	fn request_thaw(&mut self, cx: &mut Cx<'_>) {
		self.thaw_requested = true;
		match cx.provider.request_thaw() {
			Ok(op) => self.launch(op, Some(Step::RunThawScripts)),
			Err(err) => {
				warn!(target = "vmbackup.provider", error = %err, "provider rejected thaw");
				self.provider_active = false;
				self.provider_failed = true;
				let event = HostEvent::new(EventName::RequestorError, StatusCode::SyncError, "Error when notifying the sync provider.");
				self.notify(cx, SendMode::Strict, event);
			}
		}
	}

	fn request_undo(&mut self, cx: &mut Cx<'_>) {
		self.undo_requested = true;
		match cx.provider.request_undo() {
			Ok(op) => self.launch(op, None),
			Err(err) => {
				warn!(target = "vmbackup.provider", error = %err, "provider undo failed");
				self.provider_active = false;
			}
		}
	}

	fn run_scripts(&mut self, cx: &mut Cx<'_>, phase: ScriptPhase) {
		self.set_phase(match phase {
			ScriptPhase::Freeze => Phase::RunningFreezeScripts,
			ScriptPhase::Thaw => Phase::RunningThawScripts,
			ScriptPhase::FreezeFailed => Phase::RunningFreezeFailScripts,
		});
		match cx.scripts.run_scripts(phase) {
			Ok(op) => self.launch(op, Some(Step::Finalize)),
			Err(err) => {
				warn!(target = "vmbackup.scripts", %phase, error = %err, "failed to start scripts");
				self.scripts_failed = true;
				let event = HostEvent::new(EventName::RequestorError, StatusCode::ScriptError, "Error when starting backup scripts.");
				self.notify(cx, SendMode::Tolerant, event);
			}
		}
	}

	/// Tears the session down and tells the host the cycle is over.
	pub(crate) fn finalize(mut self, cx: &mut Cx<'_>) {
		if let Some(mut flight) = self.current.take() {
			if !flight.op.query().is_terminal() {
				flight.op.cancel();
			}
			flight.op.release();
		}
		if self.provider_active {
			warn!(target = "vmbackup.session", phase = %self.phase, "provider still active at teardown; aborting it");
			cx.provider.abort();
			self.provider_active = false;
		}

		self.notify(cx, SendMode::Tolerant, HostEvent::bare(EventName::RequestorDone));
		self.clear_timers(cx);
		cx.provider.end_session();
		info!(
			target = "vmbackup.session",
			aborted = self.client_aborted,
			channel_failed = self.channel_failed,
			provider_failed = self.provider_failed,
			scripts_failed = self.scripts_failed,
			"backup cycle finished"
		);
	}

	/// Drops a session that never got past its first step, without a done event.
	pub(crate) fn discard(mut self, cx: &mut Cx<'_>) {
		if let Some(flight) = self.current.take() {
			flight.op.release();
		}
		self.clear_timers(cx);
		cx.provider.end_session();
	}

	fn clear_timers(&mut self, cx: &mut Cx<'_>) {
		if let Some(id) = self.poll_timer.take() {
			cx.timers.remove(id);
		}
		cx.channel.disarm(&mut self.channel, cx.timers);
	}
}
