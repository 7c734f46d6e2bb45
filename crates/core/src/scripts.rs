//! Hook scripts run before the freeze, after the thaw, and on failure.
//!
//! Scripts are the executable regular files in the scripts directory, ordered
//! by file name. The freeze batch runs them in ascending order and stops at the
//! first failure. The thaw and freeze-fail batches run, in descending order,
//! exactly the scripts the last freeze batch launched, and keep going past
//! failures.

use std::collections::VecDeque;
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::Child;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};
use vmbackup_runtime::process;

use crate::error::ScriptError;
use crate::operation::{AsyncOperation, OpStatus, OperationKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScriptPhase {
	Freeze,
	FreezeFailed,
	Thaw,
}

impl ScriptPhase {
	/// The single argument each script receives.
	pub fn arg(self) -> &'static str {
		match self {
			ScriptPhase::Freeze => "freeze",
			ScriptPhase::FreezeFailed => "freezeFail",
			ScriptPhase::Thaw => "thaw",
		}
	}
}

impl fmt::Display for ScriptPhase {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			ScriptPhase::Freeze => "freeze",
			ScriptPhase::FreezeFailed => "freeze-fail",
			ScriptPhase::Thaw => "thaw",
		})
	}
}

/// Launches script batches as pollable operations.
pub trait ScriptSubsystem {
	fn run_scripts(&mut self, phase: ScriptPhase) -> Result<Box<dyn AsyncOperation>, ScriptError>;
}

#[derive(Debug, Default)]
struct Ledger {
	/// Scripts launched by the last freeze batch, in launch order.
	frozen: Vec<PathBuf>,
	busy: Option<ScriptPhase>,
}

/// Runs the scripts found in a directory.
#[derive(Debug)]
pub struct ScriptRunner {
	dir: PathBuf,
	ledger: Arc<Mutex<Ledger>>,
}

impl ScriptRunner {
	pub fn new(dir: impl Into<PathBuf>) -> Self {
		Self {
			dir: dir.into(),
			ledger: Arc::default(),
		}
	}

	pub fn dir(&self) -> &Path {
		&self.dir
	}

	/// Executable regular files in the scripts directory, sorted by file name.
	pub fn discover(&self) -> Result<Vec<PathBuf>, ScriptError> {
		let entries = match std::fs::read_dir(&self.dir) {
			Ok(entries) => entries,
			Err(err) if err.kind() == ErrorKind::NotFound => {
				debug!(target = "vmbackup.scripts", dir = %self.dir.display(), "no scripts directory");
				return Ok(Vec::new());
			}
			Err(source) => {
				return Err(ScriptError::Discover {
					dir: self.dir.clone(),
					source,
				});
			}
		};

		let mut scripts = Vec::new();
		for entry in entries {
			let entry = entry.map_err(|source| ScriptError::Discover {
				dir: self.dir.clone(),
				source,
			})?;
			let path = entry.path();
			if process::is_executable(&path) {
				scripts.push(path);
			} else {
				debug!(target = "vmbackup.scripts", path = %path.display(), "skipping non-executable entry");
			}
		}
		scripts.sort_by(|a, b| a.file_name().cmp(&b.file_name()));
		Ok(scripts)
	}
}

impl ScriptSubsystem for ScriptRunner {
	fn run_scripts(&mut self, phase: ScriptPhase) -> Result<Box<dyn AsyncOperation>, ScriptError> {
		let mut ledger = self.ledger.lock();
		if let Some(running) = ledger.busy {
			return Err(ScriptError::BatchInProgress { running, requested: phase });
		}

		let scripts: Vec<PathBuf> = match phase {
			ScriptPhase::Freeze => {
				let found = self.discover()?;
				ledger.frozen.clear();
				found
			}
			ScriptPhase::Thaw | ScriptPhase::FreezeFailed => ledger.frozen.iter().rev().cloned().collect(),
		};
		ledger.busy = Some(phase);
		drop(ledger);

		debug!(target = "vmbackup.scripts", %phase, count = scripts.len(), dir = %self.dir.display(), "starting script batch");
		let mut batch = ScriptBatch {
			name: format!("{phase} scripts"),
			phase,
			queue: scripts.into(),
			running: None,
			status: OpStatus::Pending,
			first_failure: None,
			ledger: Arc::clone(&self.ledger),
		};
		batch.advance();
		Ok(Box::new(batch))
	}
}

#[derive(Debug)]
struct RunningScript {
	path: PathBuf,
	child: Child,
}

/// One batch of scripts, run one at a time.
#[derive(Debug)]
pub struct ScriptBatch {
	name: String,
	phase: ScriptPhase,
	queue: VecDeque<PathBuf>,
	running: Option<RunningScript>,
	status: OpStatus,
	first_failure: Option<String>,
	ledger: Arc<Mutex<Ledger>>,
}

impl ScriptBatch {
	/// Reaps the running script and launches the next ones until one is still
	/// running or the batch is terminal.
	fn advance(&mut self) -> OpStatus {
		while self.status == OpStatus::Pending {
			if let Some(running) = self.running.as_mut() {
				match running.child.try_wait() {
					Ok(None) => return OpStatus::Pending,
					Ok(Some(exit)) => {
						let path = running.path.clone();
						self.running = None;
						if exit.success() {
							debug!(target = "vmbackup.scripts", script = %path.display(), phase = %self.phase, "script finished");
						} else {
							self.record_failure(&path, process::describe_exit(exit));
						}
					}
					Err(err) => {
						let path = running.path.clone();
						self.running = None;
						self.record_failure(&path, err.to_string());
					}
				}
				continue;
			}

			let Some(path) = self.queue.pop_front() else {
				self.status = if self.first_failure.is_some() { OpStatus::Failed } else { OpStatus::Finished };
				break;
			};
			if self.phase == ScriptPhase::Freeze {
				self.ledger.lock().frozen.push(path.clone());
			}
			match process::spawn_hook(&path, self.phase.arg()) {
				Ok(child) => {
					debug!(target = "vmbackup.scripts", script = %path.display(), pid = child.id(), phase = %self.phase, "script started");
					self.running = Some(RunningScript { path, child });
				}
				Err(err) => self.record_failure(&path, err.to_string()),
			}
		}
		self.status
	}

	fn record_failure(&mut self, path: &Path, reason: String) {
		warn!(target = "vmbackup.scripts", script = %path.display(), phase = %self.phase, %reason, "script failed");
		if self.first_failure.is_none() {
			self.first_failure = Some(format!("Script {} failed during {} ({reason}).", path.display(), self.phase));
		}
		if self.phase == ScriptPhase::Freeze {
			self.queue.clear();
			self.status = OpStatus::Failed;
		}
	}
}

impl AsyncOperation for ScriptBatch {
	fn name(&self) -> &str {
		&self.name
	}

	fn kind(&self) -> OperationKind {
		OperationKind::ScriptBatch(self.phase)
	}

	fn query(&mut self) -> OpStatus {
		self.advance()
	}

	fn cancel(&mut self) {
		if self.status.is_terminal() {
			return;
		}
		if let Some(running) = self.running.as_mut() {
			process::terminate(&mut running.child);
		}
		self.running = None;
		self.queue.clear();
		self.status = OpStatus::Canceled;
		debug!(target = "vmbackup.scripts", phase = %self.phase, "script batch canceled");
	}

	fn release(self: Box<Self>) {}

	fn failure(&self) -> Option<String> {
		self.first_failure.clone()
	}
}

impl Drop for ScriptBatch {
	fn drop(&mut self) {
		if let Some(mut running) = self.running.take() {
			process::terminate(&mut running.child);
		}
		self.ledger.lock().busy = None;
	}
}
