//! Daemon settings and the quiesce exclusion list.

use std::fs::File;
use std::io::{BufRead, BufReader, ErrorKind};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{BackupError, Result};

/// Exclusion list file name inside the config directory.
pub const EXCLUSION_FILE: &str = "vmbackup.conf";
/// Hook-script directory name inside the config directory.
pub const SCRIPTS_DIR: &str = "backupScripts.d";

pub const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
pub const DEFAULT_IDLE_POLL_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_KEEP_ALIVE_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_CANCEL_GRACE_POLLS: u32 = 50;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuiesceSettings {
	pub config_dir: PathBuf,
	/// Defaults to `<config_dir>/backupScripts.d`.
	pub scripts_dir: Option<PathBuf>,
	/// Defaults to `config_dir`.
	pub manifest_dir: Option<PathBuf>,
	pub poll_interval_ms: u64,
	/// Poll cadence while the provider holds the freeze and nothing is in flight.
	pub idle_poll_interval_ms: u64,
	pub keep_alive_interval_ms: u64,
	/// Polls a canceled operation may stay pending before it is released anyway.
	pub cancel_grace_polls: u32,
}

impl Default for QuiesceSettings {
	fn default() -> Self {
		Self {
			config_dir: default_config_dir(),
			scripts_dir: None,
			manifest_dir: None,
			poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
			idle_poll_interval_ms: DEFAULT_IDLE_POLL_INTERVAL_MS,
			keep_alive_interval_ms: DEFAULT_KEEP_ALIVE_INTERVAL_MS,
			cancel_grace_polls: DEFAULT_CANCEL_GRACE_POLLS,
		}
	}
}

impl QuiesceSettings {
	/// Reads settings from a JSON file. Missing fields take their defaults.
	pub fn from_file(path: &Path) -> Result<Self> {
		let raw = std::fs::read_to_string(path).map_err(|err| BackupError::Settings {
			path: path.to_path_buf(),
			reason: err.to_string(),
		})?;
		serde_json::from_str(&raw).map_err(|err| BackupError::Settings {
			path: path.to_path_buf(),
			reason: err.to_string(),
		})
	}

	pub fn with_config_dir(mut self, dir: impl Into<PathBuf>) -> Self {
		self.config_dir = dir.into();
		self
	}

	pub fn with_cancel_grace_polls(mut self, polls: u32) -> Self {
		self.cancel_grace_polls = polls;
		self
	}

	pub fn scripts_dir(&self) -> PathBuf {
		self.scripts_dir.clone().unwrap_or_else(|| self.config_dir.join(SCRIPTS_DIR))
	}

	pub fn manifest_dir(&self) -> PathBuf {
		self.manifest_dir.clone().unwrap_or_else(|| self.config_dir.clone())
	}

	pub fn exclusion_path(&self) -> PathBuf {
		self.config_dir.join(EXCLUSION_FILE)
	}

	pub fn poll_interval(&self) -> Duration {
		Duration::from_millis(self.poll_interval_ms)
	}

	pub fn idle_poll_interval(&self) -> Duration {
		Duration::from_millis(self.idle_poll_interval_ms)
	}

	pub fn keep_alive_interval(&self) -> Duration {
		Duration::from_millis(self.keep_alive_interval_ms)
	}
}

#[cfg(unix)]
pub fn default_config_dir() -> PathBuf {
	PathBuf::from("/etc/vmware-tools")
}

#[cfg(windows)]
pub fn default_config_dir() -> PathBuf {
	let base = std::env::var_os("ProgramData").map(PathBuf::from).unwrap_or_else(|| PathBuf::from(r"C:\ProgramData"));
	base.join("VMware").join("VMware Tools")
}

#[cfg(not(any(unix, windows)))]
pub fn default_config_dir() -> PathBuf {
	PathBuf::from(".")
}

/// Loads the targets to leave out of quiescing, one per line.
///
/// A missing file, or a path that is not a regular file, yields an empty list.
/// Blank lines and lines whose first non-blank character is `#` are skipped.
/// Other lines are kept as written, less the line terminator; duplicates keep
/// their first position.
pub fn load_exclusions(path: &Path) -> Result<Vec<String>> {
	let load_err = |source| BackupError::ConfigLoad {
		path: path.to_path_buf(),
		source,
	};

	match std::fs::metadata(path) {
		Ok(meta) if !meta.is_file() => {
			debug!(target = "vmbackup.session", path = %path.display(), "exclusion list is not a regular file; ignoring");
			return Ok(Vec::new());
		}
		Ok(_) => {}
		Err(err) if err.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
		Err(err) => return Err(load_err(err)),
	}

	let file = File::open(path).map_err(load_err)?;
	let mut targets: Vec<String> = Vec::new();
	for line in BufReader::new(file).lines() {
		let line = line.map_err(load_err)?;
		let entry = line.trim_end_matches(['\r', '\n']);
		let content = entry.trim_start();
		if content.is_empty() || content.starts_with('#') {
			continue;
		}
		if !targets.iter().any(|existing| existing == entry) {
			targets.push(entry.to_string());
		}
	}

	debug!(target = "vmbackup.session", path = %path.display(), count = targets.len(), "loaded exclusion list");
	Ok(targets)
}
