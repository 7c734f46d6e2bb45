//! Backup manifest written while the freeze is held.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::debug;

pub const MANIFEST_FILE: &str = "quiesce_manifest.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
	pub provider: String,
	pub volumes: Option<String>,
	pub excluded: Vec<String>,
	/// Seconds since the Unix epoch.
	pub created_at: u64,
}

impl Manifest {
	pub fn new(provider: impl Into<String>, volumes: Option<String>, excluded: Vec<String>) -> Self {
		Self {
			provider: provider.into(),
			volumes,
			excluded,
			created_at: now_ts(),
		}
	}
}

/// Writes `manifest` into `dir`, replacing any earlier one, and returns its path.
pub fn write_manifest(dir: &Path, manifest: &Manifest) -> io::Result<PathBuf> {
	std::fs::create_dir_all(dir)?;
	let path = dir.join(MANIFEST_FILE);
	let tmp = path.with_extension("json.tmp");
	let bytes = serde_json::to_vec_pretty(manifest).map_err(io::Error::other)?;
	std::fs::write(&tmp, bytes)?;
	std::fs::rename(&tmp, &path)?;
	debug!(target = "vmbackup.session", path = %path.display(), "manifest written");
	Ok(path)
}

fn now_ts() -> u64 {
	SystemTime::now().duration_since(UNIX_EPOCH).map(|elapsed| elapsed.as_secs()).unwrap_or(0)
}
