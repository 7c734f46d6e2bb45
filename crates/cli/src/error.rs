use std::path::PathBuf;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CliError {
	#[error("I/O error: {0}")]
	Io(#[from] std::io::Error),

	#[error("JSON error: {0}")]
	Json(#[from] serde_json::Error),

	#[error(transparent)]
	Backup(#[from] vmbackup::BackupError),

	#[error("daemon not running at {}", .0.display())]
	NotRunning(PathBuf),

	#[error("daemon already running with pid {0}")]
	AlreadyRunning(u32),

	#[error("{0}")]
	Rejected(String),

	#[error(transparent)]
	Anyhow(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, CliError>;
