//! Error taxonomy for a backup cycle.

use std::path::PathBuf;

use thiserror::Error;
use vmbackup_protocol::StatusCode;
use vmbackup_runtime::ChannelError;

use crate::scripts::ScriptPhase;
use crate::session::Phase;

pub type Result<T> = std::result::Result<T, BackupError>;

/// Failures of the hook-script subsystem.
#[derive(Debug, Error)]
pub enum ScriptError {
	#[error("cannot run {requested} scripts while {running} scripts are still running")]
	BatchInProgress { running: ScriptPhase, requested: ScriptPhase },

	#[error("failed to list scripts in {}: {source}", dir.display())]
	Discover {
		dir: PathBuf,
		#[source]
		source: std::io::Error,
	},
}

/// Failures reported by a quiesce provider.
#[derive(Debug, Error)]
pub enum ProviderError {
	#[error("{provider} failed to start quiescing: {reason}")]
	Start { provider: String, reason: String },

	#[error("{provider} reported a failure: {reason}")]
	Faulted { provider: String, reason: String },

	#[error("{action} requested but the provider has not completed a freeze")]
	NotFrozen { action: &'static str },

	#[error("provider has already been {state} this session")]
	AlreadyReleased { state: &'static str },
}

#[derive(Debug, Error)]
pub enum BackupError {
	#[error("failed to read exclusion list {}: {source}", path.display())]
	ConfigLoad {
		path: PathBuf,
		#[source]
		source: std::io::Error,
	},

	#[error("invalid settings file {}: {reason}", path.display())]
	Settings { path: PathBuf, reason: String },

	#[error(transparent)]
	Script(#[from] ScriptError),

	#[error(transparent)]
	Provider(#[from] ProviderError),

	#[error(transparent)]
	Channel(#[from] ChannelError),

	#[error("backup aborted by the host")]
	RemoteAbort,

	#[error("Asynchronous operation failed: {operation}")]
	UnexpectedOperationFailure { operation: String },

	#[error("Backup operation already in progress.")]
	AlreadyRunning,

	#[error("Error: no backup in progress")]
	NotRunning,

	#[error("cannot accept {action} while {phase}")]
	InvalidState { phase: Phase, action: &'static str },
}

impl BackupError {
	/// Status code reported to the host for this error.
	pub fn status_code(&self) -> StatusCode {
		match self {
			BackupError::ConfigLoad { .. } | BackupError::Settings { .. } | BackupError::AlreadyRunning | BackupError::NotRunning => StatusCode::InvalidState,
			BackupError::InvalidState { .. } => StatusCode::InvalidState,
			BackupError::Script(_) => StatusCode::ScriptError,
			BackupError::Provider(_) => StatusCode::SyncError,
			BackupError::RemoteAbort => StatusCode::RemoteAbort,
			BackupError::Channel(_) | BackupError::UnexpectedOperationFailure { .. } => StatusCode::UnexpectedError,
		}
	}

	/// Message returned to the caller of a rejected command.
	pub fn reply_message(&self) -> String {
		match self {
			BackupError::ConfigLoad { .. } => "Error when reading configuration file.".to_string(),
			BackupError::Script(_) => "Error initializing backup.".to_string(),
			other => other.to_string(),
		}
	}
}
