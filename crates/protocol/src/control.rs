//! Request/response types for the local control socket.
//!
//! Each request and response is a single JSON line.

use serde::{Deserialize, Serialize};

use crate::commands::StartArgs;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlRequest {
	Ping,
	Start {
		#[serde(default)]
		generate_manifests: bool,
		#[serde(default)]
		volumes: Option<String>,
	},
	Abort,
	SnapshotDone,
	/// A host command in its text form, e.g. `vmbackup.start 1 /`.
	Rpc {
		line: String,
	},
	Status,
	Shutdown,
}

impl ControlRequest {
	pub fn start(args: StartArgs) -> Self {
		ControlRequest::Start {
			generate_manifests: args.generate_manifests,
			volumes: args.volumes,
		}
	}
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlResponse {
	Pong,
	Ok { message: String },
	Error { message: String },
	Status { session: SessionSnapshot },
}

/// Point-in-time view of the backup session for operators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionSnapshot {
	pub active: bool,
	pub phase: String,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub rpc_status: Option<String>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub current_operation: Option<String>,
	#[serde(default)]
	pub provider_active: bool,
	#[serde(default)]
	pub snapshot_acknowledged: bool,
	#[serde(default)]
	pub client_aborted: bool,
	#[serde(default)]
	pub provider_failed: bool,
	#[serde(default)]
	pub disabled_targets: Vec<String>,
}
