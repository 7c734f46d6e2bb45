//! Client side of the control socket.

use std::path::Path;

use anyhow::anyhow;
use serde::Serialize;
use serde_json::json;
use vmbackup_protocol::{ControlRequest, ControlResponse};

use crate::daemon::send_request;
use crate::error::{CliError, Result};

pub async fn request(socket: &Path, request: ControlRequest) -> Result<()> {
	match send_request(socket, &request).await? {
		None => Err(CliError::NotRunning(socket.to_path_buf())),
		Some(ControlResponse::Error { message }) => Err(CliError::Rejected(message)),
		Some(response) => print_json(&response),
	}
}

pub async fn status(socket: &Path) -> Result<()> {
	match send_request(socket, &ControlRequest::Status).await? {
		None => print_json(&json!({
			"running": false,
			"message": "daemon not running"
		})),
		Some(ControlResponse::Status { session }) => print_json(&json!({
			"running": true,
			"session": session
		})),
		Some(ControlResponse::Error { message }) => Err(CliError::Rejected(message)),
		Some(other) => Err(CliError::Anyhow(anyhow!("unexpected daemon response: {other:?}"))),
	}
}

pub async fn shutdown(socket: &Path) -> Result<()> {
	match send_request(socket, &ControlRequest::Shutdown).await? {
		None => print_json(&json!({
			"stopped": false,
			"message": "daemon not running"
		})),
		Some(ControlResponse::Ok { .. }) => print_json(&json!({ "stopped": true })),
		Some(ControlResponse::Error { message }) => Err(CliError::Rejected(message)),
		Some(other) => Err(CliError::Anyhow(anyhow!("unexpected daemon response: {other:?}"))),
	}
}

fn print_json(value: &impl Serialize) -> Result<()> {
	println!("{}", serde_json::to_string_pretty(value)?);
	Ok(())
}
