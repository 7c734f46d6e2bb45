//! Host-bound backup event notifications.

use std::fmt;

use serde::{Deserialize, Serialize};

/// RPC verb used to publish a backup event to the host.
pub const EVENT_SET: &str = "vmbackup.eventSet";

/// Fixed vocabulary of events understood by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventName {
	/// A new backup cycle started; the host discards stale state.
	Reset,
	/// The guest finished the cycle and released every resource.
	RequestorDone,
	/// A phase failed; the message carries the cause.
	RequestorError,
	/// The cycle was aborted on request.
	RequestorAbort,
	/// Heartbeat preventing the host from timing out the session.
	KeepAlive,
	/// A backup manifest was written; the message is its path.
	GenericManifest,
}

impl EventName {
	pub fn as_str(self) -> &'static str {
		match self {
			EventName::Reset => "reset",
			EventName::RequestorDone => "requestor-done",
			EventName::RequestorError => "requestor-error",
			EventName::RequestorAbort => "requestor-abort",
			EventName::KeepAlive => "keep-alive",
			EventName::GenericManifest => "generic-manifest",
		}
	}
}

impl fmt::Display for EventName {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(self.as_str())
	}
}

/// Result codes attached to every event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u32", try_from = "u32")]
#[repr(u32)]
pub enum StatusCode {
	Success = 0,
	InvalidState = 1,
	ScriptError = 2,
	SyncError = 3,
	RemoteAbort = 4,
	UnexpectedError = 5,
}

impl From<StatusCode> for u32 {
	fn from(code: StatusCode) -> Self {
		code as u32
	}
}

/// Numeric status code with no named counterpart.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnknownStatusCode(pub u32);

impl fmt::Display for UnknownStatusCode {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "unknown backup status code {}", self.0)
	}
}

impl std::error::Error for UnknownStatusCode {}

impl TryFrom<u32> for StatusCode {
	type Error = UnknownStatusCode;

	fn try_from(value: u32) -> Result<Self, Self::Error> {
		Ok(match value {
			0 => StatusCode::Success,
			1 => StatusCode::InvalidState,
			2 => StatusCode::ScriptError,
			3 => StatusCode::SyncError,
			4 => StatusCode::RemoteAbort,
			5 => StatusCode::UnexpectedError,
			other => return Err(UnknownStatusCode(other)),
		})
	}
}

/// A single notification for the host.
///
/// Serialized as JSON for line-delimited transports:
/// ```json
/// { "event": "requestor-error", "code": 2, "message": "Freeze script failed" }
/// ```
/// and as `vmbackup.eventSet <event> <code> <message>` for text RPC channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostEvent {
	pub event: EventName,
	pub code: StatusCode,
	#[serde(default)]
	pub message: String,
}

impl HostEvent {
	pub fn new(event: EventName, code: StatusCode, message: impl Into<String>) -> Self {
		Self {
			event,
			code,
			message: message.into(),
		}
	}

	/// Event with a success code and an empty message.
	pub fn bare(event: EventName) -> Self {
		Self::new(event, StatusCode::Success, String::new())
	}

	/// Renders the text RPC form of this event.
	pub fn to_rpc(&self) -> String {
		format!("{} {} {} {}", EVENT_SET, self.event, u32::from(self.code), self.message)
	}
}
