//! Inbound host commands in their text RPC form.

use std::fmt;

use serde::{Deserialize, Serialize};

pub const START: &str = "vmbackup.start";
pub const ABORT: &str = "vmbackup.abort";
pub const SNAPSHOT_DONE: &str = "vmbackup.snapshotDone";

/// Arguments of the start command.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartArgs {
	/// Whether a backup manifest should be produced once quiesced.
	#[serde(default)]
	pub generate_manifests: bool,
	/// Provider-specific volume selection; `None` quiesces everything.
	#[serde(default)]
	pub volumes: Option<String>,
}

impl StartArgs {
	pub fn new(generate_manifests: bool, volumes: Option<String>) -> Self {
		Self { generate_manifests, volumes }
	}

	/// Parses `"<manifests> <volumes...>"`.
	///
	/// The first space-delimited token is read as an integer flag; everything
	/// after its separator is the volume specification. When the leading token
	/// is not an integer, the whole string is taken as the volume specification.
	pub fn parse(args: &str) -> Self {
		let trimmed = args.trim_start_matches(' ');
		let (token, rest) = trimmed.split_once(' ').unwrap_or((trimmed, ""));

		match token.parse::<i64>() {
			Ok(flag) => Self::new(flag != 0, non_empty(rest)),
			Err(_) => Self::new(false, non_empty(trimmed)),
		}
	}
}

fn non_empty(value: &str) -> Option<String> {
	if value.is_empty() { None } else { Some(value.to_string()) }
}

/// The three commands the host may issue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
	Start(StartArgs),
	Abort,
	SnapshotDone,
}

/// Text that does not name a backup command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownCommand(pub String);

impl fmt::Display for UnknownCommand {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "unknown backup command: {}", self.0)
	}
}

impl std::error::Error for UnknownCommand {}

impl Command {
	/// Parses a full RPC line such as `vmbackup.start 1 /dev/sda1`.
	pub fn parse(line: &str) -> Result<Self, UnknownCommand> {
		let line = line.trim_end_matches(['\r', '\n']);
		let (verb, args) = line.split_once(' ').unwrap_or((line, ""));
		match verb {
			START => Ok(Command::Start(StartArgs::parse(args))),
			ABORT => Ok(Command::Abort),
			SNAPSHOT_DONE => Ok(Command::SnapshotDone),
			_ => Err(UnknownCommand(verb.to_string())),
		}
	}

	pub fn verb(&self) -> &'static str {
		match self {
			Command::Start(_) => START,
			Command::Abort => ABORT,
			Command::SnapshotDone => SNAPSHOT_DONE,
		}
	}
}

/// Outcome of a command handler: success flag plus a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandReply {
	pub ok: bool,
	pub message: String,
}

impl CommandReply {
	pub fn ok() -> Self {
		Self {
			ok: true,
			message: String::new(),
		}
	}

	pub fn fail(message: impl Into<String>) -> Self {
		Self {
			ok: false,
			message: message.into(),
		}
	}
}
