//! Outbound host transport.
//!
//! A transport delivers one [`HostEvent`] at a time and reports failure
//! synchronously, so the caller can decide whether the failure matters.

use std::fmt;
use std::io::Write;
use std::str::FromStr;

use thiserror::Error;
use vmbackup_protocol::HostEvent;

/// Failure to hand an event to the host.
#[derive(Debug, Error)]
pub enum ChannelError {
	#[error("host channel I/O failed: {0}")]
	Io(#[from] std::io::Error),

	#[error("failed to encode host event: {0}")]
	Encode(#[from] serde_json::Error),

	#[error("host rejected event: {0}")]
	Rejected(String),

	#[error("host channel closed")]
	Closed,
}

/// Sink for host events.
pub trait HostTransport {
	fn send(&mut self, event: &HostEvent) -> Result<(), ChannelError>;
}

impl<T: HostTransport + ?Sized> HostTransport for Box<T> {
	fn send(&mut self, event: &HostEvent) -> Result<(), ChannelError> {
		(**self).send(event)
	}
}

/// Line encoding used by [`LineTransport`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum EventFormat {
	/// One JSON object per line.
	#[default]
	Json,
	/// `vmbackup.eventSet <event> <code> <message>` lines.
	Rpc,
}

impl FromStr for EventFormat {
	type Err = String;

	fn from_str(value: &str) -> Result<Self, Self::Err> {
		match value {
			"json" => Ok(EventFormat::Json),
			"rpc" => Ok(EventFormat::Rpc),
			other => Err(format!("unknown event format `{other}` (expected json or rpc)")),
		}
	}
}

impl fmt::Display for EventFormat {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		f.write_str(match self {
			EventFormat::Json => "json",
			EventFormat::Rpc => "rpc",
		})
	}
}

/// Writes each event as one line and flushes.
pub struct LineTransport<W: Write> {
	writer: W,
	format: EventFormat,
}

impl<W: Write> LineTransport<W> {
	pub fn new(writer: W) -> Self {
		Self::with_format(writer, EventFormat::Json)
	}

	pub fn with_format(writer: W, format: EventFormat) -> Self {
		Self { writer, format }
	}

	pub fn into_inner(self) -> W {
		self.writer
	}
}

impl<W: Write> HostTransport for LineTransport<W> {
	fn send(&mut self, event: &HostEvent) -> Result<(), ChannelError> {
		let mut line = match self.format {
			EventFormat::Json => serde_json::to_vec(event)?,
			EventFormat::Rpc => event.to_rpc().into_bytes(),
		};
		line.push(b'\n');
		self.writer.write_all(&line)?;
		self.writer.flush()?;
		Ok(())
	}
}

#[cfg(test)]
mod tests {
	use vmbackup_protocol::{EventName, StatusCode};

	use super::*;

	#[test]
	fn writes_one_json_line_per_event() {
		let mut transport = LineTransport::new(Vec::new());
		transport.send(&HostEvent::bare(EventName::Reset)).unwrap();
		transport
			.send(&HostEvent::new(EventName::RequestorError, StatusCode::SyncError, "freeze failed"))
			.unwrap();

		let output = String::from_utf8(transport.into_inner()).unwrap();
		let lines: Vec<serde_json::Value> = output.lines().map(|line| serde_json::from_str(line).unwrap()).collect();
		assert_eq!(lines.len(), 2);
		assert_eq!(lines[0]["event"], "reset");
		assert_eq!(lines[1]["code"], 3);
		assert_eq!(lines[1]["message"], "freeze failed");
	}

	#[test]
	fn rpc_format_writes_event_set_lines() {
		let mut transport = LineTransport::with_format(Vec::new(), EventFormat::Rpc);
		transport.send(&HostEvent::bare(EventName::Reset)).unwrap();
		transport
			.send(&HostEvent::new(EventName::RequestorAbort, StatusCode::RemoteAbort, "Remote abort."))
			.unwrap();

		let output = String::from_utf8(transport.into_inner()).unwrap();
		assert_eq!(output, "vmbackup.eventSet reset 0 \nvmbackup.eventSet requestor-abort 4 Remote abort.\n");
	}

	#[test]
	fn event_format_parses_from_flag_values() {
		assert_eq!("rpc".parse::<EventFormat>(), Ok(EventFormat::Rpc));
		assert_eq!("json".parse::<EventFormat>(), Ok(EventFormat::Json));
		assert!("xml".parse::<EventFormat>().is_err());
	}

	struct BrokenPipe;

	impl Write for BrokenPipe {
		fn write(&mut self, _: &[u8]) -> std::io::Result<usize> {
			Err(std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed"))
		}

		fn flush(&mut self) -> std::io::Result<()> {
			Ok(())
		}
	}

	#[test]
	fn write_failures_surface_as_io_errors() {
		let mut transport = LineTransport::new(BrokenPipe);
		let err = transport.send(&HostEvent::bare(EventName::KeepAlive)).unwrap_err();
		assert!(matches!(err, ChannelError::Io(_)));
	}
}
