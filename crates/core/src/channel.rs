//! Event delivery to the host and the keep-alive heartbeat.
//!
//! Every send, successful or not, re-arms the keep-alive timer, so a session
//! with an open channel always has exactly one heartbeat scheduled.

use std::time::{Duration, Instant};

use tracing::{debug, trace, warn};
use vmbackup_protocol::HostEvent;
use vmbackup_runtime::{HostTransport, TimerId};

use crate::timers::{TimerKind, Timers};

/// How a failed send affects the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendMode {
	/// Failure is logged and otherwise ignored.
	Tolerant,
	/// Failure marks the channel broken, which aborts the session.
	Strict,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RpcStatus {
	#[default]
	Normal,
	/// A strict send failed; the next poll aborts the session.
	Error,
	/// Send failures no longer matter because the session is already aborting.
	Ignoring,
}

impl RpcStatus {
	pub fn as_str(self) -> &'static str {
		match self {
			RpcStatus::Normal => "normal",
			RpcStatus::Error => "error",
			RpcStatus::Ignoring => "ignoring",
		}
	}
}

/// Per-session channel bookkeeping.
#[derive(Debug, Default)]
pub struct ChannelState {
	rpc_status: RpcStatus,
	keep_alive: Option<TimerId>,
}

impl ChannelState {
	pub fn rpc_status(&self) -> RpcStatus {
		self.rpc_status
	}

	pub fn keep_alive_timer(&self) -> Option<TimerId> {
		self.keep_alive
	}

	pub fn ignore_failures(&mut self) {
		self.rpc_status = RpcStatus::Ignoring;
	}

	/// Forgets a keep-alive timer that has just fired.
	pub(crate) fn keep_alive_fired(&mut self) {
		self.keep_alive = None;
	}
}

pub struct EventChannel {
	transport: Box<dyn HostTransport>,
	keep_alive_interval: Duration,
}

impl EventChannel {
	pub fn new(transport: Box<dyn HostTransport>, keep_alive_interval: Duration) -> Self {
		Self {
			transport,
			keep_alive_interval,
		}
	}

	/// Sends `event` and re-arms the keep-alive. Returns whether the host accepted it.
	pub fn send(&mut self, state: &mut ChannelState, timers: &mut Timers, now: Instant, mode: SendMode, event: HostEvent) -> bool {
		if let Some(id) = state.keep_alive.take() {
			timers.remove(id);
		}

		let delivered = match self.transport.send(&event) {
			Ok(()) => {
				trace!(target = "vmbackup.channel", event = %event.event, code = ?event.code, "event sent");
				true
			}
			Err(err) if mode == SendMode::Strict && state.rpc_status == RpcStatus::Normal => {
				warn!(target = "vmbackup.channel", event = %event.event, error = %err, "required event failed; session will abort");
				state.rpc_status = RpcStatus::Error;
				false
			}
			Err(err) => {
				debug!(target = "vmbackup.channel", event = %event.event, error = %err, ?mode, "event not delivered");
				false
			}
		};

		state.keep_alive = Some(timers.add(now, self.keep_alive_interval, TimerKind::KeepAlive));
		delivered
	}

	/// Cancels the keep-alive timer, if any.
	pub fn disarm(&self, state: &mut ChannelState, timers: &mut Timers) {
		if let Some(id) = state.keep_alive.take() {
			timers.remove(id);
		}
	}
}
