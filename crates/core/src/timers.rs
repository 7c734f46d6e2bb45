//! Timer payloads owned by a backup session.

use vmbackup_runtime::TimerQueue;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TimerKind {
	/// Re-query the current operation and advance the phase.
	Poll,
	/// Send a heartbeat to the host.
	KeepAlive,
}

pub type Timers = TimerQueue<TimerKind>;
