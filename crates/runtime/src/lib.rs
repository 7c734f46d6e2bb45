//! Cooperative runtime primitives for the backup state machine.
//!
//! Nothing in this crate blocks: timers are plain deadlines handed back to the
//! caller's loop, transports write one line per event, and child processes are
//! polled rather than awaited.

pub mod fake_transport;
pub mod process;
pub mod timer;
pub mod transport;

pub use fake_transport::{FakeTransport, FakeTransportBuilder, FakeTransportController};
pub use timer::{TimerId, TimerQueue};
pub use transport::{ChannelError, EventFormat, HostTransport, LineTransport};
