//! Wire types for the guest backup protocol.
//!
//! This crate contains the data exchanged between the guest backup service and
//! its host: event notifications sent to the host, the inbound commands the host
//! issues, and the line-delimited request/response types spoken by the local
//! control socket.
//!
//! # Design Philosophy
//!
//! Types in this crate are:
//! * Pure data: No behavior beyond parsing and serialization
//! * 1:1 with the wire: Names and codes match what the host expects
//! * Stable: Changes only when the wire protocol changes
//!
//! The state machine that produces and consumes these types lives in `vmbackup`.

pub mod commands;
pub mod control;
pub mod events;

pub use commands::*;
pub use control::*;
pub use events::*;
