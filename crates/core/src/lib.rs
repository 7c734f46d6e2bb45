//! Guest-side quiesce and backup orchestration.
//!
//! A [`Quiescer`] owns at most one [`BackupSession`] and drives it from a
//! single-threaded poll loop:
//!
//! ```text
//! start -> freeze scripts -> provider freeze -> (snapshot acknowledged) -> provider thaw -> thaw scripts -> done
//!             \__________________ failure or abort ___________________/
//!                          provider undo (if frozen) -> freeze-fail scripts -> done
//! ```
//!
//! Every step that takes unbounded time is an [`AsyncOperation`] polled by the
//! session; nothing blocks, and the only timers are the session's poll timer
//! and its keep-alive heartbeat.

pub mod channel;
pub mod config;
pub mod error;
pub mod fake;
pub mod manifest;
pub mod operation;
pub mod provider;
pub mod quiescer;
pub mod scripts;
pub mod session;
pub mod timers;

pub use channel::{ChannelState, EventChannel, RpcStatus, SendMode};
pub use config::{QuiesceSettings, load_exclusions};
pub use error::{BackupError, ProviderError, Result, ScriptError};
pub use operation::{AsyncOperation, ImmediateOperation, OpStatus, OperationKind};
pub use provider::{NullProvider, ProviderAdapter, QuiesceProvider};
pub use quiescer::Quiescer;
pub use scripts::{ScriptBatch, ScriptPhase, ScriptRunner, ScriptSubsystem};
pub use session::{AbortCause, BackupSession, Phase};
pub use timers::TimerKind;
