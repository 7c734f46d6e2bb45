//! Quiesce providers and the adapter that enforces their call contract.

mod null;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, error, warn};

pub use null::NullProvider;

use crate::error::ProviderError;
use crate::operation::{AsyncOperation, OpStatus, OperationKind};

/// An OS-specific mechanism that freezes and thaws filesystem I/O.
///
/// The session calls `start` at most once per cycle, then exactly one of
/// `request_thaw`, `request_undo`, or `abort`.
pub trait QuiesceProvider {
	fn name(&self) -> &str;

	/// Begins quiescing `volumes` (all volumes when `None`), leaving out `excluded`.
	fn start(&mut self, volumes: Option<&str>, excluded: &[String]) -> Result<Box<dyn AsyncOperation>, ProviderError>;

	/// Releases the freeze after the host has taken its snapshot.
	fn request_thaw(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError>;

	/// Rolls back a completed freeze.
	fn request_undo(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError>;

	/// Tears down a freeze that never completed.
	fn abort(&mut self);

	/// Reports a failure detected while the freeze is held.
	fn check(&mut self) -> Result<(), ProviderError> {
		Ok(())
	}

	/// Frees the provider when the service shuts down.
	fn release(&mut self) {}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
	Idle,
	Started,
	Thawed,
	Undone,
	Aborted,
}

impl Stage {
	fn label(self) -> &'static str {
		match self {
			Stage::Idle => "idle",
			Stage::Started => "started",
			Stage::Thawed => "thawed",
			Stage::Undone => "undone",
			Stage::Aborted => "aborted",
		}
	}
}

/// Wraps a provider for one cycle at a time.
///
/// Undo and thaw are only forwarded once the freeze operation has finished, and
/// each of thaw, undo, and abort at most once per cycle.
pub struct ProviderAdapter {
	inner: Box<dyn QuiesceProvider>,
	frozen: Arc<AtomicBool>,
	stage: Stage,
}

impl ProviderAdapter {
	pub fn new(inner: Box<dyn QuiesceProvider>) -> Self {
		Self {
			inner,
			frozen: Arc::new(AtomicBool::new(false)),
			stage: Stage::Idle,
		}
	}

	pub fn name(&self) -> &str {
		self.inner.name()
	}

	/// Whether the freeze operation of the current cycle has finished.
	pub fn is_frozen(&self) -> bool {
		self.frozen.load(Ordering::Acquire)
	}

	pub fn begin_session(&mut self) {
		self.frozen.store(false, Ordering::Release);
		self.stage = Stage::Idle;
	}

	pub fn start(&mut self, volumes: Option<&str>, excluded: &[String]) -> Result<Box<dyn AsyncOperation>, ProviderError> {
		if self.stage != Stage::Idle {
			return Err(ProviderError::AlreadyReleased { state: self.stage.label() });
		}
		let op = self.inner.start(volumes, excluded)?;
		self.stage = Stage::Started;
		debug!(target = "vmbackup.provider", provider = self.inner.name(), ?volumes, excluded = excluded.len(), "provider started");
		Ok(Box::new(FreezeTracker {
			inner: op,
			frozen: Arc::clone(&self.frozen),
		}))
	}

	pub fn request_thaw(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError> {
		self.ensure_frozen("thaw")?;
		self.stage = Stage::Thawed;
		self.inner.request_thaw()
	}

	pub fn request_undo(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError> {
		self.ensure_frozen("undo")?;
		self.stage = Stage::Undone;
		self.inner.request_undo()
	}

	pub fn abort(&mut self) {
		if self.stage != Stage::Started {
			debug!(target = "vmbackup.provider", stage = self.stage.label(), "provider abort skipped");
			return;
		}
		self.stage = Stage::Aborted;
		self.inner.abort();
	}

	pub fn check(&mut self) -> Result<(), ProviderError> {
		if self.stage == Stage::Started && self.is_frozen() { self.inner.check() } else { Ok(()) }
	}

	/// Closes out a cycle, aborting a provider nobody released.
	pub fn end_session(&mut self) {
		if self.stage == Stage::Started {
			warn!(target = "vmbackup.provider", provider = self.inner.name(), "provider still started at end of cycle; aborting");
			self.abort();
		}
		self.frozen.store(false, Ordering::Release);
		self.stage = Stage::Idle;
	}

	pub fn release(&mut self) {
		self.end_session();
		self.inner.release();
	}

	fn ensure_frozen(&self, action: &'static str) -> Result<(), ProviderError> {
		if self.stage != Stage::Started {
			error!(target = "vmbackup.provider", action, stage = self.stage.label(), "provider call out of order");
			return Err(ProviderError::AlreadyReleased { state: self.stage.label() });
		}
		if !self.is_frozen() {
			error!(target = "vmbackup.provider", action, "provider call before the freeze completed");
			return Err(ProviderError::NotFrozen { action });
		}
		Ok(())
	}
}

/// Marks the adapter frozen when the wrapped freeze operation finishes.
struct FreezeTracker {
	inner: Box<dyn AsyncOperation>,
	frozen: Arc<AtomicBool>,
}

impl AsyncOperation for FreezeTracker {
	fn name(&self) -> &str {
		self.inner.name()
	}

	fn kind(&self) -> OperationKind {
		OperationKind::ProviderFreeze
	}

	fn query(&mut self) -> OpStatus {
		let status = self.inner.query();
		if status == OpStatus::Finished {
			self.frozen.store(true, Ordering::Release);
		}
		status
	}

	fn cancel(&mut self) {
		self.inner.cancel();
	}

	fn release(self: Box<Self>) {
		self.inner.release();
	}

	fn failure(&self) -> Option<String> {
		self.inner.failure()
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::operation::ImmediateOperation;

	#[derive(Default)]
	struct Recording {
		calls: Arc<parking_lot::Mutex<Vec<&'static str>>>,
	}

	impl QuiesceProvider for Recording {
		fn name(&self) -> &str {
			"recording"
		}

		fn start(&mut self, _volumes: Option<&str>, _excluded: &[String]) -> Result<Box<dyn AsyncOperation>, ProviderError> {
			self.calls.lock().push("start");
			Ok(Box::new(ImmediateOperation::finished(OperationKind::ProviderFreeze, "freeze")))
		}

		fn request_thaw(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError> {
			self.calls.lock().push("thaw");
			Ok(Box::new(ImmediateOperation::finished(OperationKind::ProviderThaw, "thaw")))
		}

		fn request_undo(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError> {
			self.calls.lock().push("undo");
			Ok(Box::new(ImmediateOperation::finished(OperationKind::ProviderUndo, "undo")))
		}

		fn abort(&mut self) {
			self.calls.lock().push("abort");
		}
	}

	#[test]
	fn undo_is_refused_until_freeze_finishes() {
		let mut adapter = ProviderAdapter::new(Box::new(Recording::default()));
		adapter.begin_session();
		let mut freeze = adapter.start(None, &[]).unwrap();

		assert!(matches!(adapter.request_undo(), Err(ProviderError::NotFrozen { action: "undo" })));
		assert_eq!(freeze.query(), OpStatus::Finished);
		assert!(adapter.is_frozen());
		freeze.release();

		assert!(adapter.request_undo().is_ok());
		assert!(matches!(adapter.request_thaw(), Err(ProviderError::AlreadyReleased { state: "undone" })));
	}

	#[test]
	fn end_session_aborts_an_unreleased_provider_once() {
		let provider = Recording::default();
		let calls = Arc::clone(&provider.calls);
		let mut adapter = ProviderAdapter::new(Box::new(provider));
		adapter.begin_session();
		adapter.start(Some("/"), &[]).unwrap().release();

		adapter.end_session();
		adapter.abort();
		assert!(!adapter.is_frozen());
		assert_eq!(*calls.lock(), vec!["start", "abort"]);

		adapter.begin_session();
		assert!(adapter.start(None, &[]).is_ok());
	}
}
