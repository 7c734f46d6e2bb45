//! The polled unit of in-flight work.
//!
//! An operation is queried until it reports a terminal status, may be canceled
//! at most once along the way, and is released exactly once afterwards by
//! whoever holds it.

use crate::scripts::ScriptPhase;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpStatus {
	Pending,
	Finished,
	Failed,
	Canceled,
}

impl OpStatus {
	pub fn is_terminal(self) -> bool {
		!matches!(self, OpStatus::Pending)
	}
}

/// Which step of the cycle an operation belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OperationKind {
	ScriptBatch(ScriptPhase),
	ProviderFreeze,
	ProviderThaw,
	ProviderUndo,
}

impl OperationKind {
	/// Whether an abort cancels this operation. Thaw and undo always run to
	/// completion.
	pub fn cancel_on_abort(self) -> bool {
		matches!(self, OperationKind::ScriptBatch(_) | OperationKind::ProviderFreeze)
	}
}

pub trait AsyncOperation {
	fn name(&self) -> &str;

	fn kind(&self) -> OperationKind;

	/// Non-blocking progress check.
	fn query(&mut self) -> OpStatus;

	/// Requests cancellation. Later queries report `Canceled` once the work has
	/// actually stopped.
	fn cancel(&mut self);

	/// Frees all resources. Consumes the operation.
	fn release(self: Box<Self>);

	/// Human-readable reason for a `Failed` status, if the operation has one.
	fn failure(&self) -> Option<String> {
		None
	}
}

/// An operation that is already terminal when created.
#[derive(Debug, Clone)]
pub struct ImmediateOperation {
	name: String,
	kind: OperationKind,
	status: OpStatus,
	failure: Option<String>,
}

impl ImmediateOperation {
	pub fn finished(kind: OperationKind, name: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind,
			status: OpStatus::Finished,
			failure: None,
		}
	}

	pub fn failed(kind: OperationKind, name: impl Into<String>, failure: impl Into<String>) -> Self {
		Self {
			name: name.into(),
			kind,
			status: OpStatus::Failed,
			failure: Some(failure.into()),
		}
	}
}

impl AsyncOperation for ImmediateOperation {
	fn name(&self) -> &str {
		&self.name
	}

	fn kind(&self) -> OperationKind {
		self.kind
	}

	fn query(&mut self) -> OpStatus {
		self.status
	}

	fn cancel(&mut self) {}

	fn release(self: Box<Self>) {}

	fn failure(&self) -> Option<String> {
		self.failure.clone()
	}
}
