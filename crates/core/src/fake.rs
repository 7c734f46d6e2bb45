//! Scriptable in-memory collaborators for exercising the state machine.
//!
//! A [`FakeWorld`] hands out a [`FakeScripts`] and a [`FakeProvider`] sharing
//! one recorder, so tests can script how each operation behaves and then
//! inspect every call and every operation's query/cancel/release history.

use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{ProviderError, ScriptError};
use crate::operation::{AsyncOperation, OpStatus, OperationKind};
use crate::provider::QuiesceProvider;
use crate::scripts::{ScriptPhase, ScriptSubsystem};

/// How a fake operation behaves once launched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Behavior {
	/// Finishes on the query after `after` pending ones.
	Finish { after: u32 },
	/// Finishes on the query after `after` pending ones, canceled or not.
	Uncancelable { after: u32 },
	/// Fails on the query after `after` pending ones.
	Fail { after: u32, detail: Option<String> },
	/// Pending until canceled.
	Hang,
	/// Pending forever, even after cancel.
	IgnoreCancel,
	/// The launch itself fails.
	Reject(String),
}

impl Behavior {
	pub fn immediate() -> Self {
		Behavior::Finish { after: 0 }
	}

	pub fn fail(detail: impl Into<String>) -> Self {
		Behavior::Fail {
			after: 0,
			detail: Some(detail.into()),
		}
	}
}

impl Default for Behavior {
	fn default() -> Self {
		Behavior::immediate()
	}
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
	RunScripts(ScriptPhase),
	ProviderStart { volumes: Option<String>, excluded: Vec<String> },
	ProviderThaw,
	ProviderUndo,
	ProviderAbort,
	ProviderRelease,
}

/// Lifetime history of one fake operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpRecord {
	pub name: String,
	pub kind: OperationKind,
	pub queries: u32,
	pub cancels: u32,
	pub releases: u32,
}

#[derive(Debug, Default)]
struct WorldState {
	calls: Vec<Call>,
	ops: Vec<OpRecord>,
	scripts: HashMap<ScriptPhase, Behavior>,
	freeze: Behavior,
	thaw: Behavior,
	undo: Behavior,
	check_failure: Option<String>,
}

impl WorldState {
	fn behavior(&self, kind: OperationKind) -> Behavior {
		match kind {
			OperationKind::ScriptBatch(phase) => self.scripts.get(&phase).cloned().unwrap_or_default(),
			OperationKind::ProviderFreeze => self.freeze.clone(),
			OperationKind::ProviderThaw => self.thaw.clone(),
			OperationKind::ProviderUndo => self.undo.clone(),
		}
	}
}

#[derive(Debug, Clone, Default)]
pub struct FakeWorld {
	state: Arc<Mutex<WorldState>>,
}

impl FakeWorld {
	pub fn new() -> Self {
		Self::default()
	}

	pub fn scripts(&self) -> FakeScripts {
		FakeScripts { world: self.clone() }
	}

	pub fn provider(&self) -> FakeProvider {
		FakeProvider { world: self.clone() }
	}

	pub fn set_scripts(&self, phase: ScriptPhase, behavior: Behavior) -> &Self {
		self.state.lock().scripts.insert(phase, behavior);
		self
	}

	pub fn set_freeze(&self, behavior: Behavior) -> &Self {
		self.state.lock().freeze = behavior;
		self
	}

	pub fn set_thaw(&self, behavior: Behavior) -> &Self {
		self.state.lock().thaw = behavior;
		self
	}

	pub fn set_undo(&self, behavior: Behavior) -> &Self {
		self.state.lock().undo = behavior;
		self
	}

	/// Makes every later provider health check fail with `reason`.
	pub fn fail_checks(&self, reason: impl Into<String>) -> &Self {
		self.state.lock().check_failure = Some(reason.into());
		self
	}

	pub fn calls(&self) -> Vec<Call> {
		self.state.lock().calls.clone()
	}

	pub fn count(&self, call: &Call) -> usize {
		self.state.lock().calls.iter().filter(|c| *c == call).count()
	}

	pub fn ops(&self) -> Vec<OpRecord> {
		self.state.lock().ops.clone()
	}

	/// Operations that have been launched but not yet released.
	pub fn live_ops(&self) -> usize {
		self.state.lock().ops.iter().filter(|op| op.releases == 0).count()
	}

	fn launch(&self, kind: OperationKind, name: String, call: Call) -> Result<Box<dyn AsyncOperation>, String> {
		let mut state = self.state.lock();
		state.calls.push(call);
		let behavior = state.behavior(kind);
		if let Behavior::Reject(reason) = &behavior {
			return Err(reason.clone());
		}
		let index = state.ops.len();
		state.ops.push(OpRecord {
			name: name.clone(),
			kind,
			queries: 0,
			cancels: 0,
			releases: 0,
		});
		Ok(Box::new(FakeOperation {
			index,
			name,
			kind,
			behavior,
			polls: 0,
			canceled: false,
			status: OpStatus::Pending,
			world: self.clone(),
		}))
	}
}

pub struct FakeScripts {
	world: FakeWorld,
}

impl ScriptSubsystem for FakeScripts {
	fn run_scripts(&mut self, phase: ScriptPhase) -> Result<Box<dyn AsyncOperation>, ScriptError> {
		let kind = OperationKind::ScriptBatch(phase);
		self.world
			.launch(kind, format!("{phase} scripts"), Call::RunScripts(phase))
			.map_err(|reason| ScriptError::Discover {
				dir: PathBuf::from("fake"),
				source: io::Error::other(reason),
			})
	}
}

pub struct FakeProvider {
	world: FakeWorld,
}

impl FakeProvider {
	fn rejected(reason: String) -> ProviderError {
		ProviderError::Faulted {
			provider: "fake".to_string(),
			reason,
		}
	}
}

impl QuiesceProvider for FakeProvider {
	fn name(&self) -> &str {
		"fake"
	}

	fn start(&mut self, volumes: Option<&str>, excluded: &[String]) -> Result<Box<dyn AsyncOperation>, ProviderError> {
		let call = Call::ProviderStart {
			volumes: volumes.map(str::to_string),
			excluded: excluded.to_vec(),
		};
		self.world
			.launch(OperationKind::ProviderFreeze, "fake freeze".to_string(), call)
			.map_err(|reason| ProviderError::Start {
				provider: "fake".to_string(),
				reason,
			})
	}

	fn request_thaw(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError> {
		self.world
			.launch(OperationKind::ProviderThaw, "fake thaw".to_string(), Call::ProviderThaw)
			.map_err(Self::rejected)
	}

	fn request_undo(&mut self) -> Result<Box<dyn AsyncOperation>, ProviderError> {
		self.world
			.launch(OperationKind::ProviderUndo, "fake undo".to_string(), Call::ProviderUndo)
			.map_err(Self::rejected)
	}

	fn abort(&mut self) {
		self.world.state.lock().calls.push(Call::ProviderAbort);
	}

	fn check(&mut self) -> Result<(), ProviderError> {
		match self.world.state.lock().check_failure.clone() {
			Some(reason) => Err(Self::rejected(reason)),
			None => Ok(()),
		}
	}

	fn release(&mut self) {
		self.world.state.lock().calls.push(Call::ProviderRelease);
	}
}

struct FakeOperation {
	index: usize,
	name: String,
	kind: OperationKind,
	behavior: Behavior,
	polls: u32,
	canceled: bool,
	status: OpStatus,
	world: FakeWorld,
}

impl FakeOperation {
	fn record(&self, update: impl FnOnce(&mut OpRecord)) {
		if let Some(record) = self.world.state.lock().ops.get_mut(self.index) {
			update(record);
		}
	}
}

impl AsyncOperation for FakeOperation {
	fn name(&self) -> &str {
		&self.name
	}

	fn kind(&self) -> OperationKind {
		self.kind
	}

	fn query(&mut self) -> OpStatus {
		self.record(|record| record.queries += 1);
		if self.status.is_terminal() {
			return self.status;
		}
		if self.canceled && !matches!(self.behavior, Behavior::IgnoreCancel | Behavior::Uncancelable { .. }) {
			self.status = OpStatus::Canceled;
			return self.status;
		}
		let (after, terminal) = match self.behavior {
			Behavior::Finish { after } | Behavior::Uncancelable { after } => (after, OpStatus::Finished),
			Behavior::Fail { after, .. } => (after, OpStatus::Failed),
			Behavior::Hang | Behavior::IgnoreCancel | Behavior::Reject(_) => return OpStatus::Pending,
		};
		if self.polls >= after {
			self.status = terminal;
		} else {
			self.polls += 1;
		}
		self.status
	}

	fn cancel(&mut self) {
		self.record(|record| record.cancels += 1);
		self.canceled = true;
	}

	fn release(self: Box<Self>) {
		self.record(|record| record.releases += 1);
	}

	fn failure(&self) -> Option<String> {
		match (&self.behavior, self.status) {
			(Behavior::Fail { detail, .. }, OpStatus::Failed) => detail.clone(),
			_ => None,
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn operations_follow_their_behavior() {
		let world = FakeWorld::new();
		world.set_scripts(ScriptPhase::Freeze, Behavior::Finish { after: 2 });
		let mut scripts = world.scripts();

		let mut op = scripts.run_scripts(ScriptPhase::Freeze).unwrap();
		assert_eq!(op.query(), OpStatus::Pending);
		assert_eq!(op.query(), OpStatus::Pending);
		assert_eq!(op.query(), OpStatus::Finished);
		op.release();

		let record = &world.ops()[0];
		assert_eq!((record.queries, record.cancels, record.releases), (3, 0, 1));
		assert_eq!(world.live_ops(), 0);
	}

	#[test]
	fn ignore_cancel_stays_pending() {
		let world = FakeWorld::new();
		world.set_freeze(Behavior::IgnoreCancel);
		let mut provider = world.provider();

		let mut op = provider.start(None, &[]).unwrap();
		op.cancel();
		assert_eq!(op.query(), OpStatus::Pending);
		assert_eq!(world.live_ops(), 1);
	}

	#[test]
	fn rejected_launch_is_recorded_without_an_operation() {
		let world = FakeWorld::new();
		world.set_thaw(Behavior::Reject("busy".into()));
		let mut provider = world.provider();

		assert!(provider.request_thaw().is_err());
		assert_eq!(world.calls(), vec![Call::ProviderThaw]);
		assert!(world.ops().is_empty());
	}
}
