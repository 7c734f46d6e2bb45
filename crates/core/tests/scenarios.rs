mod common;

use common::Harness;
use vmbackup::fake::{Behavior, Call};
use vmbackup::{Phase, RpcStatus, ScriptPhase};
use vmbackup_protocol::{EventName, StatusCode};

#[test]
fn happy_path_without_manifests() {
	let mut h = Harness::new();
	h.start("0 /");
	assert_eq!(h.quiescer.phase(), Phase::RunningFreezeScripts);
	assert_eq!(h.event_names(), vec![EventName::Reset]);

	h.poll();
	assert_eq!(h.quiescer.phase(), Phase::EnablingProvider);
	h.poll();
	assert_eq!(h.quiescer.phase(), Phase::ProviderActive);
	assert!(h.quiescer.session().unwrap().provider_active());

	assert!(h.quiescer.snapshot_done().ok);
	h.poll_until_idle(5);

	assert_eq!(h.event_names(), vec![EventName::Reset, EventName::RequestorDone]);
	assert_eq!(
		h.world.calls(),
		vec![
			Call::RunScripts(ScriptPhase::Freeze),
			Call::ProviderStart {
				volumes: Some("/".into()),
				excluded: vec![]
			},
			Call::ProviderThaw,
			Call::RunScripts(ScriptPhase::Thaw),
		]
	);
	h.assert_clean();
}

#[test]
fn snapshot_acknowledged_while_enabling_thaws_once_frozen() {
	let mut h = Harness::new();
	h.world.set_freeze(Behavior::Finish { after: 3 });
	h.start("0");
	h.poll_until(Phase::EnablingProvider, 3);

	assert!(h.quiescer.snapshot_done().ok);
	h.poll_until_idle(10);

	assert_eq!(h.world.count(&Call::ProviderThaw), 1);
	assert_eq!(h.world.count(&Call::ProviderUndo), 0);
	assert_eq!(h.event_names().last(), Some(&EventName::RequestorDone));
	h.assert_clean();
}

#[test]
fn freeze_script_failure_skips_provider() {
	let mut h = Harness::new();
	h.world.set_scripts(ScriptPhase::Freeze, Behavior::fail("Script 20-db failed during freeze (exit code 1)."));
	h.start("0 /");

	h.poll();
	assert_eq!(h.quiescer.phase(), Phase::RunningFreezeFailScripts);
	h.poll_until_idle(3);

	let events = h.events();
	assert_eq!(events.len(), 3);
	assert_eq!(events[1].event, EventName::RequestorError);
	assert_eq!(events[1].code, StatusCode::ScriptError);
	assert!(events[1].message.contains("20-db"));
	assert_eq!(events[2].event, EventName::RequestorDone);

	assert!(!h.world.calls().iter().any(|call| matches!(call, Call::ProviderStart { .. })));
	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::FreezeFailed)), 1);
	h.assert_clean();
}

#[test]
fn failure_without_detail_reports_generic_message() {
	let mut h = Harness::new();
	h.world.set_freeze(Behavior::Fail { after: 0, detail: None });
	h.start("0");
	h.poll_until_idle(5);

	let error = h.events().into_iter().find(|event| event.event == EventName::RequestorError).unwrap();
	assert_eq!(error.code, StatusCode::UnexpectedError);
	assert_eq!(error.message, "Asynchronous operation failed: fake freeze");
	assert_eq!(h.world.count(&Call::ProviderUndo), 0);
	assert_eq!(h.world.count(&Call::ProviderAbort), 1);
	h.assert_clean();
}

#[test]
fn abort_while_frozen_undoes_before_freeze_fail_scripts() {
	let mut h = Harness::new();
	h.start("0 /");
	h.poll_until(Phase::ProviderActive, 3);

	assert!(h.quiescer.abort().ok);
	assert_eq!(h.world.count(&Call::ProviderUndo), 1);
	let aborted = h.events().into_iter().find(|event| event.event == EventName::RequestorAbort).unwrap();
	assert_eq!(aborted.code, StatusCode::RemoteAbort);

	h.poll_until_idle(5);
	let calls = h.world.calls();
	let undo = calls.iter().position(|call| *call == Call::ProviderUndo).unwrap();
	let fail_scripts = calls.iter().position(|call| *call == Call::RunScripts(ScriptPhase::FreezeFailed)).unwrap();
	assert!(undo < fail_scripts);
	assert_eq!(h.world.count(&Call::ProviderThaw), 0);
	assert_eq!(h.event_names().last(), Some(&EventName::RequestorDone));
	h.assert_clean();
}

#[test]
fn failed_reset_aborts_before_any_new_operation() {
	let mut h = Harness::new();
	h.host.fail_event(EventName::Reset);
	h.start("0 /");
	assert_eq!(h.quiescer.session().unwrap().rpc_status(), RpcStatus::Error);

	h.poll();
	assert_eq!(h.quiescer.session().unwrap().rpc_status(), RpcStatus::Ignoring);
	assert_eq!(h.quiescer.phase(), Phase::RunningFreezeFailScripts);
	h.poll_until_idle(3);

	assert!(!h.world.calls().iter().any(|call| matches!(call, Call::ProviderStart { .. })));
	let freeze_batch = &h.world.ops()[0];
	assert_eq!(freeze_batch.cancels, 1);

	let events = h.events();
	assert_eq!(events[0].event, EventName::RequestorError);
	assert_eq!(events[0].message, "Host channel failure.");
	assert_eq!(events.last().unwrap().event, EventName::RequestorDone);
	h.assert_clean();
}

#[test]
fn channel_failure_while_frozen_undoes_the_freeze() {
	let mut h = Harness::new();
	h.start("0");
	h.poll_until(Phase::ProviderActive, 3);

	h.host.close();
	h.world.fail_checks("volume went away");
	h.poll();
	assert_eq!(h.quiescer.session().unwrap().rpc_status(), RpcStatus::Error);

	h.poll_until_idle(6);
	assert_eq!(h.world.count(&Call::ProviderUndo), 1);
	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::FreezeFailed)), 1);
	h.assert_clean();
}

#[test]
fn exclusion_list_is_passed_to_provider() {
	let mut h = Harness::new();
	std::fs::write(h.dir.path().join("vmbackup.conf"), "# not quiesced\n/mnt/scratch\n\n/var/tmp\n").unwrap();
	h.start("0");
	h.poll();

	assert_eq!(
		h.world.calls()[1],
		Call::ProviderStart {
			volumes: None,
			excluded: vec!["/mnt/scratch".into(), "/var/tmp".into()]
		}
	);
	assert_eq!(h.quiescer.status().disabled_targets, vec!["/mnt/scratch".to_string(), "/var/tmp".to_string()]);
}

#[test]
fn unreadable_exclusion_list_refuses_start() {
	let mut h = Harness::new();
	std::fs::write(h.dir.path().join("vmbackup.conf"), [0xff, 0xfe, b'\n']).unwrap();

	let reply = h.quiescer.start(vmbackup_protocol::StartArgs::parse("0"));
	assert!(!reply.ok);
	assert_eq!(reply.message, "Error when reading configuration file.");
	assert!(!h.quiescer.is_running());
	assert!(h.host.attempts().is_empty());
	assert!(h.world.calls().is_empty());
}

#[test]
fn script_launch_failure_refuses_start() {
	let mut h = Harness::new();
	h.world.set_scripts(ScriptPhase::Freeze, Behavior::Reject("permission denied".into()));

	let reply = h.quiescer.start(vmbackup_protocol::StartArgs::parse("0"));
	assert!(!reply.ok);
	assert_eq!(reply.message, "Error initializing backup.");
	assert!(!h.quiescer.is_running());
	assert_eq!(h.quiescer.pending_timers(), 0);

	let events = h.events();
	assert_eq!(events[0].event, EventName::Reset);
	assert_eq!(events[1].message, "Error when starting backup scripts.");
	assert_eq!(events.len(), 2);
}

#[test]
fn manifest_is_written_and_announced() {
	let mut h = Harness::new();
	h.start("1 /");
	h.poll_until(Phase::ProviderActive, 3);

	let manifest = h.events().into_iter().find(|event| event.event == EventName::GenericManifest).unwrap();
	let path = std::path::PathBuf::from(&manifest.message);
	assert!(path.starts_with(h.dir.path()));
	let body: serde_json::Value = serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
	assert_eq!(body["provider"], "fake");
	assert_eq!(body["volumes"], "/");
}

#[test]
fn manifest_send_is_retried_once() {
	let mut h = Harness::new();
	h.host.fail_event(EventName::GenericManifest);
	h.start("1");
	h.poll_until(Phase::ProviderActive, 3);

	h.poll();
	h.poll();
	let attempts = h.host.attempts().into_iter().filter(|event| event.event == EventName::GenericManifest).count();
	assert_eq!(attempts, 2);
	assert_eq!(h.quiescer.session().unwrap().rpc_status(), RpcStatus::Normal);
}

#[test]
fn provider_failure_while_frozen_undoes_and_reports_sync_error() {
	let mut h = Harness::new();
	h.start("0");
	h.poll_until(Phase::ProviderActive, 3);

	h.world.fail_checks("writer timed out");
	h.poll_until_idle(6);

	let error = h.events().into_iter().find(|event| event.event == EventName::RequestorError).unwrap();
	assert_eq!(error.code, StatusCode::SyncError);
	assert!(error.message.contains("writer timed out"));
	assert_eq!(h.world.count(&Call::ProviderUndo), 1);
	assert_eq!(h.world.count(&Call::ProviderThaw), 0);
	h.assert_clean();
}

#[test]
fn thaw_failure_runs_freeze_fail_scripts() {
	let mut h = Harness::new();
	h.world.set_thaw(Behavior::fail("snapshot set timed out"));
	h.start("0");
	h.poll_until(Phase::ProviderActive, 3);
	assert!(h.quiescer.snapshot_done().ok);
	h.poll_until_idle(6);

	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::Thaw)), 0);
	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::FreezeFailed)), 1);
	assert_eq!(h.world.count(&Call::ProviderUndo), 0);
	let error = h.events().into_iter().find(|event| event.event == EventName::RequestorError).unwrap();
	assert_eq!((error.code, error.message.as_str()), (StatusCode::SyncError, "snapshot set timed out"));
	h.assert_clean();
}

#[test]
fn rejected_thaw_request_reports_notification_error() {
	let mut h = Harness::new();
	h.world.set_thaw(Behavior::Reject("not frozen".into()));
	h.start("0");
	h.poll_until(Phase::ProviderActive, 3);
	assert!(h.quiescer.snapshot_done().ok);
	h.poll_until_idle(6);

	let error = h.events().into_iter().find(|event| event.event == EventName::RequestorError).unwrap();
	assert_eq!(error.message, "Error when notifying the sync provider.");
	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::FreezeFailed)), 1);
	h.assert_clean();
}

#[test]
fn thaw_script_failure_is_reported_before_done() {
	let mut h = Harness::new();
	h.world.set_scripts(ScriptPhase::Thaw, Behavior::fail("Script 10-fs failed during thaw (exit code 2)."));
	h.start("0");
	h.poll_until(Phase::ProviderActive, 3);
	assert!(h.quiescer.snapshot_done().ok);
	h.poll_until_idle(6);

	let names = h.event_names();
	assert_eq!(names, vec![EventName::Reset, EventName::RequestorError, EventName::RequestorDone]);
	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::FreezeFailed)), 0);
	h.assert_clean();
}

#[test]
fn snapshot_done_outside_provider_phases_is_rejected() {
	let mut h = Harness::new();
	h.world.set_scripts(ScriptPhase::Freeze, Behavior::Hang);
	h.start("0");

	let reply = h.quiescer.snapshot_done();
	assert!(!reply.ok);
	assert!(reply.message.contains("running-freeze-scripts"));
	assert!(!h.quiescer.status().snapshot_acknowledged);
	assert_eq!(h.quiescer.phase(), Phase::RunningFreezeScripts);
}

#[test]
fn keep_alive_follows_every_send() {
	let mut h = Harness::new();
	h.world.set_freeze(Behavior::Hang);
	h.start("0");
	assert!(h.quiescer.session().unwrap().keep_alive_timer().is_some());
	h.poll_until(Phase::EnablingProvider, 3);

	for _ in 0..25 {
		h.poll();
		assert!(h.quiescer.session().unwrap().keep_alive_timer().is_some());
	}
	let keep_alives = h.host.sent_names().into_iter().filter(|name| *name == EventName::KeepAlive).count();
	assert!(keep_alives >= 2, "only {keep_alives} keep-alives sent");

	assert!(h.quiescer.abort().ok);
	h.poll_until_idle(5);
	h.assert_clean();
}

/// After a strict send failed mid-poll: nothing new is in flight, and the next
/// poll runs the freeze-fail scripts to completion under abort routing.
fn recover_from_failed_error_report(h: &mut Harness, phase: Phase) {
	assert_eq!(h.quiescer.phase(), phase);
	let session = h.quiescer.session().unwrap();
	assert_eq!(session.rpc_status(), RpcStatus::Error);
	assert_eq!(session.current_operation(), None);
	assert_eq!(h.world.count(&Call::RunScripts(ScriptPhase::FreezeFailed)), 0);

	h.host.heal_event(EventName::RequestorError);
	h.poll();
	assert_eq!(h.quiescer.session().unwrap().rpc_status(), RpcStatus::Ignoring);
	assert_eq!(h.quiescer.phase(), Phase::RunningFreezeFailScripts);
	h.poll_until_idle(3);

	let cleanup = h.world.ops().into_iter().find(|op| op.name == "freeze-fail scripts").unwrap();
	assert_eq!((cleanup.cancels, cleanup.releases), (0, 1));
	let events = h.events();
	assert!(events.iter().any(|event| event.message == "Host channel failure."));
	assert_eq!(events.last().unwrap().event, EventName::RequestorDone);
	h.assert_clean();
}

#[test]
fn undelivered_script_error_defers_freeze_fail_scripts() {
	let mut h = Harness::new();
	h.world.set_scripts(ScriptPhase::Freeze, Behavior::fail("Script 20-db failed during freeze (exit code 1)."));
	h.start("0 /");
	h.host.fail_event(EventName::RequestorError);

	h.poll();
	recover_from_failed_error_report(&mut h, Phase::RunningFreezeScripts);
}

#[test]
fn undelivered_provider_start_error_defers_recovery() {
	let mut h = Harness::new();
	h.world.set_freeze(Behavior::Reject("no freeze driver".into()));
	h.start("0 /");
	h.host.fail_event(EventName::RequestorError);

	h.poll();
	recover_from_failed_error_report(&mut h, Phase::RunningFreezeScripts);
	assert_eq!(h.world.count(&Call::ProviderAbort), 0);
}

#[test]
fn undelivered_thaw_rejection_defers_recovery() {
	let mut h = Harness::new();
	h.world.set_thaw(Behavior::Reject("not frozen".into()));
	h.start("0");
	h.poll_until(Phase::ProviderActive, 3);
	h.host.fail_event(EventName::RequestorError);
	assert!(h.quiescer.snapshot_done().ok);

	h.poll();
	recover_from_failed_error_report(&mut h, Phase::ProviderActive);
	assert_eq!(h.world.count(&Call::ProviderUndo), 0);
}
