//! End-to-end dispatcher tests against a scripted bus: two-phase launch,
//! per-target failure modes, heartbeat loss, job timeout, legacy mode.

mod common;

use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use common::{job, MockBus};
use saltpeter::bus::{BusOutcome, BusPoll};
use saltpeter::config::ConfigSnapshot;
use saltpeter::dispatch::Dispatcher;
use saltpeter::joblog::JobLog;
use saltpeter::monitor::MonitorSettings;
use saltpeter::state::StateStore;

fn settings(heartbeat_timeout_ms: u64) -> MonitorSettings {
    MonitorSettings {
        tick: Duration::from_millis(20),
        heartbeat_timeout: Duration::from_millis(heartbeat_timeout_ms),
    }
}

struct Harness {
    state: Arc<StateStore>,
    bus: Arc<MockBus>,
    dispatcher: Dispatcher,
    logdir: tempfile::TempDir,
}

fn harness(machines: &[&str], heartbeat_timeout_ms: u64) -> Harness {
    let state = Arc::new(StateStore::new());
    let bus = Arc::new(MockBus::new(machines));
    let logdir = tempfile::tempdir().unwrap();
    let dispatcher = Dispatcher::new(
        Arc::clone(&state),
        Arc::clone(&bus) as Arc<dyn saltpeter::bus::RemoteBus>,
        JobLog::new(logdir.path()),
        settings(heartbeat_timeout_ms),
    );
    Harness {
        state,
        bus,
        dispatcher,
        logdir,
    }
}

/// Simulate the channel server's view of an agent that prints `output` and
/// exits `retcode`, once the target has been confirmed into phase 2.
async fn simulate_agent(state: Arc<StateStore>, job: &str, machine: &str, output: &str, retcode: i32) {
    let confirmed = |state: &StateStore| {
        let cell = state.job(job);
        let guard = cell.lock().unwrap();
        guard
            .results
            .get(machine)
            .map(|r| r.last_heartbeat.is_some())
            .unwrap_or(false)
    };
    while !confirmed(&state) {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let now = Utc::now();
    state.apply_output(job, machine, 1, output, now);
    state.finalize_target(job, machine, retcode, None, now);
}

#[tokio::test]
async fn happy_path_both_targets_succeed() {
    let h = harness(&["m1", "m2"], 2_000);
    h.bus.script_confirm_all();
    let j = job("echo", "echo hi", 30);
    h.state.job("echo").lock().unwrap().overlap = true;

    for machine in ["m1", "m2"] {
        tokio::spawn(simulate_agent(
            Arc::clone(&h.state),
            "echo",
            machine,
            "hi\n",
            0,
        ));
    }
    h.dispatcher
        .dispatch(j, Arc::new(ConfigSnapshot::default()))
        .await;

    let cell = h.state.job("echo");
    let guard = cell.lock().unwrap();
    for machine in ["m1", "m2"] {
        let result = &guard.results[machine];
        assert_eq!(result.retcode, Some(0));
        assert_eq!(result.output, "hi\n");
        assert!(result.endtime.is_some());
    }
    assert!(!guard.overlap, "overlap released");
    drop(guard);
    assert!(h.state.running_snapshot().is_empty(), "instance removed");

    // One aggregated record in the per-job log.
    let text = std::fs::read_to_string(h.logdir.path().join("echo.log")).unwrap();
    assert!(text.contains("**** Exit Code 0 ******"));
    assert!(text.contains("###### Finished"));

    // The launch carried the agent environment, not the command line.
    let launches = h.bus.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].env["SP_COMMAND"], "echo hi");
    assert_eq!(launches[0].env["SP_JOB_NAME"], "echo");
    assert!(launches[0].env["SP_JOB_INSTANCE"].starts_with("echo_"));
    assert!(!launches[0].command.contains("echo hi"));
}

#[tokio::test]
async fn missing_agent_binary_fails_during_phase_one() {
    let h = harness(&["m1", "m2"], 2_000);
    let mut outcomes = HashMap::new();
    outcomes.insert("m1".to_string(), BusOutcome::default());
    outcomes.insert(
        "m2".to_string(),
        BusOutcome {
            retcode: 127,
            stdout: String::new(),
            stderr: "sh: saltpeter: No such file or directory".to_string(),
        },
    );
    h.bus.script_poll(BusPoll {
        outcomes,
        finished: true,
    });

    tokio::spawn(simulate_agent(Arc::clone(&h.state), "j", "m1", "ok\n", 0));
    h.state.job("j").lock().unwrap().overlap = true;
    h.dispatcher
        .dispatch(job("j", "true", 30), Arc::new(ConfigSnapshot::default()))
        .await;

    let cell = h.state.job("j");
    let guard = cell.lock().unwrap();
    assert_eq!(guard.results["m1"].retcode, Some(0));

    let failed = &guard.results["m2"];
    assert_eq!(failed.retcode, Some(127));
    assert!(failed.output.contains("No such file or directory"));
    // The heartbeat clock never started for a target that failed Phase 1.
    assert!(failed.last_heartbeat.is_none());
}

#[tokio::test]
async fn unreachable_target_finalises_with_255() {
    let h = harness(&["m1", "m2"], 2_000);
    let mut outcomes = HashMap::new();
    outcomes.insert("m1".to_string(), BusOutcome::default());
    h.bus.script_poll(BusPoll {
        outcomes,
        finished: true,
    });

    tokio::spawn(simulate_agent(Arc::clone(&h.state), "j", "m1", "ok\n", 0));
    h.state.job("j").lock().unwrap().overlap = true;
    h.dispatcher
        .dispatch(job("j", "true", 30), Arc::new(ConfigSnapshot::default()))
        .await;

    let cell = h.state.job("j");
    let guard = cell.lock().unwrap();
    assert_eq!(guard.results["m2"].retcode, Some(255));
    assert!(guard.results["m2"].output.contains("did not respond"));
}

#[tokio::test]
async fn silent_agent_fails_on_heartbeat_loss() {
    let h = harness(&["m1"], 300);
    h.bus.script_confirm_all();
    h.state.job("quiet").lock().unwrap().overlap = true;

    let started = std::time::Instant::now();
    h.dispatcher
        .dispatch(job("quiet", "sleep 60", 600), Arc::new(ConfigSnapshot::default()))
        .await;

    let cell = h.state.job("quiet");
    let guard = cell.lock().unwrap();
    let result = &guard.results["m1"];
    assert_eq!(result.retcode, Some(253));
    assert!(result.output.contains("[SALTPETER ERROR: no heartbeat for"));
    // Detected around the heartbeat deadline, not immediately, not late.
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));
}

#[tokio::test]
async fn job_timeout_kills_and_finalises_with_124() {
    let h = harness(&["m1"], 10_000);
    h.bus.script_confirm_all();
    h.state.job("slow").lock().unwrap().overlap = true;

    // The "agent" heartbeats diligently but never completes.
    let state = Arc::clone(&h.state);
    let beat = tokio::spawn(async move {
        loop {
            state.record_heartbeat("slow", "m1", Utc::now());
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    });

    h.dispatcher
        .dispatch(job("slow", "sleep 600", 1), Arc::new(ConfigSnapshot::default()))
        .await;
    beat.abort();

    let cell = h.state.job("slow");
    let guard = cell.lock().unwrap();
    assert_eq!(guard.results["m1"].retcode, Some(124));
    drop(guard);
    // A best-effort kill went onto the command queue.
    assert_eq!(h.state.take_kill_commands(), vec!["slow".to_string()]);
    assert!(h.state.running_snapshot().is_empty());
}

#[tokio::test]
async fn maintenance_machines_never_appear_as_targets() {
    let h = harness(&["m1", "m2", "m3"], 2_000);
    h.bus.script_poll(BusPoll {
        outcomes: [("m2".to_string(), BusOutcome::default())].into(),
        finished: true,
    });

    let mut snapshot = ConfigSnapshot::default();
    snapshot.maintenance.machines.insert("m1".to_string());
    snapshot.maintenance.machines.insert("m3".to_string());

    tokio::spawn(simulate_agent(Arc::clone(&h.state), "j", "m2", "ok\n", 0));
    h.state.job("j").lock().unwrap().overlap = true;
    h.dispatcher.dispatch(job("j", "true", 30), Arc::new(snapshot)).await;

    let launches = h.bus.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].targets, vec!["m2".to_string()]);
}

#[tokio::test]
async fn empty_target_set_releases_the_job() {
    let h = harness(&["m1"], 2_000);
    let mut snapshot = ConfigSnapshot::default();
    snapshot.maintenance.machines.insert("m1".to_string());

    h.state.job("j").lock().unwrap().overlap = true;
    h.dispatcher.dispatch(job("j", "true", 30), Arc::new(snapshot)).await;

    assert!(h.bus.launches().is_empty());
    assert!(!h.state.job("j").lock().unwrap().overlap);
    assert!(h.state.running_snapshot().is_empty());
    let text = std::fs::read_to_string(h.logdir.path().join("j.log")).unwrap();
    assert!(text.contains("No targets matched"));
}

#[tokio::test]
async fn number_of_targets_samples_the_pool() {
    let h = harness(&["m1", "m2", "m3", "m4", "m5"], 2_000);
    h.bus.script_poll(BusPoll {
        outcomes: HashMap::new(),
        finished: true, // all unreachable, instance ends immediately
    });

    let mut j = job("sampled", "true", 30);
    j.number_of_targets = 2;
    h.state.job("sampled").lock().unwrap().overlap = true;
    h.dispatcher.dispatch(j, Arc::new(ConfigSnapshot::default())).await;

    let launches = h.bus.launches();
    assert_eq!(launches.len(), 1);
    assert_eq!(launches[0].targets.len(), 2);
    for target in &launches[0].targets {
        assert!(h.bus.machines.contains(target));
    }
}

#[tokio::test]
async fn failed_redispatch_does_not_resurrect_previous_success() {
    let h = harness(&["m1"], 2_000);

    // Run 1 succeeds and freezes a retcode-0 result for m1.
    h.bus.script_confirm_all();
    h.state.job("foo").lock().unwrap().overlap = true;
    tokio::spawn(simulate_agent(Arc::clone(&h.state), "foo", "m1", "ok\n", 0));
    h.dispatcher
        .dispatch(job("foo", "true", 30), Arc::new(ConfigSnapshot::default()))
        .await;
    {
        let cell = h.state.job("foo");
        assert_eq!(cell.lock().unwrap().results["m1"].retcode, Some(0));
    }

    // Run 2: the bus refuses the launch. The failure must be recorded, not
    // masked by run 1's frozen success.
    h.bus.set_fail_submit(true);
    h.state.job("foo").lock().unwrap().overlap = true;
    h.dispatcher
        .dispatch(job("foo", "true", 30), Arc::new(ConfigSnapshot::default()))
        .await;

    let cell = h.state.job("foo");
    let guard = cell.lock().unwrap();
    let result = &guard.results["m1"];
    assert_eq!(result.retcode, Some(255));
    assert!(result.output.contains("dispatch failed"));
    assert!(!guard.overlap);
    drop(guard);
    assert!(h.state.running_snapshot().is_empty());

    // The second joblog record carries the failure, not the old output.
    let text = std::fs::read_to_string(h.logdir.path().join("foo.log")).unwrap();
    assert!(text.contains("**** Exit Code 255 ******"));
}

#[tokio::test]
async fn redispatch_after_success_can_still_fail_on_heartbeat_loss() {
    let h = harness(&["m1"], 300);

    // Run 1 completes cleanly.
    h.bus.script_confirm_all();
    h.state.job("quiet").lock().unwrap().overlap = true;
    tokio::spawn(simulate_agent(Arc::clone(&h.state), "quiet", "m1", "ok\n", 0));
    h.dispatcher
        .dispatch(job("quiet", "true", 600), Arc::new(ConfigSnapshot::default()))
        .await;

    // Run 2's agent confirms but then goes silent.
    h.bus.script_confirm_all();
    h.state.job("quiet").lock().unwrap().overlap = true;
    h.dispatcher
        .dispatch(job("quiet", "sleep 60", 600), Arc::new(ConfigSnapshot::default()))
        .await;

    let cell = h.state.job("quiet");
    let guard = cell.lock().unwrap();
    let result = &guard.results["m1"];
    assert_eq!(result.retcode, Some(253));
    assert!(result.output.contains("[SALTPETER ERROR: no heartbeat for"));
}

#[tokio::test]
async fn legacy_jobs_run_synchronously_without_the_agent() {
    let h = harness(&["m1"], 2_000);
    h.bus.set_sync_outcome(
        "m1",
        BusOutcome {
            retcode: 2,
            stdout: "partial\n".to_string(),
            stderr: "boom\n".to_string(),
        },
    );

    let mut j = job("legacy", "exit 2", 30);
    j.use_agent = false;
    h.state.job("legacy").lock().unwrap().overlap = true;
    h.dispatcher.dispatch(j, Arc::new(ConfigSnapshot::default())).await;

    let cell = h.state.job("legacy");
    let guard = cell.lock().unwrap();
    let result = &guard.results["m1"];
    assert_eq!(result.retcode, Some(2));
    assert!(result.output.contains("partial"));
    assert!(result.output.contains("boom"));
    assert!(!guard.overlap);
    drop(guard);

    // The command itself went over the bus, no agent env involved.
    let launches = h.bus.launches();
    assert_eq!(launches[0].command, "exit 2");
    assert!(launches[0].env.is_empty());
}
