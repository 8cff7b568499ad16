//! Live job monitoring.
//!
//! One monitor runs per job instance, from the end of Phase 1 submission
//! until its machine set is empty. Each tick it observes completions
//! recorded by the channel server, enforces the per-target heartbeat
//! deadline (253) and the job-level timeout (124, with a best-effort kill),
//! then finalises the instance: one aggregated job-log record, overlap flag
//! cleared, instance removed.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

use crate::config::JobDefinition;
use crate::joblog::JobLog;
use crate::state::{Command, StateStore, TargetResult};

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    /// Poll cadence of the monitor loop.
    pub tick: Duration,
    /// A live target whose agent stays silent longer than this is failed
    /// with retcode 253.
    pub heartbeat_timeout: Duration,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            heartbeat_timeout: Duration::from_secs(15),
        }
    }
}

/// Watch one running instance until every machine reached a final
/// disposition, then finalise the instance.
pub async fn run_instance(
    state: Arc<StateStore>,
    joblog: JobLog,
    settings: MonitorSettings,
    instance_id: String,
    job: JobDefinition,
) {
    let heartbeat_timeout =
        ChronoDuration::from_std(settings.heartbeat_timeout).unwrap_or(ChronoDuration::seconds(15));
    let job_timeout = ChronoDuration::seconds(job.timeout as i64);
    let mut kill_issued = false;

    loop {
        let Some(instance) = state.instance(&instance_id) else {
            return;
        };
        if instance.machines.is_empty() {
            break;
        }

        let now = Utc::now();
        let mut finished: Vec<String> = Vec::new();

        {
            let cell = state.job(&job.name);
            let mut job_state = cell.lock().unwrap();
            for machine in &instance.machines {
                let Some(result) = job_state.results.get_mut(machine) else {
                    // Still in Phase 1; the dispatcher owns this target.
                    continue;
                };
                if result.is_final() {
                    info!(
                        job = %job.name,
                        instance = %instance_id,
                        machine = %machine,
                        retcode = result.retcode.unwrap_or(-1),
                        "target finished"
                    );
                    finished.push(machine.clone());
                    continue;
                }
                let Some(last_heartbeat) = result.last_heartbeat else {
                    continue;
                };
                let silence = now - last_heartbeat;
                if silence > heartbeat_timeout {
                    warn!(
                        job = %job.name,
                        instance = %instance_id,
                        machine = %machine,
                        silent_for = silence.num_seconds(),
                        "heartbeat lost"
                    );
                    result.output.push_str(&format!(
                        "[SALTPETER ERROR: no heartbeat for {} seconds]",
                        silence.num_seconds()
                    ));
                    result.retcode = Some(253);
                    result.endtime = Some(now);
                    finished.push(machine.clone());
                }
            }
        }

        for machine in &finished {
            state.remove_instance_machine(&instance_id, machine);
        }

        // Job-level timeout: the clock runs from Phase 2 entry, so a slow
        // bus confirmation can never eat into the job's budget.
        if let Some(phase2_started) = instance.phase2_started {
            if now - phase2_started > job_timeout {
                if !kill_issued {
                    warn!(job = %job.name, instance = %instance_id, timeout = job.timeout, "job timed out");
                    state.push_command(Command::Kill {
                        job_name: job.name.clone(),
                    });
                    kill_issued = true;
                }
                if let Some(current) = state.instance(&instance_id) {
                    for machine in &current.machines {
                        if state.finalize_target(&job.name, machine, 124, None, now) {
                            state.remove_instance_machine(&instance_id, machine);
                        }
                    }
                }
            }
        }

        tokio::time::sleep(settings.tick).await;
    }

    write_record_and_release(
        &state,
        &joblog,
        &job.name,
        &instance_id,
        state
            .instance(&instance_id)
            .map(|i| i.started_at)
            .unwrap_or_else(Utc::now),
    );
}

/// Final bookkeeping shared by the monitor and the legacy path: write the
/// aggregated record, clear the overlap flag, drop the instance.
pub fn write_record_and_release(
    state: &StateStore,
    joblog: &JobLog,
    job_name: &str,
    instance_id: &str,
    started_at: DateTime<Utc>,
) {
    let results: HashMap<String, TargetResult> = {
        let cell = state.job(job_name);
        let mut job_state = cell.lock().unwrap();
        job_state.overlap = false;
        let targets = job_state.targets.clone();
        targets
            .iter()
            .filter_map(|m| job_state.results.get(m).map(|r| (m.clone(), r.clone())))
            .collect()
    };

    if let Err(e) = joblog.write_instance(job_name, instance_id, started_at, Utc::now(), &results)
    {
        warn!(job = %job_name, instance = %instance_id, error = %e, "could not write job log");
    }
    state.remove_instance(instance_id);
    info!(job = %job_name, instance = %instance_id, "instance finished");
}
