//! Process-wide shared state.
//!
//! One store is shared by the scheduler loop, the dispatcher, the monitors,
//! the channel server and the HTTP API. Per-job state sits behind its own
//! mutex; every caller takes short critical sections and never holds a lock
//! across an await point. The command queue is append-only: the API pushes,
//! the channel server drains kills and the scheduler drains run-nows.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

/// Result of one target within one job instance.
///
/// `endtime` and `retcode` are set together, exactly once (first write wins);
/// an unset `endtime` means the target is still running.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TargetResult {
    pub starttime: Option<DateTime<Utc>>,
    pub endtime: Option<DateTime<Utc>>,
    pub output: String,
    pub retcode: Option<i32>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Highest output sequence number appended so far (0 = none yet).
    pub last_seq: u64,
}

impl TargetResult {
    pub fn is_final(&self) -> bool {
        self.endtime.is_some()
    }
}

/// Mutable per-job state, guarded by the job's own mutex.
#[derive(Debug, Clone, Default, Serialize)]
pub struct JobState {
    pub next_run: Option<DateTime<Utc>>,
    pub last_run: Option<DateTime<Utc>>,
    /// Set while an instance of this job is live; suppresses re-dispatch.
    pub overlap: bool,
    /// Targets of the most recent dispatch.
    pub targets: Vec<String>,
    pub results: HashMap<String, TargetResult>,
}

/// One dispatch of a job across its target set.
#[derive(Debug, Clone, Serialize)]
pub struct RunningInstance {
    pub job_name: String,
    pub started_at: DateTime<Utc>,
    /// Targets still outstanding; a machine is removed on final disposition.
    pub machines: HashSet<String>,
    /// Set when the first target enters live monitoring; the job timeout
    /// clock runs from here, never from dispatch.
    pub phase2_started: Option<DateTime<Utc>>,
}

/// Commands injected through the external API.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Kill { job_name: String },
    RunNow { job_name: String },
}

/// Outcome of applying one output frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDisposition {
    /// In order; acknowledge the sequence.
    Appended { ack: u64 },
    /// Result already frozen; acknowledge so the agent drains.
    Frozen { ack: u64 },
    /// Gap or duplicate; agent must replay from `last_seq + 1`.
    OutOfSync { last_seq: u64 },
}

#[derive(Default)]
pub struct StateStore {
    jobs: RwLock<HashMap<String, Arc<Mutex<JobState>>>>,
    running: RwLock<HashMap<String, RunningInstance>>,
    commands: Mutex<Vec<Command>>,
    last_instance_stamp: AtomicU64,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The per-job state cell, created on first use.
    pub fn job(&self, name: &str) -> Arc<Mutex<JobState>> {
        if let Some(entry) = self.jobs.read().unwrap().get(name) {
            return Arc::clone(entry);
        }
        let mut jobs = self.jobs.write().unwrap();
        Arc::clone(
            jobs.entry(name.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(JobState::default()))),
        )
    }

    /// Mint a unique `{job_name}_{stamp}` instance id. The stamp is the
    /// current epoch second, bumped when two dispatches land in the same
    /// second so ids stay strictly monotonic.
    pub fn next_instance_id(&self, job_name: &str) -> String {
        let now = Utc::now().timestamp().max(0) as u64;
        let stamp = self
            .last_instance_stamp
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
                Some(now.max(prev + 1))
            })
            .map(|prev| now.max(prev + 1))
            .unwrap_or(now);
        format!("{job_name}_{stamp}")
    }

    // ------------------------------------------------------------------
    // Running instances
    // ------------------------------------------------------------------

    pub fn register_instance(
        &self,
        instance_id: &str,
        job_name: &str,
        machines: HashSet<String>,
        started_at: DateTime<Utc>,
    ) {
        self.running.write().unwrap().insert(
            instance_id.to_string(),
            RunningInstance {
                job_name: job_name.to_string(),
                started_at,
                machines,
                phase2_started: None,
            },
        );
    }

    pub fn instance(&self, instance_id: &str) -> Option<RunningInstance> {
        self.running.read().unwrap().get(instance_id).cloned()
    }

    pub fn remove_instance(&self, instance_id: &str) {
        self.running.write().unwrap().remove(instance_id);
    }

    /// Drop a finished machine from the instance. Returns the number of
    /// machines still outstanding, or `None` if the instance is gone.
    pub fn remove_instance_machine(&self, instance_id: &str, machine: &str) -> Option<usize> {
        let mut running = self.running.write().unwrap();
        let instance = running.get_mut(instance_id)?;
        instance.machines.remove(machine);
        Some(instance.machines.len())
    }

    /// Record that the instance entered live monitoring (first confirmed
    /// target). Only the first call sets the timestamp.
    pub fn mark_phase2_started(&self, instance_id: &str, now: DateTime<Utc>) {
        let mut running = self.running.write().unwrap();
        if let Some(instance) = running.get_mut(instance_id) {
            instance.phase2_started.get_or_insert(now);
        }
    }

    pub fn running_snapshot(&self) -> HashMap<String, RunningInstance> {
        self.running.read().unwrap().clone()
    }

    /// True when some instance of the job is registered.
    pub fn job_has_instance(&self, job_name: &str) -> bool {
        self.running
            .read()
            .unwrap()
            .values()
            .any(|i| i.job_name == job_name)
    }

    // ------------------------------------------------------------------
    // Target results
    // ------------------------------------------------------------------

    /// A new instance is about to run on these machines: record them as the
    /// dispatch's target list and give each one a fresh result slot, so no
    /// disposition of this run can be masked by a frozen result from a
    /// previous instance. First-write-wins still holds within the run.
    pub fn begin_dispatch(&self, job_name: &str, targets: &[String]) {
        let job = self.job(job_name);
        let mut state = job.lock().unwrap();
        state.targets = targets.to_vec();
        for machine in targets {
            state
                .results
                .insert(machine.clone(), TargetResult::default());
        }
    }

    /// Enter a target into live monitoring: start the heartbeat clock on
    /// the result slot created at dispatch.
    pub fn confirm_target(&self, job_name: &str, machine: &str, now: DateTime<Utc>) {
        let job = self.job(job_name);
        let mut state = job.lock().unwrap();
        let entry = state.results.entry(machine.to_string()).or_default();
        if !entry.is_final() {
            entry.last_heartbeat = Some(now);
        }
    }

    /// The agent reported its command started: stamp `starttime` and reset
    /// the heartbeat clock.
    pub fn record_start(&self, job_name: &str, machine: &str, now: DateTime<Utc>) {
        let job = self.job(job_name);
        let mut state = job.lock().unwrap();
        let entry = state.results.entry(machine.to_string()).or_default();
        entry.starttime = Some(now);
        entry.last_heartbeat = Some(now);
    }

    /// Liveness signal from the agent. Ignored once the result is frozen.
    pub fn record_heartbeat(&self, job_name: &str, machine: &str, now: DateTime<Utc>) {
        let job = self.job(job_name);
        let mut state = job.lock().unwrap();
        let entry = state.results.entry(machine.to_string()).or_default();
        if !entry.is_final() {
            entry.last_heartbeat = Some(now);
        }
    }

    /// Apply one output frame, enforcing the contiguous-sequence invariant:
    /// only `last_seq + 1` is appended; anything else asks the agent to
    /// replay from the server's prefix. Output doubles as a heartbeat.
    pub fn apply_output(
        &self,
        job_name: &str,
        machine: &str,
        seq: u64,
        data: &str,
        now: DateTime<Utc>,
    ) -> OutputDisposition {
        let job = self.job(job_name);
        let mut state = job.lock().unwrap();
        let entry = state.results.entry(machine.to_string()).or_default();
        if entry.is_final() {
            // Frozen result: nothing is appended, but ack so the agent can
            // drain its buffer and finish.
            OutputDisposition::Frozen {
                ack: entry.last_seq.max(seq),
            }
        } else if seq == entry.last_seq + 1 {
            entry.output.push_str(data);
            entry.last_seq = seq;
            entry.last_heartbeat = Some(now);
            OutputDisposition::Appended { ack: seq }
        } else {
            OutputDisposition::OutOfSync {
                last_seq: entry.last_seq,
            }
        }
    }

    /// Freeze a target's result. First write wins: a later `complete`,
    /// heartbeat loss or timeout against an already-final target is a no-op.
    /// Returns whether this call performed the finalisation.
    pub fn finalize_target(
        &self,
        job_name: &str,
        machine: &str,
        retcode: i32,
        extra_output: Option<&str>,
        now: DateTime<Utc>,
    ) -> bool {
        let job = self.job(job_name);
        let mut state = job.lock().unwrap();
        let entry = state.results.entry(machine.to_string()).or_default();
        if entry.is_final() {
            return false;
        }
        if let Some(extra) = extra_output {
            entry.output.push_str(extra);
        }
        entry.retcode = Some(retcode);
        entry.endtime = Some(now);
        true
    }

    // ------------------------------------------------------------------
    // Command queue
    // ------------------------------------------------------------------

    pub fn push_command(&self, command: Command) {
        self.commands.lock().unwrap().push(command);
    }

    /// Drain all pending kill commands (single consumer: the channel server).
    pub fn take_kill_commands(&self) -> Vec<String> {
        let mut queue = self.commands.lock().unwrap();
        let mut kills = Vec::new();
        queue.retain(|cmd| match cmd {
            Command::Kill { job_name } => {
                kills.push(job_name.clone());
                false
            }
            _ => true,
        });
        kills
    }

    /// Drain all pending run-now commands (single consumer: the scheduler).
    pub fn take_run_commands(&self) -> Vec<String> {
        let mut queue = self.commands.lock().unwrap();
        let mut runs = Vec::new();
        queue.retain(|cmd| match cmd {
            Command::RunNow { job_name } => {
                runs.push(job_name.clone());
                false
            }
            _ => true,
        });
        runs
    }

    /// Per-job state snapshot for the API.
    pub fn state_snapshot(&self) -> HashMap<String, JobState> {
        let jobs = self.jobs.read().unwrap();
        jobs.iter()
            .map(|(name, cell)| (name.clone(), cell.lock().unwrap().clone()))
            .collect()
    }
}
