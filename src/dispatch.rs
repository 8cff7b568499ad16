//! Dispatch: one scheduled execution of a job across its target set.
//!
//! Resolves the target expression through the bus, applies the maintenance
//! filter and the `number_of_targets` sample, submits the agent launch in
//! asynchronous mode and drives the two-phase confirmation: Phase 1 polls
//! the bus with no deadline of its own, Phase 2 hands confirmed targets to
//! the live monitor. Legacy jobs (`use_agent: false`) run synchronously
//! through the bus instead.

use chrono::Utc;
use rand::seq::SliceRandom;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::{RemoteBus, SyncInvocation};
use crate::config::{ConfigSnapshot, JobDefinition};
use crate::joblog::JobLog;
use crate::monitor::{self, MonitorSettings};
use crate::state::StateStore;

pub struct Dispatcher {
    state: Arc<StateStore>,
    bus: Arc<dyn RemoteBus>,
    joblog: JobLog,
    settings: MonitorSettings,
}

impl Dispatcher {
    pub fn new(
        state: Arc<StateStore>,
        bus: Arc<dyn RemoteBus>,
        joblog: JobLog,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            state,
            bus,
            joblog,
            settings,
        }
    }

    /// Run one instance of `job` to completion. The caller (scheduler loop)
    /// has already set the overlap flag and spawns this as its own task; the
    /// flag is cleared on every exit path that ends the instance.
    pub async fn dispatch(&self, job: JobDefinition, snapshot: Arc<ConfigSnapshot>) {
        let instance_id = self.state.next_instance_id(&job.name);

        let targets = match self.resolve(&job, &snapshot).await {
            Ok(targets) => targets,
            Err(e) => {
                error!(job = %job.name, instance = %instance_id, error = %e, "target resolution failed");
                self.clear_overlap(&job.name);
                return;
            }
        };

        if targets.is_empty() {
            info!(job = %job.name, instance = %instance_id, "no targets matched");
            if let Err(e) = self.joblog.write_no_targets(&job.name, &instance_id) {
                warn!(job = %job.name, error = %e, "could not write job log");
            }
            self.clear_overlap(&job.name);
            return;
        }

        info!(
            job = %job.name,
            instance = %instance_id,
            targets = targets.len(),
            "dispatching"
        );
        // Fresh result slots for every target of this instance; a frozen
        // result from the previous run must never mask this run's outcome.
        self.state.begin_dispatch(&job.name, &targets);
        let machines: HashSet<String> = targets.iter().cloned().collect();
        let started_at = Utc::now();
        self.state
            .register_instance(&instance_id, &job.name, machines, started_at);

        if job.use_agent {
            self.run_with_agent(&job, &snapshot, &instance_id, &targets)
                .await;
        } else {
            self.run_legacy(&job, &instance_id, &targets).await;
        }
    }

    /// Resolve the target expression, subtract the maintenance set and apply
    /// the uniform sample.
    async fn resolve(
        &self,
        job: &JobDefinition,
        snapshot: &ConfigSnapshot,
    ) -> Result<Vec<String>, crate::error::DispatchError> {
        let mut machines = self
            .bus
            .resolve_targets(&job.targets, job.target_type)
            .await?;
        machines.retain(|m| !snapshot.maintenance.machines.contains(m));
        machines.sort();

        if job.number_of_targets > 0 && job.number_of_targets < machines.len() {
            let mut rng = rand::thread_rng();
            machines.shuffle(&mut rng);
            machines.truncate(job.number_of_targets);
            machines.sort();
        }
        Ok(machines)
    }

    async fn run_with_agent(
        &self,
        job: &JobDefinition,
        snapshot: &ConfigSnapshot,
        instance_id: &str,
        targets: &[String],
    ) {
        let env = self.agent_env(job, snapshot, instance_id);
        let agent_cmd = job
            .agent_path
            .clone()
            .unwrap_or_else(|| snapshot.runtime.agent_path.clone());

        let job_ref = match self.bus.submit_detached(targets, &agent_cmd, &env).await {
            Ok(job_ref) => job_ref,
            Err(e) => {
                error!(job = %job.name, instance = %instance_id, error = %e, "bus refused the launch");
                let now = Utc::now();
                for machine in targets {
                    self.state.finalize_target(
                        &job.name,
                        machine,
                        255,
                        Some(&format!("[SALTPETER ERROR: dispatch failed: {e}]")),
                        now,
                    );
                    self.state.remove_instance_machine(instance_id, machine);
                }
                self.finish_instance(job, instance_id).await;
                return;
            }
        };

        self.confirm_launch(job, instance_id, &job_ref).await;
        monitor::run_instance(
            Arc::clone(&self.state),
            self.joblog.clone(),
            self.settings.clone(),
            instance_id.to_string(),
            job.clone(),
        )
        .await;
    }

    /// Phase 1: poll the bus until every target either confirmed the agent
    /// fork (retcode 0), failed to start it, or never responded. A busy bus
    /// only delays this loop, it never fails a target.
    async fn confirm_launch(
        &self,
        job: &JobDefinition,
        instance_id: &str,
        job_ref: &crate::bus::BusJobRef,
    ) {
        let mut outstanding: HashSet<String> = self
            .state
            .instance(instance_id)
            .map(|i| i.machines)
            .unwrap_or_default();

        while !outstanding.is_empty() {
            let poll = match self.bus.poll(job_ref).await {
                Ok(poll) => poll,
                Err(e) => {
                    warn!(job = %job.name, instance = %instance_id, error = %e, "bus poll failed, retrying");
                    tokio::time::sleep(self.bus.poll_interval()).await;
                    continue;
                }
            };

            let now = Utc::now();
            for (machine, outcome) in &poll.outcomes {
                if !outstanding.remove(machine) {
                    continue;
                }
                if outcome.retcode == 0 {
                    info!(job = %job.name, instance = %instance_id, machine = %machine, "agent launch confirmed");
                    self.state.confirm_target(&job.name, machine, now);
                    self.state.mark_phase2_started(instance_id, now);
                } else {
                    // The agent never forked; fail the target right away
                    // instead of waiting for a heartbeat that cannot come.
                    error!(
                        job = %job.name,
                        instance = %instance_id,
                        machine = %machine,
                        retcode = outcome.retcode,
                        "agent launch failed"
                    );
                    let text = if outcome.stderr.is_empty() {
                        outcome.stdout.clone()
                    } else {
                        outcome.stderr.clone()
                    };
                    self.state
                        .finalize_target(&job.name, machine, outcome.retcode, Some(&text), now);
                    self.state.remove_instance_machine(instance_id, machine);
                }
            }

            if poll.finished && !outstanding.is_empty() {
                let now = Utc::now();
                for machine in outstanding.drain() {
                    error!(job = %job.name, instance = %instance_id, machine = %machine, "target unreachable");
                    self.state.finalize_target(
                        &job.name,
                        &machine,
                        255,
                        Some("[SALTPETER ERROR: target did not respond to the launch call]"),
                        now,
                    );
                    self.state.remove_instance_machine(instance_id, &machine);
                }
                break;
            }

            if !outstanding.is_empty() {
                tokio::time::sleep(self.bus.poll_interval()).await;
            }
        }
    }

    /// Environment injected into the agent process on each target. The
    /// command and credentials travel here, never on the command line.
    fn agent_env(
        &self,
        job: &JobDefinition,
        snapshot: &ConfigSnapshot,
        instance_id: &str,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = job.custom_env.clone();
        env.insert(
            "SP_WEBSOCKET_URL".into(),
            snapshot.runtime.channel_url.clone(),
        );
        env.insert("SP_JOB_NAME".into(), job.name.clone());
        env.insert("SP_JOB_INSTANCE".into(), instance_id.to_string());
        env.insert("SP_COMMAND".into(), job.command.clone());
        env.insert("SP_TIMEOUT".into(), job.timeout.to_string());
        if let Some(cwd) = &job.cwd {
            env.insert("SP_CWD".into(), cwd.clone());
        }
        if let Some(user) = &job.user {
            env.insert("SP_USER".into(), user.clone());
        }
        if let Some(level) = job
            .agent_log_level
            .as_ref()
            .or(snapshot.runtime.agent_log_level.as_ref())
        {
            env.insert("SP_LOG_LEVEL".into(), level.clone());
        }
        if let Some(dir) = job
            .agent_log_dir
            .as_ref()
            .or(snapshot.runtime.agent_log_dir.as_ref())
        {
            env.insert("SP_LOG_DIR".into(), dir.clone());
        }
        env
    }

    /// Legacy mode: run the command synchronously through the bus and feed
    /// the outcomes straight into state, no agent channel involved.
    async fn run_legacy(&self, job: &JobDefinition, instance_id: &str, targets: &[String]) {
        let invocation = SyncInvocation {
            command: job.command.clone(),
            cwd: job.cwd.clone(),
            user: job.user.clone(),
            timeout: job.timeout,
        };

        match self.bus.run_sync(targets, &invocation).await {
            Ok(outcomes) => {
                let now = Utc::now();
                for machine in targets {
                    match outcomes.get(machine) {
                        Some(outcome) => {
                            let mut output = outcome.stdout.clone();
                            output.push_str(&outcome.stderr);
                            self.state.confirm_target(&job.name, machine, now);
                            self.state.finalize_target(
                                &job.name,
                                machine,
                                outcome.retcode,
                                Some(&output),
                                now,
                            );
                        }
                        None => {
                            self.state.finalize_target(
                                &job.name,
                                machine,
                                255,
                                Some("[SALTPETER ERROR: target did not respond]"),
                                now,
                            );
                        }
                    }
                    self.state.remove_instance_machine(instance_id, machine);
                }
            }
            Err(e) => {
                error!(job = %job.name, instance = %instance_id, error = %e, "legacy run failed");
                let now = Utc::now();
                for machine in targets {
                    self.state.finalize_target(
                        &job.name,
                        machine,
                        255,
                        Some(&format!("[SALTPETER ERROR: dispatch failed: {e}]")),
                        now,
                    );
                    self.state.remove_instance_machine(instance_id, machine);
                }
            }
        }
        self.finish_instance(job, instance_id).await;
    }

    /// Write the instance record and release the job for re-dispatch.
    async fn finish_instance(&self, job: &JobDefinition, instance_id: &str) {
        let started_at = self
            .state
            .instance(instance_id)
            .map(|i| i.started_at)
            .unwrap_or_else(Utc::now);
        monitor::write_record_and_release(
            &self.state,
            &self.joblog,
            &job.name,
            instance_id,
            started_at,
        );
    }

    fn clear_overlap(&self, job_name: &str) {
        let cell = self.state.job(job_name);
        cell.lock().unwrap().overlap = false;
    }
}
