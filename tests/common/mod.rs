//! Shared test helpers: a scriptable in-memory bus and job builders.
#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use saltpeter::bus::{BusJobRef, BusOutcome, BusPoll, RemoteBus, SyncInvocation};
use saltpeter::config::{JobDefinition, TargetType};
use saltpeter::error::DispatchError;
use saltpeter::schedule::CronSpec;

/// A launch the mock bus accepted.
#[derive(Debug, Clone)]
pub struct LaunchRecord {
    pub targets: Vec<String>,
    pub command: String,
    pub env: HashMap<String, String>,
}

/// Scriptable bus: `resolve_targets` answers from a fixed machine list,
/// `poll` pops pre-scripted results, everything is recorded for assertions.
pub struct MockBus {
    pub machines: Vec<String>,
    launches: Mutex<Vec<LaunchRecord>>,
    polls: Mutex<VecDeque<BusPoll>>,
    sync_outcomes: Mutex<HashMap<String, BusOutcome>>,
    fail_submit: AtomicBool,
}

impl MockBus {
    pub fn new(machines: &[&str]) -> Self {
        Self {
            machines: machines.iter().map(|m| m.to_string()).collect(),
            launches: Mutex::new(Vec::new()),
            polls: Mutex::new(VecDeque::new()),
            sync_outcomes: Mutex::new(HashMap::new()),
            fail_submit: AtomicBool::new(false),
        }
    }

    /// Make the next `submit_detached` calls refuse the launch.
    pub fn set_fail_submit(&self, fail: bool) {
        self.fail_submit.store(fail, Ordering::SeqCst);
    }

    /// Queue the next poll answer.
    pub fn script_poll(&self, poll: BusPoll) {
        self.polls.lock().unwrap().push_back(poll);
    }

    /// Convenience: one poll that confirms every machine with retcode 0.
    pub fn script_confirm_all(&self) {
        let outcomes = self
            .machines
            .iter()
            .map(|m| (m.clone(), BusOutcome::default()))
            .collect();
        self.script_poll(BusPoll {
            outcomes,
            finished: true,
        });
    }

    pub fn set_sync_outcome(&self, machine: &str, outcome: BusOutcome) {
        self.sync_outcomes
            .lock()
            .unwrap()
            .insert(machine.to_string(), outcome);
    }

    pub fn launches(&self) -> Vec<LaunchRecord> {
        self.launches.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteBus for MockBus {
    async fn resolve_targets(
        &self,
        _expr: &str,
        _target_type: TargetType,
    ) -> Result<Vec<String>, DispatchError> {
        Ok(self.machines.clone())
    }

    async fn submit_detached(
        &self,
        targets: &[String],
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<BusJobRef, DispatchError> {
        if self.fail_submit.load(Ordering::SeqCst) {
            return Err(DispatchError::Submit("bus queue is full".to_string()));
        }
        self.launches.lock().unwrap().push(LaunchRecord {
            targets: targets.to_vec(),
            command: command.to_string(),
            env: env.clone(),
        });
        Ok(BusJobRef {
            jid: format!("mock-{}", self.launches.lock().unwrap().len()),
            minions: targets.to_vec(),
        })
    }

    async fn poll(&self, _job: &BusJobRef) -> Result<BusPoll, DispatchError> {
        Ok(self
            .polls
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(BusPoll {
                outcomes: HashMap::new(),
                finished: false,
            }))
    }

    async fn run_sync(
        &self,
        targets: &[String],
        invocation: &SyncInvocation,
    ) -> Result<HashMap<String, BusOutcome>, DispatchError> {
        self.launches.lock().unwrap().push(LaunchRecord {
            targets: targets.to_vec(),
            command: invocation.command.clone(),
            env: HashMap::new(),
        });
        Ok(self.sync_outcomes.lock().unwrap().clone())
    }

    fn poll_interval(&self) -> Duration {
        Duration::from_millis(10)
    }
}

/// A job definition with test-friendly defaults.
pub fn job(name: &str, command: &str, timeout: u64) -> JobDefinition {
    JobDefinition {
        name: name.to_string(),
        schedule: CronSpec::default(),
        command: command.to_string(),
        user: None,
        cwd: None,
        custom_env: HashMap::new(),
        targets: "*".to_string(),
        target_type: TargetType::Glob,
        number_of_targets: 0,
        timeout,
        use_agent: true,
        agent_path: None,
        agent_log_level: None,
        agent_log_dir: None,
    }
}
