//! Remote-execution bus interface.
//!
//! The bus is an external collaborator: it resolves target expressions to
//! machine lists and runs command lines on those machines. The scheduler
//! only depends on this trait; production uses [`salt::SaltCliBus`], tests
//! substitute their own implementation.

use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;

use crate::config::TargetType;
use crate::error::DispatchError;

pub mod salt;

pub use salt::SaltCliBus;

/// Per-machine outcome of a bus command.
#[derive(Debug, Clone, Default)]
pub struct BusOutcome {
    pub retcode: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Handle to an asynchronous bus job.
#[derive(Debug, Clone)]
pub struct BusJobRef {
    pub jid: String,
    /// Machines the bus accepted the job for.
    pub minions: Vec<String>,
}

/// One poll of an asynchronous bus job.
#[derive(Debug, Clone, Default)]
pub struct BusPoll {
    /// Outcomes returned so far, keyed by machine. A machine may appear in
    /// consecutive polls; callers treat the first sighting as authoritative.
    pub outcomes: HashMap<String, BusOutcome>,
    /// True once the bus considers the job over; machines still missing
    /// from `outcomes` at that point never responded.
    pub finished: bool,
}

/// Arguments for a legacy synchronous run (`use_agent: false`).
#[derive(Debug, Clone)]
pub struct SyncInvocation {
    pub command: String,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub timeout: u64,
}

#[async_trait]
pub trait RemoteBus: Send + Sync {
    /// Machines matching `(expr, target_type)`.
    async fn resolve_targets(
        &self,
        expr: &str,
        target_type: TargetType,
    ) -> Result<Vec<String>, DispatchError>;

    /// Fire-and-forget launch of `command` (with injected environment) on
    /// the given machines. Returns a reference to poll.
    async fn submit_detached(
        &self,
        targets: &[String],
        command: &str,
        env: &HashMap<String, String>,
    ) -> Result<BusJobRef, DispatchError>;

    /// Collect outcomes of a detached launch. Called repeatedly with no
    /// overall deadline.
    async fn poll(&self, job: &BusJobRef) -> Result<BusPoll, DispatchError>;

    /// Blocking run used by legacy (agent-less) jobs.
    async fn run_sync(
        &self,
        targets: &[String],
        invocation: &SyncInvocation,
    ) -> Result<HashMap<String, BusOutcome>, DispatchError>;

    /// How long the dispatcher waits between polls.
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(5)
    }
}
