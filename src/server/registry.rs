//! Registry of live agent connections.
//!
//! Keyed by `(job_instance, machine)`; a duplicate connect for the same key
//! replaces the entry (resumption). The kill poller walks the registry to
//! deliver kill commands to every connection of a job.

use actix::Addr;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

use crate::state::StateStore;

use super::session::{AgentSession, KillSignal};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConnKey {
    pub job_instance: String,
    pub machine: String,
}

struct Entry {
    job_name: String,
    addr: Addr<AgentSession>,
}

#[derive(Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<ConnKey, Entry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, key: ConnKey, job_name: String, addr: Addr<AgentSession>) {
        let replaced = self
            .inner
            .lock()
            .unwrap()
            .insert(key.clone(), Entry { job_name, addr })
            .is_some();
        if replaced {
            info!(instance = %key.job_instance, machine = %key.machine, "agent reconnected");
        }
    }

    /// Remove the entry, but only if it still belongs to `addr` — a stale
    /// session closing must not evict its replacement.
    pub fn unregister(&self, key: &ConnKey, addr: &Addr<AgentSession>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.get(key).map(|e| &e.addr == addr).unwrap_or(false) {
            inner.remove(key);
        }
    }

    pub fn addrs_for_job(&self, job_name: &str) -> Vec<Addr<AgentSession>> {
        self.inner
            .lock()
            .unwrap()
            .values()
            .filter(|e| e.job_name == job_name)
            .map(|e| e.addr.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Drain the command queue every 500ms and forward kills to every live
/// connection of the named job. A kill for a job with no connections is
/// dropped silently — by the time an agent reconnects the monitor will have
/// timed the target out.
pub async fn run_kill_poller(state: Arc<StateStore>, registry: Arc<ConnectionRegistry>) {
    let mut tick = tokio::time::interval(Duration::from_millis(500));
    loop {
        tick.tick().await;
        for job_name in state.take_kill_commands() {
            let addrs = registry.addrs_for_job(&job_name);
            if addrs.is_empty() {
                debug!(job = %job_name, "kill requested but no live connections");
                continue;
            }
            info!(job = %job_name, connections = addrs.len(), "delivering kill");
            for addr in addrs {
                addr.do_send(KillSignal);
            }
        }
    }
}
