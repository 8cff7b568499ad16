//! The scheduling loop.
//!
//! Ticks once a second over the current config snapshot. A job fires when
//! its next firing time has passed (or a run-now command is queued for it),
//! it has no live instance, and maintenance is not global. Missed firings
//! are not queued: after every fire the next run is recomputed strictly
//! after the current wall clock.

use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::config::ConfigLoader;
use crate::dispatch::Dispatcher;
use crate::state::StateStore;

#[derive(Debug, Clone)]
pub struct SchedulerSettings {
    pub tick: Duration,
    /// Cadence of the "maintenance is on" reminder while dispatch is
    /// suppressed globally.
    pub maintenance_log_every: Duration,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            tick: Duration::from_secs(1),
            maintenance_log_every: Duration::from_secs(20),
        }
    }
}

pub struct SchedulerLoop {
    state: Arc<StateStore>,
    loader: Arc<ConfigLoader>,
    dispatcher: Arc<Dispatcher>,
    settings: SchedulerSettings,
}

impl SchedulerLoop {
    pub fn new(
        state: Arc<StateStore>,
        loader: Arc<ConfigLoader>,
        dispatcher: Arc<Dispatcher>,
        settings: SchedulerSettings,
    ) -> Self {
        Self {
            state,
            loader,
            dispatcher,
            settings,
        }
    }

    pub async fn run(&self) {
        let mut tick = tokio::time::interval(self.settings.tick);
        let mut last_maintenance_log: Option<Instant> = None;

        loop {
            tick.tick().await;
            let snapshot = self.loader.snapshot();
            let forced: HashSet<String> = self.state.take_run_commands().into_iter().collect();

            if snapshot.maintenance.global {
                let due = last_maintenance_log
                    .map(|t| t.elapsed() >= self.settings.maintenance_log_every)
                    .unwrap_or(true);
                if due {
                    info!("global maintenance is on, dispatch suppressed");
                    last_maintenance_log = Some(Instant::now());
                }
                for job_name in forced {
                    warn!(job = %job_name, "run-now ignored, global maintenance is on");
                }
                continue;
            }
            last_maintenance_log = None;

            let now = Utc::now();
            for job in snapshot.jobs.values() {
                let cell = self.state.job(&job.name);
                let mut job_state = cell.lock().unwrap();

                let due = match job_state.next_run {
                    Some(next_run) => now >= next_run,
                    None => {
                        // Fresh job (or schedule changed under us): seed the
                        // firing time; it does not fire on the seeding tick,
                        // though a queued run-now still can.
                        match job.schedule.next_after(now) {
                            Ok(next) => job_state.next_run = next,
                            Err(e) => debug!(job = %job.name, error = %e, "schedule did not compile"),
                        }
                        false
                    }
                };
                let fire = due || forced.contains(&job.name);
                if !fire {
                    continue;
                }

                if due {
                    // Recompute regardless of whether we can dispatch; a
                    // missed firing is simply missed.
                    job_state.next_run = job.schedule.next_after(now).ok().flatten();
                }

                if job_state.overlap {
                    debug!(job = %job.name, "previous instance still live, firing suppressed");
                    continue;
                }

                job_state.overlap = true;
                job_state.last_run = Some(now);
                drop(job_state);

                info!(job = %job.name, "firing");
                let dispatcher = Arc::clone(&self.dispatcher);
                let job = job.clone();
                let snapshot = Arc::clone(&snapshot);
                tokio::spawn(async move {
                    dispatcher.dispatch(job, snapshot).await;
                });
            }
        }
    }
}
