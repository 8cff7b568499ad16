//! Start command: wire up and run the scheduler daemon.

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::info;

use crate::bus::{RemoteBus, SaltCliBus};
use crate::config::{self, ConfigLoader};
use crate::dispatch::Dispatcher;
use crate::joblog::JobLog;
use crate::logging;
use crate::monitor::MonitorSettings;
use crate::scheduler::{SchedulerLoop, SchedulerSettings};
use crate::server::{self, ConnectionRegistry, ServerContext};
use crate::state::StateStore;

pub async fn run(configdir: PathBuf) -> Result<()> {
    let loader = Arc::new(ConfigLoader::new(&configdir));
    // An unreadable config directory at startup is fatal.
    let snapshot = loader.reload().context("initial configuration load")?;
    let logging = Arc::new(logging::init_logging(
        snapshot.runtime.verbose,
        &snapshot.runtime.log_dir,
    )?);
    info!(
        configdir = %configdir.display(),
        jobs = snapshot.jobs.len(),
        "saltpeter starting"
    );

    // The verbose flag follows config reloads; ports, bind address and the
    // daemon log directory stay as loaded at startup.
    let reload_logging = Arc::clone(&logging);
    let _watcher = config::spawn_watcher(Arc::clone(&loader), move |snapshot| {
        reload_logging.set_verbose(snapshot.runtime.verbose);
    })?;

    let state = Arc::new(StateStore::new());
    let registry = Arc::new(ConnectionRegistry::new());
    let joblog = JobLog::new(&snapshot.runtime.log_dir);
    let bus: Arc<dyn RemoteBus> = Arc::new(SaltCliBus::new());

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::clone(&state),
        bus,
        joblog,
        MonitorSettings::default(),
    ));

    tokio::spawn(server::run_kill_poller(
        Arc::clone(&state),
        Arc::clone(&registry),
    ));

    let scheduler = SchedulerLoop::new(
        Arc::clone(&state),
        Arc::clone(&loader),
        dispatcher,
        SchedulerSettings::default(),
    );
    tokio::spawn(async move { scheduler.run().await });

    let ctx = ServerContext {
        state,
        registry,
        loader,
    };
    let channel_server = server::run_channel_server(
        &snapshot.runtime.bind_addr,
        snapshot.runtime.channel_port,
        ctx.clone(),
    );
    let api_server = server::run_api_server(
        &snapshot.runtime.bind_addr,
        snapshot.runtime.api_port,
        ctx.clone(),
    );

    tokio::select! {
        result = channel_server => result?,
        result = api_server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
    Ok(())
}
