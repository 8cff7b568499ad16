//! Agent command: detach from the bus call, then run the agent.

use anyhow::{Context, Result};

use crate::agent::{self, AgentConfig};
use crate::logging;

pub fn run() -> Result<()> {
    // Resolve the environment before forking so a missing variable is
    // reported straight back through the bus as a launch failure.
    let cfg = AgentConfig::from_env()?;

    // Detach before any runtime exists: the foreground process reports
    // success to the bus and is gone, the grandchild does the work.
    #[cfg(unix)]
    match agent::daemon::detach()? {
        agent::daemon::Detach::Parent => {
            println!("Agent started successfully");
            return Ok(());
        }
        agent::daemon::Detach::Child => {}
    }

    logging::init_agent_logging(cfg.log_level.as_deref(), cfg.log_dir.as_deref());

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("building agent runtime")?;
    runtime.block_on(agent::run(cfg))
}
