//! CLI surface.
//!
//! `start` runs the scheduler daemon, `agent` runs the on-target agent
//! (which must fork before any runtime exists, hence the synchronous entry
//! point), `check-config` validates the config directory and exits.

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;

mod agent_cmd;
mod start;

#[derive(Parser)]
#[command(name = "saltpeter", about = "Distributed cron scheduler", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler daemon.
    Start {
        /// Configuration directory location.
        #[arg(short = 'c', long, default_value = "/etc/saltpeter")]
        configdir: PathBuf,
    },

    /// Run the on-target agent. Configured exclusively through SP_*
    /// environment variables; takes no positional parameters.
    Agent,

    /// Parse the configuration directory, report every problem, exit
    /// non-zero if any file or job is bad.
    CheckConfig {
        #[arg(short = 'c', long, default_value = "/etc/saltpeter")]
        configdir: PathBuf,
    },
}

pub fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Start { configdir } => {
            let runtime = tokio::runtime::Runtime::new()?;
            runtime.block_on(start::run(configdir))
        }
        Commands::Agent => agent_cmd::run(),
        Commands::CheckConfig { configdir } => check_config(&configdir),
    }
}

fn check_config(configdir: &PathBuf) -> Result<()> {
    crate::logging::init_simple_logging();
    let loader = crate::config::ConfigLoader::new(configdir);
    let problems = loader.validate()?;
    if problems.is_empty() {
        println!("configuration ok");
        return Ok(());
    }
    for problem in &problems {
        eprintln!("{problem}");
    }
    anyhow::bail!("{} problem(s) found", problems.len())
}
