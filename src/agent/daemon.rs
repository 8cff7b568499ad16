//! Detachment from the controlling bus call.
//!
//! The bus invocation must return success the moment the agent is viable,
//! so the foreground process forks, the intermediate child starts a new
//! session and forks again, and the grandchild carries on with its standard
//! descriptors pointed at /dev/null. Only the grandchild returns from
//! [`detach`].

#![cfg(unix)]

use anyhow::{Context, Result};
use nix::unistd::{fork, setsid, ForkResult};
use std::os::fd::AsRawFd;

/// Outcome of the double fork, as seen by the caller.
pub enum Detach {
    /// Foreground process: report success to the bus and exit 0.
    Parent,
    /// Fully detached grandchild: run the agent.
    Child,
}

pub fn detach() -> Result<Detach> {
    // First fork: the parent is what the bus is waiting on.
    match unsafe { fork() }.context("first fork failed")? {
        ForkResult::Parent { .. } => return Ok(Detach::Parent),
        ForkResult::Child => {}
    }

    // New session, away from the bus's process group.
    setsid().context("setsid failed")?;

    // Second fork so the survivor can never reacquire a controlling tty and
    // the session leader exits immediately (no zombie: init reaps it).
    match unsafe { fork() }.context("second fork failed")? {
        ForkResult::Parent { .. } => std::process::exit(0),
        ForkResult::Child => {}
    }

    redirect_stdio_to_devnull().context("redirecting stdio")?;
    Ok(Detach::Child)
}

fn redirect_stdio_to_devnull() -> Result<()> {
    let devnull = std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .open("/dev/null")
        .context("opening /dev/null")?;
    let fd = devnull.as_raw_fd();
    for target in 0..=2 {
        nix::unistd::dup2(fd, target).with_context(|| format!("dup2 to fd {target}"))?;
    }
    Ok(())
}
