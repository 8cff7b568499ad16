//! Command execution on the target.
//!
//! The command runs under `sh -c` with piped stdout/stderr; both pipes are
//! read line by line and tagged with their stream. Termination follows the
//! SIGTERM → 5s grace → SIGKILL sequence.

use anyhow::{Context, Result};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::protocol::OutputStream;

use super::AgentConfig;

const TERM_GRACE: Duration = Duration::from_secs(5);

pub struct RunningCommand {
    pub child: Child,
    pub pid: u32,
    /// Captured lines, newline included, in emission order per stream.
    pub lines: mpsc::Receiver<(OutputStream, String)>,
}

pub fn spawn(cfg: &AgentConfig) -> Result<RunningCommand> {
    let mut command = Command::new("sh");
    command
        .arg("-c")
        .arg(&cfg.command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    // Own process group, so termination reaches the whole command tree and
    // no orphan keeps the output pipes open.
    #[cfg(unix)]
    command.process_group(0);

    if let Some(cwd) = &cfg.cwd {
        command.current_dir(cwd);
    }

    #[cfg(unix)]
    if let Some(user) = &cfg.user {
        let record = nix::unistd::User::from_name(user)
            .with_context(|| format!("looking up user {user}"))?
            .with_context(|| format!("no such user: {user}"))?;
        command.uid(record.uid.as_raw()).gid(record.gid.as_raw());
    }

    let mut child = command.spawn().context("spawning command")?;
    let pid = child.id().context("spawned command has no pid")?;

    let stdout = child.stdout.take().context("missing stdout pipe")?;
    let stderr = child.stderr.take().context("missing stderr pipe")?;
    let (tx, rx) = mpsc::channel(256);

    let out_tx = tx.clone();
    tokio::spawn(async move {
        let mut lines = BufReader::new(stdout).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if out_tx
                .send((OutputStream::Stdout, line + "\n"))
                .await
                .is_err()
            {
                break;
            }
        }
    });
    tokio::spawn(async move {
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            if tx.send((OutputStream::Stderr, line + "\n")).await.is_err() {
                break;
            }
        }
    });

    debug!(pid, "command spawned");
    Ok(RunningCommand { child, pid, lines: rx })
}

/// SIGTERM to the command's process group, a 5 second grace period, then
/// SIGKILL. Returns the process's real exit status (143 for a SIGTERM
/// death).
pub async fn terminate(cmd: &mut RunningCommand) -> Result<std::process::ExitStatus> {
    #[cfg(unix)]
    {
        signal_group(cmd.pid, nix::sys::signal::Signal::SIGTERM);
        match tokio::time::timeout(TERM_GRACE, cmd.child.wait()).await {
            Ok(status) => return status.context("waiting after SIGTERM"),
            Err(_) => {
                warn!(pid = cmd.pid, "no exit after SIGTERM, sending SIGKILL");
                signal_group(cmd.pid, nix::sys::signal::Signal::SIGKILL);
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = cmd.child.start_kill();
    }
    cmd.child.wait().await.context("waiting after SIGKILL")
}

#[cfg(unix)]
fn signal_group(pid: u32, signal: nix::sys::signal::Signal) {
    let pgid = nix::unistd::Pid::from_raw(pid as i32);
    if let Err(e) = nix::sys::signal::killpg(pgid, signal) {
        debug!(error = %e, "group signal failed, trying the process itself");
        let _ = nix::sys::signal::kill(pgid, signal);
    }
}

/// Map an exit status to the wire retcode: the code itself, or 128+signal
/// for a signal death.
pub fn exit_code(status: std::process::ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    255
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn config(command: &str) -> AgentConfig {
        AgentConfig {
            websocket_url: "ws://127.0.0.1:1/ws".into(),
            job_name: "t".into(),
            job_instance: "t_1".into(),
            machine: "test".into(),
            command: command.into(),
            cwd: None,
            user: None,
            timeout: None,
            log_level: None,
            log_dir: None,
            flush_interval: Duration::from_millis(250),
            flush_max_bytes: 4096,
        }
    }

    #[tokio::test]
    async fn captures_both_streams_line_by_line() {
        let mut cmd = spawn(&config("echo out; echo err >&2")).unwrap();
        let status = cmd.child.wait().await.unwrap();
        assert_eq!(exit_code(status), 0);

        let mut seen = Vec::new();
        while let Some(line) = cmd.lines.recv().await {
            seen.push(line);
        }
        assert!(seen.contains(&(OutputStream::Stdout, "out\n".to_string())));
        assert!(seen.contains(&(OutputStream::Stderr, "err\n".to_string())));
    }

    #[tokio::test]
    async fn exit_code_passes_through() {
        let mut cmd = spawn(&config("exit 7")).unwrap();
        let status = cmd.child.wait().await.unwrap();
        assert_eq!(exit_code(status), 7);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_reports_sigterm_death() {
        let mut cmd = spawn(&config("sleep 30")).unwrap();
        let status = terminate(&mut cmd).await.unwrap();
        assert_eq!(exit_code(status), 128 + 15);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn cwd_is_honoured() {
        let dir = tempfile::tempdir().unwrap();
        let mut cfg = config("pwd");
        cfg.cwd = Some(dir.path().to_string_lossy().into_owned());
        let mut cmd = spawn(&cfg).unwrap();
        cmd.child.wait().await.unwrap();
        let mut out = String::new();
        while let Some((_, line)) = cmd.lines.recv().await {
            out.push_str(&line);
        }
        let canonical = dir.path().canonicalize().unwrap();
        assert_eq!(out.trim(), canonical.to_string_lossy());
    }
}
