//! The on-target agent.
//!
//! The only remote-side code. It detaches from the bus invocation, runs the
//! command, streams sequenced output back to the scheduler with
//! at-least-once delivery, heartbeats every five seconds, honours kill, and
//! reports the final exit status — retrying the completion report for up to
//! a minute. The command keeps running whether or not the channel is up;
//! the channel reconnects every two seconds and replays unacked output.
//!
//! All configuration comes from `SP_*` environment variables; nothing
//! sensitive ever appears on a command line.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::protocol::{AgentMessage, OutputStream, ServerMessage};

pub mod buffer;
pub mod channel;
#[cfg(unix)]
pub mod daemon;
pub mod proc;

use buffer::OutputBuffer;
use channel::Channel;

/// Reconnect cadence while the channel is down.
const RECONNECT_INTERVAL: Duration = Duration::from_secs(2);
/// Application-level heartbeat cadence.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
/// Inbound poll slice; keeps the output pipeline from starving.
const PUMP_INTERVAL: Duration = Duration::from_millis(100);
/// How long the completion report is retried after the process exits.
const COMPLETION_WINDOW: Duration = Duration::from_secs(60);

#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub websocket_url: String,
    pub job_name: String,
    pub job_instance: String,
    pub machine: String,
    pub command: String,
    pub cwd: Option<String>,
    pub user: Option<String>,
    pub timeout: Option<u64>,
    pub log_level: Option<String>,
    pub log_dir: Option<String>,
    pub flush_interval: Duration,
    pub flush_max_bytes: usize,
}

impl AgentConfig {
    /// Read the full configuration from the environment. Required:
    /// `SP_WEBSOCKET_URL`, `SP_JOB_NAME`, `SP_JOB_INSTANCE`, `SP_COMMAND`.
    pub fn from_env() -> Result<Self> {
        let required = |key: &str| -> Result<String> {
            std::env::var(key).with_context(|| format!("{key} environment variable not set"))
        };
        let optional = |key: &str| std::env::var(key).ok().filter(|v| !v.is_empty());

        let timeout = match optional("SP_TIMEOUT") {
            None => None,
            Some(raw) => match raw.parse::<u64>() {
                Ok(secs) => Some(secs),
                Err(_) => {
                    eprintln!("Warning: invalid SP_TIMEOUT value '{raw}', ignoring");
                    None
                }
            },
        };
        let flush_interval_ms = optional("SP_OUTPUT_INTERVAL_MS")
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(250);
        let flush_max_kb = optional("SP_OUTPUT_MAX_SIZE_KB")
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(4);

        Ok(Self {
            websocket_url: required("SP_WEBSOCKET_URL")?,
            job_name: required("SP_JOB_NAME")?,
            job_instance: required("SP_JOB_INSTANCE")?,
            machine: optional("SP_MACHINE_ID").unwrap_or_else(default_machine_id),
            command: required("SP_COMMAND")?,
            cwd: optional("SP_CWD"),
            user: optional("SP_USER"),
            timeout,
            log_level: optional("SP_LOG_LEVEL"),
            log_dir: optional("SP_LOG_DIR"),
            flush_interval: Duration::from_millis(flush_interval_ms),
            flush_max_bytes: flush_max_kb * 1024,
        })
    }

    fn message(&self, build: impl FnOnce(String, String, String) -> AgentMessage) -> AgentMessage {
        build(
            self.job_name.clone(),
            self.job_instance.clone(),
            self.machine.clone(),
        )
    }
}

fn default_machine_id() -> String {
    #[cfg(unix)]
    {
        if let Ok(name) = nix::unistd::gethostname() {
            return name.to_string_lossy().into_owned();
        }
    }
    "unknown".to_string()
}

/// Run the agent to completion. The caller has already detached.
pub async fn run(cfg: AgentConfig) -> Result<()> {
    info!(
        job = %cfg.job_name,
        instance = %cfg.job_instance,
        machine = %cfg.machine,
        "agent starting"
    );

    let mut cmd = match proc::spawn(&cfg) {
        Ok(cmd) => cmd,
        Err(e) => {
            report_fatal(&cfg, &format!("could not start command: {e:#}")).await;
            bail!("could not start command: {e:#}");
        }
    };

    let mut session = Session::new(&cfg, cmd.pid);
    let deadline = cfg.timeout.map(|t| Instant::now() + Duration::from_secs(t));
    let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
    let mut pump = tokio::time::interval(PUMP_INTERVAL);
    let mut killed = false;
    let mut timed_out = false;
    let mut pipes_open = true;

    let status = loop {
        tokio::select! {
            line = cmd.lines.recv(), if pipes_open => {
                match line {
                    Some((stream, line)) => session.buffer.push(stream, line),
                    None => pipes_open = false,
                }
            }
            status = cmd.child.wait() => {
                break status.context("waiting for command")?;
            }
            _ = heartbeat.tick() => {
                session.send_heartbeat().await;
            }
            _ = pump.tick() => {
                if let Some(deadline) = deadline {
                    if !timed_out && Instant::now() >= deadline {
                        warn!(timeout = ?cfg.timeout, "command timed out, killing");
                        timed_out = true;
                        break proc::terminate(&mut cmd).await?;
                    }
                }
                session.maintain_connection().await;
                if session.drain_inbound().await && !killed {
                    // At most one effective SIGTERM; a second kill while the
                    // first is in flight is a no-op.
                    killed = true;
                    break proc::terminate(&mut cmd).await?;
                }
                session.flush_output().await;
            }
        }
    };

    // Drain whatever the pipes still hold; the reader tasks close the
    // channel once both hit EOF. The per-read timeout covers the corner
    // where something outside the process group inherited a pipe end.
    loop {
        match tokio::time::timeout(Duration::from_secs(2), cmd.lines.recv()).await {
            Ok(Some((stream, line))) => session.buffer.push(stream, line),
            Ok(None) => break,
            Err(_) => break,
        }
    }

    if killed {
        session.buffer.push(
            OutputStream::Stderr,
            "\n[Job terminated by user request]\n".to_string(),
        );
    }

    let retcode = if timed_out { 124 } else { proc::exit_code(status) };
    info!(retcode, killed, timed_out, "command finished");

    session.report_completion(retcode).await;
    Ok(())
}

/// Channel state plus the output buffer: everything that survives a
/// reconnect.
struct Session<'a> {
    cfg: &'a AgentConfig,
    pid: u32,
    channel: Option<Channel>,
    buffer: OutputBuffer,
    start_sent: bool,
    last_attempt: Option<Instant>,
}

impl<'a> Session<'a> {
    fn new(cfg: &'a AgentConfig, pid: u32) -> Self {
        Self {
            cfg,
            pid,
            channel: None,
            buffer: OutputBuffer::new(cfg.flush_interval, cfg.flush_max_bytes),
            start_sent: false,
            last_attempt: None,
        }
    }

    /// (Re)open the channel if it is down and a retry is due. On success:
    /// `connect`, then `start` (once), then replay of everything unacked.
    async fn maintain_connection(&mut self) {
        if self.channel.is_some() {
            return;
        }
        let due = self
            .last_attempt
            .map(|t| t.elapsed() >= RECONNECT_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        self.last_attempt = Some(Instant::now());

        let mut channel = match Channel::connect(&self.cfg.websocket_url).await {
            Ok(channel) => channel,
            Err(e) => {
                debug!(error = %e, "channel connect failed, will retry");
                return;
            }
        };

        let connect = self.cfg.message(|job_name, job_instance, machine| {
            AgentMessage::Connect {
                job_name,
                job_instance,
                machine,
                timestamp: Utc::now(),
            }
        });
        if channel.send(&connect).await.is_err() {
            return;
        }
        if !self.start_sent {
            let pid = self.pid;
            let start = self.cfg.message(|job_name, job_instance, machine| {
                AgentMessage::Start {
                    job_name,
                    job_instance,
                    machine,
                    pid,
                    timestamp: Utc::now(),
                }
            });
            if channel.send(&start).await.is_err() {
                return;
            }
            self.start_sent = true;
        }
        self.channel = Some(channel);
        info!("channel up");

        // Replay the unacked tail so the server sees a contiguous sequence.
        for msg in self.buffer.unacked() {
            let frame = self.output_frame(&msg);
            if self.send(&frame).await.is_err() {
                return;
            }
        }
    }

    fn output_frame(&self, msg: &buffer::PendingOutput) -> AgentMessage {
        AgentMessage::Output {
            job_name: self.cfg.job_name.clone(),
            job_instance: self.cfg.job_instance.clone(),
            machine: self.cfg.machine.clone(),
            seq: msg.seq,
            stream: msg.stream,
            data: msg.data.clone(),
            timestamp: Utc::now(),
        }
    }

    async fn send_heartbeat(&mut self) {
        if self.channel.is_none() {
            return;
        }
        let frame = self.cfg.message(|job_name, job_instance, machine| {
            AgentMessage::Heartbeat {
                job_name,
                job_instance,
                machine,
                timestamp: Utc::now(),
            }
        });
        let _ = self.send(&frame).await;
    }

    /// Process every queued server message. Returns true when a kill was
    /// requested.
    async fn drain_inbound(&mut self) -> bool {
        let mut kill = false;
        loop {
            let received = match self.channel.as_mut() {
                None => break,
                Some(channel) => channel.recv(Duration::from_millis(1)).await,
            };
            match received {
                Ok(Some(ServerMessage::Ack { seq })) => self.buffer.ack(seq),
                Ok(Some(ServerMessage::SyncResponse { last_seq })) => {
                    let replay = self.buffer.resync(last_seq);
                    debug!(last_seq, replay = replay.len(), "resync requested");
                    for msg in replay {
                        let frame = self.output_frame(&msg);
                        if self.send(&frame).await.is_err() {
                            break;
                        }
                    }
                }
                Ok(Some(ServerMessage::Kill { .. })) => {
                    warn!("kill received");
                    kill = true;
                    break;
                }
                Ok(None) => break,
                Err(e) => {
                    debug!(error = %e, "channel lost");
                    self.channel = None;
                }
            }
        }
        kill
    }

    /// Send staged output once a flush trigger fired.
    async fn flush_output(&mut self) {
        if self.channel.is_none() || !self.buffer.flush_due() {
            return;
        }
        for msg in self.buffer.flush() {
            let frame = self.output_frame(&msg);
            if self.send(&frame).await.is_err() {
                break;
            }
        }
    }

    async fn send(&mut self, frame: &AgentMessage) -> Result<()> {
        let Some(channel) = self.channel.as_mut() else {
            bail!("channel is down");
        };
        if let Err(e) = channel.send(frame).await {
            debug!(error = %e, "send failed, channel down");
            self.channel = None;
            return Err(e);
        }
        Ok(())
    }

    /// Completion path: pack the tail, then retry `complete` until the
    /// server acknowledges (or cleanly closes on us) or the window elapses.
    async fn report_completion(&mut self, retcode: i32) {
        let deadline = Instant::now() + COMPLETION_WINDOW;
        // Pack any staged remainder exactly once; it stays in the pending
        // buffer across reconnects.
        self.buffer.flush();

        loop {
            self.last_attempt = None;
            self.maintain_connection().await;

            if self.channel.is_some() {
                let mut alive = true;
                for msg in self.buffer.unacked() {
                    let frame = self.output_frame(&msg);
                    if self.send(&frame).await.is_err() {
                        alive = false;
                        break;
                    }
                }
                if alive {
                    let complete = self.cfg.message(|job_name, job_instance, machine| {
                        AgentMessage::Complete {
                            job_name,
                            job_instance,
                            machine,
                            retcode,
                            timestamp: Utc::now(),
                        }
                    });
                    if self.send(&complete).await.is_ok() && self.await_completion_ack().await {
                        info!(retcode, "completion delivered");
                        return;
                    }
                }
            }

            if Instant::now() >= deadline {
                warn!("completion window elapsed, giving up");
                return;
            }
            tokio::time::sleep(RECONNECT_INTERVAL).await;
        }
    }

    /// After `complete` the server answers with a final ack and closes.
    /// Either counts as delivery.
    async fn await_completion_ack(&mut self) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            let received = match self.channel.as_mut() {
                None => return false,
                Some(channel) => channel.recv(Duration::from_millis(500)).await,
            };
            match received {
                Ok(Some(ServerMessage::Ack { seq })) => {
                    self.buffer.ack(seq);
                    return true;
                }
                Ok(Some(ServerMessage::SyncResponse { last_seq })) => {
                    // The server is missing output; resend and re-complete.
                    let _ = self.buffer.resync(last_seq);
                    return false;
                }
                Ok(Some(ServerMessage::Kill { .. })) => {
                    // Already completing; a late kill is a no-op.
                }
                Ok(None) => {}
                Err(_) => {
                    // Closed right after our complete: the server processed
                    // it and hung up.
                    self.channel = None;
                    return true;
                }
            }
        }
        false
    }
}

/// Best-effort fatal report when the command could not even start.
async fn report_fatal(cfg: &AgentConfig, error: &str) {
    let deadline = Instant::now() + Duration::from_secs(30);
    while Instant::now() < deadline {
        if let Ok(mut channel) = Channel::connect(&cfg.websocket_url).await {
            let connect = cfg.message(|job_name, job_instance, machine| {
                AgentMessage::Connect {
                    job_name,
                    job_instance,
                    machine,
                    timestamp: Utc::now(),
                }
            });
            let report = cfg.message(|job_name, job_instance, machine| {
                AgentMessage::Error {
                    job_name,
                    job_instance,
                    machine,
                    error: error.to_string(),
                    timestamp: Utc::now(),
                }
            });
            if channel.send(&connect).await.is_ok() && channel.send(&report).await.is_ok() {
                return;
            }
        }
        tokio::time::sleep(RECONNECT_INTERVAL).await;
    }
}
