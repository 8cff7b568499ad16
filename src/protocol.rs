//! Agent channel wire protocol.
//!
//! Every frame on the channel is a JSON object with a `type` tag. Agents
//! send [`AgentMessage`], the scheduler answers with [`ServerMessage`].
//! Output frames carry a per-(instance, machine) sequence number starting
//! at 1; the server acknowledges cumulatively and requests retransmission
//! with `sync_response` whenever it sees a gap or a duplicate.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutputStream {
    Stdout,
    Stderr,
}

impl std::fmt::Display for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OutputStream::Stdout => write!(f, "stdout"),
            OutputStream::Stderr => write!(f, "stderr"),
        }
    }
}

/// Messages sent by an agent to the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentMessage {
    Connect {
        job_name: String,
        job_instance: String,
        machine: String,
        timestamp: DateTime<Utc>,
    },
    Start {
        job_name: String,
        job_instance: String,
        machine: String,
        pid: u32,
        timestamp: DateTime<Utc>,
    },
    Output {
        job_name: String,
        job_instance: String,
        machine: String,
        seq: u64,
        stream: OutputStream,
        data: String,
        timestamp: DateTime<Utc>,
    },
    Heartbeat {
        job_name: String,
        job_instance: String,
        machine: String,
        timestamp: DateTime<Utc>,
    },
    Complete {
        job_name: String,
        job_instance: String,
        machine: String,
        retcode: i32,
        timestamp: DateTime<Utc>,
    },
    Error {
        job_name: String,
        job_instance: String,
        machine: String,
        error: String,
        timestamp: DateTime<Utc>,
    },
}

impl AgentMessage {
    /// The `(job_name, job_instance, machine)` identity carried by every frame.
    pub fn identity(&self) -> (&str, &str, &str) {
        match self {
            AgentMessage::Connect { job_name, job_instance, machine, .. }
            | AgentMessage::Start { job_name, job_instance, machine, .. }
            | AgentMessage::Output { job_name, job_instance, machine, .. }
            | AgentMessage::Heartbeat { job_name, job_instance, machine, .. }
            | AgentMessage::Complete { job_name, job_instance, machine, .. }
            | AgentMessage::Error { job_name, job_instance, machine, .. } => {
                (job_name, job_instance, machine)
            }
        }
    }
}

/// Messages sent by the scheduler to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Cumulative acknowledgement: every output seq `<= seq` has been received.
    Ack { seq: u64 },
    /// The server has a contiguous prefix up to `last_seq`; replay from
    /// `last_seq + 1`.
    SyncResponse { last_seq: u64 },
    /// Terminate the running command (SIGTERM, then SIGKILL after 5s).
    Kill { timestamp: DateTime<Utc> },
}
