//! Per-agent websocket session actor.
//!
//! Each inbound agent connection gets one `AgentSession`. The session
//! enforces the frame identity declared by `connect`, keeps the output
//! sequence contiguous (ack in order, `sync_response` on any gap or
//! duplicate) and writes every observation into the shared state, where the
//! monitor picks it up.

use actix::{Actor, ActorContext, AsyncContext, Handler, Message as ActixMessage, StreamHandler};
use actix_web::{web, Error, HttpRequest, HttpResponse};
use actix_web_actors::ws;
use chrono::Utc;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::error::ProtocolError;
use crate::protocol::{AgentMessage, ServerMessage};
use crate::state::{OutputDisposition, StateStore};

use super::registry::{ConnKey, ConnectionRegistry};
use super::ServerContext;

/// Websocket-level ping cadence; application liveness is the monitor's job.
const PING_INTERVAL: Duration = Duration::from_secs(5);
/// A socket silent for this long is closed; the agent will reconnect.
const SOCKET_TIMEOUT: Duration = Duration::from_secs(30);

pub struct AgentSession {
    state: Arc<StateStore>,
    registry: Arc<ConnectionRegistry>,
    job_name: Option<String>,
    key: Option<ConnKey>,
    last_frame: Instant,
}

impl AgentSession {
    fn new(state: Arc<StateStore>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            state,
            registry,
            job_name: None,
            key: None,
            last_frame: Instant::now(),
        }
    }

    fn send(&self, ctx: &mut ws::WebsocketContext<Self>, msg: &ServerMessage) {
        if let Ok(json) = serde_json::to_string(msg) {
            ctx.text(json);
        }
    }

    /// Every frame after `connect` must carry the identity the connection
    /// was registered with; anything else is a protocol error and closes
    /// the connection.
    fn check_identity(&self, msg: &AgentMessage) -> Result<(), ProtocolError> {
        let (job_name, job_instance, machine) = msg.identity();
        match (&self.job_name, &self.key) {
            (Some(name), Some(key)) => {
                if name == job_name
                    && key.job_instance == job_instance
                    && key.machine == machine
                {
                    Ok(())
                } else {
                    Err(ProtocolError::IdentityMismatch {
                        expected: format!("{name}/{}/{}", key.job_instance, key.machine),
                        got: format!("{job_name}/{job_instance}/{machine}"),
                    })
                }
            }
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn handle_agent_message(&mut self, msg: AgentMessage, ctx: &mut ws::WebsocketContext<Self>) {
        if let AgentMessage::Connect { job_name, job_instance, machine, .. } = &msg {
            self.job_name = Some(job_name.clone());
            let key = ConnKey {
                job_instance: job_instance.clone(),
                machine: machine.clone(),
            };
            self.registry
                .register(key.clone(), job_name.clone(), ctx.address());
            self.key = Some(key);
            info!(instance = %job_instance, machine = %machine, "agent connected");

            // Resumption: tell the agent how far we already got so it can
            // replay from last_seq + 1.
            let last_seq = {
                let cell = self.state.job(job_name);
                let state = cell.lock().unwrap();
                state.results.get(machine).map(|r| r.last_seq)
            };
            if let Some(last_seq) = last_seq {
                self.send(ctx, &ServerMessage::SyncResponse { last_seq });
            }
            return;
        }

        if let Err(e) = self.check_identity(&msg) {
            warn!(error = %e, "protocol violation, closing connection");
            ctx.stop();
            return;
        }
        let job_name = self.job_name.clone().unwrap();
        let key = self.key.clone().unwrap();
        let now = Utc::now();

        match msg {
            AgentMessage::Connect { .. } => unreachable!("handled above"),

            AgentMessage::Start { pid, .. } => {
                info!(instance = %key.job_instance, machine = %key.machine, pid, "command started");
                self.state.record_start(&job_name, &key.machine, now);
            }

            AgentMessage::Output { seq, data, stream, .. } => {
                let reply = match self
                    .state
                    .apply_output(&job_name, &key.machine, seq, &data, now)
                {
                    OutputDisposition::Appended { ack } => {
                        debug!(
                            instance = %key.job_instance,
                            machine = %key.machine,
                            seq,
                            stream = %stream,
                            bytes = data.len(),
                            "output appended"
                        );
                        ServerMessage::Ack { seq: ack }
                    }
                    OutputDisposition::Frozen { ack } => ServerMessage::Ack { seq: ack },
                    OutputDisposition::OutOfSync { last_seq } => {
                        debug!(
                            instance = %key.job_instance,
                            machine = %key.machine,
                            seq,
                            expected = last_seq + 1,
                            "out-of-sequence output"
                        );
                        ServerMessage::SyncResponse { last_seq }
                    }
                };
                self.send(ctx, &reply);
            }

            AgentMessage::Heartbeat { .. } => {
                self.state.record_heartbeat(&job_name, &key.machine, now);
            }

            AgentMessage::Complete { retcode, .. } => {
                let finalized =
                    self.state
                        .finalize_target(&job_name, &key.machine, retcode, None, now);
                if finalized {
                    info!(instance = %key.job_instance, machine = %key.machine, retcode, "target completed");
                } else {
                    // Already timed out or heartbeat-failed; first write wins.
                    debug!(instance = %key.job_instance, machine = %key.machine, retcode, "late complete ignored");
                }
                let last_seq = {
                    let cell = self.state.job(&job_name);
                    let state = cell.lock().unwrap();
                    state.results.get(&key.machine).map(|r| r.last_seq).unwrap_or(0)
                };
                self.send(ctx, &ServerMessage::Ack { seq: last_seq });
                ctx.close(None);
                ctx.stop();
            }

            AgentMessage::Error { error, .. } => {
                warn!(instance = %key.job_instance, machine = %key.machine, error = %error, "agent reported a fatal error");
                self.state.finalize_target(
                    &job_name,
                    &key.machine,
                    255,
                    Some(&format!("[SALTPETER ERROR: {error}]")),
                    now,
                );
                ctx.close(None);
                ctx.stop();
            }
        }
    }
}

impl Actor for AgentSession {
    type Context = ws::WebsocketContext<Self>;

    fn started(&mut self, ctx: &mut Self::Context) {
        ctx.run_interval(PING_INTERVAL, |act, ctx| {
            if Instant::now().duration_since(act.last_frame) > SOCKET_TIMEOUT {
                warn!("agent socket silent too long, closing");
                ctx.stop();
                return;
            }
            ctx.ping(b"");
        });
    }

    fn stopped(&mut self, ctx: &mut Self::Context) {
        if let Some(key) = &self.key {
            // Do not finalise here: the agent may reconnect and resume; if
            // it does not, the monitor fails the target on heartbeat loss.
            self.registry.unregister(key, &ctx.address());
            info!(instance = %key.job_instance, machine = %key.machine, "agent connection closed");
        }
    }
}

impl StreamHandler<Result<ws::Message, ws::ProtocolError>> for AgentSession {
    fn handle(&mut self, msg: Result<ws::Message, ws::ProtocolError>, ctx: &mut Self::Context) {
        self.last_frame = Instant::now();
        match msg {
            Ok(ws::Message::Text(text)) => match serde_json::from_str::<AgentMessage>(&text) {
                Ok(msg) => self.handle_agent_message(msg, ctx),
                Err(e) => {
                    // Bad JSON: log and close this connection, never crash
                    // the server.
                    warn!(error = %ProtocolError::BadFrame(e), "closing connection");
                    ctx.stop();
                }
            },
            Ok(ws::Message::Ping(payload)) => ctx.pong(&payload),
            Ok(ws::Message::Pong(_)) => {}
            Ok(ws::Message::Close(reason)) => {
                debug!(?reason, "agent closed the socket");
                ctx.stop();
            }
            Ok(ws::Message::Binary(_)) => {
                warn!("binary frames are not part of the protocol");
            }
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "websocket protocol error");
                ctx.stop();
            }
        }
    }
}

/// Kill delivery from the command-queue poller.
#[derive(ActixMessage)]
#[rtype(result = "()")]
pub struct KillSignal;

impl Handler<KillSignal> for AgentSession {
    type Result = ();

    fn handle(&mut self, _msg: KillSignal, ctx: &mut Self::Context) {
        self.send(
            ctx,
            &ServerMessage::Kill {
                timestamp: Utc::now(),
            },
        );
    }
}

/// Route handler for inbound agent connections.
pub async fn agent_ws(
    req: HttpRequest,
    stream: web::Payload,
    ctx: web::Data<ServerContext>,
) -> Result<HttpResponse, Error> {
    let session = AgentSession::new(Arc::clone(&ctx.state), Arc::clone(&ctx.registry));
    ws::start(session, &req, stream)
}
