//! Agent side of the websocket channel.
//!
//! Thin wrapper over `tokio-tungstenite`: JSON text frames, short connect
//! timeout, non-blocking receive. Connection failures are returned to the
//! caller, which owns the retry loop — the command keeps running whether or
//! not the channel is up.

use anyhow::{bail, Context, Result};
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

use crate::protocol::{AgentMessage, ServerMessage};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct Channel {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl Channel {
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, tokio_tungstenite::connect_async(url))
            .await
            .context("channel connect timed out")?
            .context("channel connect failed")?;
        debug!(url, "channel connected");
        Ok(Self { ws })
    }

    pub async fn send(&mut self, msg: &AgentMessage) -> Result<()> {
        let json = serde_json::to_string(msg).context("serialising frame")?;
        self.ws
            .send(Message::Text(json))
            .await
            .context("channel send failed")
    }

    /// Wait up to `wait` for one server message. `Ok(None)` means nothing
    /// arrived in time; an error means the connection is gone.
    pub async fn recv(&mut self, wait: Duration) -> Result<Option<ServerMessage>> {
        let frame = match tokio::time::timeout(wait, self.ws.next()).await {
            Err(_) => return Ok(None),
            Ok(None) => bail!("channel closed"),
            Ok(Some(frame)) => frame.context("channel receive failed")?,
        };
        match frame {
            Message::Text(text) => match serde_json::from_str::<ServerMessage>(&text) {
                Ok(msg) => Ok(Some(msg)),
                Err(e) => {
                    debug!(error = %e, "ignoring unparseable server frame");
                    Ok(None)
                }
            },
            Message::Close(_) => bail!("channel closed by server"),
            // Pings are answered by the library on the next flush.
            _ => Ok(None),
        }
    }
}
