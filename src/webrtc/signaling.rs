//! Websocket signalling transport
//!
//! Envelopes travel either as plain JSON text frames (direct mode) or wrapped
//! in a relay message addressed to a relay channel (relayed mode). Both modes
//! deliver decoded envelope text on the same inbound channel.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::types::{Envelope, PeerId, RelayMessage, Role, SIGNALLING_CHANNEL};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportMode {
    /// Straight to the signalling server
    #[default]
    Direct,
    /// Through a relay that multiplexes channels
    Relayed,
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportMode::Direct => write!(f, "direct"),
            TransportMode::Relayed => write!(f, "relayed"),
        }
    }
}

impl std::str::FromStr for TransportMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(TransportMode::Direct),
            "relayed" | "relay" => Ok(TransportMode::Relayed),
            other => Err(format!("unknown transport mode '{}'", other)),
        }
    }
}

/// `[signalling]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignallingConfig {
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default)]
    pub mode: TransportMode,
    /// Relay channel id used in relayed mode
    #[serde(default = "default_relay_channel")]
    pub relay_channel: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    /// Capacity of the inbound envelope queue
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    /// Fixed identity; a fresh one is generated per run when unset
    #[serde(default)]
    pub local_id: Option<String>,
}

fn default_url() -> String {
    "ws://127.0.0.1:8081/signalling".to_string()
}

fn default_relay_channel() -> String {
    SIGNALLING_CHANNEL.to_string()
}

fn default_reconnect_delay_ms() -> u64 {
    2_000
}

fn default_queue_size() -> usize {
    256
}

impl Default for SignallingConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            mode: TransportMode::default(),
            relay_channel: default_relay_channel(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            queue_size: default_queue_size(),
            local_id: None,
        }
    }
}

/// Converts envelopes to websocket messages and back
pub trait Framing: Send + Sync {
    fn encode(&self, envelope: &Envelope) -> crate::Result<Message>;

    /// Envelope text carried by `message`, or `None` if it is not for us
    fn decode(&self, message: Message) -> crate::Result<Option<String>>;
}

pub struct DirectFraming;

impl Framing for DirectFraming {
    fn encode(&self, envelope: &Envelope) -> crate::Result<Message> {
        Ok(Message::Text(envelope.to_json()?.into()))
    }

    fn decode(&self, message: Message) -> crate::Result<Option<String>> {
        match message {
            Message::Text(text) => Ok(Some(text.to_string())),
            Message::Binary(data) => Ok(Some(String::from_utf8(data.to_vec())?)),
            _ => Ok(None),
        }
    }
}

pub struct RelayedFraming {
    channel: String,
}

impl RelayedFraming {
    pub fn new(channel: impl Into<String>) -> Self {
        Self {
            channel: channel.into(),
        }
    }
}

impl Framing for RelayedFraming {
    fn encode(&self, envelope: &Envelope) -> crate::Result<Message> {
        let relay = RelayMessage::wrap(&self.channel, envelope.to_json()?.into_bytes());
        Ok(Message::Binary(serde_json::to_vec(&relay)?.into()))
    }

    fn decode(&self, message: Message) -> crate::Result<Option<String>> {
        let relay: RelayMessage = match message {
            Message::Text(text) => serde_json::from_str(text.as_str())?,
            Message::Binary(data) => serde_json::from_slice(&data)?,
            _ => return Ok(None),
        };
        if relay.meta.id != self.channel {
            return Ok(None);
        }
        Ok(Some(String::from_utf8(relay.body.data)?))
    }
}

pub fn framing_for(config: &SignallingConfig) -> Box<dyn Framing> {
    match config.mode {
        TransportMode::Direct => Box::new(DirectFraming),
        TransportMode::Relayed => Box::new(RelayedFraming::new(config.relay_channel.clone())),
    }
}

/// Channels connecting the transport task to the rest of the process
pub struct SignallingHandle {
    /// Envelopes to send; queued while disconnected
    pub outbound: mpsc::UnboundedSender<Envelope>,
    /// Raw envelope text as received
    pub inbound: mpsc::Receiver<String>,
    pub task: JoinHandle<()>,
}

enum SessionEnd {
    Disconnected,
    Shutdown,
}

pub struct SignallingClient;

impl SignallingClient {
    /// Start the transport task. It reconnects until `shutdown` fires or
    /// every outbound sender is dropped.
    pub fn spawn(
        config: SignallingConfig,
        local: PeerId,
        shutdown: watch::Receiver<bool>,
    ) -> SignallingHandle {
        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound_rx) = mpsc::channel(config.queue_size.max(1));

        let task = tokio::spawn(Self::run(config, local, outbound_rx, inbound_tx, shutdown));

        SignallingHandle {
            outbound: outbound_tx,
            inbound: inbound_rx,
            task,
        }
    }

    async fn run(
        config: SignallingConfig,
        local: PeerId,
        mut outbound_rx: mpsc::UnboundedReceiver<Envelope>,
        inbound_tx: mpsc::Sender<String>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let framing = framing_for(&config);
        let delay = Duration::from_millis(config.reconnect_delay_ms);

        while !*shutdown.borrow() {
            let end = Self::session(
                &config,
                &local,
                framing.as_ref(),
                &mut outbound_rx,
                &inbound_tx,
                &mut shutdown,
            )
            .await;

            match end {
                Ok(SessionEnd::Shutdown) => break,
                Ok(SessionEnd::Disconnected) => warn!("Signalling connection to {} closed", config.url),
                Err(e) => error!("Signalling error on {}: {:#}", config.url, e),
            }

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Signalling transport stopped");
    }

    async fn session(
        config: &SignallingConfig,
        local: &PeerId,
        framing: &dyn Framing,
        outbound_rx: &mut mpsc::UnboundedReceiver<Envelope>,
        inbound_tx: &mpsc::Sender<String>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> Result<SessionEnd> {
        info!("Connecting to signalling server {} ({})", config.url, config.mode);

        let (ws_stream, _) = connect_async(config.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", config.url))?;
        let (mut write, mut read) = ws_stream.split();

        write
            .send(framing.encode(&Envelope::join(local, Role::Consumer))?)
            .await?;
        info!("Joined signalling network as {}", local.short());

        // Received text waiting for room in the inbound queue. The socket is
        // not read while it is set, but outbound keeps draining.
        let mut pending: Option<String> = None;

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        // Flush what is already queued, typically leaveNetwork
                        while let Ok(envelope) = outbound_rx.try_recv() {
                            if let Ok(message) = framing.encode(&envelope) {
                                let _ = write.send(message).await;
                            }
                        }
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    }
                }
                envelope = outbound_rx.recv() => {
                    let Some(envelope) = envelope else {
                        let _ = write.send(Message::Close(None)).await;
                        return Ok(SessionEnd::Shutdown);
                    };
                    match framing.encode(&envelope) {
                        Ok(message) => {
                            write.send(message).await?;
                            debug!(
                                "Sent {} to {}",
                                envelope.command(),
                                envelope.dest.as_ref().map(|d| d.short()).unwrap_or("everyone")
                            );
                        }
                        Err(e) => warn!("Failed to encode {}: {}", envelope.command(), e),
                    }
                }
                permit = inbound_tx.reserve(), if pending.is_some() => {
                    let Ok(permit) = permit else {
                        return Ok(SessionEnd::Shutdown);
                    };
                    if let Some(text) = pending.take() {
                        permit.send(text);
                    }
                }
                message = read.next(), if pending.is_none() => match message {
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Disconnected),
                    Some(Ok(message)) => match framing.decode(message) {
                        Ok(Some(text)) => pending = Some(text),
                        Ok(None) => {}
                        Err(e) => warn!("Undecodable signalling frame: {}", e),
                    },
                    Some(Err(e)) => return Err(e.into()),
                },
            }
        }
    }
}
