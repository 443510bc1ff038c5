//! One negotiated connection to a remote toolbox participant

use anyhow::{bail, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch, Mutex};
use tracing::{debug, info, trace, warn};

use super::native::{ChannelOptions, ConnectionFactory, DataChannel, LinkState, NativeConnection, NativeEvent};
use super::types::{ChannelState, Envelope, NegotiationState, PeerId, RtcConfig, Signal};
use crate::error::Error;
use crate::frame::FrameDecoder;
use crate::media::{spawn_playback, AutoplayPolicy, MediaCapture, PlaybackFactory};

/// Everything a new peer connection is wired to
#[derive(Clone)]
pub struct PeerContext {
    pub local: PeerId,
    pub factory: Arc<dyn ConnectionFactory>,
    /// Envelopes for the signalling transport; never blocks the caller
    pub outbound: mpsc::UnboundedSender<Envelope>,
    pub media: Arc<MediaCapture>,
    pub frames: Arc<FrameDecoder>,
    pub playback: Arc<dyn PlaybackFactory>,
    pub config: RtcConfig,
    pub autoplay: AutoplayPolicy,
}

/// State reachable from the event pump
struct PeerShared {
    local: PeerId,
    remote: PeerId,
    state: watch::Sender<NegotiationState>,
    send_channel: Mutex<Option<Arc<dyn DataChannel>>>,
    outbound: mpsc::UnboundedSender<Envelope>,
    frames: Arc<FrameDecoder>,
    playback: Arc<dyn PlaybackFactory>,
    autoplay: AutoplayPolicy,
    /// Flipped on close; stops pending autoplay retries
    cancel: watch::Sender<bool>,
}

impl PeerShared {
    fn is_closed(&self) -> bool {
        *self.state.borrow() == NegotiationState::Closed
    }

    /// Move to `next` unless closed. An open channel only gives way to `Closed`.
    fn advance(&self, next: NegotiationState) -> bool {
        self.state.send_if_modified(|current| {
            let allowed = match *current {
                NegotiationState::Closed => false,
                NegotiationState::ChannelOpen => next == NegotiationState::Closed,
                _ => *current != next,
            };
            if allowed {
                trace!("[Peer {}] {} -> {}", self.remote.short(), current, next);
                *current = next;
            }
            allowed
        })
    }

    async fn handle_event(&self, event: NativeEvent) {
        let peer = self.remote.short();
        match event {
            NativeEvent::IceCandidate(candidate) => {
                let envelope = Envelope::candidate(&self.local, &self.remote, candidate);
                if self.outbound.send(envelope).is_err() {
                    debug!("[Peer {}] Signalling gone, dropping local candidate", peer);
                }
            }
            NativeEvent::DataChannel(channel) => {
                let mut send_channel = self.send_channel.lock().await;
                if let Some(current) = send_channel.as_ref() {
                    if current.state().is_live() {
                        debug!(
                            "[Peer {}] Keeping own channel '{}', ignoring remote '{}'",
                            peer,
                            current.label(),
                            channel.label()
                        );
                        return;
                    }
                }
                info!("[Peer {}] Received data channel '{}'", peer, channel.label());
                let open = channel.state() == ChannelState::Open;
                *send_channel = Some(channel);
                drop(send_channel);
                if open {
                    self.advance(NegotiationState::ChannelOpen);
                }
            }
            NativeEvent::ChannelOpen(label) => {
                if self.advance(NegotiationState::ChannelOpen) {
                    info!("[Peer {}] Data channel '{}' open", peer, label);
                }
            }
            NativeEvent::ChannelClosed(label) => {
                debug!("[Peer {}] Data channel '{}' closed", peer, label);
            }
            NativeEvent::Message(payload) => {
                self.frames.handle(&payload);
            }
            NativeEvent::Track(remote) => {
                info!("[Peer {}] Remote audio track {}", peer, remote.track_id);
                spawn_playback(
                    remote,
                    self.playback.clone(),
                    self.autoplay.clone(),
                    self.cancel.subscribe(),
                );
            }
            NativeEvent::Link(LinkState::Failed) => {
                warn!("[Peer {}] Connection failed", peer);
            }
            NativeEvent::Link(state) => {
                debug!("[Peer {}] Connection state: {:?}", peer, state);
            }
        }
    }
}

/// Single consumer of native callbacks for one peer
async fn pump_events(shared: Arc<PeerShared>, mut events: mpsc::UnboundedReceiver<NativeEvent>) {
    while let Some(event) = events.recv().await {
        if shared.is_closed() {
            break;
        }
        shared.handle_event(event).await;
    }
    trace!("[Peer {}] Event pump finished", shared.remote.short());
}

/// WebRTC peer connection with its negotiation state machine
pub struct PeerConnection {
    remote: PeerId,
    local: PeerId,
    offered: bool,
    created_at: Instant,
    channel_label: String,
    native: Option<Arc<dyn NativeConnection>>,
    shared: Arc<PeerShared>,
}

impl PeerConnection {
    /// Build the native connection and start consuming its events
    pub async fn new(ctx: &PeerContext, remote: PeerId) -> Result<Self> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let native = ctx.factory.create(events_tx).await?;

        if ctx.media.has_audio() {
            if let Err(e) = native.add_local_audio(&ctx.media).await {
                warn!("[Peer {}] Failed to attach local audio: {}", remote.short(), e);
            }
        }

        let (state, _) = watch::channel(NegotiationState::Idle);
        let (cancel, _) = watch::channel(false);
        let shared = Arc::new(PeerShared {
            local: ctx.local.clone(),
            remote: remote.clone(),
            state,
            send_channel: Mutex::new(None),
            outbound: ctx.outbound.clone(),
            frames: ctx.frames.clone(),
            playback: ctx.playback.clone(),
            autoplay: ctx.autoplay.clone(),
            cancel,
        });

        tokio::spawn(pump_events(shared.clone(), events_rx));

        Ok(Self {
            remote,
            local: ctx.local.clone(),
            offered: false,
            created_at: Instant::now(),
            channel_label: ctx.config.channel_label.clone(),
            native: Some(native),
            shared,
        })
    }

    pub fn remote(&self) -> &PeerId {
        &self.remote
    }

    /// Whether this side created the offer
    pub fn offered(&self) -> bool {
        self.offered
    }

    pub fn state(&self) -> NegotiationState {
        *self.shared.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<NegotiationState> {
        self.shared.state.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn elapsed(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Ready state of the send channel, if there is one yet
    pub async fn channel_state(&self) -> Option<ChannelState> {
        self.shared
            .send_channel
            .lock()
            .await
            .as_ref()
            .map(|channel| channel.state())
    }

    fn native(&self) -> Result<Arc<dyn NativeConnection>> {
        self.native.clone().ok_or_else(|| Error::Closed.into())
    }

    /// Result of an await that finished after `close()` is discarded
    fn closed_meanwhile(&self, step: &str) -> bool {
        let closed = self.shared.is_closed();
        if closed {
            debug!("[Peer {}] Closed during {}, dropping result", self.remote.short(), step);
        }
        closed
    }

    /// Offer side: create the frame channel and send an offer
    pub async fn connect(&mut self) -> Result<()> {
        let native = self.native()?;

        let channel = native
            .create_data_channel(&self.channel_label, ChannelOptions::unreliable())
            .await?;
        if self.closed_meanwhile("channel creation") {
            let _ = channel.close().await;
            return Ok(());
        }
        *self.shared.send_channel.lock().await = Some(channel);
        self.offered = true;

        let offer = native.create_offer().await?;
        if self.closed_meanwhile("offer") {
            return Ok(());
        }
        self.shared.advance(NegotiationState::LocalOfferCreated);

        native.set_local_description(offer.clone()).await?;
        if self.closed_meanwhile("set local offer") {
            return Ok(());
        }
        self.shared.advance(NegotiationState::LocalDescriptionSet);

        self.shared
            .outbound
            .send(Envelope::description(&self.local, &self.remote, offer))
            .map_err(|_| Error::Transport("signalling transport is gone".to_string()))?;
        info!("[Peer {}] Sent offer", self.remote.short());
        Ok(())
    }

    /// Apply a description or candidate from the remote side
    pub async fn on_signal(&mut self, signal: &Signal) -> Result<()> {
        if self.shared.is_closed() {
            debug!(
                "[Peer {}] Ignoring {} for closed connection",
                self.remote.short(),
                signal.command()
            );
            return Ok(());
        }
        let native = self.native()?;

        match signal {
            Signal::NewIceCandidate(candidate) => {
                if let Err(e) = native.add_ice_candidate(candidate.clone()).await {
                    warn!("[Peer {}] Failed to add ICE candidate: {}", self.remote.short(), e);
                }
            }
            Signal::NewDescription(description) if self.offered => {
                native.set_remote_description(description.clone()).await?;
                if self.closed_meanwhile("set remote answer") {
                    return Ok(());
                }
                self.shared.advance(NegotiationState::RemoteDescriptionSet);
                debug!("[Peer {}] Applied {:?}", self.remote.short(), description.sdp_type);
            }
            Signal::NewDescription(description) => {
                self.shared.advance(NegotiationState::RemoteOfferReceived);

                native.set_remote_description(description.clone()).await?;
                if self.closed_meanwhile("set remote offer") {
                    return Ok(());
                }
                self.shared.advance(NegotiationState::RemoteDescriptionSet);

                let answer = native.create_answer().await?;
                if self.closed_meanwhile("answer") {
                    return Ok(());
                }
                self.shared.advance(NegotiationState::LocalAnswerCreated);

                native.set_local_description(answer.clone()).await?;
                if self.closed_meanwhile("set local answer") {
                    return Ok(());
                }
                self.shared.advance(NegotiationState::LocalDescriptionSet);

                self.shared
                    .outbound
                    .send(Envelope::description(&self.local, &self.remote, answer))
                    .map_err(|_| Error::Transport("signalling transport is gone".to_string()))?;
                info!("[Peer {}] Sent answer", self.remote.short());
            }
            other => {
                debug!("[Peer {}] Not a negotiation signal: {}", self.remote.short(), other.command());
            }
        }
        Ok(())
    }

    /// Send one frame over the send channel
    pub async fn send_frame(&self, payload: &Bytes) -> Result<()> {
        let channel = self.shared.send_channel.lock().await.clone();
        match channel {
            Some(channel) if channel.state() == ChannelState::Open => channel.send(payload).await,
            Some(channel) => bail!(
                "channel to {} is {:?}",
                self.remote.short(),
                channel.state()
            ),
            None => bail!("no channel to {}", self.remote.short()),
        }
    }

    /// Tell the remote side we are leaving, then close. Idempotent.
    pub async fn disconnect(&mut self) {
        if self.shared.is_closed() {
            return;
        }
        let leave = Envelope::leave(&self.local, &self.remote);
        if self.shared.outbound.send(leave).is_err() {
            debug!("[Peer {}] Signalling gone, leave not sent", self.remote.short());
        }
        self.close().await;
    }

    /// Tear down without notifying the remote side. Idempotent.
    pub async fn close(&mut self) {
        if !self.shared.advance(NegotiationState::Closed) {
            return;
        }
        self.shared.cancel.send_replace(true);

        let channel = self.shared.send_channel.lock().await.take();
        if let Some(channel) = channel {
            if let Err(e) = channel.close().await {
                debug!("[Peer {}] Error closing data channel: {}", self.remote.short(), e);
            }
        }

        if let Some(native) = self.native.take() {
            if let Err(e) = native.close().await {
                debug!("[Peer {}] Error closing connection: {}", self.remote.short(), e);
            }
        }

        info!("[Peer {}] Closed", self.remote.short());
    }
}
