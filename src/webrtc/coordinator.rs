//! Routes signalling envelopes to per-peer connections
//!
//! The coordinator owns at most one `PeerConnection` per remote id. Envelopes
//! are applied one at a time, in arrival order, so every peer sees its
//! signals in the order the rendezvous delivered them.

use anyhow::Result;
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch, RwLock};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, trace, warn};

use super::peer::{PeerConnection, PeerContext};
use super::types::{ChannelState, Envelope, NegotiationState, PeerId, Role, Signal};
use crate::media::MediaCapture;

pub struct Coordinator {
    ctx: PeerContext,
    /// At most one entry per remote id; only the coordinator touches it
    peers: RwLock<HashMap<PeerId, PeerConnection>>,
}

impl Coordinator {
    pub fn new(ctx: PeerContext) -> Self {
        Self {
            ctx,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn local_id(&self) -> &PeerId {
        &self.ctx.local
    }

    pub fn media(&self) -> &Arc<MediaCapture> {
        &self.ctx.media
    }

    /// Mute or unmute the local stream for every peer at once
    pub fn set_muted(&self, muted: bool) {
        self.ctx.media.set_muted(muted);
    }

    /// Entry point for raw text from the signalling transport
    pub async fn on_message(&self, text: &str) {
        match Envelope::parse(text) {
            Ok(envelope) => self.on_envelope(envelope).await,
            Err(e) => warn!("Dropping malformed envelope: {}", e),
        }
    }

    pub async fn on_envelope(&self, envelope: Envelope) {
        let local = &self.ctx.local;

        if envelope.is_addressed_elsewhere(local) {
            trace!("Ignoring {} for another participant", envelope.command());
            return;
        }
        if envelope.src == *local {
            trace!("Ignoring echo of our own {}", envelope.command());
            return;
        }

        debug!("Received {} from {}", envelope.command(), envelope.src.short());

        let Envelope { src, dest, signal } = envelope;
        match signal {
            Signal::JoinNetwork {
                role: Role::Provider,
            } => {
                info!("Provider {} joined", src.short());
                self.init_connection(&src).await;
            }
            Signal::JoinNetwork {
                role: Role::Consumer,
            } => {
                debug!("Consumer {} joined, waiting for discovery", src.short());
            }
            Signal::DiscoverPeers {
                providers,
                consumers,
            } => {
                if dest.as_ref() != Some(local) {
                    debug!("Ignoring discoverPeers not addressed to us");
                    return;
                }
                info!(
                    "Discovered {} provider(s) and {} consumer(s)",
                    providers.len(),
                    consumers.len()
                );
                for peer in providers.iter().chain(consumers.iter()) {
                    if peer != local {
                        self.init_connection(peer).await;
                    }
                }
            }
            Signal::LeaveNetwork => {
                let removed = self.peers.write().await.remove(&src);
                if let Some(mut peer) = removed {
                    info!("Peer {} left", src.short());
                    peer.close().await;
                }
            }
            signal @ (Signal::NewDescription(_) | Signal::NewIceCandidate(_)) => {
                self.route_signal(&src, signal).await;
            }
            Signal::Unknown(command) => {
                debug!("Ignoring unknown command '{}' from {}", command, src.short());
            }
        }
    }

    /// Offer a connection to `remote` unless one is live or the remote side
    /// is expected to offer
    pub async fn init_connection(&self, remote: &PeerId) {
        if *remote == self.ctx.local {
            return;
        }

        let mut peers = self.peers.write().await;

        if let Some(existing) = peers.get(remote) {
            if let Some(channel) = existing.channel_state().await {
                if channel.is_live() {
                    debug!("Channel to {} already {:?}", remote.short(), channel);
                    return;
                }
            }
            if !existing.offered() && !existing.is_closed() {
                debug!("Waiting for {} to finish its offer", remote.short());
                return;
            }
        }

        if let Some(mut stale) = peers.remove(remote) {
            debug!("Replacing stale connection to {}", remote.short());
            stale.close().await;
        }

        info!("Initiating connection to {}", remote.short());
        let mut peer = match PeerConnection::new(&self.ctx, remote.clone()).await {
            Ok(peer) => peer,
            Err(e) => {
                warn!("Failed to create connection to {}: {:#}", remote.short(), e);
                return;
            }
        };

        if let Err(e) = peer.connect().await {
            warn!("Failed to offer to {}: {:#}", remote.short(), e);
            peer.close().await;
            return;
        }
        peers.insert(remote.clone(), peer);
    }

    async fn route_signal(&self, src: &PeerId, signal: Signal) {
        let mut peers = self.peers.write().await;

        if let Signal::NewDescription(description) = &signal {
            if description.is_offer() {
                if let Some(existing) = peers.get(src) {
                    let colliding = existing.offered()
                        && !existing.is_closed()
                        && existing.state() != NegotiationState::ChannelOpen;

                    if colliding && self.ctx.local < *src {
                        info!("Offer collision with {}: keeping ours", src.short());
                        return;
                    }
                    if colliding || existing.is_closed() {
                        if colliding {
                            info!("Offer collision with {}: answering theirs", src.short());
                        }
                        if let Some(mut ours) = peers.remove(src) {
                            ours.close().await;
                        }
                    }
                }
            }
        }

        if !peers.contains_key(src) {
            match PeerConnection::new(&self.ctx, src.clone()).await {
                Ok(peer) => {
                    peers.insert(src.clone(), peer);
                }
                Err(e) => {
                    warn!("Failed to create connection to {}: {:#}", src.short(), e);
                    return;
                }
            }
        }

        if let Some(peer) = peers.get_mut(src) {
            if let Err(e) = peer.on_signal(&signal).await {
                warn!(
                    "Negotiation with {} failed on {}: {:#}",
                    src.short(),
                    signal.command(),
                    e
                );
            }
        }
    }

    /// Send `leaveNetwork` to `remote` and drop its connection
    pub async fn disconnect(&self, remote: &PeerId) -> bool {
        let removed = self.peers.write().await.remove(remote);
        match removed {
            Some(mut peer) => {
                peer.disconnect().await;
                true
            }
            None => false,
        }
    }

    pub async fn disconnect_all(&self) {
        let peers: Vec<PeerConnection> = {
            let mut peers = self.peers.write().await;
            peers.drain().map(|(_, peer)| peer).collect()
        };
        if !peers.is_empty() {
            info!("Disconnecting {} peer(s)", peers.len());
        }
        for mut peer in peers {
            peer.disconnect().await;
        }
    }

    /// Drop connections that never opened their channel in time, or whose
    /// channel has since died. Returns how many were removed.
    pub async fn reap_stalled(&self) -> usize {
        let timeout = Duration::from_millis(self.ctx.config.negotiation_timeout_ms);
        let mut peers = self.peers.write().await;

        let mut stalled = Vec::new();
        for (id, peer) in peers.iter() {
            let dead = match peer.state() {
                NegotiationState::Closed => true,
                NegotiationState::ChannelOpen => matches!(
                    peer.channel_state().await,
                    Some(ChannelState::Closing | ChannelState::Closed)
                ),
                _ => peer.elapsed() >= timeout,
            };
            if dead {
                stalled.push(id.clone());
            }
        }

        for id in &stalled {
            if let Some(mut peer) = peers.remove(id) {
                info!("Reaping connection to {} ({})", id.short(), peer.state());
                peer.disconnect().await;
            }
        }
        stalled.len()
    }

    /// Send a frame to one peer over its data channel
    pub async fn send_frame(&self, remote: &PeerId, payload: &Bytes) -> Result<()> {
        let peers = self.peers.read().await;
        let peer = peers
            .get(remote)
            .ok_or_else(|| anyhow::anyhow!("no connection to {}", remote.short()))?;
        peer.send_frame(payload).await
    }

    pub async fn peer_count(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn peer_ids(&self) -> Vec<PeerId> {
        let mut ids: Vec<PeerId> = self.peers.read().await.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub async fn peer_state(&self, remote: &PeerId) -> Option<NegotiationState> {
        self.peers.read().await.get(remote).map(|p| p.state())
    }

    pub async fn channel_state(&self, remote: &PeerId) -> Option<ChannelState> {
        let peers = self.peers.read().await;
        match peers.get(remote) {
            Some(peer) => peer.channel_state().await,
            None => None,
        }
    }

    pub async fn is_offered(&self, remote: &PeerId) -> Option<bool> {
        self.peers.read().await.get(remote).map(|p| p.offered())
    }

    /// Process signalling until shutdown, then disconnect everyone
    pub async fn run(
        &self,
        mut inbound: mpsc::Receiver<String>,
        mut shutdown: watch::Receiver<bool>,
    ) -> Result<()> {
        info!("Starting coordinator as {}", self.ctx.local.short());

        let interval = Duration::from_millis(self.ctx.config.reap_interval_ms.max(1));
        let mut reaper = tokio::time::interval(interval);
        reaper.set_missed_tick_behavior(MissedTickBehavior::Delay);

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            info!("Coordinator shutting down");
                            break;
                        }
                    }
                    message = inbound.recv() => match message {
                        Some(text) => self.on_message(&text).await,
                        None => {
                            info!("Signalling transport closed");
                            break;
                        }
                    },
                    _ = reaper.tick() => {
                        let reaped = self.reap_stalled().await;
                        if reaped > 0 {
                            debug!("Reaped {} stalled connection(s)", reaped);
                        }
                    }
                }
            }
        }

        self.disconnect_all().await;
        Ok(())
    }
}
