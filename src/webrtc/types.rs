//! Signalling wire types shared with the browser toolbox

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Default relay channel id used when signalling is tunnelled through a relay
pub const SIGNALLING_CHANNEL: &str = "signalling";

/// Route tag carried by relay envelopes (unused by the relay itself)
pub const RELAY_ROUTE_TAG: &str = "unused";

/// Generate a random session identifier
pub fn generate_id() -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..30)
        .map(|_| {
            let digit = rng.gen_range(0..36);
            std::char::from_digit(digit, 36).unwrap_or('0')
        })
        .collect()
}

/// Identity of a participant on the signalling rendezvous
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Fresh identity for a new session
    pub fn generate() -> Self {
        Self(generate_id())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(8)
            .map(|(i, _)| i)
            .unwrap_or(self.0.len());
        &self.0[..end]
    }
}

impl std::fmt::Display for PeerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Role announced in `joinNetwork`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Provider,
    Consumer,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Provider => write!(f, "provider"),
            Role::Consumer => write!(f, "consumer"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

/// SDP session description (`{type, sdp}`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub sdp_type: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            sdp_type: SdpType::Answer,
            sdp: sdp.into(),
        }
    }

    pub fn is_offer(&self) -> bool {
        self.sdp_type == SdpType::Offer
    }
}

/// Trickled ICE candidate, field names as in the browser's RTCIceCandidateInit
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
    #[serde(rename = "usernameFragment", default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

/// The closed set of signalling commands
#[derive(Debug, Clone, PartialEq)]
pub enum Signal {
    JoinNetwork { role: Role },
    DiscoverPeers { providers: Vec<PeerId>, consumers: Vec<PeerId> },
    NewDescription(SessionDescription),
    NewIceCandidate(IceCandidate),
    LeaveNetwork,
    /// Command string this build does not understand
    Unknown(String),
}

impl Signal {
    pub fn command(&self) -> &str {
        match self {
            Signal::JoinNetwork { .. } => "joinNetwork",
            Signal::DiscoverPeers { .. } => "discoverPeers",
            Signal::NewDescription(_) => "newDescription",
            Signal::NewIceCandidate(_) => "newIceCandidate",
            Signal::LeaveNetwork => "leaveNetwork",
            Signal::Unknown(command) => command,
        }
    }
}

/// A signalling message between two rendezvous participants
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub src: PeerId,
    pub dest: Option<PeerId>,
    pub signal: Signal,
}

impl Envelope {
    pub fn new(src: PeerId, dest: Option<PeerId>, signal: Signal) -> Self {
        Self { src, dest, signal }
    }

    pub fn join(src: &PeerId, role: Role) -> Self {
        Self::new(src.clone(), None, Signal::JoinNetwork { role })
    }

    pub fn description(src: &PeerId, dest: &PeerId, description: SessionDescription) -> Self {
        Self::new(
            src.clone(),
            Some(dest.clone()),
            Signal::NewDescription(description),
        )
    }

    pub fn candidate(src: &PeerId, dest: &PeerId, candidate: IceCandidate) -> Self {
        Self::new(
            src.clone(),
            Some(dest.clone()),
            Signal::NewIceCandidate(candidate),
        )
    }

    pub fn leave(src: &PeerId, dest: &PeerId) -> Self {
        Self::new(src.clone(), Some(dest.clone()), Signal::LeaveNetwork)
    }

    pub fn command(&self) -> &str {
        self.signal.command()
    }

    /// True when the envelope names a destination other than `local`
    pub fn is_addressed_elsewhere(&self, local: &PeerId) -> bool {
        matches!(&self.dest, Some(dest) if dest != local)
    }

    pub fn parse(text: &str) -> Result<Self> {
        let wire: WireEnvelope = serde_json::from_str(text)?;
        Self::try_from(wire)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(&WireEnvelope::from(self))?)
    }
}

/// Flat JSON shape of an envelope as it travels over the socket
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireEnvelope {
    pub command: String,
    pub src: PeerId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dest: Option<PeerId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub providers: Option<Vec<PeerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consumers: Option<Vec<PeerId>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<SessionDescription>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub candidate: Option<IceCandidate>,
}

impl TryFrom<WireEnvelope> for Envelope {
    type Error = Error;

    fn try_from(wire: WireEnvelope) -> Result<Self> {
        let missing = |field: &str| {
            Error::InvalidEnvelope(format!("{} without {}", wire.command, field))
        };

        let signal = match wire.command.as_str() {
            "joinNetwork" => Signal::JoinNetwork {
                role: wire.role.ok_or_else(|| missing("role"))?,
            },
            "discoverPeers" => Signal::DiscoverPeers {
                providers: wire.providers.clone().unwrap_or_default(),
                consumers: wire.consumers.clone().unwrap_or_default(),
            },
            "newDescription" => Signal::NewDescription(
                wire.description.clone().ok_or_else(|| missing("description"))?,
            ),
            "newIceCandidate" => Signal::NewIceCandidate(
                wire.candidate.clone().ok_or_else(|| missing("candidate"))?,
            ),
            "leaveNetwork" => Signal::LeaveNetwork,
            other => Signal::Unknown(other.to_string()),
        };

        Ok(Envelope {
            src: wire.src,
            dest: wire.dest,
            signal,
        })
    }
}

impl From<&Envelope> for WireEnvelope {
    fn from(envelope: &Envelope) -> Self {
        let mut wire = WireEnvelope {
            command: envelope.command().to_string(),
            src: envelope.src.clone(),
            dest: envelope.dest.clone(),
            ..Default::default()
        };

        match &envelope.signal {
            Signal::JoinNetwork { role } => wire.role = Some(*role),
            Signal::DiscoverPeers {
                providers,
                consumers,
            } => {
                wire.providers = Some(providers.clone());
                wire.consumers = Some(consumers.clone());
            }
            Signal::NewDescription(description) => wire.description = Some(description.clone()),
            Signal::NewIceCandidate(candidate) => wire.candidate = Some(candidate.clone()),
            Signal::LeaveNetwork | Signal::Unknown(_) => {}
        }

        wire
    }
}

/// Outer message understood by the relay when signalling is proxied
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMessage {
    #[serde(rename = "routeTag")]
    pub route_tag: String,
    pub meta: RelayMeta,
    pub body: RelayBody,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayMeta {
    pub id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayBody {
    pub data: Vec<u8>,
}

impl RelayMessage {
    pub fn wrap(channel: &str, payload: Vec<u8>) -> Self {
        Self {
            route_tag: RELAY_ROUTE_TAG.to_string(),
            meta: RelayMeta {
                id: channel.to_string(),
            },
            body: RelayBody { data: payload },
        }
    }
}

/// Negotiation progress of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NegotiationState {
    Idle,
    LocalOfferCreated,
    LocalDescriptionSet,
    RemoteOfferReceived,
    RemoteDescriptionSet,
    LocalAnswerCreated,
    ChannelOpen,
    Closed,
}

impl std::fmt::Display for NegotiationState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NegotiationState::Idle => "idle",
            NegotiationState::LocalOfferCreated => "local-offer-created",
            NegotiationState::LocalDescriptionSet => "local-description-set",
            NegotiationState::RemoteOfferReceived => "remote-offer-received",
            NegotiationState::RemoteDescriptionSet => "remote-description-set",
            NegotiationState::LocalAnswerCreated => "local-answer-created",
            NegotiationState::ChannelOpen => "channel-open",
            NegotiationState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Ready state of a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl ChannelState {
    /// Connecting or open: a new attempt would only compete with it
    pub fn is_live(self) -> bool {
        matches!(self, ChannelState::Connecting | ChannelState::Open)
    }
}

/// Runtime options for peer connections
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RtcConfig {
    /// STUN/TURN urls for NAT traversal
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Label of the frame data channel
    #[serde(default = "default_channel_label")]
    pub channel_label: String,
    /// Negotiations that have not opened a channel by then are torn down
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
    /// How often stalled negotiations are looked for
    #[serde(default = "default_reap_interval_ms")]
    pub reap_interval_ms: u64,
}

fn default_stun_servers() -> Vec<String> {
    vec![
        "stun:stun.l.google.com:19302".to_string(),
        "stun:stun.cloudflare.com:3478".to_string(),
    ]
}

fn default_channel_label() -> String {
    "frames".to_string()
}

fn default_negotiation_timeout_ms() -> u64 {
    30_000
}

fn default_reap_interval_ms() -> u64 {
    5_000
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            stun_servers: default_stun_servers(),
            channel_label: default_channel_label(),
            negotiation_timeout_ms: default_negotiation_timeout_ms(),
            reap_interval_ms: default_reap_interval_ms(),
        }
    }
}
