//! WebRTC signalling and peer-connection coordination
//!
//! A consumer joins the signalling rendezvous, learns about providers from
//! `joinNetwork` and `discoverPeers` envelopes, and negotiates one peer
//! connection per remote id:
//! - commands: joinNetwork, discoverPeers, newDescription, newIceCandidate, leaveNetwork
//! - frames arrive on an unordered, unreliable data channel
//! - audio is exchanged on the same connection

mod coordinator;
mod native;
mod peer;
mod signaling;
mod types;


pub use coordinator::Coordinator;
pub use native::{
    ChannelOptions, ConnectionFactory, DataChannel, LinkState, NativeConnection, NativeEvent,
    WebRtcFactory,
};
pub use peer::{PeerConnection, PeerContext};
pub use signaling::{
    framing_for, DirectFraming, Framing, RelayedFraming, SignallingClient, SignallingConfig,
    SignallingHandle, TransportMode,
};
pub use types::{
    generate_id, ChannelState, Envelope, IceCandidate, NegotiationState, PeerId, RelayBody,
    RelayMessage, RelayMeta, Role, RtcConfig, SdpType, SessionDescription, Signal, WireEnvelope,
    RELAY_ROUTE_TAG, SIGNALLING_CHANNEL,
};
