pub mod config;
pub mod error;
pub mod frame;
pub mod media;
pub mod webrtc;

pub use config::Config;
pub use error::{Error, Result};
pub use frame::{FrameDecoder, FrameKind, FrameSink};
pub use media::{MediaCapture, MediaConfig};
pub use crate::webrtc::{Coordinator, Envelope, PeerContext, PeerId, SignallingClient, WebRtcFactory};
