//! Native peer connection seam and its webrtc-rs implementation
//!
//! `PeerConnection` only talks to the traits below. Native callbacks are
//! turned into `NativeEvent`s on an unbounded channel so that a single task
//! per peer consumes them in order.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::{MediaEngine, MIME_TYPE_OPUS};
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::media::Sample;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use super::types::{ChannelState, IceCandidate, RtcConfig, SdpType, SessionDescription};
use crate::error::Error;
use crate::media::{AudioSample, AudioSink, MediaCapture, RemoteAudio};

/// Aggregate state of the underlying transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

/// Everything a native connection reports back to its owner
pub enum NativeEvent {
    /// Locally gathered candidate to trickle to the remote side
    IceCandidate(IceCandidate),
    /// Channel created by the remote side
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen(String),
    ChannelClosed(String),
    /// Binary message received on a data channel
    Message(Bytes),
    Track(RemoteAudio),
    Link(LinkState),
}

/// Reliability settings for a new data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelOptions {
    pub ordered: bool,
    pub max_retransmits: Option<u16>,
}

impl ChannelOptions {
    /// Unordered, never retransmitted: a late frame is worth less than a lost one
    pub fn unreliable() -> Self {
        Self {
            ordered: false,
            max_retransmits: Some(0),
        }
    }
}

#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> String;
    fn state(&self) -> ChannelState;
    async fn send(&self, data: &Bytes) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait NativeConnection: Send + Sync {
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>>;
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, description: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, description: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    /// Send the shared local audio stream on this connection
    async fn add_local_audio(&self, media: &Arc<MediaCapture>) -> Result<()>;
    async fn close(&self) -> Result<()>;
}

/// Creates native connections whose callbacks feed `events`
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<NativeEvent>,
    ) -> Result<Arc<dyn NativeConnection>>;
}

/// webrtc-rs backed factory
pub struct WebRtcFactory {
    api: API,
    ice_servers: Vec<RTCIceServer>,
}

impl WebRtcFactory {
    pub fn new(config: &RtcConfig) -> Result<Self> {
        let mut m = MediaEngine::default();
        m.register_default_codecs()?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut m)?;

        let api = APIBuilder::new()
            .with_media_engine(m)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = config
            .stun_servers
            .iter()
            .map(|url| RTCIceServer {
                urls: vec![url.clone()],
                ..Default::default()
            })
            .collect();

        Ok(Self { api, ice_servers })
    }
}

#[async_trait]
impl ConnectionFactory for WebRtcFactory {
    async fn create(
        &self,
        events: mpsc::UnboundedSender<NativeEvent>,
    ) -> Result<Arc<dyn NativeConnection>> {
        let config = RTCConfiguration {
            ice_servers: self.ice_servers.clone(),
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        let connection = WebRtcConnection {
            pc,
            events,
            pending_candidates: Mutex::new(Vec::new()),
            audio_tracks: Mutex::new(Vec::new()),
        };
        connection.setup_handlers();

        Ok(Arc::new(connection))
    }
}

struct WebRtcConnection {
    pc: Arc<RTCPeerConnection>,
    events: mpsc::UnboundedSender<NativeEvent>,
    /// Candidates that arrived before the remote description
    pending_candidates: Mutex<Vec<RTCIceCandidateInit>>,
    /// Keeps this connection's audio tracks alive for the shared capture
    audio_tracks: Mutex<Vec<Arc<dyn AudioSink>>>,
}

impl WebRtcConnection {
    fn setup_handlers(&self) {
        let events = self.events.clone();
        self.pc
            .on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
                let events = events.clone();
                Box::pin(async move {
                    let Some(c) = candidate else {
                        return;
                    };
                    match c.to_json() {
                        Ok(init) => {
                            let _ = events.send(NativeEvent::IceCandidate(from_init(init)));
                        }
                        Err(e) => debug!("Failed to serialize local candidate: {}", e),
                    }
                })
            }));

        let events = self.events.clone();
        self.pc
            .on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
                let _ = events.send(NativeEvent::Link(link_state(state)));
                Box::pin(async {})
            }));

        let events = self.events.clone();
        self.pc
            .on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                let events = events.clone();
                Box::pin(async move {
                    wire_channel(&dc, &events);
                    let channel: Arc<dyn DataChannel> = Arc::new(WebRtcChannel(dc));
                    let _ = events.send(NativeEvent::DataChannel(channel));
                })
            }));

        let events = self.events.clone();
        self.pc.on_track(Box::new(
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                if track.kind() != RTPCodecType::Audio {
                    return Box::pin(async {});
                }

                let (tx, rx) = mpsc::channel(64);
                let remote = RemoteAudio {
                    track_id: track.id(),
                    stream_id: track.stream_id(),
                    packets: rx,
                };
                let _ = events.send(NativeEvent::Track(remote));

                Box::pin(async move {
                    tokio::spawn(read_track(track, tx));
                })
            },
        ));
    }

    async fn flush_pending_candidates(&self) {
        let pending: Vec<RTCIceCandidateInit> =
            std::mem::take(&mut *self.pending_candidates.lock().await);
        for init in pending {
            if let Err(e) = self.pc.add_ice_candidate(init).await {
                debug!("Failed to add buffered candidate: {}", e);
            }
        }
    }
}

#[async_trait]
impl NativeConnection for WebRtcConnection {
    async fn create_data_channel(
        &self,
        label: &str,
        options: ChannelOptions,
    ) -> Result<Arc<dyn DataChannel>> {
        let init = RTCDataChannelInit {
            ordered: Some(options.ordered),
            max_retransmits: options.max_retransmits,
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        wire_channel(&dc, &self.events);
        Ok(Arc::new(WebRtcChannel(dc)))
    }

    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(description)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, description: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(description)?).await?;
        self.flush_pending_candidates().await;
        Ok(())
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        if candidate.candidate.is_empty() {
            // End-of-candidates marker
            return Ok(());
        }

        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };

        if self.pc.remote_description().await.is_none() {
            trace!("Buffering candidate until the remote description is set");
            self.pending_candidates.lock().await.push(init);
            return Ok(());
        }

        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn add_local_audio(&self, media: &Arc<MediaCapture>) -> Result<()> {
        let track = Arc::new(TrackLocalStaticSample::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_owned(),
                clock_rate: 48000,
                channels: 2,
                sdp_fmtp_line: "minptime=10;useinbandfec=1".to_owned(),
                rtcp_feedback: vec![],
            },
            "audio".to_owned(),
            media.stream_id().to_owned(),
        ));

        let sender = self
            .pc
            .add_track(Arc::clone(&track) as Arc<dyn TrackLocal + Send + Sync>)
            .await?;

        // RTCP has to be drained for the interceptors to keep working
        tokio::spawn(async move {
            let mut buf = vec![0u8; 1500];
            while sender.read(&mut buf).await.is_ok() {}
        });

        let sink: Arc<dyn AudioSink> = Arc::new(SampleTrack(track));
        media.attach(&sink).await;
        self.audio_tracks.lock().await.push(sink);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.audio_tracks.lock().await.clear();
        self.pc.close().await?;
        Ok(())
    }
}

struct WebRtcChannel(Arc<RTCDataChannel>);

#[async_trait]
impl DataChannel for WebRtcChannel {
    fn label(&self) -> String {
        self.0.label().to_string()
    }

    fn state(&self) -> ChannelState {
        match self.0.ready_state() {
            RTCDataChannelState::Open => ChannelState::Open,
            RTCDataChannelState::Closing => ChannelState::Closing,
            RTCDataChannelState::Closed => ChannelState::Closed,
            _ => ChannelState::Connecting,
        }
    }

    async fn send(&self, data: &Bytes) -> Result<()> {
        self.0.send(data).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.0.close().await?;
        Ok(())
    }
}

struct SampleTrack(Arc<TrackLocalStaticSample>);

#[async_trait]
impl AudioSink for SampleTrack {
    fn id(&self) -> String {
        self.0.id().to_string()
    }

    async fn write(&self, sample: &AudioSample) -> Result<()> {
        self.0
            .write_sample(&Sample {
                data: sample.data.clone(),
                duration: sample.duration,
                ..Default::default()
            })
            .await?;
        Ok(())
    }
}

/// Forward open/close/message callbacks of a data channel as events
fn wire_channel(dc: &Arc<RTCDataChannel>, events: &mpsc::UnboundedSender<NativeEvent>) {
    let label = dc.label().to_string();

    let open_events = events.clone();
    let open_label = label.clone();
    dc.on_open(Box::new(move || {
        let _ = open_events.send(NativeEvent::ChannelOpen(open_label.clone()));
        Box::pin(async {})
    }));

    let close_events = events.clone();
    let close_label = label.clone();
    dc.on_close(Box::new(move || {
        let _ = close_events.send(NativeEvent::ChannelClosed(close_label.clone()));
        Box::pin(async {})
    }));

    let message_events = events.clone();
    dc.on_message(Box::new(move |msg: DataChannelMessage| {
        if msg.is_string {
            trace!("Ignoring {} byte text message on '{}'", msg.data.len(), label);
        } else {
            let _ = message_events.send(NativeEvent::Message(msg.data));
        }
        Box::pin(async {})
    }));
}

async fn read_track(track: Arc<TrackRemote>, tx: mpsc::Sender<Bytes>) {
    loop {
        match tokio::time::timeout(Duration::from_secs(30), track.read_rtp()).await {
            Ok(Ok((packet, _))) => {
                if packet.payload.is_empty() {
                    continue;
                }
                if tx.send(packet.payload).await.is_err() {
                    break;
                }
            }
            Ok(Err(e)) => {
                debug!("Remote track {} ended: {}", track.id(), e);
                break;
            }
            Err(_) => {
                warn!("Remote track {} silent for 30s, dropping reader", track.id());
                break;
            }
        }
    }
}

fn link_state(state: RTCPeerConnectionState) -> LinkState {
    match state {
        RTCPeerConnectionState::Connecting => LinkState::Connecting,
        RTCPeerConnectionState::Connected => LinkState::Connected,
        RTCPeerConnectionState::Disconnected => LinkState::Disconnected,
        RTCPeerConnectionState::Failed => LinkState::Failed,
        RTCPeerConnectionState::Closed => LinkState::Closed,
        _ => LinkState::New,
    }
}

fn from_init(init: RTCIceCandidateInit) -> IceCandidate {
    IceCandidate {
        candidate: init.candidate,
        sdp_mid: init.sdp_mid,
        sdp_mline_index: init.sdp_mline_index,
        username_fragment: init.username_fragment,
    }
}

fn to_rtc(description: SessionDescription) -> Result<RTCSessionDescription> {
    let desc = match description.sdp_type {
        SdpType::Offer => RTCSessionDescription::offer(description.sdp)?,
        SdpType::Answer => RTCSessionDescription::answer(description.sdp)?,
        SdpType::Pranswer => RTCSessionDescription::pranswer(description.sdp)?,
        SdpType::Rollback => {
            return Err(Error::Negotiation("rollback descriptions are not supported".into()).into())
        }
    };
    Ok(desc)
}

fn from_rtc(description: RTCSessionDescription) -> Result<SessionDescription> {
    let sdp_type = match description.sdp_type {
        RTCSdpType::Offer => SdpType::Offer,
        RTCSdpType::Answer => SdpType::Answer,
        RTCSdpType::Pranswer => SdpType::Pranswer,
        RTCSdpType::Rollback => SdpType::Rollback,
        other => return Err(Error::Negotiation(format!("unexpected SDP type {}", other)).into()),
    };
    Ok(SessionDescription {
        sdp_type,
        sdp: description.sdp,
    })
}
