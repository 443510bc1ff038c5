//! E2E test: a consumer and a provider negotiate through a websocket rendezvous
//!
//! The rendezvous is a tiny broadcast server: every text or binary frame one
//! client sends is forwarded to all other clients, so dest filtering happens
//! in the coordinators as it does against the real signalling server.

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, watch, Mutex};
use tokio_tungstenite::{accept_async, tungstenite::Message};
use toolbox_rtc::frame::{DepthImage, FrameMatrices};
use toolbox_rtc::media::{AudioPlayback, AutoplayPolicy, PlaybackFactory};
use toolbox_rtc::webrtc::{
    Coordinator, Envelope, NegotiationState, PeerContext, PeerId, Role, RtcConfig,
    SignallingClient, SignallingConfig, TransportMode, WebRtcFactory,
};
use toolbox_rtc::{FrameDecoder, FrameSink, MediaCapture};

type Clients = Arc<Mutex<Vec<(usize, mpsc::UnboundedSender<Message>)>>>;

async fn rendezvous() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    let clients: Clients = Arc::new(Mutex::new(Vec::new()));

    tokio::spawn(async move {
        let mut next_id = 0;
        while let Ok((stream, _)) = listener.accept().await {
            let Ok(ws) = accept_async(stream).await else {
                continue;
            };
            let (mut write, mut read) = ws.split();
            let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
            let id = next_id;
            next_id += 1;
            clients.lock().await.push((id, tx));

            tokio::spawn(async move {
                while let Some(message) = rx.recv().await {
                    if write.send(message).await.is_err() {
                        break;
                    }
                }
            });

            let clients = clients.clone();
            tokio::spawn(async move {
                while let Some(Ok(message)) = read.next().await {
                    if !(message.is_text() || message.is_binary()) {
                        continue;
                    }
                    for (other, tx) in clients.lock().await.iter() {
                        if *other != id {
                            let _ = tx.send(message.clone());
                        }
                    }
                }
            });
        }
    });

    url
}

#[derive(Default)]
struct CountingSink {
    color: AtomicUsize,
}

impl FrameSink for CountingSink {
    fn on_color_frame(&self, _jpeg: Bytes) {
        self.color.fetch_add(1, Ordering::SeqCst);
    }
    fn on_depth_frame(&self, _png: Bytes) {}
    fn on_matrices(&self, _matrices: &FrameMatrices) {}
    fn on_depth_samples(&self, _depth: DepthImage) {}
}

struct NoPlayback;

impl PlaybackFactory for NoPlayback {
    fn create(&self, _track_id: &str, _stream_id: &str) -> Arc<dyn AudioPlayback> {
        struct Silent;
        #[async_trait::async_trait]
        impl AudioPlayback for Silent {
            async fn play(&self) -> anyhow::Result<()> {
                Ok(())
            }
            async fn write(&self, _payload: Bytes) -> anyhow::Result<()> {
                Ok(())
            }
        }
        Arc::new(Silent)
    }
}

struct Participant {
    id: PeerId,
    coordinator: Arc<Coordinator>,
    outbound: mpsc::UnboundedSender<Envelope>,
    sink: Arc<CountingSink>,
}

fn participant(
    id: &str,
    url: &str,
    mode: TransportMode,
    shutdown: &watch::Receiver<bool>,
) -> Result<Participant> {
    let id = PeerId::from(id);
    let signalling = SignallingConfig {
        url: url.to_string(),
        mode,
        reconnect_delay_ms: 200,
        ..Default::default()
    };
    let rtc = RtcConfig {
        stun_servers: vec![],
        ..Default::default()
    };

    let handle = SignallingClient::spawn(signalling, id.clone(), shutdown.clone());
    let sink = Arc::new(CountingSink::default());

    let coordinator = Arc::new(Coordinator::new(PeerContext {
        local: id.clone(),
        factory: Arc::new(WebRtcFactory::new(&rtc)?),
        outbound: handle.outbound.clone(),
        media: Arc::new(MediaCapture::disabled()),
        frames: Arc::new(FrameDecoder::new(sink.clone())),
        playback: Arc::new(NoPlayback),
        config: rtc,
        autoplay: AutoplayPolicy::default(),
    }));

    let runner = coordinator.clone();
    let inbound = handle.inbound;
    let shutdown = shutdown.clone();
    tokio::spawn(async move { runner.run(inbound, shutdown).await });

    Ok(Participant {
        id,
        coordinator,
        outbound: handle.outbound,
        sink,
    })
}

async fn negotiate(mode: TransportMode) -> Result<()> {
    let url = rendezvous().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let consumer = participant("consumer-aaa", &url, mode, &shutdown_rx)?;
    let provider = participant("provider-zzz", &url, mode, &shutdown_rx)?;

    // Both sockets need to be up before the provider announces itself
    tokio::time::sleep(Duration::from_millis(500)).await;
    provider
        .outbound
        .send(Envelope::join(&provider.id, Role::Provider))?;

    println!("Waiting for negotiation ({})...", mode);
    let mut answered = false;
    for i in 0..50 {
        tokio::time::sleep(Duration::from_millis(200)).await;
        let consumer_state = consumer.coordinator.peer_state(&provider.id).await;
        let provider_state = provider.coordinator.peer_state(&consumer.id).await;
        println!(
            "Check {}: consumer {:?}, provider {:?}",
            i + 1,
            consumer_state,
            provider_state
        );

        if matches!(
            consumer_state,
            Some(NegotiationState::RemoteDescriptionSet | NegotiationState::ChannelOpen)
        ) {
            answered = true;
            break;
        }
    }
    assert!(answered, "consumer should receive the provider's answer");

    assert_eq!(consumer.coordinator.is_offered(&provider.id).await, Some(true));
    assert_eq!(provider.coordinator.is_offered(&consumer.id).await, Some(false));

    // ICE over loopback usually completes; report rather than require it
    let mut open = false;
    for _ in 0..50 {
        if provider.coordinator.peer_state(&consumer.id).await == Some(NegotiationState::ChannelOpen)
            && consumer.coordinator.peer_state(&provider.id).await
                == Some(NegotiationState::ChannelOpen)
        {
            open = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    if open {
        println!("SUCCESS: data channel open, sending a frame");
        let jpeg = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xE0, 0x00, 0x10, 0x4A, 0x46]);
        provider.coordinator.send_frame(&consumer.id, &jpeg).await?;
        for _ in 0..25 {
            if consumer.sink.color.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(200)).await;
        }
        assert_eq!(consumer.sink.color.load(Ordering::SeqCst), 1);
    } else {
        println!("Data channel did not open in this environment (descriptions were exchanged)");
    }

    shutdown_tx.send_replace(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(consumer.coordinator.peer_count().await, 0);

    Ok(())
}

#[tokio::test]
async fn test_direct_signalling_negotiation() -> Result<()> {
    negotiate(TransportMode::Direct).await
}

#[tokio::test]
async fn test_relayed_signalling_negotiation() -> Result<()> {
    negotiate(TransportMode::Relayed).await
}
