use anyhow::{Context, Result};
use async_trait::async_trait;
use bytes::Bytes;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, trace};
use tracing_subscriber::EnvFilter;

use toolbox_rtc::config::get_config_path;
use toolbox_rtc::frame::{DepthImage, FrameMatrices};
use toolbox_rtc::media::{AudioPlayback, PlaybackFactory};
use toolbox_rtc::webrtc::TransportMode;
use toolbox_rtc::{
    Config, Coordinator, FrameDecoder, FrameSink, MediaCapture, PeerContext, SignallingClient,
    WebRtcFactory,
};

#[derive(Parser)]
#[command(name = "toolbox-rtc")]
#[command(about = "WebRTC consumer for spatial toolbox frame and audio streams", long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.toolbox-rtc/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the signalling network and receive frames from providers
    Consume {
        /// Signalling server websocket url
        #[arg(long)]
        url: Option<String>,
        /// direct or relayed
        #[arg(long)]
        mode: Option<TransportMode>,
        /// Fixed identity instead of a generated one
        #[arg(long)]
        id: Option<String>,
        /// Start with the local audio stream muted
        #[arg(long)]
        muted: bool,
    },
    /// Classify and decode a saved data channel payload
    Classify {
        /// Path to the payload
        file: PathBuf,
    },
    /// Print the effective configuration
    Config {
        /// Write it back to the config file
        #[arg(long)]
        save: bool,
    },
}

/// Logs what arrives; rendering is someone else's job
#[derive(Default)]
struct LogFrameSink {
    bytes: AtomicU64,
}

impl FrameSink for LogFrameSink {
    fn on_color_frame(&self, jpeg: Bytes) {
        self.bytes.fetch_add(jpeg.len() as u64, Ordering::Relaxed);
        debug!("Color frame, {} bytes", jpeg.len());
    }

    fn on_depth_frame(&self, png: Bytes) {
        self.bytes.fetch_add(png.len() as u64, Ordering::Relaxed);
        debug!("Depth frame, {} bytes", png.len());
    }

    fn on_matrices(&self, matrices: &FrameMatrices) {
        trace!(
            "Camera translation ({:.3}, {:.3}, {:.3})",
            matrices.camera[3],
            matrices.camera[7],
            matrices.camera[11]
        );
    }

    fn on_depth_samples(&self, depth: DepthImage) {
        let valid = depth.samples.iter().filter(|&&d| d != 0).count();
        self.bytes
            .fetch_add(depth.samples.len() as u64 * 2, Ordering::Relaxed);
        debug!(
            "Depth image {}x{}, {} valid samples",
            depth.width, depth.height, valid
        );
    }
}

struct LogPlayback {
    track_id: String,
    packets: AtomicU64,
}

#[async_trait]
impl AudioPlayback for LogPlayback {
    async fn play(&self) -> Result<()> {
        Ok(())
    }

    async fn write(&self, payload: Bytes) -> Result<()> {
        let n = self.packets.fetch_add(1, Ordering::Relaxed) + 1;
        if n % 500 == 0 {
            debug!("Audio {}: {} packets ({} bytes last)", self.track_id, n, payload.len());
        }
        Ok(())
    }
}

struct LogPlaybackFactory;

impl PlaybackFactory for LogPlaybackFactory {
    fn create(&self, track_id: &str, _stream_id: &str) -> Arc<dyn AudioPlayback> {
        Arc::new(LogPlayback {
            track_id: track_id.to_string(),
            packets: AtomicU64::new(0),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(get_config_path);

    match cli.command {
        Commands::Consume {
            url,
            mode,
            id,
            muted,
        } => {
            let mut config = Config::load_from(&config_path)?;
            if let Some(url) = url {
                config.signalling.url = url;
            }
            if let Some(mode) = mode {
                config.signalling.mode = mode;
            }
            if id.is_some() {
                config.signalling.local_id = id;
            }
            if muted {
                config.media.start_muted = true;
            }
            consume(config).await?;
        }
        Commands::Classify { file } => {
            let payload = std::fs::read(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let sink = Arc::new(LogFrameSink::default());
            let decoder = FrameDecoder::new(sink.clone());

            match decoder.handle(&Bytes::from(payload)) {
                Some(kind) => {
                    let stats = decoder.stats();
                    println!("Kind:    {}", kind);
                    println!("Decoded: {} bytes", sink.bytes.load(Ordering::Relaxed));
                    if stats.errors > 0 {
                        println!("Status:  corrupt");
                    } else {
                        println!("Status:  ok");
                    }
                }
                None => println!("Empty payload"),
            }
        }
        Commands::Config { save } => {
            let config = Config::load_from(&config_path)?;
            println!("# {}", config_path.display());
            print!("{}", toml::to_string_pretty(&config)?);
            if save {
                config.save_to(&config_path)?;
                println!("# saved");
            }
        }
    }

    Ok(())
}

async fn consume(config: Config) -> Result<()> {
    let local = config.local_id();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (transport_stop_tx, transport_stop_rx) = watch::channel(false);

    let handle = SignallingClient::spawn(config.signalling.clone(), local.clone(), transport_stop_rx);

    let sink = Arc::new(LogFrameSink::default());
    let frames = Arc::new(FrameDecoder::new(sink.clone()));
    let factory = Arc::new(WebRtcFactory::new(&config.webrtc)?);
    let media = Arc::new(MediaCapture::new(local.as_str(), &config.media));

    let coordinator = Coordinator::new(PeerContext {
        local: local.clone(),
        factory,
        outbound: handle.outbound.clone(),
        media,
        frames: frames.clone(),
        playback: Arc::new(LogPlaybackFactory),
        config: config.webrtc.clone(),
        autoplay: config.media.autoplay_policy(),
    });

    info!("Consumer {} starting ({} signalling)", local.short(), config.signalling.mode);

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Interrupted, shutting down");
            shutdown_tx.send_replace(true);
        }
    });

    coordinator.run(handle.inbound, shutdown_rx).await?;

    // Transport stops after the coordinator so queued leaves still go out
    transport_stop_tx.send_replace(true);
    let _ = handle.task.await;

    let stats = frames.stats();
    info!(
        "Received {} color, {} depth, {} custom frames ({} errors, {} bytes decoded)",
        stats.color,
        stats.depth,
        stats.custom,
        stats.errors,
        sink.bytes.load(Ordering::Relaxed)
    );
    Ok(())
}
