//! Local audio capture shared by every peer, and playback of remote audio
//!
//! One `MediaCapture` is handed to all peer connections. Muting flips a single
//! flag that every attached track consults, so there is no per-peer mute.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

/// Audio settings from the `[media]` config section
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MediaConfig {
    /// Offer a local audio track to peers
    #[serde(default = "default_capture_audio")]
    pub capture_audio: bool,
    #[serde(default)]
    pub start_muted: bool,
    #[serde(default = "default_autoplay_retry_ms")]
    pub autoplay_retry_ms: u64,
    #[serde(default = "default_autoplay_max_attempts")]
    pub autoplay_max_attempts: u32,
}

fn default_capture_audio() -> bool {
    true
}

fn default_autoplay_retry_ms() -> u64 {
    250
}

fn default_autoplay_max_attempts() -> u32 {
    40
}

impl Default for MediaConfig {
    fn default() -> Self {
        Self {
            capture_audio: default_capture_audio(),
            start_muted: false,
            autoplay_retry_ms: default_autoplay_retry_ms(),
            autoplay_max_attempts: default_autoplay_max_attempts(),
        }
    }
}

impl MediaConfig {
    pub fn autoplay_policy(&self) -> AutoplayPolicy {
        AutoplayPolicy {
            retry_interval: Duration::from_millis(self.autoplay_retry_ms),
            max_attempts: self.autoplay_max_attempts.max(1),
        }
    }
}

/// One encoded audio sample (an opus packet in practice)
#[derive(Debug, Clone)]
pub struct AudioSample {
    pub data: Bytes,
    pub duration: Duration,
}

/// A local track that samples are written into
#[async_trait]
pub trait AudioSink: Send + Sync {
    fn id(&self) -> String;
    async fn write(&self, sample: &AudioSample) -> Result<()>;
}

/// The local audio stream, shared read-only across peer connections
pub struct MediaCapture {
    stream_id: String,
    capture_audio: bool,
    muted: AtomicBool,
    tracks: Mutex<Vec<Weak<dyn AudioSink>>>,
}

impl MediaCapture {
    pub fn new(stream_id: impl Into<String>, config: &MediaConfig) -> Self {
        Self {
            stream_id: stream_id.into(),
            capture_audio: config.capture_audio,
            muted: AtomicBool::new(config.start_muted),
            tracks: Mutex::new(Vec::new()),
        }
    }

    /// A capture that never offers audio to peers
    pub fn disabled() -> Self {
        Self {
            stream_id: String::new(),
            capture_audio: false,
            muted: AtomicBool::new(true),
            tracks: Mutex::new(Vec::new()),
        }
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    pub fn has_audio(&self) -> bool {
        self.capture_audio
    }

    pub fn is_muted(&self) -> bool {
        self.muted.load(Ordering::Relaxed)
    }

    /// Applies to every track of the stream at once
    pub fn set_muted(&self, muted: bool) {
        let was = self.muted.swap(muted, Ordering::Relaxed);
        if was != muted {
            info!(
                "Local audio stream {} {}",
                self.stream_id,
                if muted { "muted" } else { "unmuted" }
            );
        }
    }

    /// Register a track created for one peer connection
    pub async fn attach(&self, sink: &Arc<dyn AudioSink>) {
        let mut tracks = self.tracks.lock().await;
        tracks.retain(|t| t.strong_count() > 0);
        tracks.push(Arc::downgrade(sink));
        debug!("Attached audio track {} ({} live)", sink.id(), tracks.len());
    }

    pub async fn track_count(&self) -> usize {
        let mut tracks = self.tracks.lock().await;
        tracks.retain(|t| t.strong_count() > 0);
        tracks.len()
    }

    /// Write a captured sample to every live track; dropped while muted.
    /// Returns how many tracks accepted it.
    pub async fn push_sample(&self, sample: &AudioSample) -> usize {
        if self.is_muted() {
            return 0;
        }

        let live: Vec<Arc<dyn AudioSink>> = {
            let mut tracks = self.tracks.lock().await;
            tracks.retain(|t| t.strong_count() > 0);
            tracks.iter().filter_map(|t| t.upgrade()).collect()
        };

        let mut written = 0;
        for track in live {
            match track.write(sample).await {
                Ok(()) => written += 1,
                Err(e) => trace!("Audio track {} rejected sample: {}", track.id(), e),
            }
        }
        written
    }
}

/// Remote audio delivered by a peer connection
pub struct RemoteAudio {
    pub track_id: String,
    pub stream_id: String,
    pub packets: mpsc::Receiver<Bytes>,
}

/// Output for one remote audio stream; `play` may be refused until the
/// platform allows playback to start
#[async_trait]
pub trait AudioPlayback: Send + Sync {
    async fn play(&self) -> Result<()>;
    async fn write(&self, payload: Bytes) -> Result<()>;
}

pub trait PlaybackFactory: Send + Sync {
    fn create(&self, track_id: &str, stream_id: &str) -> Arc<dyn AudioPlayback>;
}

#[derive(Debug, Clone)]
pub struct AutoplayPolicy {
    pub retry_interval: Duration,
    pub max_attempts: u32,
}

impl Default for AutoplayPolicy {
    fn default() -> Self {
        MediaConfig::default().autoplay_policy()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AutoplayOutcome {
    Started { attempts: u32 },
    Cancelled,
    GaveUp,
}

/// Retry `play()` until it succeeds, the attempts run out, or `cancel` fires
pub async fn autoplay(
    playback: &dyn AudioPlayback,
    policy: &AutoplayPolicy,
    cancel: &mut watch::Receiver<bool>,
) -> AutoplayOutcome {
    for attempt in 1..=policy.max_attempts {
        if *cancel.borrow() {
            return AutoplayOutcome::Cancelled;
        }

        match playback.play().await {
            Ok(()) => return AutoplayOutcome::Started { attempts: attempt },
            Err(e) => trace!("Autoplay attempt {} refused: {}", attempt, e),
        }

        if attempt == policy.max_attempts {
            break;
        }

        tokio::select! {
            _ = tokio::time::sleep(policy.retry_interval) => {}
            changed = cancel.changed() => {
                if changed.is_err() || *cancel.borrow() {
                    return AutoplayOutcome::Cancelled;
                }
            }
        }
    }

    AutoplayOutcome::GaveUp
}

/// Start playback of a remote track and feed it until the track ends or
/// the owning connection cancels
pub fn spawn_playback(
    remote: RemoteAudio,
    factory: Arc<dyn PlaybackFactory>,
    policy: AutoplayPolicy,
    mut cancel: watch::Receiver<bool>,
) -> JoinHandle<AutoplayOutcome> {
    tokio::spawn(async move {
        let RemoteAudio {
            track_id,
            stream_id,
            mut packets,
        } = remote;
        let playback = factory.create(&track_id, &stream_id);

        let outcome = autoplay(playback.as_ref(), &policy, &mut cancel).await;
        match outcome {
            AutoplayOutcome::Started { attempts } => {
                info!("Playing remote audio {} after {} attempt(s)", track_id, attempts);
            }
            AutoplayOutcome::Cancelled => {
                debug!("Playback of {} cancelled before it started", track_id);
                return outcome;
            }
            AutoplayOutcome::GaveUp => {
                warn!(
                    "Remote audio {} never started after {} attempts",
                    track_id, policy.max_attempts
                );
                return outcome;
            }
        }

        loop {
            tokio::select! {
                packet = packets.recv() => match packet {
                    Some(payload) => {
                        if let Err(e) = playback.write(payload).await {
                            debug!("Playback write for {} failed: {}", track_id, e);
                        }
                    }
                    None => break,
                },
                changed = cancel.changed() => {
                    if changed.is_err() || *cancel.borrow() {
                        break;
                    }
                }
            }
        }

        debug!("Remote audio {} ended", track_id);
        outcome
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    struct FlakyPlayback {
        refusals: u32,
        calls: AtomicU32,
        written: std::sync::Mutex<Vec<Bytes>>,
    }

    impl FlakyPlayback {
        fn new(refusals: u32) -> Self {
            Self {
                refusals,
                calls: AtomicU32::new(0),
                written: std::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl AudioPlayback for FlakyPlayback {
        async fn play(&self) -> Result<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if call <= self.refusals {
                anyhow::bail!("autoplay refused");
            }
            Ok(())
        }

        async fn write(&self, payload: Bytes) -> Result<()> {
            self.written.lock().unwrap().push(payload);
            Ok(())
        }
    }

    struct Factory(Arc<FlakyPlayback>);

    impl PlaybackFactory for Factory {
        fn create(&self, _track_id: &str, _stream_id: &str) -> Arc<dyn AudioPlayback> {
            self.0.clone()
        }
    }

    struct CountingSink {
        writes: AtomicU32,
    }

    #[async_trait]
    impl AudioSink for CountingSink {
        fn id(&self) -> String {
            "counting".to_string()
        }

        async fn write(&self, _sample: &AudioSample) -> Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn fast_policy(max_attempts: u32) -> AutoplayPolicy {
        AutoplayPolicy {
            retry_interval: Duration::from_millis(1),
            max_attempts,
        }
    }

    #[tokio::test]
    async fn test_autoplay_retries_until_started() {
        let playback = FlakyPlayback::new(2);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        let outcome = autoplay(&playback, &fast_policy(10), &mut cancel).await;

        assert_eq!(outcome, AutoplayOutcome::Started { attempts: 3 });
        assert_eq!(playback.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_autoplay_is_bounded() {
        let playback = FlakyPlayback::new(u32::MAX);
        let (_cancel_tx, mut cancel) = watch::channel(false);

        let outcome = autoplay(&playback, &fast_policy(3), &mut cancel).await;

        assert_eq!(outcome, AutoplayOutcome::GaveUp);
        assert_eq!(playback.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_autoplay_stops_when_cancelled() {
        let playback = FlakyPlayback::new(u32::MAX);
        let (cancel_tx, mut cancel) = watch::channel(false);
        let policy = AutoplayPolicy {
            retry_interval: Duration::from_secs(60),
            max_attempts: 100,
        };

        let canceller = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            cancel_tx.send_replace(true);
            cancel_tx
        });

        let outcome = autoplay(&playback, &policy, &mut cancel).await;
        assert_eq!(outcome, AutoplayOutcome::Cancelled);
        assert_eq!(playback.calls.load(Ordering::SeqCst), 1);
        drop(canceller.await.unwrap());
    }

    #[tokio::test]
    async fn test_spawned_playback_forwards_packets() {
        let playback = Arc::new(FlakyPlayback::new(1));
        let (tx, rx) = mpsc::channel(8);
        let (_cancel_tx, cancel) = watch::channel(false);

        let handle = spawn_playback(
            RemoteAudio {
                track_id: "audio".to_string(),
                stream_id: "remote".to_string(),
                packets: rx,
            },
            Arc::new(Factory(playback.clone())),
            fast_policy(5),
            cancel,
        );

        tx.send(Bytes::from_static(b"opus-1")).await.unwrap();
        tx.send(Bytes::from_static(b"opus-2")).await.unwrap();
        drop(tx);

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, AutoplayOutcome::Started { attempts: 2 });
        assert_eq!(playback.written.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_mute_is_shared_by_every_track() {
        let capture = MediaCapture::new("local", &MediaConfig::default());
        let first = Arc::new(CountingSink {
            writes: AtomicU32::new(0),
        });
        let second = Arc::new(CountingSink {
            writes: AtomicU32::new(0),
        });
        let first_dyn: Arc<dyn AudioSink> = first.clone();
        let second_dyn: Arc<dyn AudioSink> = second.clone();
        capture.attach(&first_dyn).await;
        capture.attach(&second_dyn).await;

        let sample = AudioSample {
            data: Bytes::from_static(b"pcm"),
            duration: Duration::from_millis(20),
        };
        assert_eq!(capture.push_sample(&sample).await, 2);

        capture.set_muted(true);
        assert!(capture.is_muted());
        assert_eq!(capture.push_sample(&sample).await, 0);

        capture.set_muted(false);
        assert_eq!(capture.push_sample(&sample).await, 2);
        assert_eq!(first.writes.load(Ordering::SeqCst), 2);
        assert_eq!(second.writes.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_dropped_tracks_are_forgotten() {
        let capture = MediaCapture::new("local", &MediaConfig::default());
        let sink: Arc<dyn AudioSink> = Arc::new(CountingSink {
            writes: AtomicU32::new(0),
        });
        capture.attach(&sink).await;
        assert_eq!(capture.track_count().await, 1);

        drop(sink);
        assert_eq!(capture.track_count().await, 0);
    }
}
