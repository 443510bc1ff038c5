//! Classification and decoding of frames received over the data channel
//!
//! Color frames arrive as JPEG, depth frames either as PNG or as a compact
//! container: `[u32 LE json length][JSON header][RVL depth samples]`. The
//! JSON header carries the camera and ground-plane matrices.

pub mod rvl;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, trace, warn};

use crate::error::{Error, Result};

pub const JPEG_MAGIC: [u8; 2] = [0xFF, 0xD8];
pub const PNG_MAGIC: [u8; 4] = [0x89, 0x50, 0x4E, 0x47];

/// Upper bound on decoded depth images (8K x 4K)
const MAX_DEPTH_PIXELS: usize = 8192 * 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameKind {
    /// JPEG color frame
    Color,
    /// PNG depth frame
    Depth,
    /// Matrices plus RVL depth
    Custom,
}

impl std::fmt::Display for FrameKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameKind::Color => write!(f, "color/jpeg"),
            FrameKind::Depth => write!(f, "depth/png"),
            FrameKind::Custom => write!(f, "depth/rvl"),
        }
    }
}

/// Classify a payload by its leading magic bytes; `None` for empty payloads
pub fn classify(payload: &[u8]) -> Option<FrameKind> {
    if payload.is_empty() {
        None
    } else if payload.starts_with(&JPEG_MAGIC) {
        Some(FrameKind::Color)
    } else if payload.starts_with(&PNG_MAGIC) {
        Some(FrameKind::Depth)
    } else {
        Some(FrameKind::Custom)
    }
}

/// Row-major 4x4 transforms sent with every custom depth frame
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FrameMatrices {
    pub camera: [f32; 16],
    pub groundplane: [f32; 16],
}

impl FrameMatrices {
    pub fn identity() -> Self {
        let mut m = [0.0; 16];
        for i in 0..4 {
            m[i * 5] = 1.0;
        }
        Self {
            camera: m,
            groundplane: m,
        }
    }
}

/// JSON block at the front of a custom container
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerHeader {
    #[serde(flatten)]
    pub matrices: FrameMatrices,
    pub width: u32,
    pub height: u32,
}

impl ContainerHeader {
    pub fn pixel_count(&self) -> Result<usize> {
        let count = (self.width as usize)
            .checked_mul(self.height as usize)
            .filter(|&n| n <= MAX_DEPTH_PIXELS)
            .ok_or_else(|| {
                Error::FrameDecode(format!(
                    "depth image {}x{} too large",
                    self.width, self.height
                ))
            })?;
        Ok(count)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DepthImage {
    pub width: u32,
    pub height: u32,
    pub samples: Vec<u16>,
}

/// Consumer of decoded frames (rendering lives behind this)
pub trait FrameSink: Send + Sync {
    fn on_color_frame(&self, jpeg: Bytes);
    fn on_depth_frame(&self, png: Bytes);
    fn on_matrices(&self, matrices: &FrameMatrices);
    fn on_depth_samples(&self, depth: DepthImage);
}

/// Split a custom container into its header and compressed depth bytes
pub fn split_container(payload: &[u8]) -> Result<(ContainerHeader, &[u8])> {
    let len_bytes = payload
        .get(..4)
        .ok_or_else(|| Error::FrameDecode("container shorter than its length prefix".into()))?;
    let json_len = u32::from_le_bytes([len_bytes[0], len_bytes[1], len_bytes[2], len_bytes[3]])
        as usize;

    let json_end = 4usize
        .checked_add(json_len)
        .filter(|&end| end <= payload.len())
        .ok_or_else(|| {
            Error::FrameDecode(format!(
                "JSON block of {} bytes overruns a {} byte frame",
                json_len,
                payload.len()
            ))
        })?;

    let header: ContainerHeader = serde_json::from_slice(&payload[4..json_end])?;
    Ok((header, &payload[json_end..]))
}

/// Build a custom container (provider side)
pub fn encode_container(matrices: &FrameMatrices, depth: &DepthImage) -> Result<Vec<u8>> {
    let header = ContainerHeader {
        matrices: matrices.clone(),
        width: depth.width,
        height: depth.height,
    };
    if header.pixel_count()? != depth.samples.len() {
        return Err(Error::FrameDecode(format!(
            "{} samples for a {}x{} image",
            depth.samples.len(),
            depth.width,
            depth.height
        )));
    }

    let json = serde_json::to_vec(&header)?;
    let compressed = rvl::compress(&depth.samples);

    let mut frame = Vec::with_capacity(4 + json.len() + compressed.len());
    frame.extend_from_slice(&(json.len() as u32).to_le_bytes());
    frame.extend_from_slice(&json);
    frame.extend_from_slice(&compressed);
    Ok(frame)
}

/// Frame counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub color: u64,
    pub depth: u64,
    pub custom: u64,
    pub errors: u64,
}

/// Routes received payloads to a `FrameSink`. Decode failures are logged and
/// only skip the offending frame.
pub struct FrameDecoder {
    sink: Arc<dyn FrameSink>,
    color: AtomicU64,
    depth: AtomicU64,
    custom: AtomicU64,
    errors: AtomicU64,
}

impl FrameDecoder {
    pub fn new(sink: Arc<dyn FrameSink>) -> Self {
        Self {
            sink,
            color: AtomicU64::new(0),
            depth: AtomicU64::new(0),
            custom: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }

    pub fn handle(&self, payload: &Bytes) -> Option<FrameKind> {
        let kind = classify(payload)?;
        trace!("Received {} frame ({} bytes)", kind, payload.len());

        match kind {
            FrameKind::Color => {
                self.color.fetch_add(1, Ordering::Relaxed);
                self.sink.on_color_frame(payload.clone());
            }
            FrameKind::Depth => {
                self.depth.fetch_add(1, Ordering::Relaxed);
                self.sink.on_depth_frame(payload.clone());
            }
            FrameKind::Custom => {
                self.custom.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.handle_custom(payload) {
                    self.errors.fetch_add(1, Ordering::Relaxed);
                    warn!("Skipping depth frame: {}", e);
                }
            }
        }

        Some(kind)
    }

    fn handle_custom(&self, payload: &[u8]) -> Result<()> {
        let (header, compressed) = split_container(payload)?;

        // Matrices go out even if the depth samples turn out to be corrupt
        self.sink.on_matrices(&header.matrices);

        let pixels = header.pixel_count()?;
        let samples = rvl::decompress(compressed, pixels)?;
        debug!(
            "Decoded {}x{} depth frame from {} bytes",
            header.width,
            header.height,
            compressed.len()
        );

        self.sink.on_depth_samples(DepthImage {
            width: header.width,
            height: header.height,
            samples,
        });
        Ok(())
    }

    pub fn stats(&self) -> FrameStats {
        FrameStats {
            color: self.color.load(Ordering::Relaxed),
            depth: self.depth.load(Ordering::Relaxed),
            custom: self.custom.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classify_by_magic() {
        assert_eq!(classify(&[]), None);
        assert_eq!(classify(&[0xFF, 0xD8, 0xFF, 0xE0]), Some(FrameKind::Color));
        assert_eq!(classify(&[0xFF, 0xD8]), Some(FrameKind::Color));
        assert_eq!(
            classify(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A]),
            Some(FrameKind::Depth)
        );
        // A truncated PNG signature is not a PNG
        assert_eq!(classify(&[0x89, 0x50, 0x4E]), Some(FrameKind::Custom));
        assert_eq!(classify(&[0xFF]), Some(FrameKind::Custom));
        assert_eq!(classify(b"{\"camera\"}"), Some(FrameKind::Custom));
    }

    #[test]
    fn test_split_rejects_overlong_json() {
        let mut frame = 100u32.to_le_bytes().to_vec();
        frame.extend_from_slice(b"{}");
        assert!(split_container(&frame).is_err());
        assert!(split_container(&[1, 2]).is_err());
    }

    #[test]
    fn test_container_header_layout() {
        let depth = DepthImage {
            width: 2,
            height: 1,
            samples: vec![0, 1200],
        };
        let frame = encode_container(&FrameMatrices::identity(), &depth).unwrap();
        let (header, compressed) = split_container(&frame).unwrap();

        assert_eq!(header.width, 2);
        assert_eq!(header.height, 1);
        assert_eq!(header.matrices.camera[0], 1.0);
        assert_eq!(header.matrices.camera[1], 0.0);
        assert_eq!(rvl::decompress(compressed, 2).unwrap(), vec![0, 1200]);
    }

    #[test]
    fn test_encode_rejects_mismatched_sample_count() {
        let depth = DepthImage {
            width: 4,
            height: 4,
            samples: vec![1; 3],
        };
        assert!(encode_container(&FrameMatrices::identity(), &depth).is_err());
    }

    #[test]
    fn test_header_json_field_names() {
        let header = ContainerHeader {
            matrices: FrameMatrices::identity(),
            width: 640,
            height: 480,
        };
        let json = serde_json::to_value(&header).unwrap();
        assert!(json.get("camera").is_some());
        assert!(json.get("groundplane").is_some());
        assert_eq!(json["width"], 640);
        assert_eq!(json["camera"].as_array().unwrap().len(), 16);
    }
}
