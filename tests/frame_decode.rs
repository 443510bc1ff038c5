//! Tests for frames as they arrive on the data channel

use bytes::Bytes;
use std::sync::{Arc, Mutex};
use toolbox_rtc::frame::{
    classify, encode_container, rvl, split_container, DepthImage, FrameDecoder, FrameKind,
    FrameMatrices, FrameSink,
};

/// Records everything the decoder dispatches
#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<String>>,
    depth: Mutex<Option<DepthImage>>,
    matrices: Mutex<Option<FrameMatrices>>,
}

impl FrameSink for Recorder {
    fn on_color_frame(&self, jpeg: Bytes) {
        self.events.lock().unwrap().push(format!("color:{}", jpeg.len()));
    }

    fn on_depth_frame(&self, png: Bytes) {
        self.events.lock().unwrap().push(format!("png:{}", png.len()));
    }

    fn on_matrices(&self, matrices: &FrameMatrices) {
        self.events.lock().unwrap().push("matrices".to_string());
        *self.matrices.lock().unwrap() = Some(matrices.clone());
    }

    fn on_depth_samples(&self, depth: DepthImage) {
        self.events
            .lock()
            .unwrap()
            .push(format!("depth:{}x{}", depth.width, depth.height));
        *self.depth.lock().unwrap() = Some(depth);
    }
}

/// A sensor-like depth image: a sloped floor with holes where nothing was seen
fn sample_depth(width: u32, height: u32) -> DepthImage {
    let mut samples = Vec::with_capacity((width * height) as usize);
    for y in 0..height {
        for x in 0..width {
            let hole = (x / 8 + y / 8) % 5 == 0;
            samples.push(if hole { 0 } else { 800 + (y * 12) as u16 + (x % 3) as u16 });
        }
    }
    DepthImage {
        width,
        height,
        samples,
    }
}

fn camera_pose() -> FrameMatrices {
    let mut matrices = FrameMatrices::identity();
    matrices.camera[3] = 0.25;
    matrices.camera[7] = 1.5;
    matrices.camera[11] = -3.0;
    matrices.groundplane[7] = -1.2;
    matrices
}

#[test]
fn test_decoder_dispatches_by_magic() {
    let recorder = Arc::new(Recorder::default());
    let decoder = FrameDecoder::new(recorder.clone());

    let jpeg = Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xDB, 0x00, 0x43]);
    let png = Bytes::from_static(&[0x89, 0x50, 0x4E, 0x47, 0x0D, 0x0A, 0x1A, 0x0A, 0x00]);

    assert_eq!(decoder.handle(&jpeg), Some(FrameKind::Color));
    assert_eq!(decoder.handle(&png), Some(FrameKind::Depth));
    assert_eq!(decoder.handle(&Bytes::new()), None);

    assert_eq!(
        *recorder.events.lock().unwrap(),
        vec!["color:6".to_string(), "png:9".to_string()]
    );
}

#[test]
fn test_custom_container_round_trip() {
    let recorder = Arc::new(Recorder::default());
    let decoder = FrameDecoder::new(recorder.clone());
    let depth = sample_depth(64, 48);

    let frame = encode_container(&camera_pose(), &depth).unwrap();
    assert_eq!(classify(&frame), Some(FrameKind::Custom));
    assert_eq!(decoder.handle(&Bytes::from(frame)), Some(FrameKind::Custom));

    // Matrices always come first
    assert_eq!(
        *recorder.events.lock().unwrap(),
        vec!["matrices".to_string(), "depth:64x48".to_string()]
    );
    assert_eq!(recorder.matrices.lock().unwrap().clone(), Some(camera_pose()));
    assert_eq!(recorder.depth.lock().unwrap().clone(), Some(depth));
    assert_eq!(decoder.stats().errors, 0);
}

#[test]
fn test_rvl_shrinks_sensor_depth() {
    let depth = sample_depth(160, 120);
    let compressed = rvl::compress(&depth.samples);

    println!(
        "RVL: {} samples -> {} bytes ({:.1}%)",
        depth.samples.len(),
        compressed.len(),
        100.0 * compressed.len() as f64 / (depth.samples.len() * 2) as f64
    );
    assert!(compressed.len() < depth.samples.len() * 2);
    assert_eq!(
        rvl::decompress(&compressed, depth.samples.len()).unwrap(),
        depth.samples
    );
}

#[test]
fn test_json_header_is_little_endian_prefixed() {
    let frame = encode_container(&camera_pose(), &sample_depth(4, 4)).unwrap();
    let json_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;

    let header: serde_json::Value = serde_json::from_slice(&frame[4..4 + json_len]).unwrap();
    assert_eq!(header["width"], 4);
    assert_eq!(header["height"], 4);
    assert_eq!(header["camera"][3], 0.25);
    assert_eq!(header["groundplane"].as_array().unwrap().len(), 16);

    let (parsed, rest) = split_container(&frame).unwrap();
    assert_eq!(parsed.width, 4);
    assert_eq!(rest.len(), frame.len() - 4 - json_len);
}

#[test]
fn test_corrupt_frames_are_skipped() {
    let recorder = Arc::new(Recorder::default());
    let decoder = FrameDecoder::new(recorder.clone());

    // Header claims a larger image than the samples cover
    let mut frame = encode_container(&camera_pose(), &sample_depth(8, 8)).unwrap();
    let json_len = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
    let header = String::from_utf8(frame[4..4 + json_len].to_vec()).unwrap();
    let widened = header.replace("\"width\":8", "\"width\":9");
    assert_eq!(widened.len(), header.len());
    frame.splice(4..4 + json_len, widened.into_bytes());

    decoder.handle(&Bytes::from(frame));
    // Garbage that is neither JPEG nor PNG nor a valid container
    decoder.handle(&Bytes::from_static(b"\x05\x00\x00\x00{bad}"));

    let stats = decoder.stats();
    assert_eq!(stats.custom, 2);
    assert_eq!(stats.errors, 2);
    assert_eq!(*recorder.events.lock().unwrap(), vec!["matrices".to_string()]);
    assert!(recorder.depth.lock().unwrap().is_none());

    // The decoder keeps working afterwards
    decoder.handle(&Bytes::from_static(&[0xFF, 0xD8, 0x00]));
    assert_eq!(decoder.stats().color, 1);
}
