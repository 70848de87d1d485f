//! Synthetic frame sources and pipeline stubs for session tests.
//!
//! The stubs encode identity as brightness: the embedder maps a crop's
//! mean gray level to a unit vector at that many degrees, so the cosine
//! between two levels is `cos(Δlevel°)` and confidence is steerable by
//! choosing frame levels.

use emarge_core::detector::{Detect, DetectorError};
use emarge_core::embedder::{Embed, EmbedderError};
use emarge_core::{Detection, Embedding, Identity, TrainedModel};
use emarge_hw::camera::{CameraError, FrameSource};
use emarge_hw::Frame;
use image::GrayImage;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub const FRAME_W: u32 = 64;
pub const FRAME_H: u32 = 64;
pub const FRAME_PIXELS: usize = (FRAME_W * FRAME_H) as usize;

/// Frame source producing uniform frames at the given gray levels.
///
/// The released flag flips when the source is dropped, standing in for
/// the capture device being closed.
pub struct SyntheticSource {
    levels: Vec<u8>,
    index: usize,
    cycle: bool,
    released: Arc<AtomicBool>,
}

impl SyntheticSource {
    /// Loops over `levels` forever.
    pub fn cycling(levels: Vec<u8>) -> (Self, Arc<AtomicBool>) {
        Self::new(levels, true)
    }

    /// Yields `levels` once, then fails like an unplugged camera.
    pub fn finite(levels: Vec<u8>) -> (Self, Arc<AtomicBool>) {
        Self::new(levels, false)
    }

    fn new(levels: Vec<u8>, cycle: bool) -> (Self, Arc<AtomicBool>) {
        let released = Arc::new(AtomicBool::new(false));
        (
            Self {
                levels,
                index: 0,
                cycle,
                released: Arc::clone(&released),
            },
            released,
        )
    }
}

impl Drop for SyntheticSource {
    fn drop(&mut self) {
        self.released.store(true, Ordering::SeqCst);
    }
}

impl FrameSource for SyntheticSource {
    fn next_frame(&mut self) -> Result<Frame, CameraError> {
        if self.index >= self.levels.len() {
            if self.cycle {
                self.index = 0;
            } else {
                return Err(CameraError::Exhausted);
            }
        }
        let level = self.levels[self.index];
        self.index += 1;

        let mut frame = Frame::from_gray(vec![level; FRAME_PIXELS], FRAME_W, FRAME_H);
        frame.sequence = self.index as u32;
        Ok(frame)
    }

    fn dimensions(&self) -> (u32, u32) {
        (FRAME_W, FRAME_H)
    }
}

/// Detects one full-frame face whenever the frame is reasonably lit.
pub struct BrightDetector;

impl Detect for BrightDetector {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let mean = gray.iter().map(|&p| p as usize).sum::<usize>() / gray.len().max(1);
        if mean >= 40 {
            Ok(vec![Detection {
                x: 0.0,
                y: 0.0,
                width: width as f32,
                height: height as f32,
                score: 0.9,
            }])
        } else {
            Ok(vec![])
        }
    }
}

/// Embedding = unit vector at (mean gray level) degrees.
pub struct AngleEmbedder;

impl Embed for AngleEmbedder {
    fn embed(
        &mut self,
        crop: &[u8],
        _width: u32,
        _height: u32,
    ) -> Result<Embedding, EmbedderError> {
        let mean = crop.iter().map(|&p| p as usize).sum::<usize>() / crop.len().max(1);
        let theta = (mean as f32).to_radians();
        Ok(Embedding {
            values: vec![theta.cos(), theta.sin()],
            model_tag: None,
        })
    }
}

/// Train a gallery from (identity, gray level) pairs through the stubs.
pub fn trained_model(entries: &[(Identity, u8)]) -> TrainedModel {
    let samples: Vec<(Identity, GrayImage)> = entries
        .iter()
        .map(|&(identity, level)| {
            let image = GrayImage::from_raw(FRAME_W, FRAME_H, vec![level; FRAME_PIXELS])
                .expect("synthetic image dimensions");
            (identity, image)
        })
        .collect();

    TrainedModel::train(&samples, &mut BrightDetector, &mut AngleEmbedder)
        .expect("synthetic training set is usable")
}
