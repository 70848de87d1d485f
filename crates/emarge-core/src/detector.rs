//! Face detection.
//!
//! [`Detect`] is the capability contract sessions and training code see;
//! [`OnnxDetector`] is the production implementation, an anchor-free
//! three-stride face detector run via ONNX Runtime on grayscale frames.

use crate::types::Detection;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DET_INPUT_SIZE: usize = 640;
const DET_MEAN: f32 = 127.5;
const DET_STD: f32 = 128.0;
const DET_STRIDES: [usize; 3] = [8, 16, 32];
const DET_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("frame buffer too short: expected {expected}, got {actual}")]
    BadFrame { expected: usize, actual: usize },
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Locates face regions in a grayscale frame.
///
/// Zero detections is a valid, non-error outcome: the steady state while
/// waiting for a usable frame. Implementations are stateless across
/// frames: a detection never depends on what earlier frames contained.
pub trait Detect {
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError>;
}

/// Detector tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct DetectorConfig {
    /// Reject detections smaller than this (pixels, either dimension).
    /// Bounds recognizer input size and drops noise regions.
    pub min_size: u32,
    /// Per-anchor score threshold; raises false-positive rejection.
    pub score_threshold: f32,
    /// IoU threshold for non-maximum suppression.
    pub nms_iou: f32,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            min_size: 60,
            score_threshold: 0.5,
            nms_iou: 0.4,
        }
    }
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// Output tensor indices for one stride: (score_idx, bbox_idx).
type StrideOutputs = (usize, usize);

/// Anchor-free ONNX face detector.
pub struct OnnxDetector {
    session: Session,
    config: DetectorConfig,
    /// Per-stride output indices [(score, bbox)] for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_outputs: [StrideOutputs; 3],
}

impl OnnxDetector {
    /// Load the detection model from the given path.
    pub fn load(model_path: &str, config: DetectorConfig) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            outputs = ?output_names,
            "loaded face detection model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector requires 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_outputs = discover_stride_outputs(&output_names);
        tracing::debug!(?stride_outputs, "detector output tensor mapping");

        Ok(Self {
            session,
            config,
            stride_outputs,
        })
    }
}

impl Detect for OnnxDetector {
    /// Detect faces, returning regions sorted by score, highest first.
    ///
    /// Every returned detection is at least `min_size` pixels in both
    /// dimensions.
    fn detect(
        &mut self,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Vec<Detection>, DetectorError> {
        let expected = (width * height) as usize;
        if gray.len() < expected {
            return Err(DetectorError::BadFrame {
                expected,
                actual: gray.len(),
            });
        }

        let (input, letterbox) = preprocess(gray, width as usize, height as usize);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all = Vec::new();
        for (pos, &stride) in DET_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all.extend(decode_stride(
                scores,
                bboxes,
                stride,
                &letterbox,
                self.config.score_threshold,
            ));
        }

        let mut result = filter_min_size(nms(all, self.config.nms_iou), self.config.min_size);
        result.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });

        Ok(result)
    }
}

/// Discover score/bbox output ordering by tensor name.
///
/// Exports may name tensors "score_8"/"bbox_8" etc., or use generic
/// numeric names; in the latter case the standard positional ordering
/// applies: [0-2] = scores, [3-5] = bboxes, each for strides 8/16/32.
fn discover_stride_outputs(names: &[String]) -> [StrideOutputs; 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = DET_STRIDES
        .iter()
        .all(|&s| find("score", s).is_some() && find("bbox", s).is_some());

    if named {
        std::array::from_fn(|i| {
            let stride = DET_STRIDES[i];
            // unwraps guarded by the `named` check above
            (find("score", stride).unwrap(), find("bbox", stride).unwrap())
        })
    } else {
        tracing::info!(
            ?names,
            "detector output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Preprocess a grayscale frame into a NCHW float tensor with letterbox
/// padding, using bilinear interpolation for the resize.
fn preprocess(gray: &[u8], width: usize, height: usize) -> (Array4<f32>, Letterbox) {
    let scale_w = DET_INPUT_SIZE as f32 / width as f32;
    let scale_h = DET_INPUT_SIZE as f32 / height as f32;
    let scale = scale_w.min(scale_h);

    let new_w = (width as f32 * scale).round() as usize;
    let new_h = (height as f32 * scale).round() as usize;
    let pad_x = (DET_INPUT_SIZE - new_w) as f32 / 2.0;
    let pad_y = (DET_INPUT_SIZE - new_h) as f32 / 2.0;

    let resized = crate::embedder::resize_bilinear(gray, width, height, new_w, new_h);

    let pad_x_start = pad_x.floor() as usize;
    let pad_y_start = pad_y.floor() as usize;

    let mut tensor = Array4::<f32>::zeros((1, 3, DET_INPUT_SIZE, DET_INPUT_SIZE));

    for y in 0..DET_INPUT_SIZE {
        for x in 0..DET_INPUT_SIZE {
            let pixel = if y >= pad_y_start
                && y < pad_y_start + new_h
                && x >= pad_x_start
                && x < pad_x_start + new_w
            {
                resized[(y - pad_y_start) * new_w + (x - pad_x_start)] as f32
            } else {
                DET_MEAN // pad value normalizes to 0.0
            };

            let normalized = (pixel - DET_MEAN) / DET_STD;
            // Grayscale → 3-channel: replicate Y into R, G, B
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    (tensor, Letterbox { scale, pad_x, pad_y })
}

/// Decode detections for a single stride level, mapping coordinates back
/// from letterboxed space to the original frame.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    letterbox: &Letterbox,
    threshold: f32,
) -> Vec<Detection> {
    let grid = DET_INPUT_SIZE / stride;
    let num_anchors = grid * grid * DET_ANCHORS_PER_CELL;

    let mut detections = Vec::new();

    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / DET_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride as f32;
        let anchor_cy = (anchor_idx / grid) as f32 * stride as f32;

        // bbox layout per anchor: [left, top, right, bottom] offsets × stride
        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        let orig_x1 = (x1 - letterbox.pad_x) / letterbox.scale;
        let orig_y1 = (y1 - letterbox.pad_y) / letterbox.scale;
        let orig_x2 = (x2 - letterbox.pad_x) / letterbox.scale;
        let orig_y2 = (y2 - letterbox.pad_y) / letterbox.scale;

        detections.push(Detection {
            x: orig_x1,
            y: orig_y1,
            width: orig_x2 - orig_x1,
            height: orig_y2 - orig_y1,
            score,
        });
    }

    detections
}

/// Non-maximum suppression: drop detections overlapping a higher-scored one.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep = Vec::new();
    let mut suppressed = vec![false; detections.len()];

    for i in 0..detections.len() {
        if suppressed[i] {
            continue;
        }
        keep.push(detections[i]);

        for j in (i + 1)..detections.len() {
            if !suppressed[j] && iou(&detections[i], &detections[j]) > iou_threshold {
                suppressed[j] = true;
            }
        }
    }

    keep
}

/// Drop detections smaller than `min_size` in either dimension.
///
/// Applied after NMS and coordinate de-mapping, so the guarantee holds on
/// the regions callers actually receive.
fn filter_min_size(detections: Vec<Detection>, min_size: u32) -> Vec<Detection> {
    let min = min_size as f32;
    detections
        .into_iter()
        .filter(|d| d.width >= min && d.height >= min)
        .collect()
}

/// Intersection-over-union of two detections.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.width * a.height + b.width * b.height - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn det(x: f32, y: f32, w: f32, h: f32, score: f32) -> Detection {
        Detection { x, y, width: w, height: h, score }
    }

    #[test]
    fn iou_identical() {
        let a = det(0.0, 0.0, 100.0, 100.0, 1.0);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_no_overlap() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(20.0, 20.0, 10.0, 10.0, 1.0);
        assert!(iou(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn iou_half_overlap() {
        let a = det(0.0, 0.0, 10.0, 10.0, 1.0);
        let b = det(5.0, 0.0, 10.0, 10.0, 1.0);
        // overlap 5x10 = 50, union 150
        assert!((iou(&a, &b) - 50.0 / 150.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_overlapping() {
        let input = vec![
            det(0.0, 0.0, 100.0, 100.0, 0.9),
            det(5.0, 5.0, 100.0, 100.0, 0.8),
            det(200.0, 200.0, 50.0, 50.0, 0.7),
        ];
        let result = nms(input, 0.4);
        assert_eq!(result.len(), 2);
        assert!((result[0].score - 0.9).abs() < 1e-6);
        assert!((result[1].score - 0.7).abs() < 1e-6);
    }

    #[test]
    fn nms_keeps_disjoint() {
        let input = vec![
            det(0.0, 0.0, 10.0, 10.0, 0.9),
            det(50.0, 50.0, 10.0, 10.0, 0.8),
        ];
        assert_eq!(nms(input, 0.4).len(), 2);
    }

    #[test]
    fn nms_empty() {
        assert!(nms(vec![], 0.4).is_empty());
    }

    #[test]
    fn min_size_rejects_small_regions() {
        let input = vec![
            det(0.0, 0.0, 59.0, 80.0, 0.9),  // too narrow
            det(0.0, 0.0, 80.0, 59.0, 0.9),  // too short
            det(0.0, 0.0, 60.0, 60.0, 0.8),  // exactly min
            det(0.0, 0.0, 120.0, 120.0, 0.7),
        ];
        let kept = filter_min_size(input, 60);
        assert_eq!(kept.len(), 2);
        assert!(kept.iter().all(|d| d.width >= 60.0 && d.height >= 60.0));
    }

    #[test]
    fn min_size_zero_keeps_everything() {
        let input = vec![det(0.0, 0.0, 1.0, 1.0, 0.9)];
        assert_eq!(filter_min_size(input, 0).len(), 1);
    }

    #[test]
    fn stride_outputs_named() {
        let names: Vec<String> = [
            "score_8", "score_16", "score_32", "bbox_8", "bbox_16", "bbox_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let outputs = discover_stride_outputs(&names);
        assert_eq!(outputs, [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn stride_outputs_shuffled_named() {
        let names: Vec<String> = [
            "bbox_8", "score_8", "bbox_16", "score_16", "bbox_32", "score_32",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect();

        let outputs = discover_stride_outputs(&names);
        assert_eq!(outputs, [(1, 0), (3, 2), (5, 4)]);
    }

    #[test]
    fn stride_outputs_positional_fallback() {
        let names: Vec<String> = (0..6).map(|i: usize| i.to_string()).collect();
        assert_eq!(discover_stride_outputs(&names), [(0, 3), (1, 4), (2, 5)]);
    }

    #[test]
    fn decode_maps_letterbox_back_to_frame() {
        // One anchor above threshold at stride 8, grid cell (1, 1),
        // offsets of one stride in every direction.
        let grid = DET_INPUT_SIZE / 8;
        let anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let mut scores = vec![0.0f32; anchors];
        let mut bboxes = vec![0.0f32; anchors * 4];

        let cell = grid + 1; // row 1, col 1
        let idx = cell * DET_ANCHORS_PER_CELL;
        scores[idx] = 0.9;
        bboxes[idx * 4..idx * 4 + 4].copy_from_slice(&[1.0, 1.0, 1.0, 1.0]);

        let lb = Letterbox { scale: 2.0, pad_x: 0.0, pad_y: 0.0 };
        let dets = decode_stride(&scores, &bboxes, 8, &lb, 0.5);
        assert_eq!(dets.len(), 1);

        // anchor center (8, 8), box [0, 0, 16, 16] letterboxed → /2 in frame space
        let d = dets[0];
        assert!((d.x - 0.0).abs() < 1e-4);
        assert!((d.y - 0.0).abs() < 1e-4);
        assert!((d.width - 8.0).abs() < 1e-4);
        assert!((d.height - 8.0).abs() < 1e-4);
    }

    #[test]
    fn decode_respects_score_threshold() {
        let grid = DET_INPUT_SIZE / 8;
        let anchors = grid * grid * DET_ANCHORS_PER_CELL;
        let scores = vec![0.3f32; anchors];
        let bboxes = vec![1.0f32; anchors * 4];

        let lb = Letterbox { scale: 1.0, pad_x: 0.0, pad_y: 0.0 };
        assert!(decode_stride(&scores, &bboxes, 8, &lb, 0.5).is_empty());
    }
}
