//! Face embedding extraction.
//!
//! Turns a grayscale face crop into an L2-normalized feature vector via
//! an ONNX embedding network. The gallery recognizer compares these
//! vectors by cosine similarity; nothing downstream depends on which
//! network produced them, only on the [`Embed`] contract.

use crate::types::Embedding;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBED_INPUT_SIZE: usize = 112;
const EMBED_MEAN: f32 = 127.5;
const EMBED_STD: f32 = 127.5;
const EMBED_DIM: usize = 512;
const EMBED_MODEL_TAG: &str = "w600k_r50";

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("empty face crop")]
    EmptyCrop,
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Extracts an embedding from a grayscale face crop of arbitrary size.
pub trait Embed {
    fn embed(&mut self, crop: &[u8], width: u32, height: u32)
        -> Result<Embedding, EmbedderError>;
}

/// ONNX embedding network.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    /// Load the embedding model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedding model"
        );

        Ok(Self { session })
    }
}

impl Embed for OnnxEmbedder {
    /// Resize the crop to the network input size, run inference, and
    /// L2-normalize the resulting vector.
    fn embed(
        &mut self,
        crop: &[u8],
        width: u32,
        height: u32,
    ) -> Result<Embedding, EmbedderError> {
        if width == 0 || height == 0 || crop.len() < (width * height) as usize {
            return Err(EmbedderError::EmptyCrop);
        }

        let resized = resize_bilinear(
            crop,
            width as usize,
            height as usize,
            EMBED_INPUT_SIZE,
            EMBED_INPUT_SIZE,
        );
        let input = preprocess(&resized);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw_data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        let raw: Vec<f32> = raw_data.to_vec();
        if raw.len() != EMBED_DIM {
            return Err(EmbedderError::InferenceFailed(format!(
                "expected {EMBED_DIM}-dim embedding, got {}",
                raw.len()
            )));
        }

        let norm: f32 = raw.iter().map(|x| x * x).sum::<f32>().sqrt();
        let values = if norm > 0.0 {
            raw.iter().map(|x| x / norm).collect()
        } else {
            raw
        };

        Ok(Embedding {
            values,
            model_tag: Some(EMBED_MODEL_TAG.to_string()),
        })
    }
}

/// Bilinear grayscale resize.
///
/// Shared by the embedder (crop → network input) and the detector's
/// letterbox preprocessing.
pub(crate) fn resize_bilinear(
    src: &[u8],
    src_w: usize,
    src_h: usize,
    dst_w: usize,
    dst_h: usize,
) -> Vec<u8> {
    if src_w == 0 || src_h == 0 || dst_w == 0 || dst_h == 0 {
        return vec![0u8; dst_w * dst_h];
    }

    let x_ratio = src_w as f32 / dst_w as f32;
    let y_ratio = src_h as f32 / dst_h as f32;

    let mut out = vec![0u8; dst_w * dst_h];
    for y in 0..dst_h {
        let src_y = (y as f32 + 0.5) * y_ratio - 0.5;
        let y0 = (src_y.floor() as i32).clamp(0, src_h as i32 - 1) as usize;
        let y1 = (y0 + 1).min(src_h - 1);
        let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

        for x in 0..dst_w {
            let src_x = (x as f32 + 0.5) * x_ratio - 0.5;
            let x0 = (src_x.floor() as i32).clamp(0, src_w as i32 - 1) as usize;
            let x1 = (x0 + 1).min(src_w - 1);
            let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

            let tl = src[y0 * src_w + x0] as f32;
            let tr = src[y0 * src_w + x1] as f32;
            let bl = src[y1 * src_w + x0] as f32;
            let br = src[y1 * src_w + x1] as f32;

            let val = tl * (1.0 - fx) * (1.0 - fy)
                + tr * fx * (1.0 - fy)
                + bl * (1.0 - fx) * fy
                + br * fx * fy;

            out[y * dst_w + x] = val.round().clamp(0.0, 255.0) as u8;
        }
    }

    out
}

/// Preprocess a 112×112 grayscale crop into a NCHW float tensor.
fn preprocess(resized: &[u8]) -> Array4<f32> {
    let size = EMBED_INPUT_SIZE;
    let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

    for y in 0..size {
        for x in 0..size {
            let pixel = resized.get(y * size + x).copied().unwrap_or(0) as f32;
            let normalized = (pixel - EMBED_MEAN) / EMBED_STD;
            tensor[[0, 0, y, x]] = normalized;
            tensor[[0, 1, y, x]] = normalized;
            tensor[[0, 2, y, x]] = normalized;
        }
    }

    tensor
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn preprocess_shape() {
        let crop = vec![128u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = preprocess(&crop);
        assert_eq!(tensor.shape(), &[1, 3, EMBED_INPUT_SIZE, EMBED_INPUT_SIZE]);
    }

    #[test]
    fn preprocess_normalization() {
        let crop = vec![128u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = preprocess(&crop);
        let expected = (128.0 - EMBED_MEAN) / EMBED_STD;
        assert!((tensor[[0, 0, 0, 0]] - expected).abs() < 1e-6);
    }

    #[test]
    fn preprocess_channels_identical() {
        let crop = vec![100u8; EMBED_INPUT_SIZE * EMBED_INPUT_SIZE];
        let tensor = preprocess(&crop);
        for y in 0..EMBED_INPUT_SIZE {
            for x in 0..EMBED_INPUT_SIZE {
                assert_eq!(tensor[[0, 0, y, x]], tensor[[0, 1, y, x]]);
                assert_eq!(tensor[[0, 1, y, x]], tensor[[0, 2, y, x]]);
            }
        }
    }

    #[test]
    fn resize_uniform_stays_uniform() {
        let src = vec![77u8; 30 * 30];
        let out = resize_bilinear(&src, 30, 30, 112, 112);
        assert_eq!(out.len(), 112 * 112);
        assert!(out.iter().all(|&p| p == 77));
    }

    #[test]
    fn resize_identity_size() {
        let src: Vec<u8> = (0..16).collect();
        let out = resize_bilinear(&src, 4, 4, 4, 4);
        assert_eq!(out, src);
    }

    #[test]
    fn resize_preserves_gradient_direction() {
        // Left-dark, right-bright 2x2 → upscaled output keeps the ramp
        let src = vec![0u8, 255u8, 0u8, 255u8];
        let out = resize_bilinear(&src, 2, 2, 8, 8);
        assert!(out[0] < out[7]);
        assert!(out[56] < out[63]);
    }
}
