//! Trainable gallery recognizer.
//!
//! The trained model is a gallery of labeled embeddings built from the
//! full current sample set. Prediction is nearest-neighbor by cosine
//! similarity with the distance normalized onto a 0–100 scale, so the
//! session policy's confidence thresholds keep their meaning regardless
//! of which embedding network is plugged in.
//!
//! The artifact is one JSON file with replace-on-retrain semantics:
//! writers stage a temp file and rename it into place, readers load a
//! snapshot and never share a mutable handle. Retraining is always
//! explicit; callers decide when the sample set is final enough.

use crate::detector::{Detect, DetectorError};
use crate::embedder::{Embed, EmbedderError};
use crate::types::{Embedding, Identity, Prediction};
use image::GrayImage;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum TrainError {
    #[error("no usable face samples — enroll at least one identity before training")]
    InsufficientData,
    #[error("identity {0} has no usable samples after detector filtering")]
    NoUsableSamples(Identity),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] EmbedderError),
}

#[derive(Error, Debug)]
pub enum ArtifactError {
    #[error("model artifact io: {0}")]
    Io(#[from] std::io::Error),
    #[error("model artifact encoding: {0}")]
    Json(#[from] serde_json::Error),
}

/// One gallery entry: an embedding tagged with the identity it came from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LabeledEmbedding {
    pub identity: Identity,
    pub embedding: Embedding,
}

/// Serialized recognizer state. Immutable once built; retraining
/// produces a fresh model with a new version id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainedModel {
    pub version: Uuid,
    pub created_at: String,
    pub embedder_tag: Option<String>,
    gallery: Vec<LabeledEmbedding>,
}

impl TrainedModel {
    /// Build a model from labeled samples.
    ///
    /// Each sample is re-scanned by the detector (samples are stored as
    /// face-region crops, but the detector is the arbiter of what is
    /// usable); the best-scored region is embedded into the gallery.
    ///
    /// A single enrolled identity is valid. Fails with
    /// [`TrainError::InsufficientData`] when nothing usable remains at
    /// all, and with [`TrainError::NoUsableSamples`] when some identity
    /// contributed samples but none survived detector filtering.
    pub fn train<D: Detect, E: Embed>(
        samples: &[(Identity, GrayImage)],
        detector: &mut D,
        embedder: &mut E,
    ) -> Result<TrainedModel, TrainError> {
        // One active retrain per process; concurrent callers queue here.
        static TRAIN_SLOT: Mutex<()> = Mutex::new(());
        let _slot = TRAIN_SLOT.lock().unwrap_or_else(|e| e.into_inner());

        let mut usable: BTreeMap<Identity, usize> = BTreeMap::new();
        let mut gallery = Vec::new();
        let mut embedder_tag = None;

        for (identity, image) in samples {
            usable.entry(*identity).or_insert(0);

            let faces = detector.detect(image.as_raw(), image.width(), image.height())?;
            let Some(best) = faces
                .iter()
                .max_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))
            else {
                tracing::debug!(identity, "sample rejected: no face found in crop");
                continue;
            };

            let (crop, cw, ch) = best.crop(image.as_raw(), image.width(), image.height());
            if crop.is_empty() {
                continue;
            }

            let embedding = embedder.embed(&crop, cw, ch)?;
            if embedder_tag.is_none() {
                embedder_tag = embedding.model_tag.clone();
            }
            gallery.push(LabeledEmbedding { identity: *identity, embedding });
            *usable.entry(*identity).or_insert(0) += 1;
        }

        if gallery.is_empty() {
            return Err(TrainError::InsufficientData);
        }
        if let Some((&identity, _)) = usable.iter().find(|(_, &count)| count == 0) {
            return Err(TrainError::NoUsableSamples(identity));
        }

        let model = TrainedModel {
            version: Uuid::new_v4(),
            created_at: chrono::Utc::now().to_rfc3339(),
            embedder_tag,
            gallery,
        };

        tracing::info!(
            version = %model.version,
            entries = model.gallery.len(),
            identities = usable.len(),
            "trained gallery model"
        );

        Ok(model)
    }

    /// Nearest-neighbor prediction over the gallery.
    ///
    /// Always traverses every entry; no early exit. Returns `None` only
    /// for an empty gallery, which [`Self::train`] never produces.
    pub fn predict(&self, probe: &Embedding) -> Option<Prediction> {
        let mut best_sim = f32::NEG_INFINITY;
        let mut best_identity = None;

        for entry in &self.gallery {
            let sim = probe.similarity(&entry.embedding);
            if sim > best_sim {
                best_sim = sim;
                best_identity = Some(entry.identity);
            }
        }

        best_identity.map(|identity| Prediction {
            identity,
            distance: normalize_distance(best_sim),
        })
    }

    /// Write the artifact atomically: stage a temp file next to the
    /// target and rename it into place, so a concurrent reader sees
    /// either the old model or the new one, never a torn file.
    pub fn save(&self, path: &Path) -> Result<(), ArtifactError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let staged = path.with_extension(format!("tmp.{}", self.version.simple()));
        std::fs::write(&staged, serde_json::to_vec_pretty(self)?)?;
        std::fs::rename(&staged, path)?;

        tracing::info!(version = %self.version, path = %path.display(), "model artifact replaced");
        Ok(())
    }

    /// Load a model snapshot from disk.
    pub fn load(path: &Path) -> Result<TrainedModel, ArtifactError> {
        let raw = std::fs::read(path)?;
        Ok(serde_json::from_slice(&raw)?)
    }

    pub fn len(&self) -> usize {
        self.gallery.len()
    }

    pub fn is_empty(&self) -> bool {
        self.gallery.is_empty()
    }

    /// Distinct identities in the gallery, with entry counts.
    pub fn identity_counts(&self) -> BTreeMap<Identity, usize> {
        let mut counts = BTreeMap::new();
        for entry in &self.gallery {
            *counts.entry(entry.identity).or_insert(0) += 1;
        }
        counts
    }
}

/// Map cosine similarity onto the 0–100 distance scale the policy layer
/// expects: `(1 − cosine) × 100`, clamped. A perfect match is 0, an
/// orthogonal probe is 100.
fn normalize_distance(similarity: f32) -> f32 {
    ((1.0 - similarity) * 100.0).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Detection;

    fn axis_embedding(axis: usize) -> Embedding {
        let mut values = vec![0.0f32; 4];
        values[axis] = 1.0;
        Embedding { values, model_tag: None }
    }

    fn model_with(entries: Vec<(Identity, Embedding)>) -> TrainedModel {
        TrainedModel {
            version: Uuid::new_v4(),
            created_at: "2026-01-01T00:00:00Z".into(),
            embedder_tag: None,
            gallery: entries
                .into_iter()
                .map(|(identity, embedding)| LabeledEmbedding { identity, embedding })
                .collect(),
        }
    }

    /// Detector stub: one full-image detection per frame, or nothing.
    struct FixedDetector {
        found: bool,
    }

    impl Detect for FixedDetector {
        fn detect(
            &mut self,
            _gray: &[u8],
            width: u32,
            height: u32,
        ) -> Result<Vec<Detection>, DetectorError> {
            if self.found {
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

    /// Embedder stub: embedding determined by the crop's mean intensity,
    /// bucketed so same-identity images cluster on one axis.
    struct BucketEmbedder;

    impl Embed for BucketEmbedder {
        fn embed(
            &mut self,
            crop: &[u8],
            _width: u32,
            _height: u32,
        ) -> Result<Embedding, EmbedderError> {
            let mean = crop.iter().map(|&p| p as usize).sum::<usize>() / crop.len().max(1);
            Ok(axis_embedding((mean / 64).min(3)))
        }
    }

    fn gray(level: u8) -> GrayImage {
        GrayImage::from_raw(8, 8, vec![level; 64]).unwrap()
    }

    #[test]
    fn predict_nearest_neighbor() {
        let model = model_with(vec![
            (1, axis_embedding(0)),
            (2, axis_embedding(1)),
            (3, axis_embedding(2)),
        ]);

        let p = model.predict(&axis_embedding(1)).unwrap();
        assert_eq!(p.identity, 2);
        assert!(p.distance < 1e-4);
    }

    #[test]
    fn predict_traverses_full_gallery() {
        // Best match is the last entry
        let model = model_with(vec![
            (1, axis_embedding(0)),
            (2, axis_embedding(1)),
            (9, axis_embedding(3)),
        ]);
        let p = model.predict(&axis_embedding(3)).unwrap();
        assert_eq!(p.identity, 9);
    }

    #[test]
    fn predict_empty_gallery_is_none() {
        let model = model_with(vec![]);
        assert!(model.predict(&axis_embedding(0)).is_none());
    }

    #[test]
    fn distance_scale() {
        assert!(normalize_distance(1.0).abs() < 1e-6);
        assert!((normalize_distance(0.35) - 65.0).abs() < 1e-4);
        assert!((normalize_distance(0.0) - 100.0).abs() < 1e-6);
        // Anti-correlated probes clamp at the scale ceiling
        assert_eq!(normalize_distance(-1.0), 100.0);
    }

    #[test]
    fn train_builds_gallery_per_identity() {
        let samples = vec![
            (7, gray(10)),
            (7, gray(20)),
            (8, gray(200)),
        ];
        let model = TrainedModel::train(
            &samples,
            &mut FixedDetector { found: true },
            &mut BucketEmbedder,
        )
        .unwrap();

        assert_eq!(model.len(), 3);
        let counts = model.identity_counts();
        assert_eq!(counts[&7], 2);
        assert_eq!(counts[&8], 1);

        // A training-set probe maps back to its own identity
        let p = model.predict(&axis_embedding(0)).unwrap();
        assert_eq!(p.identity, 7);
        assert!(p.distance < 1.0);
    }

    #[test]
    fn train_single_identity_is_valid() {
        let samples = vec![(7, gray(10))];
        let model = TrainedModel::train(
            &samples,
            &mut FixedDetector { found: true },
            &mut BucketEmbedder,
        )
        .unwrap();
        assert_eq!(model.identity_counts().len(), 1);
    }

    #[test]
    fn train_empty_set_fails() {
        let samples: Vec<(Identity, GrayImage)> = vec![];
        let err = TrainedModel::train(
            &samples,
            &mut FixedDetector { found: true },
            &mut BucketEmbedder,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::InsufficientData));
    }

    #[test]
    fn train_identity_without_faces_fails() {
        let samples = vec![(7, gray(10))];
        let err = TrainedModel::train(
            &samples,
            &mut FixedDetector { found: false },
            &mut BucketEmbedder,
        )
        .unwrap_err();
        assert!(matches!(err, TrainError::InsufficientData));
    }

    #[test]
    fn train_mixed_usable_and_unusable_identity_fails() {
        struct EveryOther {
            call: usize,
        }
        impl Detect for EveryOther {
            fn detect(
                &mut self,
                _gray: &[u8],
                width: u32,
                height: u32,
            ) -> Result<Vec<Detection>, DetectorError> {
                self.call += 1;
                if self.call == 1 {
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

        // identity 7 yields a usable sample, identity 8 yields none
        let samples = vec![(7, gray(10)), (8, gray(200))];
        let err = TrainedModel::train(&samples, &mut EveryOther { call: 0 }, &mut BucketEmbedder)
            .unwrap_err();
        assert!(matches!(err, TrainError::NoUsableSamples(8)));
    }

    #[test]
    fn save_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let model = model_with(vec![(7, axis_embedding(0)), (8, axis_embedding(1))]);
        model.save(&path).unwrap();

        let loaded = TrainedModel::load(&path).unwrap();
        assert_eq!(loaded.version, model.version);
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded.predict(&axis_embedding(1)).unwrap().identity, 8);
    }

    #[test]
    fn save_leaves_no_staging_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        model_with(vec![(7, axis_embedding(0))]).save(&path).unwrap();

        let names: Vec<String> = std::fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(names, vec!["model.json".to_string()]);
    }

    #[test]
    fn save_replaces_previous_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model.json");

        let first = model_with(vec![(7, axis_embedding(0))]);
        first.save(&path).unwrap();
        let second = model_with(vec![(8, axis_embedding(1))]);
        second.save(&path).unwrap();

        let loaded = TrainedModel::load(&path).unwrap();
        assert_eq!(loaded.version, second.version);
    }

    #[test]
    fn load_missing_artifact_is_io_error() {
        let err = TrainedModel::load(Path::new("/nonexistent/model.json")).unwrap_err();
        assert!(matches!(err, ArtifactError::Io(_)));
    }
}
