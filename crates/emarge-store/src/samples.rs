//! Face sample store.
//!
//! One grayscale PNG per sample under a flat directory, keyed
//! `user.<identity>.<sequence>.png`. The identity label is recovered by
//! parsing the key: label and image always travel together, and nothing
//! can retag an image without renaming the file itself.

use emarge_core::Identity;
use image::GrayImage;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use thiserror::Error;

const KEY_PREFIX: &str = "user";
const KEY_EXT: &str = "png";

#[derive(Error, Debug)]
pub enum SampleStoreError {
    #[error("enrollment already in progress for identity {0}")]
    EnrollmentInProgress(Identity),
    #[error("invalid sample dimensions {width}x{height} for {len} bytes")]
    BadDimensions { width: u32, height: u32, len: usize },
    #[error("sample io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sample image: {0}")]
    Image(#[from] image::ImageError),
}

/// Key of one stored sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SampleId {
    pub identity: Identity,
    pub sequence: u32,
}

/// Filesystem-backed store of labeled face crops.
pub struct SampleStore {
    root: PathBuf,
    /// Identities with an enrollment session in flight. Two sessions for
    /// the same identity would interleave sequence numbers.
    enrolling: Arc<Mutex<HashSet<Identity>>>,
}

impl SampleStore {
    pub fn open(root: &Path) -> Result<Self, SampleStoreError> {
        std::fs::create_dir_all(root)?;
        Ok(Self {
            root: root.to_path_buf(),
            enrolling: Arc::new(Mutex::new(HashSet::new())),
        })
    }

    /// Claim the single-writer slot for an identity. The returned guard
    /// releases the slot on drop; a second concurrent claim fails.
    pub fn begin_enrollment(
        &self,
        identity: Identity,
    ) -> Result<EnrollmentGuard, SampleStoreError> {
        let mut enrolling = lock(&self.enrolling);
        if !enrolling.insert(identity) {
            return Err(SampleStoreError::EnrollmentInProgress(identity));
        }
        Ok(EnrollmentGuard {
            identity,
            enrolling: Arc::clone(&self.enrolling),
        })
    }

    /// Persist one grayscale face crop for `identity`, assigning the next
    /// free sequence number.
    pub fn add_sample(
        &self,
        identity: Identity,
        gray: &[u8],
        width: u32,
        height: u32,
    ) -> Result<SampleId, SampleStoreError> {
        let image = GrayImage::from_raw(width, height, gray.to_vec()).ok_or(
            SampleStoreError::BadDimensions {
                width,
                height,
                len: gray.len(),
            },
        )?;

        let sequence = self.next_sequence(identity)?;
        let id = SampleId { identity, sequence };
        image.save(self.key_path(&id))?;

        tracing::debug!(identity, sequence, "face sample stored");
        Ok(id)
    }

    /// Load every stored sample with its identity label. Files whose
    /// names do not parse as sample keys are skipped with a warning.
    pub fn list_samples(&self) -> Result<Vec<(Identity, GrayImage)>, SampleStoreError> {
        let mut entries: Vec<(SampleId, PathBuf)> = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            match parse_key(name) {
                Some(id) => entries.push((id, path)),
                None => {
                    if path.is_file() {
                        tracing::warn!(file = %path.display(), "skipping non-sample file");
                    }
                }
            }
        }
        // Deterministic order: identity, then sequence
        entries.sort_by_key(|(id, _)| (id.identity, id.sequence));

        let mut samples = Vec::with_capacity(entries.len());
        for (id, path) in entries {
            let image = image::open(&path)?.to_luma8();
            samples.push((id.identity, image));
        }
        Ok(samples)
    }

    /// Number of stored samples for one identity.
    pub fn sample_count(&self, identity: Identity) -> Result<usize, SampleStoreError> {
        Ok(self.keys_for(identity)?.len())
    }

    /// Delete every sample for `identity`. Returns how many were removed.
    pub fn purge(&self, identity: Identity) -> Result<usize, SampleStoreError> {
        let keys = self.keys_for(identity)?;
        for id in &keys {
            std::fs::remove_file(self.key_path(id))?;
        }
        tracing::info!(identity, removed = keys.len(), "samples purged");
        Ok(keys.len())
    }

    fn next_sequence(&self, identity: Identity) -> Result<u32, SampleStoreError> {
        Ok(self
            .keys_for(identity)?
            .iter()
            .map(|id| id.sequence)
            .max()
            .map_or(1, |max| max + 1))
    }

    fn keys_for(&self, identity: Identity) -> Result<Vec<SampleId>, SampleStoreError> {
        let mut keys = Vec::new();
        for entry in std::fs::read_dir(&self.root)? {
            let path = entry?.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or_default();
            if let Some(id) = parse_key(name) {
                if id.identity == identity {
                    keys.push(id);
                }
            }
        }
        Ok(keys)
    }

    fn key_path(&self, id: &SampleId) -> PathBuf {
        self.root
            .join(format!("{KEY_PREFIX}.{}.{}.{KEY_EXT}", id.identity, id.sequence))
    }
}

/// Single-writer token for one identity's enrollment.
pub struct EnrollmentGuard {
    identity: Identity,
    enrolling: Arc<Mutex<HashSet<Identity>>>,
}

impl Drop for EnrollmentGuard {
    fn drop(&mut self) {
        lock(&self.enrolling).remove(&self.identity);
    }
}

fn lock(set: &Mutex<HashSet<Identity>>) -> std::sync::MutexGuard<'_, HashSet<Identity>> {
    set.lock().unwrap_or_else(|e| e.into_inner())
}

/// Parse `user.<identity>.<sequence>.png` into a [`SampleId`].
fn parse_key(name: &str) -> Option<SampleId> {
    let mut parts = name.split('.');
    if parts.next()? != KEY_PREFIX {
        return None;
    }
    let identity: Identity = parts.next()?.parse().ok()?;
    let sequence: u32 = parts.next()?.parse().ok()?;
    if parts.next()? != KEY_EXT || parts.next().is_some() {
        return None;
    }
    Some(SampleId { identity, sequence })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> (tempfile::TempDir, SampleStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SampleStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn parse_key_roundtrip() {
        assert_eq!(
            parse_key("user.7.3.png"),
            Some(SampleId { identity: 7, sequence: 3 })
        );
        assert_eq!(parse_key("user.123.45.png").unwrap().identity, 123);
    }

    #[test]
    fn parse_key_rejects_foreign_files() {
        assert!(parse_key("model.json").is_none());
        assert!(parse_key("user.7.png").is_none());
        assert!(parse_key("user.7.3.jpg").is_none());
        assert!(parse_key("user.x.3.png").is_none());
        assert!(parse_key("user.7.3.png.bak").is_none());
        assert!(parse_key("").is_none());
    }

    #[test]
    fn add_assigns_monotone_sequences() {
        let (_dir, store) = store();
        let gray = vec![100u8; 16];

        let a = store.add_sample(7, &gray, 4, 4).unwrap();
        let b = store.add_sample(7, &gray, 4, 4).unwrap();
        let other = store.add_sample(8, &gray, 4, 4).unwrap();

        assert_eq!(a.sequence, 1);
        assert_eq!(b.sequence, 2);
        // sequences are per-identity
        assert_eq!(other.sequence, 1);
    }

    #[test]
    fn list_recovers_labels_from_keys() {
        let (_dir, store) = store();
        store.add_sample(7, &vec![10u8; 16], 4, 4).unwrap();
        store.add_sample(7, &vec![20u8; 16], 4, 4).unwrap();
        store.add_sample(8, &vec![30u8; 16], 4, 4).unwrap();

        let samples = store.list_samples().unwrap();
        assert_eq!(samples.len(), 3);
        assert_eq!(samples[0].0, 7);
        assert_eq!(samples[1].0, 7);
        assert_eq!(samples[2].0, 8);
        // pixel data survives the roundtrip
        assert_eq!(samples[0].1.as_raw()[0], 10);
        assert_eq!(samples[2].1.as_raw()[0], 30);
    }

    #[test]
    fn list_skips_foreign_files(){
        let (dir, store) = store();
        store.add_sample(7, &vec![10u8; 16], 4, 4).unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"not a sample").unwrap();

        assert_eq!(store.list_samples().unwrap().len(), 1);
    }

    #[test]
    fn purge_removes_only_target_identity() {
        let (_dir, store) = store();
        store.add_sample(7, &vec![10u8; 16], 4, 4).unwrap();
        store.add_sample(7, &vec![20u8; 16], 4, 4).unwrap();
        store.add_sample(8, &vec![30u8; 16], 4, 4).unwrap();

        assert_eq!(store.purge(7).unwrap(), 2);
        let remaining = store.list_samples().unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].0, 8);
    }

    #[test]
    fn sequences_continue_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        {
            let store = SampleStore::open(dir.path()).unwrap();
            store.add_sample(7, &vec![10u8; 16], 4, 4).unwrap();
        }
        let store = SampleStore::open(dir.path()).unwrap();
        let id = store.add_sample(7, &vec![20u8; 16], 4, 4).unwrap();
        assert_eq!(id.sequence, 2);
    }

    #[test]
    fn enrollment_guard_is_exclusive_per_identity() {
        let (_dir, store) = store();

        let guard = store.begin_enrollment(7).unwrap();
        assert!(matches!(
            store.begin_enrollment(7),
            Err(SampleStoreError::EnrollmentInProgress(7))
        ));
        // a different identity is unaffected
        let _other = store.begin_enrollment(8).unwrap();

        drop(guard);
        store.begin_enrollment(7).unwrap();
    }

    #[test]
    fn bad_dimensions_rejected() {
        let (_dir, store) = store();
        let err = store.add_sample(7, &vec![0u8; 10], 4, 4).unwrap_err();
        assert!(matches!(err, SampleStoreError::BadDimensions { .. }));
    }
}
