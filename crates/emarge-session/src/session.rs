//! Shared session plumbing: the consumer-facing handle, the stop signal,
//! and the outcome side channel.
//!
//! A session's capture loop runs on a dedicated OS thread that owns the
//! frame source, the models, and every other resource for its lifetime.
//! Annotated multipart chunks flow to the consumer through a bounded
//! channel: the capture thread uses `blocking_send`, so a slow consumer
//! blocks the producer rather than growing an unbounded buffer, and a
//! dropped consumer ends the session at the next send.

use emarge_core::Identity;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch};

/// In-flight chunks between the capture thread and the consumer.
pub(crate) const CHUNK_BUFFER: usize = 2;

/// Frames with more than this fraction of near-black pixels are skipped
/// instead of being fed to the detector.
pub(crate) const DARK_FRACTION: f32 = 0.95;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error(transparent)]
    Store(#[from] emarge_store::SampleStoreError),
    #[error("camera: {0}")]
    Camera(#[from] emarge_hw::CameraError),
    #[error("detector: {0}")]
    Detector(#[from] emarge_core::detector::DetectorError),
    #[error("embedder: {0}")]
    Embedder(#[from] emarge_core::embedder::EmbedderError),
    #[error("frame: {0}")]
    Frame(#[from] emarge_hw::frame::FrameError),
}

/// Terminal (or pending) state of a capture session, published on the
/// side channel, never embedded in the frame stream itself.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// Session is still sampling.
    Pending,
    /// Recognition: a candidate match reached the accept threshold.
    Accepted { identity: Identity, confidence: i32 },
    /// Enrollment: the sample cap was reached.
    Completed { samples: u32 },
    /// Stopped externally, or the consumer disconnected.
    Cancelled,
    /// The capture loop died (camera unplugged, inference failure, ...).
    Failed(String),
}

impl SessionOutcome {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionOutcome::Pending)
    }
}

/// Stop signal checked between frames, never mid-frame.
#[derive(Clone)]
pub struct SessionStop(Arc<AtomicBool>);

impl SessionStop {
    pub(crate) fn new() -> Self {
        Self(Arc::new(AtomicBool::new(false)))
    }

    pub fn signal(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub(crate) fn is_signalled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Consumer side of a running session.
pub struct SessionHandle {
    chunks: mpsc::Receiver<Vec<u8>>,
    outcome: watch::Receiver<SessionOutcome>,
    stop: SessionStop,
}

impl SessionHandle {
    pub(crate) fn new(
        chunks: mpsc::Receiver<Vec<u8>>,
        outcome: watch::Receiver<SessionOutcome>,
        stop: SessionStop,
    ) -> Self {
        Self { chunks, outcome, stop }
    }

    /// Pull the next multipart chunk. `None` means the session ended and
    /// its final outcome is readable.
    pub async fn next_chunk(&mut self) -> Option<Vec<u8>> {
        self.chunks.recv().await
    }

    /// Latest published outcome.
    pub fn outcome(&self) -> SessionOutcome {
        self.outcome.borrow().clone()
    }

    /// A watcher for the outcome side channel, e.g. for a page poller
    /// waiting on acceptance while another task streams frames.
    pub fn outcome_channel(&self) -> watch::Receiver<SessionOutcome> {
        self.outcome.clone()
    }

    /// Request termination. The capture loop notices between frames and
    /// releases the device within one frame interval.
    pub fn stop(&self) {
        self.stop.signal();
    }

    /// A detached stop trigger (e.g. for a timeout task).
    pub fn stopper(&self) -> SessionStop {
        self.stop.clone()
    }
}
