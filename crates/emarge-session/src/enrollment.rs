//! Enrollment session: capture frames, store labeled face crops, stream
//! annotated progress.

use crate::mjpeg;
use crate::session::{
    SessionError, SessionHandle, SessionOutcome, SessionStop, CHUNK_BUFFER, DARK_FRACTION,
};
use emarge_core::{Detect, Identity};
use emarge_hw::{annotate, frame, FrameSource};
use emarge_store::SampleStore;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

enum EnrollmentEnd {
    CapReached(u32),
    Stopped,
}

/// Start an enrollment session for `identity`.
///
/// Claims the identity's single-writer enrollment slot up front, so a
/// concurrent session for the same identity fails here, before any
/// capture happens. The capture loop then runs on its own thread until
/// the sample cap is reached, the consumer disconnects, or
/// [`SessionHandle::stop`] is signalled; the frame source and the
/// enrollment slot are released on every exit path.
pub fn start_enrollment<S, D>(
    identity: Identity,
    source: S,
    mut detector: D,
    store: Arc<SampleStore>,
    sample_cap: u32,
    jpeg_quality: u8,
) -> Result<SessionHandle, SessionError>
where
    S: FrameSource + 'static,
    D: Detect + Send + 'static,
{
    let guard = store.begin_enrollment(identity)?;

    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
    let (outcome_tx, outcome_rx) = watch::channel(SessionOutcome::Pending);
    let stop = SessionStop::new();
    let loop_stop = stop.clone();

    std::thread::Builder::new()
        .name(format!("emarge-enroll-{identity}"))
        .spawn(move || {
            let _guard = guard;
            let end = run(
                identity,
                source,
                &mut detector,
                &store,
                sample_cap,
                jpeg_quality,
                &loop_stop,
                &chunk_tx,
            );
            let outcome = match end {
                Ok(EnrollmentEnd::CapReached(samples)) => {
                    tracing::info!(identity, samples, "enrollment complete");
                    SessionOutcome::Completed { samples }
                }
                Ok(EnrollmentEnd::Stopped) => SessionOutcome::Cancelled,
                Err(e) => {
                    tracing::error!(identity, error = %e, "enrollment session failed");
                    SessionOutcome::Failed(e.to_string())
                }
            };
            let _ = outcome_tx.send(outcome);
            // source + guard drop here: device released, identity slot freed
        })
        .expect("failed to spawn enrollment thread");

    Ok(SessionHandle::new(chunk_rx, outcome_rx, stop))
}

#[allow(clippy::too_many_arguments)]
fn run<S: FrameSource, D: Detect>(
    identity: Identity,
    mut source: S,
    detector: &mut D,
    store: &SampleStore,
    sample_cap: u32,
    jpeg_quality: u8,
    stop: &SessionStop,
    chunks: &mpsc::Sender<Vec<u8>>,
) -> Result<EnrollmentEnd, SessionError> {
    let mut stored = 0u32;

    loop {
        if stop.is_signalled() {
            return Ok(EnrollmentEnd::Stopped);
        }
        if stored >= sample_cap {
            return Ok(EnrollmentEnd::CapReached(stored));
        }

        let mut frame = source.next_frame()?;

        // Dark frames still stream, but are not worth detecting on.
        let detections = if frame::is_dark_frame(&frame.data, DARK_FRACTION) {
            Vec::new()
        } else {
            detector.detect(&frame.data, frame.width, frame.height)?
        };

        for det in &detections {
            if stored >= sample_cap {
                break;
            }
            let (crop, cw, ch) = det.crop(&frame.data, frame.width, frame.height);
            if crop.is_empty() {
                continue;
            }
            store.add_sample(identity, &crop, cw, ch)?;
            stored += 1;
        }

        for det in &detections {
            annotate::draw_box(
                &mut frame,
                det.x as i32,
                det.y as i32,
                det.width as u32,
                det.height as u32,
                255,
                2,
            );
            annotate::draw_text(
                &mut frame,
                &format!("id {identity}"),
                det.x as i32 + 4,
                det.y as i32 - 16,
                255,
                2,
            );
        }

        let jpeg = frame.to_jpeg(jpeg_quality)?;
        if chunks.blocking_send(mjpeg::chunk(&jpeg)).is_err() {
            // consumer disconnected
            return Ok(EnrollmentEnd::Stopped);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{BrightDetector, SyntheticSource, FRAME_PIXELS};
    use emarge_store::SampleStoreError;

    fn sample_store() -> (tempfile::TempDir, Arc<SampleStore>) {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(SampleStore::open(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn stores_samples_until_cap_then_completes() {
        let (_dir, store) = sample_store();
        let (source, released) = SyntheticSource::cycling(vec![100]);

        let mut handle =
            start_enrollment(7, source, BrightDetector, Arc::clone(&store), 5, 80).unwrap();

        let mut chunks = 0usize;
        while let Some(chunk) = handle.next_chunk().await {
            assert!(chunk.starts_with(b"--frame\r\n"));
            chunks += 1;
        }

        assert_eq!(handle.outcome(), SessionOutcome::Completed { samples: 5 });
        assert!(chunks >= 5);
        assert_eq!(store.sample_count(7).unwrap(), 5);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn stored_samples_carry_the_target_identity() {
        let (_dir, store) = sample_store();
        let (source, _released) = SyntheticSource::cycling(vec![100]);

        let mut handle =
            start_enrollment(9, source, BrightDetector, Arc::clone(&store), 3, 80).unwrap();
        while handle.next_chunk().await.is_some() {}

        let samples = store.list_samples().unwrap();
        assert_eq!(samples.len(), 3);
        assert!(samples.iter().all(|(identity, _)| *identity == 9));
        // full-frame crops at the synthetic frame size
        assert_eq!(samples[0].1.as_raw().len(), FRAME_PIXELS);
    }

    #[tokio::test]
    async fn concurrent_enrollment_for_same_identity_is_rejected() {
        let (_dir, store) = sample_store();

        // Dark frames: no detections, so the first session never finishes
        let (source, _released) = SyntheticSource::cycling(vec![10]);
        let mut first =
            start_enrollment(7, source, BrightDetector, Arc::clone(&store), 5, 80).unwrap();

        let (second_source, _r2) = SyntheticSource::cycling(vec![10]);
        let err = start_enrollment(7, second_source, BrightDetector, Arc::clone(&store), 5, 80)
            .err()
            .unwrap();
        assert!(matches!(
            err,
            SessionError::Store(SampleStoreError::EnrollmentInProgress(7))
        ));

        first.stop();
        while first.next_chunk().await.is_some() {}
        assert_eq!(first.outcome(), SessionOutcome::Cancelled);

        // slot is free again
        let (third_source, _r3) = SyntheticSource::cycling(vec![10]);
        start_enrollment(7, third_source, BrightDetector, store, 5, 80).unwrap();
    }

    #[tokio::test]
    async fn dark_frames_stream_without_storing() {
        let (_dir, store) = sample_store();
        let (source, _released) = SyntheticSource::cycling(vec![10]);

        let mut handle =
            start_enrollment(7, source, BrightDetector, Arc::clone(&store), 5, 80).unwrap();

        // frames keep flowing even though nothing is detected
        for _ in 0..3 {
            assert!(handle.next_chunk().await.is_some());
        }
        handle.stop();
        while handle.next_chunk().await.is_some() {}

        assert_eq!(handle.outcome(), SessionOutcome::Cancelled);
        assert_eq!(store.sample_count(7).unwrap(), 0);
    }

    #[tokio::test]
    async fn consumer_disconnect_cancels_and_frees_the_slot() {
        let (_dir, store) = sample_store();
        let (source, released) = SyntheticSource::cycling(vec![10]);

        let handle =
            start_enrollment(7, source, BrightDetector, Arc::clone(&store), 5, 80).unwrap();
        let mut outcome = handle.outcome_channel();
        drop(handle);

        while !outcome.borrow().is_terminal() {
            if outcome.changed().await.is_err() {
                break;
            }
        }
        assert_eq!(*outcome.borrow(), SessionOutcome::Cancelled);
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));

        store.begin_enrollment(7).unwrap();
    }

    #[tokio::test]
    async fn camera_failure_surfaces_as_failed() {
        let (_dir, store) = sample_store();
        // finite source: frames run out mid-session
        let (source, released) = SyntheticSource::finite(vec![10, 10]);

        let mut handle =
            start_enrollment(7, source, BrightDetector, Arc::clone(&store), 5, 80).unwrap();
        while handle.next_chunk().await.is_some() {}

        assert!(matches!(handle.outcome(), SessionOutcome::Failed(_)));
        assert!(released.load(std::sync::atomic::Ordering::SeqCst));
    }
}
