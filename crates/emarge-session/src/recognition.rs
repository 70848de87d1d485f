//! Recognition session: capture frames, match against a claimed
//! identity, stream annotated frames, and publish acceptance on the
//! side channel.

use crate::mjpeg;
use crate::session::{
    SessionError, SessionHandle, SessionOutcome, SessionStop, CHUNK_BUFFER, DARK_FRACTION,
};
use emarge_core::{Detect, Embed, Identity, MatchPolicy, MatchResult, TrainedModel};
use emarge_hw::{annotate, frame, FrameSource};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};

enum RecognitionEnd {
    Accepted(MatchResult),
    Stopped,
}

/// Start a recognition session for the claimed identity.
///
/// The session holds the model snapshot it was given; a retrain
/// replacing the on-disk artifact never affects a running session. The
/// loop keeps sampling until a candidate match reaches the accept
/// threshold, the consumer disconnects, or stop is signalled; a frame
/// with no eligible candidate is never a reason to terminate.
pub fn start_recognition<S, D, E>(
    claimed: Identity,
    source: S,
    mut detector: D,
    mut embedder: E,
    model: Arc<TrainedModel>,
    policy: MatchPolicy,
    jpeg_quality: u8,
) -> SessionHandle
where
    S: FrameSource + 'static,
    D: Detect + Send + 'static,
    E: Embed + Send + 'static,
{
    let (chunk_tx, chunk_rx) = mpsc::channel(CHUNK_BUFFER);
    let (outcome_tx, outcome_rx) = watch::channel(SessionOutcome::Pending);
    let stop = SessionStop::new();
    let loop_stop = stop.clone();

    std::thread::Builder::new()
        .name(format!("emarge-recognize-{claimed}"))
        .spawn(move || {
            let end = run(
                claimed,
                source,
                &mut detector,
                &mut embedder,
                &model,
                policy,
                jpeg_quality,
                &loop_stop,
                &chunk_tx,
            );
            let outcome = match end {
                Ok(RecognitionEnd::Accepted(result)) => SessionOutcome::Accepted {
                    identity: result.predicted,
                    confidence: result.confidence,
                },
                Ok(RecognitionEnd::Stopped) => SessionOutcome::Cancelled,
                Err(e) => {
                    tracing::error!(claimed, error = %e, "recognition session failed");
                    SessionOutcome::Failed(e.to_string())
                }
            };
            let _ = outcome_tx.send(outcome);
        })
        .expect("failed to spawn recognition thread");

    SessionHandle::new(chunk_rx, outcome_rx, stop)
}

#[allow(clippy::too_many_arguments)]
fn run<S: FrameSource, D: Detect, E: Embed>(
    claimed: Identity,
    mut source: S,
    detector: &mut D,
    embedder: &mut E,
    model: &TrainedModel,
    policy: MatchPolicy,
    jpeg_quality: u8,
    stop: &SessionStop,
    chunks: &mpsc::Sender<Vec<u8>>,
) -> Result<RecognitionEnd, SessionError> {
    loop {
        if stop.is_signalled() {
            return Ok(RecognitionEnd::Stopped);
        }

        let mut frame = source.next_frame()?;

        let detections = if frame::is_dark_frame(&frame.data, DARK_FRACTION) {
            Vec::new()
        } else {
            detector.detect(&frame.data, frame.width, frame.height)?
        };

        let mut accepted: Option<MatchResult> = None;

        for det in &detections {
            let (crop, cw, ch) = det.crop(&frame.data, frame.width, frame.height);
            if crop.is_empty() {
                continue;
            }

            let embedding = embedder.embed(&crop, cw, ch)?;
            let Some(prediction) = model.predict(&embedding) else {
                continue;
            };
            let result = policy.evaluate(claimed, &prediction);

            if result.candidate {
                tracing::debug!(
                    claimed,
                    confidence = result.confidence,
                    accepted = result.accepted,
                    "candidate match"
                );
            }

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
                &result.display_label(),
                det.x as i32 + 4,
                det.y as i32 - 16,
                255,
                2,
            );
            annotate::draw_text(
                &mut frame,
                &format!("{}%", result.confidence),
                det.x as i32 + 4,
                (det.y + det.height) as i32 - 16,
                230,
                2,
            );

            if result.accepted && accepted.is_none() {
                accepted = Some(result);
            }
        }

        let jpeg = frame.to_jpeg(jpeg_quality)?;
        if chunks.blocking_send(mjpeg::chunk(&jpeg)).is_err() {
            return Ok(RecognitionEnd::Stopped);
        }

        if let Some(result) = accepted {
            tracing::info!(
                identity = result.predicted,
                confidence = result.confidence,
                "match accepted"
            );
            // Release the capture device before reporting acceptance.
            drop(source);
            return Ok(RecognitionEnd::Accepted(result));
        }
    }
}
