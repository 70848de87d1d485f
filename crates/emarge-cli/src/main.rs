use anyhow::{Context, Result};
use chrono::Local;
use clap::{Parser, Subcommand};
use emarge_core::{Identity, OnnxDetector, OnnxEmbedder, TrainedModel};
use emarge_hw::Camera;
use emarge_session::{
    start_enrollment, start_recognition, Config, SessionHandle, SessionOutcome,
};
use emarge_store::{AttendanceLedger, LedgerError, SampleStore};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

#[derive(Parser)]
#[command(name = "emarge", about = "Face-recognition attendance register")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Capture face samples for a user from the camera
    Enroll {
        /// User id from the directory
        #[arg(short, long)]
        identity: Identity,
        /// Stop after this many samples (default from config)
        #[arg(short, long)]
        count: Option<u32>,
        /// Mirror the annotated multipart stream to a file
        #[arg(long)]
        stream_out: Option<PathBuf>,
    },
    /// Rebuild the gallery model from the current sample set
    Train,
    /// Match the camera against a claimed identity
    Verify {
        #[arg(short, long)]
        identity: Identity,
        #[arg(long)]
        stream_out: Option<PathBuf>,
    },
    /// Verify, then record today's clock-in on success
    ClockIn {
        #[arg(short, long)]
        identity: Identity,
    },
    /// Verify, then record today's clock-out on success
    ClockOut {
        #[arg(short, long)]
        identity: Identity,
    },
    /// Show attendance records for a user
    Attendance {
        #[arg(short, long)]
        identity: Identity,
        /// A single day (YYYY-MM-DD); all days when omitted
        #[arg(short, long)]
        day: Option<String>,
    },
    /// Delete every stored sample for a user
    Purge {
        #[arg(short, long)]
        identity: Identity,
    },
    /// List available capture devices
    Devices,
    /// Show pipeline status as JSON
    Status,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Config::from_env();

    match cli.command {
        Commands::Enroll { identity, count, stream_out } => {
            enroll(&config, identity, count, stream_out).await
        }
        Commands::Train => train(&config),
        Commands::Verify { identity, stream_out } => {
            match verify(&config, identity, stream_out).await? {
                Some(confidence) => {
                    println!("Match accepted for id {identity} at {confidence}%");
                    Ok(())
                }
                None => {
                    println!("No accepted match for id {identity}");
                    Ok(())
                }
            }
        }
        Commands::ClockIn { identity } => clock(&config, identity, ClockDirection::In).await,
        Commands::ClockOut { identity } => clock(&config, identity, ClockDirection::Out).await,
        Commands::Attendance { identity, day } => attendance(&config, identity, day),
        Commands::Purge { identity } => {
            let store = SampleStore::open(&config.samples_dir)?;
            let removed = store.purge(identity)?;
            println!("Removed {removed} sample(s) for id {identity}");
            println!("The gallery is stale until the next `emarge train`.");
            Ok(())
        }
        Commands::Devices => {
            let devices = Camera::list_devices();
            if devices.is_empty() {
                println!("No capture devices found");
            }
            for d in devices {
                println!("{}  {} ({})", d.path, d.name, d.driver);
            }
            Ok(())
        }
        Commands::Status => status(&config),
    }
}

async fn enroll(
    config: &Config,
    identity: Identity,
    count: Option<u32>,
    stream_out: Option<PathBuf>,
) -> Result<()> {
    let store = Arc::new(SampleStore::open(&config.samples_dir)?);
    let detector = OnnxDetector::load(&config.detector_model_path(), config.detector)?;
    let camera = Camera::open(&config.camera_device).context("camera unavailable")?;

    let cap = count.unwrap_or(config.sample_cap);
    let mut handle =
        start_enrollment(identity, camera, detector, store, cap, config.jpeg_quality)?;

    drain_stream(&mut handle, stream_out).await?;

    match handle.outcome() {
        SessionOutcome::Completed { samples } => {
            println!("Enrolled {samples} sample(s) for id {identity}");
            println!("Run `emarge train` to rebuild the gallery.");
            Ok(())
        }
        SessionOutcome::Cancelled => {
            println!("Enrollment stopped before reaching {cap} samples");
            Ok(())
        }
        SessionOutcome::Failed(e) => anyhow::bail!("enrollment failed: {e}"),
        other => anyhow::bail!("unexpected enrollment outcome: {other:?}"),
    }
}

fn train(config: &Config) -> Result<()> {
    let store = SampleStore::open(&config.samples_dir)?;
    let samples = store.list_samples()?;
    println!("Training on {} sample(s)", samples.len());

    let mut detector = OnnxDetector::load(&config.detector_model_path(), config.detector)?;
    let mut embedder = OnnxEmbedder::load(&config.embedder_model_path())?;

    let model = TrainedModel::train(&samples, &mut detector, &mut embedder)?;
    model.save(&config.artifact_path)?;

    println!(
        "Gallery {} written to {} ({} entries, {} identities)",
        model.version,
        config.artifact_path.display(),
        model.len(),
        model.identity_counts().len(),
    );
    Ok(())
}

/// Run a recognition session against the camera; `Some(confidence)` on
/// an accepted match within the configured timeout.
async fn verify(
    config: &Config,
    identity: Identity,
    stream_out: Option<PathBuf>,
) -> Result<Option<i32>> {
    let model = Arc::new(
        TrainedModel::load(&config.artifact_path)
            .context("no trained gallery — enroll and run `emarge train` first")?,
    );
    let detector = OnnxDetector::load(&config.detector_model_path(), config.detector)?;
    let embedder = OnnxEmbedder::load(&config.embedder_model_path())?;
    let camera = Camera::open(&config.camera_device).context("camera unavailable")?;

    let mut handle = start_recognition(
        identity,
        camera,
        detector,
        embedder,
        model,
        config.policy,
        config.jpeg_quality,
    );

    // External cancellation: give up after the configured window.
    let stopper = handle.stopper();
    let timeout = config.recognition_timeout_secs;
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(timeout)).await;
        stopper.signal();
    });

    drain_stream(&mut handle, stream_out).await?;

    match handle.outcome() {
        SessionOutcome::Accepted { identity: matched, confidence } => {
            debug_assert_eq!(matched, identity);
            Ok(Some(confidence))
        }
        SessionOutcome::Cancelled => Ok(None),
        SessionOutcome::Failed(e) => anyhow::bail!("recognition failed: {e}"),
        other => anyhow::bail!("unexpected recognition outcome: {other:?}"),
    }
}

enum ClockDirection {
    In,
    Out,
}

async fn clock(config: &Config, identity: Identity, direction: ClockDirection) -> Result<()> {
    let Some(confidence) = verify(config, identity, None).await? else {
        println!("Face not recognized — attendance unchanged");
        return Ok(());
    };
    println!("Match accepted at {confidence}%");

    let ledger = AttendanceLedger::open(&config.db_path)?;
    let now = Local::now().naive_local();

    match direction {
        ClockDirection::In => {
            let record = ledger.record_clock_in(identity, now.date(), now.time())?;
            // idempotent: a repeated clock-in reports the original time
            match record.start_time {
                Some(t) => println!("Clock-in for id {identity} on {}: {t}", record.day),
                None => println!("Clock-in recorded for id {identity} on {}", record.day),
            }
        }
        ClockDirection::Out => match ledger.record_clock_out(identity, now.date(), now.time()) {
            Ok(record) => {
                if let Some(t) = record.end_time {
                    println!("Clock-out for id {identity} on {}: {t}", record.day);
                }
            }
            Err(LedgerError::NoActiveSession { .. }) => {
                println!("No active session today — clock in first");
            }
            Err(e) => return Err(e.into()),
        },
    }
    Ok(())
}

fn attendance(config: &Config, identity: Identity, day: Option<String>) -> Result<()> {
    let ledger = AttendanceLedger::open(&config.db_path)?;

    let records = match day {
        Some(day) => {
            let day = chrono::NaiveDate::parse_from_str(&day, "%Y-%m-%d")
                .context("day must be YYYY-MM-DD")?;
            ledger.record_for(identity, day)?.into_iter().collect()
        }
        None => ledger.records_for(identity)?,
    };

    if records.is_empty() {
        println!("No attendance records for id {identity}");
        return Ok(());
    }

    for r in records {
        let start = r.start_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        let end = r.end_time.map(|t| t.to_string()).unwrap_or_else(|| "-".into());
        println!("{}  in {start}  out {end}  [{:?}]", r.day, r.state());
    }
    Ok(())
}

fn status(config: &Config) -> Result<()> {
    let store = SampleStore::open(&config.samples_dir)?;
    let samples = store.list_samples()?.len();

    let gallery = TrainedModel::load(&config.artifact_path).ok().map(|m| {
        serde_json::json!({
            "version": m.version.to_string(),
            "created_at": m.created_at,
            "entries": m.len(),
            "identities": m.identity_counts().len(),
        })
    });

    let status = serde_json::json!({
        "camera": config.camera_device,
        "samples_dir": config.samples_dir,
        "samples": samples,
        "artifact": config.artifact_path,
        "gallery": gallery,
        "ledger": config.db_path,
        "accept_threshold": config.policy.accept_threshold,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

/// Pull session chunks until the stream ends, optionally mirroring the
/// raw multipart bytes to a file for an external viewer.
async fn drain_stream(handle: &mut SessionHandle, out: Option<PathBuf>) -> Result<()> {
    let mut sink = match out {
        Some(path) => Some(
            tokio::fs::File::create(&path)
                .await
                .with_context(|| format!("cannot create {}", path.display()))?,
        ),
        None => None,
    };

    while let Some(chunk) = handle.next_chunk().await {
        if let Some(file) = sink.as_mut() {
            file.write_all(&chunk).await?;
        }
    }
    if let Some(file) = sink.as_mut() {
        file.flush().await?;
    }
    Ok(())
}
