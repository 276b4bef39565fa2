//! # Analytics
//!
//! The Analytics stage performs the following functions:
//! * Subscribes to the unification topic and queues incoming unified
//!   groups.
//! * Every `log-wait-time` seconds, sends each outstanding group's
//!   combined image and metadata to the multimodal model with the
//!   configured prompt.
//! * Appends a timestamped line to `output/unified.log` and a row to the
//!   tabular report `output/unified.csv` per analysed group.
//!
//! Exactly one analytics worker runs per pipeline; the control plane
//! enforces the cap.
mod model;
mod report;

use clap::Parser;
use mcmot_common::{
    CommonKafkaOpts, init_tracing,
    metrics::{
        component_info_metric,
        failures::{self, FailureKind},
        messages_received::{self, MessageKind},
        names::{FAILURES, MESSAGES_RECEIVED},
    },
};
use mcmot_messages::{Stage, UnifiedGroup, stage_topic};
use mcmot_stage_runtime::{StageError, finish, install_observability};
use metrics::counter;
use model::{CaptionModel, HttpCaptionModel};
use rdkafka::{
    consumer::{CommitMode, Consumer},
    message::Message,
};
use report::{Report, ReportRow};
use std::{collections::VecDeque, net::SocketAddr, path::PathBuf, time::Duration};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
};
use tracing::{debug, info, warn};

#[derive(Debug, Parser)]
#[clap(author, version = mcmot_common::version!(), about)]
struct Cli {
    #[clap(flatten)]
    common_kafka_options: CommonKafkaOpts,

    /// Name of the pipeline this worker belongs to
    #[clap(long)]
    pipeline: String,

    /// Kafka consumer group
    #[clap(long, default_value = "analytics")]
    consumer_group: String,

    /// Base URL of the multimodal model endpoint
    #[clap(long)]
    model_endpoint: String,

    /// Per-request model timeout in milliseconds
    #[clap(long, default_value = "30000")]
    model_timeout_ms: u64,

    /// Prompt sent with every unified group
    #[clap(
        long,
        default_value = "Describe the tracked objects and any notable activity."
    )]
    prompt: String,

    /// Seconds between analysis batches
    #[clap(long, default_value = "10")]
    log_wait_time: u64,

    /// Directory the log and report are written to
    #[clap(long, default_value = "output")]
    output_dir: PathBuf,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Cli::parse();
    finish(run(args).await)
}

async fn run(args: Cli) -> Result<(), StageError> {
    install_observability(args.observability_address)?;

    std::fs::create_dir_all(&args.output_dir)?;

    let kafka_opts = &args.common_kafka_options;

    let model = HttpCaptionModel::new(
        &args.model_endpoint,
        Duration::from_millis(args.model_timeout_ms),
    )
    .map_err(|e| StageError::ModelLoad(e.to_string()))?;
    model
        .ready()
        .await
        .map_err(|e| StageError::ModelLoad(e.to_string()))?;

    let consumer = mcmot_common::create_default_consumer(
        &kafka_opts.broker,
        &kafka_opts.username,
        &kafka_opts.password,
        &format!("{}-{}", args.pipeline, args.consumer_group),
        Some(&[stage_topic(Stage::Unification, &args.pipeline).as_str()]),
    )?;

    let report = Report::new(&args.output_dir);
    let mut outstanding: VecDeque<UnifiedGroup> = VecDeque::new();

    let mut flush_interval = tokio::time::interval(Duration::from_secs(args.log_wait_time.max(1)));
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    component_info_metric("analytics");
    info!("analytics ready");

    loop {
        select! {
            message = consumer.recv() => {
                match message {
                    Ok(m) => {
                        if let Some(payload) = m.payload() {
                            match UnifiedGroup::from_payload(payload) {
                                Ok(group) => {
                                    counter!(
                                        MESSAGES_RECEIVED,
                                        &[messages_received::get_label(MessageKind::Unified)]
                                    )
                                    .increment(1);
                                    debug!(sync_key = group.sync_key, "queued unified group");
                                    outstanding.push_back(group);
                                }
                                Err(e) => {
                                    warn!("failed to parse message: {e}");
                                    counter!(
                                        FAILURES,
                                        &[failures::get_label(FailureKind::UnableToDecodeMessage)]
                                    )
                                    .increment(1);
                                }
                            }
                        }
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            warn!("failed to commit message: {e}");
                        }
                    }
                    Err(e) => warn!("Kafka error: {e}"),
                }
            }
            _ = flush_interval.tick() => {
                flush_batch(&model, &report, &args.prompt, &mut outstanding).await;
            }
            _ = sigint.recv() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination requested, shutting down");
                break;
            }
        }
    }

    // Analyse whatever is still queued before exiting.
    flush_batch(&model, &report, &args.prompt, &mut outstanding).await;
    Ok(())
}

/// Sends every outstanding group to the model and appends the results.
/// A failed group is pushed back for the next batch.
async fn flush_batch<M: CaptionModel>(
    model: &M,
    report: &Report,
    prompt: &str,
    outstanding: &mut VecDeque<UnifiedGroup>,
) {
    let batch = outstanding.len();
    for _ in 0..batch {
        let Some(group) = outstanding.pop_front() else {
            break;
        };

        let metadata = match serde_json::to_value(&group.frames) {
            Ok(value) => value,
            Err(e) => {
                warn!(sync_key = group.sync_key, "unserializable group metadata: {e}");
                continue;
            }
        };

        match model.caption(prompt, &group.image.data, &metadata).await {
            Ok(caption) => {
                let row = ReportRow {
                    timestamp: chrono::Utc::now(),
                    sync_key: group.sync_key,
                    cameras: group.cameras.len(),
                    complete: group.complete,
                    total_tracks: group.total_tracks(),
                    caption,
                };
                if let Err(e) = report.append(row) {
                    warn!("failed to append report row: {e}");
                    counter!(
                        FAILURES,
                        &[failures::get_label(FailureKind::FileWriteFailed)]
                    )
                    .increment(1);
                }
            }
            Err(e) => {
                warn!(sync_key = group.sync_key, "model invocation failed, retrying next batch: {e}");
                counter!(
                    FAILURES,
                    &[failures::get_label(FailureKind::ModelInvocationFailed)]
                )
                .increment(1);
                outstanding.push_back(group);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcmot_messages::TensorData;
    use super::model::ModelError;
    use std::sync::atomic::{AtomicBool, Ordering};

    struct FlakyModel {
        fail_once: AtomicBool,
    }

    impl CaptionModel for FlakyModel {
        async fn caption(
            &self,
            _prompt: &str,
            _image: &[u8],
            _metadata: &serde_json::Value,
        ) -> Result<String, ModelError> {
            if self.fail_once.swap(false, Ordering::SeqCst) {
                Err(ModelError::Unhealthy(503))
            } else {
                Ok("quiet scene".to_owned())
            }
        }

        async fn ready(&self) -> Result<(), ModelError> {
            Ok(())
        }
    }

    fn group(sync_key: i64) -> UnifiedGroup {
        UnifiedGroup {
            sync_key,
            complete: true,
            cameras: vec!["cam-a".to_owned()],
            frames: Vec::new(),
            image: TensorData::from_jpeg(vec![0xff, 0xd8, 0xff, 0xd9], 1, 1),
        }
    }

    #[tokio::test]
    async fn failed_groups_are_retried_on_the_next_batch() {
        let dir = tempfile::tempdir().expect("temp dir");
        let report = Report::new(dir.path());
        let model = FlakyModel {
            fail_once: AtomicBool::new(true),
        };

        let mut outstanding = VecDeque::from([group(1), group(2)]);
        flush_batch(&model, &report, "prompt", &mut outstanding).await;

        // Group 1 failed and was requeued; group 2 was written.
        assert_eq!(outstanding.len(), 1);
        assert_eq!(outstanding.front().map(|g| g.sync_key), Some(1));

        flush_batch(&model, &report, "prompt", &mut outstanding).await;
        assert!(outstanding.is_empty());

        let log = std::fs::read_to_string(dir.path().join("unified.log")).expect("log");
        assert_eq!(log.lines().count(), 2);
    }
}
