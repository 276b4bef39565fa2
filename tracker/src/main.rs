//! # Tracker
//!
//! The Tracker stage performs the following functions:
//! * Consumes the reid stage's output (detections with identities) and
//!   associates detections to tracks per camera via IoU and Hungarian
//!   assignment, with Kalman motion state per track.
//! * Consumes the capture topic as a secondary stream: frames the
//!   detector never saw are answered with Kalman predict-only tracks, up
//!   to a configured fraction.
//! * Emits envelopes stamped with the track list, keyed by camera id.
//!
//! ## Concurrency
//! The two consumer loops run as separate tasks sharing one per-camera
//! state object behind a mutex; the shared producer dispatches both
//! loops' output.
mod state;

use clap::Parser;
use mcmot_common::{CommonKafkaOpts, init_tracing, metrics::component_info_metric};
use mcmot_frame_sync::{FrameSync, SyncConfig, SyncDecision};
use mcmot_messages::{FrameEnvelope, Stage, group_id, stage_topic};
use mcmot_stage_runtime::{
    DeliveryFutureSender, StageError, create_producer_task, finish, install_observability,
    send_record,
};
use mcmot_tracking::TrackerSettings;
use metrics::counter;
use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    message::{BorrowedMessage, Message},
    producer::FutureProducer,
};
use state::{TrackerConfig, TrackerState};
use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};
use tokio::{
    select,
    signal::unix::{SignalKind, signal},
    sync::watch,
};
use tracing::{info, instrument, warn};

#[derive(Debug, Parser)]
#[clap(author, version = mcmot_common::version!(), about)]
struct Cli {
    #[clap(flatten)]
    common_kafka_options: CommonKafkaOpts,

    /// Name of the pipeline this worker belongs to
    #[clap(long)]
    pipeline: String,

    #[clap(flatten)]
    tracker: TrackerSettings,

    /// Cap on the fraction of capture frames answered with predictions
    #[clap(long, default_value = "0.5")]
    prediction_factor: f64,

    /// Ignore the capture stream entirely (disables Kalman-on-capture)
    #[clap(long)]
    ignore_capture: bool,

    #[clap(flatten)]
    frame_sync: SyncConfig,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

struct Shared {
    state: Mutex<TrackerState>,
    config: TrackerConfig,
    sync: FrameSync<()>,
    producer: FutureProducer,
    output_topic: String,
}

#[tokio::main]
async fn main() {
    init_tracing();
    let args = Cli::parse();
    finish(run(args).await)
}

async fn run(args: Cli) -> Result<(), StageError> {
    let kafka_opts = &args.common_kafka_options;

    install_observability(args.observability_address)?;

    let producer: FutureProducer = mcmot_common::generate_kafka_client_config(
        &kafka_opts.broker,
        &kafka_opts.username,
        &kafka_opts.password,
    )
    .set("message.max.bytes", "10485760")
    .create()
    .map_err(StageError::Broker)?;

    let detection_consumer = mcmot_common::create_default_consumer(
        &kafka_opts.broker,
        &kafka_opts.username,
        &kafka_opts.password,
        &group_id(&args.pipeline, Stage::Tracker, "detections"),
        Some(&[stage_topic(Stage::Reid, &args.pipeline).as_str()]),
    )?;

    let capture_consumer = mcmot_common::create_default_consumer(
        &kafka_opts.broker,
        &kafka_opts.username,
        &kafka_opts.password,
        &group_id(&args.pipeline, Stage::Tracker, "captures"),
        Some(&[stage_topic(Stage::Capture, &args.pipeline).as_str()]),
    )?;

    let (sender, producer_task_handle) = create_producer_task(1024)?;

    let shared = Arc::new(Shared {
        state: Mutex::new(TrackerState::default()),
        config: TrackerConfig {
            settings: args.tracker.clone(),
            prediction_factor: args.prediction_factor,
            ignore_capture: args.ignore_capture,
        },
        sync: FrameSync::new(args.frame_sync.clone()),
        producer,
        output_topic: stage_topic(Stage::Tracker, &args.pipeline),
    });

    let (shutdown_send, shutdown_recv) = watch::channel(false);

    let detection_task = tokio::spawn(detection_loop(
        detection_consumer,
        Arc::clone(&shared),
        sender.clone(),
        shutdown_recv.clone(),
    ));
    let capture_task = tokio::spawn(capture_loop(
        capture_consumer,
        Arc::clone(&shared),
        sender.clone(),
        shutdown_recv,
    ));

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    component_info_metric("tracker");
    info!("tracker ready");

    select! {
        _ = sigint.recv() => info!("interrupt received, shutting down"),
        _ = sigterm.recv() => info!("termination requested, shutting down"),
    }

    shutdown_send.send(true).ok();
    if let Err(e) = detection_task.await {
        warn!("detection loop join failed: {e}");
    }
    if let Err(e) = capture_task.await {
        warn!("capture loop join failed: {e}");
    }

    drop(sender);
    if let Err(e) = producer_task_handle.await {
        warn!("producer task join failed: {e}");
    }
    Ok(())
}

/// Primary loop: detection batches drive association and lifecycle.
async fn detection_loop(
    consumer: StreamConsumer,
    shared: Arc<Shared>,
    sender: DeliveryFutureSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        select! {
            message = consumer.recv() => {
                match message {
                    Ok(m) => {
                        process_detection_message(&shared, &sender, &m).await;
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            warn!("failed to commit detection message: {e}");
                        }
                    }
                    Err(e) => warn!("Kafka error: {e}"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[instrument(skip_all, level = "debug", fields(partition = m.partition(), offset = m.offset()))]
async fn process_detection_message(
    shared: &Shared,
    sender: &DeliveryFutureSender,
    m: &BorrowedMessage<'_>,
) {
    let Some(mut envelope) = decode(m) else {
        return;
    };

    match shared.sync.skip_or_wait(
        &envelope.camera_id,
        envelope.frame_number,
        envelope.frame_timestamp,
        envelope.fps,
    ) {
        SyncDecision::Accept => {}
        SyncDecision::Skip(_) => {
            counter!(mcmot_common::metrics::names::FRAMES_SKIPPED).increment(1);
            return;
        }
        SyncDecision::Wait(duration) => {
            let cap = Duration::from_secs_f64(shared.sync.config().latency_threshold.max(0.0));
            tokio::time::sleep(duration.min(cap)).await;
        }
    }

    let key = shared.sync.config().sync_key(
        envelope.frame_number,
        envelope.frame_timestamp,
        envelope.fps,
    );

    {
        // Callbacks stay outside the sync engine's lock; only the camera
        // state is held here.
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handle_detection(&shared.config, key, &mut envelope);
    }

    produce(shared, sender, &envelope);
}

/// Secondary loop: captures fill detector gaps with predictions.
async fn capture_loop(
    consumer: StreamConsumer,
    shared: Arc<Shared>,
    sender: DeliveryFutureSender,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        select! {
            message = consumer.recv() => {
                match message {
                    Ok(m) => {
                        process_capture_message(&shared, &sender, &m);
                        if let Err(e) = consumer.commit_message(&m, CommitMode::Async) {
                            warn!("failed to commit capture message: {e}");
                        }
                    }
                    Err(e) => warn!("Kafka error: {e}"),
                }
            }
            _ = shutdown.changed() => return,
        }
    }
}

#[instrument(skip_all, level = "debug", fields(partition = m.partition(), offset = m.offset()))]
fn process_capture_message(shared: &Shared, sender: &DeliveryFutureSender, m: &BorrowedMessage<'_>) {
    let Some(mut envelope) = decode(m) else {
        return;
    };

    let key = shared.sync.config().sync_key(
        envelope.frame_number,
        envelope.frame_timestamp,
        envelope.fps,
    );

    let emit = {
        let mut state = shared.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.handle_capture(&shared.config, key, &mut envelope)
    };

    if emit {
        produce(shared, sender, &envelope);
    }
}

fn decode(m: &BorrowedMessage<'_>) -> Option<FrameEnvelope> {
    let payload = m.payload()?;
    FrameEnvelope::from_payload(payload)
        .inspect_err(|e| warn!("failed to parse message: {e}"))
        .ok()
}

fn produce(shared: &Shared, sender: &DeliveryFutureSender, envelope: &FrameEnvelope) {
    match envelope.to_payload() {
        Ok(payload) => {
            let _ = send_record(
                &shared.producer,
                sender,
                &shared.output_topic,
                &envelope.camera_id,
                &payload,
            );
            counter!(mcmot_common::metrics::names::FRAMES_SENT).increment(1);
        }
        Err(e) => warn!("failed to encode envelope: {e}"),
    }
}
