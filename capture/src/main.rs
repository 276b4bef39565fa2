//! # Capture
//!
//! The Capture stage performs the following functions:
//! * Reads a video source (live MJPEG URL, MJPEG file or image directory)
//!   at its native frame rate.
//! * Stamps every frame with camera id, frame number, timestamp and fps,
//!   and publishes it keyed by camera id.
//! * Applies the intra-camera skip/wait policy, so under downstream
//!   pressure frames are dropped rather than queued.
//! * Obeys START / STOP / HOLD / RESUME signals from the pipeline's
//!   control topic.
mod source;

use clap::Parser;
use mcmot_common::{CommonKafkaOpts, FrameNumber, init_tracing, metrics::component_info_metric};
use mcmot_frame_sync::{FrameSync, SyncConfig, SyncDecision};
use mcmot_messages::{
    CameraMetadata, ControlMessage, FrameEnvelope, Signal, Stage, StageMetadata, TensorData,
    control_topic, group_id, stage_topic,
};
use mcmot_stage_runtime::{
    StageError, create_producer_task, finish, install_observability, send_record,
};
use metrics::counter;
use rdkafka::{
    consumer::{CommitMode, Consumer},
    message::Message,
    producer::FutureProducer,
};
use source::{VideoSource, open_source};
use std::{net::SocketAddr, time::Duration};
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

    /// Name of the pipeline this camera feeds
    #[clap(long)]
    pipeline: String,

    /// Unique camera id, used as the partition key downstream
    #[clap(long)]
    camera_id: String,

    /// Video source: an http(s) MJPEG URL, a .mjpeg file or a directory of
    /// JPEG files
    #[clap(long)]
    source: String,

    /// Begin reading immediately instead of waiting for a START signal
    #[clap(long)]
    autostart: bool,

    /// Camera location stamped into the static metadata
    #[clap(long)]
    location: Option<String>,

    /// Container format of the source
    #[clap(long)]
    format: Option<String>,

    /// Compression of the source
    #[clap(long)]
    compression: Option<String>,

    /// Source bitrate in kbit/s
    #[clap(long)]
    bitrate: Option<u32>,

    /// Pixel encoding of the source
    #[clap(long)]
    encoding: Option<String>,

    #[clap(flatten)]
    frame_sync: SyncConfig,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RunState {
    Idle,
    Running,
    Held,
}

struct Camera {
    camera_id: String,
    fps: u32,
    frame_number: FrameNumber,
    camera_metadata: CameraMetadata,
    sync: FrameSync<()>,
}

impl Camera {
    /// Builds the envelope for one captured JPEG, or [None] when the sync
    /// engine skips the frame.
    async fn stamp(&mut self, jpeg: bytes::Bytes) -> Option<FrameEnvelope> {
        let frame_number = self.frame_number;
        self.frame_number += 1;
        let frame_timestamp = chrono::Utc::now().timestamp_micros() as f64 / 1e6;

        match self
            .sync
            .skip_or_wait(&self.camera_id, frame_number, frame_timestamp, self.fps)
        {
            SyncDecision::Accept => {}
            SyncDecision::Skip(reason) => {
                debug!(frame_number, ?reason, "dropping frame under pressure");
                counter!(mcmot_common::metrics::names::FRAMES_SKIPPED).increment(1);
                return None;
            }
            SyncDecision::Wait(duration) => {
                tokio::time::sleep(duration).await;
            }
        }

        let (width, height) = match image_dimensions(&jpeg) {
            Ok(dimensions) => dimensions,
            Err(e) => {
                warn!(frame_number, "undecodable frame from source: {e}");
                return None;
            }
        };

        Some(FrameEnvelope {
            camera_id: self.camera_id.clone(),
            frame_number,
            frame_timestamp,
            fps: self.fps,
            image: TensorData::from_jpeg(jpeg.to_vec(), height as usize, width as usize),
            metadata: StageMetadata::default(),
            camera_metadata: self.camera_metadata.clone(),
        })
    }
}

fn image_dimensions(jpeg: &[u8]) -> Result<(u32, u32), image::ImageError> {
    image::ImageReader::new(std::io::Cursor::new(jpeg))
        .with_guessed_format()?
        .into_dimensions()
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

    // Every capture worker sees every control message: the group id is
    // unique per camera.
    let control = mcmot_common::create_default_consumer(
        &kafka_opts.broker,
        &kafka_opts.username,
        &kafka_opts.password,
        &group_id(
            &args.pipeline,
            Stage::Capture,
            &format!("control-{}", args.camera_id),
        ),
        Some(&[control_topic(&args.pipeline).as_str()]),
    )?;

    // Open eagerly so a bad source fails fast with the model-load exit
    // code.
    let mut video: Option<VideoSource> = Some(
        open_source(&args.source).map_err(|e| StageError::ModelLoad(e.to_string()))?,
    );

    let output_topic = stage_topic(Stage::Capture, &args.pipeline);
    let (sender, producer_task_handle) = create_producer_task(1024)?;

    // The frame-sync fps doubles as the declared source rate.
    let mut camera = Camera {
        camera_id: args.camera_id.clone(),
        fps: args.frame_sync.fps.max(1),
        frame_number: 0,
        camera_metadata: CameraMetadata {
            location: args.location.clone(),
            format: args.format.clone(),
            compression: args.compression.clone(),
            bitrate: args.bitrate,
            encoding: args.encoding.clone(),
        },
        sync: FrameSync::new(args.frame_sync.clone()),
    };

    let mut state = if args.autostart {
        RunState::Running
    } else {
        RunState::Idle
    };
    let mut loops_remaining: u32 = 1;

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut frame_interval =
        tokio::time::interval(Duration::from_secs_f64(1.0 / f64::from(camera.fps)));
    frame_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    component_info_metric("capture");
    info!(camera_id = %args.camera_id, source = %args.source, "capture ready");

    loop {
        select! {
            message = control.recv() => {
                match message {
                    Ok(m) => {
                        if let Some(signal) = parse_control(&args.pipeline, m.payload()) {
                            match signal.signal {
                                Signal::Start => {
                                    loops_remaining = signal.loop_count.unwrap_or(1).max(1);
                                    if video.is_none() {
                                        video = reopen(&args.source);
                                    }
                                    state = RunState::Running;
                                    info!(loops_remaining, "START received");
                                }
                                Signal::Hold => {
                                    state = RunState::Held;
                                    info!("HOLD received, pausing");
                                }
                                Signal::Resume => {
                                    if state == RunState::Held {
                                        state = RunState::Running;
                                        info!("RESUME received");
                                    }
                                }
                                Signal::Stop => {
                                    info!("STOP received, draining");
                                    break;
                                }
                            }
                        }
                        control.commit_message(&m, CommitMode::Async).ok();
                    }
                    Err(e) => warn!("Kafka error: {e}"),
                }
            }
            _ = frame_interval.tick(), if state == RunState::Running => {
                let Some(source) = video.as_mut() else {
                    continue;
                };
                match source.next_frame().await {
                    Ok(Some(jpeg)) => {
                        if let Some(envelope) = camera.stamp(jpeg).await {
                            match envelope.to_payload() {
                                Ok(payload) => {
                                    let _ = send_record(
                                        &producer,
                                        &sender,
                                        &output_topic,
                                        &envelope.camera_id,
                                        &payload,
                                    );
                                    counter!(mcmot_common::metrics::names::FRAMES_SENT)
                                        .increment(1);
                                }
                                Err(e) => warn!("failed to encode envelope: {e}"),
                            }
                        }
                    }
                    Ok(None) => {
                        if loops_remaining > 1 {
                            loops_remaining -= 1;
                            if let Err(e) = source.rewind() {
                                warn!("source rewind failed: {e}");
                                state = RunState::Idle;
                            } else {
                                info!(loops_remaining, "source exhausted, looping");
                            }
                        } else {
                            info!("source exhausted, idling");
                            state = RunState::Idle;
                        }
                    }
                    Err(e) => {
                        warn!("source read failed, reopening: {e}");
                        video = reopen(&args.source);
                        if video.is_none() {
                            state = RunState::Idle;
                        }
                    }
                }
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

    drop(sender);
    if let Err(e) = producer_task_handle.await {
        warn!("producer task join failed: {e}");
    }
    Ok(())
}

fn parse_control(pipeline: &str, payload: Option<&[u8]>) -> Option<ControlMessage> {
    let message = ControlMessage::from_payload(payload?)
        .inspect_err(|e| warn!("undecodable control message: {e}"))
        .ok()?;
    if message.pipeline != pipeline {
        debug!(pipeline = %message.pipeline, "ignoring control message for other pipeline");
        return None;
    }
    Some(message)
}

fn reopen(source: &str) -> Option<VideoSource> {
    open_source(source)
        .inspect_err(|e| warn!("failed to reopen source: {e}"))
        .ok()
}
