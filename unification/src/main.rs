//! # Unification
//!
//! The Unification stage performs the following functions:
//! * Runs the frame-sync engine in unify mode over tracker output,
//!   grouping contemporaneous frames from all cameras per sync key.
//! * On each released group, composes a row-major grid image, writes the
//!   per-camera and combined JPEGs under `output/<sync_key>/`, and
//!   appends the combined frame to the MJPEG video.
//! * Emits the unified group, keyed by sync key, for the analytics stage.
//!
//! Exactly one unification worker runs per pipeline; the control plane
//! enforces the cap.
mod compose;
mod video;

use clap::Parser;
use compose::compose_grid;
use mcmot_common::{CommonKafkaOpts, init_tracing, metrics::component_info_metric};
use mcmot_frame_sync::{FrameSync, SyncConfig, SyncGroup};
use mcmot_messages::{
    FrameEnvelope, Stage, TensorData, UnifiedFrame, UnifiedGroup,
};
use mcmot_stage_runtime::{
    CallbackError, OutboundRecord, StageError, StageHandler, StageRuntime, finish,
    install_observability,
};
use metrics::counter;
use std::{net::SocketAddr, path::PathBuf, time::Duration};
use tracing::{debug, instrument, warn};
use video::MjpegVideoWriter;

/// The combined video's lifetime ends after this long without frames.
const VIDEO_IDLE_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Parser)]
#[clap(author, version = mcmot_common::version!(), about)]
struct Cli {
    #[clap(flatten)]
    common_kafka_options: CommonKafkaOpts,

    /// Name of the pipeline this worker belongs to
    #[clap(long)]
    pipeline: String,

    /// Directory the unified artefacts are written to
    #[clap(long, default_value = "output")]
    output_dir: PathBuf,

    #[clap(flatten)]
    frame_sync: SyncConfig,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

struct UnificationHandler {
    sync: FrameSync<FrameEnvelope>,
    output_dir: PathBuf,
    video: MjpegVideoWriter,
}

impl UnificationHandler {
    fn new(sync_config: SyncConfig, output_dir: PathBuf) -> Self {
        let video = MjpegVideoWriter::new(&output_dir.join("combined.mjpeg"), VIDEO_IDLE_TIMEOUT);
        Self {
            sync: FrameSync::new(sync_config),
            output_dir,
            video,
        }
    }

    fn drain(&mut self) -> Result<Vec<OutboundRecord>, CallbackError> {
        let mut records = Vec::new();
        while let Some(group) = self.sync.poll() {
            records.push(self.emit_group(group)?);
        }
        Ok(records)
    }

    /// Writes the group's artefacts and builds the outbound record.
    #[instrument(skip_all, fields(sync_key = group.sync_key, cameras = group.frames.len(), complete = group.complete))]
    fn emit_group(&mut self, group: SyncGroup<FrameEnvelope>) -> Result<OutboundRecord, CallbackError> {
        let group_dir = self.output_dir.join(group.sync_key.to_string());
        std::fs::create_dir_all(&group_dir).map_err(|e| {
            CallbackError::Other(format!("failed to create group directory: {e}"))
        })?;

        let mut tiles = Vec::with_capacity(group.frames.len());
        let mut frames = Vec::with_capacity(group.frames.len());
        let mut cameras = Vec::with_capacity(group.frames.len());

        for (camera_id, envelope) in &group.frames {
            let frame_path = group_dir.join(format!("frame_{camera_id}.jpg"));
            if let Err(e) = std::fs::write(&frame_path, &envelope.image.data) {
                warn!(camera_id = %camera_id, "failed to write frame image: {e}");
            }

            match image::load_from_memory(&envelope.image.data) {
                Ok(decoded) => tiles.push(decoded.to_rgb8()),
                Err(e) => warn!(camera_id = %camera_id, "undecodable frame image: {e}"),
            }

            cameras.push(camera_id.clone());
            frames.push(UnifiedFrame {
                camera_id: camera_id.clone(),
                frame_number: envelope.frame_number,
                frame_timestamp: envelope.frame_timestamp,
                metadata: envelope.metadata.clone(),
            });
        }

        let grid = compose_grid(&tiles);
        let (width, height) = grid.dimensions();
        let mut combined_jpeg = Vec::new();
        image::DynamicImage::ImageRgb8(grid)
            .write_with_encoder(image::codecs::jpeg::JpegEncoder::new(&mut combined_jpeg))
            .map_err(|e| CallbackError::Other(format!("failed to encode combined image: {e}")))?;

        if let Err(e) = std::fs::write(group_dir.join("combined.jpg"), &combined_jpeg) {
            warn!("failed to write combined image: {e}");
        }
        if let Err(e) = self.video.append(&combined_jpeg) {
            warn!("failed to append to combined video: {e}");
        }

        counter!(mcmot_common::metrics::names::GROUPS_EMITTED).increment(1);
        debug!("unified group emitted");

        let unified = UnifiedGroup {
            sync_key: group.sync_key,
            complete: group.complete,
            cameras,
            frames,
            image: TensorData::from_jpeg(combined_jpeg, height as usize, width as usize),
        };
        Ok(OutboundRecord {
            key: unified.sync_key.to_string(),
            payload: unified.to_payload()?,
        })
    }
}

impl StageHandler for UnificationHandler {
    async fn on_envelope(
        &mut self,
        envelope: FrameEnvelope,
    ) -> Result<Vec<OutboundRecord>, CallbackError> {
        self.sync.deposit(
            &envelope.camera_id.clone(),
            envelope.frame_number,
            envelope.frame_timestamp,
            envelope.fps,
            envelope,
        );
        self.drain()
    }

    async fn on_poll(&mut self) -> Result<Vec<OutboundRecord>, CallbackError> {
        self.video.close_if_idle();
        self.drain()
    }
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

    // Unification always groups across cameras.
    let mut sync_config = args.frame_sync.clone();
    sync_config.unify = true;

    let runtime = StageRuntime::new(
        &args.common_kafka_options,
        &args.pipeline,
        Stage::Unification,
        // Group formation replaces per-frame admission here.
        None,
        Duration::from_millis(500),
    )?;

    let mut handler = UnificationHandler::new(sync_config, args.output_dir.clone());

    component_info_metric("unification");
    runtime.run(&mut handler).await
}
