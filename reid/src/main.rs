//! # ReID
//!
//! The ReID stage performs the following functions:
//! * Crops each detection out of the frame, resizes it and embeds it.
//! * Assigns a globally consistent identity per detection by cosine
//!   similarity against an in-memory embedding store.
//! * Appends the identities to the envelope metadata, parallel to the
//!   detection list.
//!
//! ## Assumptions
//! * The store is process-local. Replicated workers diverge in the ids
//!   they mint; downstream association reconciles spatially.
mod embedder;
mod store;

use clap::Parser;
use embedder::{Embedder, HttpEmbedder};
use image::imageops::FilterType;
use mcmot_common::{CommonKafkaOpts, init_tracing, metrics::component_info_metric};
use mcmot_frame_sync::SyncConfig;
use mcmot_messages::{Detection, FrameEnvelope, Stage, TensorData};
use mcmot_stage_runtime::{
    CallbackError, OutboundRecord, StageError, StageHandler, StageRuntime, finish,
    install_observability,
};
use std::{net::SocketAddr, time::Duration};
use store::EmbeddingStore;
use tracing::{debug, instrument, warn};

/// Crops are resized to the embedder's expected input before encoding.
const CROP_WIDTH: u32 = 128;
const CROP_HEIGHT: u32 = 256;

#[derive(Debug, Parser)]
#[clap(author, version = mcmot_common::version!(), about)]
struct Cli {
    #[clap(flatten)]
    common_kafka_options: CommonKafkaOpts,

    /// Name of the pipeline this worker belongs to
    #[clap(long)]
    pipeline: String,

    /// Base URL of the embedder inference endpoint
    #[clap(long)]
    embedder_endpoint: String,

    /// Per-request embedder timeout in milliseconds
    #[clap(long, default_value = "2000")]
    embedder_timeout_ms: u64,

    /// Dimension of the embedding vectors
    #[clap(long, default_value = "512")]
    embedding_dimension: usize,

    /// Cosine similarity at or above which an identity is reused
    #[clap(long, default_value = "0.7")]
    similarity_threshold: f32,

    /// Soft cap on stored embeddings; oldest entries are evicted beyond it
    #[clap(long, default_value = "10000")]
    max_store_entries: usize,

    #[clap(flatten)]
    frame_sync: SyncConfig,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

struct ReidHandler<E> {
    embedder: E,
    store: EmbeddingStore,
}

impl<E: Embedder> ReidHandler<E> {
    /// Cuts the detection's box out of the frame and shapes it for the
    /// embedder.
    fn crop(image: &TensorData, detection: &Detection) -> Option<TensorData> {
        let decoded = image::load_from_memory(&image.data)
            .inspect_err(|e| warn!("failed to decode frame image: {e}"))
            .ok()?;

        let (width, height) = (decoded.width(), decoded.height());
        let [x, y, w, h] = detection.bbox;
        let x0 = (x.max(0.0) as u32).min(width.saturating_sub(1));
        let y0 = (y.max(0.0) as u32).min(height.saturating_sub(1));
        let crop_width = (w.max(1.0) as u32).min(width - x0);
        let crop_height = (h.max(1.0) as u32).min(height - y0);

        let crop = decoded
            .crop_imm(x0, y0, crop_width, crop_height)
            .resize_exact(CROP_WIDTH, CROP_HEIGHT, FilterType::Triangle);

        let mut jpeg = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new(&mut jpeg);
        crop.write_with_encoder(encoder)
            .inspect_err(|e| warn!("failed to encode crop: {e}"))
            .ok()?;
        Some(TensorData::from_jpeg(
            jpeg,
            CROP_HEIGHT as usize,
            CROP_WIDTH as usize,
        ))
    }
}

impl<E: Embedder> StageHandler for ReidHandler<E> {
    #[instrument(skip_all, fields(camera_id = %envelope.camera_id, frame_number = envelope.frame_number, store_size = self.store.len()))]
    async fn on_envelope(
        &mut self,
        mut envelope: FrameEnvelope,
    ) -> Result<Vec<OutboundRecord>, CallbackError> {
        let detections = envelope.metadata.detections.clone().unwrap_or_default();

        let mut identities = Vec::with_capacity(detections.len());
        for detection in &detections {
            let Some(crop) = Self::crop(&envelope.image, detection) else {
                identities.push(String::new());
                continue;
            };
            let embedding = self
                .embedder
                .embed(&crop)
                .await
                .map_err(|e| CallbackError::Transient(e.to_string()))?;
            identities.push(self.store.lookup_or_insert(&embedding));
        }

        debug!(identities = identities.len(), "assigned identities");
        envelope.metadata.reid = Some(identities);
        Ok(vec![OutboundRecord::envelope(&envelope)?])
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

    let embedder = HttpEmbedder::new(
        &args.embedder_endpoint,
        Duration::from_millis(args.embedder_timeout_ms),
        args.embedding_dimension,
    )
    .map_err(|e| StageError::ModelLoad(e.to_string()))?;
    embedder
        .ready()
        .await
        .map_err(|e| StageError::ModelLoad(e.to_string()))?;

    let runtime = StageRuntime::new(
        &args.common_kafka_options,
        &args.pipeline,
        Stage::Reid,
        Some(args.frame_sync.clone()),
        Duration::from_secs(1),
    )?;

    let mut handler = ReidHandler {
        embedder,
        store: EmbeddingStore::new(args.similarity_threshold, args.max_store_entries),
    };

    component_info_metric("reid");
    runtime.run(&mut handler).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::embedder::EmbedderError;
    use mcmot_messages::{CameraMetadata, StageMetadata};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Hands out axis-aligned unit vectors in rotation, so consecutive
    /// calls look like distinct objects.
    struct RotatingEmbedder {
        calls: AtomicUsize,
    }

    impl Embedder for RotatingEmbedder {
        async fn embed(&self, _crop: &TensorData) -> Result<Vec<f32>, EmbedderError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            let mut embedding = vec![0.0; 4];
            if let Some(slot) = embedding.get_mut(call % 4) {
                *slot = 1.0;
            }
            Ok(embedding)
        }

        async fn ready(&self) -> Result<(), EmbedderError> {
            Ok(())
        }
    }

    fn envelope_with_detections(count: usize) -> FrameEnvelope {
        // A real 2x2 white JPEG so cropping succeeds.
        let mut jpeg = Vec::new();
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([255, 255, 255]));
        image::DynamicImage::ImageRgb8(image)
            .write_with_encoder(image::codecs::jpeg::JpegEncoder::new(&mut jpeg))
            .expect("encodes");

        FrameEnvelope {
            camera_id: "cam-0".to_owned(),
            frame_number: 0,
            frame_timestamp: 0.0,
            fps: 30,
            image: TensorData::from_jpeg(jpeg, 2, 2),
            metadata: StageMetadata {
                detections: Some(
                    (0..count)
                        .map(|_| Detection {
                            bbox: [0.0, 0.0, 2.0, 2.0],
                            score: 0.9,
                            class_id: "person".to_owned(),
                        })
                        .collect(),
                ),
                ..Default::default()
            },
            camera_metadata: CameraMetadata::default(),
        }
    }

    #[tokio::test]
    async fn identities_parallel_the_detection_list() {
        let mut handler = ReidHandler {
            embedder: RotatingEmbedder {
                calls: AtomicUsize::new(0),
            },
            store: EmbeddingStore::new(0.7, 100),
        };

        let records = handler
            .on_envelope(envelope_with_detections(3))
            .await
            .expect("callback");
        let out = FrameEnvelope::from_payload(&records.first().expect("one record").payload)
            .expect("decodes");
        let identities = out.metadata.reid.expect("identities present");
        assert_eq!(identities.len(), 3);
        // Three orthogonal embeddings: three distinct identities.
        assert_ne!(identities.first(), identities.get(1));
    }

    #[tokio::test]
    async fn matching_embedding_reuses_the_identity() {
        let mut handler = ReidHandler {
            embedder: RotatingEmbedder {
                calls: AtomicUsize::new(0),
            },
            store: EmbeddingStore::new(0.7, 100),
        };

        let first = handler
            .on_envelope(envelope_with_detections(1))
            .await
            .expect("callback");
        // Four rotations later the same unit vector comes round again.
        for _ in 0..3 {
            handler
                .on_envelope(envelope_with_detections(1))
                .await
                .expect("callback");
        }
        let fifth = handler
            .on_envelope(envelope_with_detections(1))
            .await
            .expect("callback");

        let id_of = |records: &[OutboundRecord]| {
            FrameEnvelope::from_payload(&records.first().expect("record").payload)
                .expect("decodes")
                .metadata
                .reid
                .and_then(|ids| ids.into_iter().next())
        };
        assert_eq!(id_of(&first), id_of(&fifth));
    }
}
