//! # Detection
//!
//! The Detection stage performs the following functions:
//! * Consumes capture output and runs the object detector on each frame.
//! * Filters detections by confidence score and configured classes.
//! * Annotates the frame image with the surviving boxes.
//! * When frame-sync skips a frame and prediction is enabled, emits
//!   Kalman-predicted boxes for the camera instead, flagged as such.
mod annotate;
mod detector;

use annotate::annotate;
use clap::Parser;
use detector::{Detector, HttpDetector};
use mcmot_common::{CameraId, CommonKafkaOpts, init_tracing, metrics::component_info_metric};
use mcmot_frame_sync::{SkipReason, SyncConfig};
use mcmot_messages::{Detection, FrameEnvelope, Stage, TensorData};
use mcmot_stage_runtime::{
    CallbackError, OutboundRecord, StageError, StageHandler, StageRuntime, finish,
    install_observability,
};
use mcmot_tracking::KalmanBoxFilter;
use std::{collections::HashMap, net::SocketAddr, time::Duration};
use tracing::{debug, instrument, warn};

#[derive(Debug, Parser)]
#[clap(author, version = mcmot_common::version!(), about)]
struct Cli {
    #[clap(flatten)]
    common_kafka_options: CommonKafkaOpts,

    /// Name of the pipeline this worker belongs to
    #[clap(long)]
    pipeline: String,

    /// Base URL of the detector inference endpoint
    #[clap(long)]
    detector_endpoint: String,

    /// Per-request detector timeout in milliseconds
    #[clap(long, default_value = "2000")]
    detector_timeout_ms: u64,

    /// Minimum detection score to keep
    #[clap(long, default_value = "0.5")]
    confidence_score: f32,

    /// Classes to keep. Empty keeps everything.
    /// Can be passed as `-c person -c car` or `-c=person,car`
    #[clap(short, long, value_delimiter = ',')]
    classes: Vec<String>,

    /// Emit Kalman-predicted boxes for frames skipped by frame-sync
    #[clap(long)]
    prediction: bool,

    #[clap(flatten)]
    frame_sync: SyncConfig,

    /// Endpoint on which Prometheus text format metrics are available
    #[clap(long, env, default_value = "127.0.0.1:9090")]
    observability_address: SocketAddr,
}

struct DetectionHandler<D> {
    detector: D,
    confidence_score: f32,
    classes: Vec<String>,
    prediction: bool,
    /// Last real detections per camera, with one filter per box.
    last_detections: HashMap<CameraId, Vec<(Detection, KalmanBoxFilter)>>,
}

impl<D: Detector> DetectionHandler<D> {
    fn new(detector: D, confidence_score: f32, classes: Vec<String>, prediction: bool) -> Self {
        Self {
            detector,
            confidence_score,
            classes,
            prediction,
            last_detections: HashMap::new(),
        }
    }

    fn keeps(&self, detection: &Detection) -> bool {
        detection.score >= self.confidence_score
            && (self.classes.is_empty() || self.classes.contains(&detection.class_id))
    }

    fn annotated_image(image: &TensorData, detections: &[Detection], predicted: bool) -> Option<TensorData> {
        let decoded = image::load_from_memory(&image.data)
            .inspect_err(|e| warn!("failed to decode frame image: {e}"))
            .ok()?;
        let mut rgb = decoded.to_rgb8();
        annotate(&mut rgb, detections, predicted);

        let mut jpeg = Vec::new();
        let encoder = image::codecs::jpeg::JpegEncoder::new(&mut jpeg);
        image::DynamicImage::ImageRgb8(rgb)
            .write_with_encoder(encoder)
            .inspect_err(|e| warn!("failed to encode annotated image: {e}"))
            .ok()?;
        Some(TensorData::from_jpeg(
            jpeg,
            decoded.height() as usize,
            decoded.width() as usize,
        ))
    }
}

impl<D: Detector> StageHandler for DetectionHandler<D> {
    #[instrument(skip_all, fields(camera_id = %envelope.camera_id, frame_number = envelope.frame_number))]
    async fn on_envelope(
        &mut self,
        mut envelope: FrameEnvelope,
    ) -> Result<Vec<OutboundRecord>, CallbackError> {
        let detections: Vec<Detection> = self
            .detector
            .detect(&envelope.image)
            .await
            .map_err(|e| CallbackError::Transient(e.to_string()))?
            .into_iter()
            .filter(|detection| self.keeps(detection))
            .collect();

        debug!(count = detections.len(), "detections kept");

        if let Some(annotated) = Self::annotated_image(&envelope.image, &detections, false) {
            envelope.image = annotated;
        }

        self.last_detections.insert(
            envelope.camera_id.clone(),
            detections
                .iter()
                .map(|detection| (detection.clone(), KalmanBoxFilter::new(detection.bbox)))
                .collect(),
        );

        envelope.metadata.detections = Some(detections);
        Ok(vec![OutboundRecord::envelope(&envelope)?])
    }

    async fn on_skip(
        &mut self,
        mut envelope: FrameEnvelope,
        reason: SkipReason,
    ) -> Result<Vec<OutboundRecord>, CallbackError> {
        if !self.prediction || reason == SkipReason::Duplicate {
            return Ok(Vec::new());
        }
        let Some(tracked) = self.last_detections.get_mut(&envelope.camera_id) else {
            return Ok(Vec::new());
        };

        let predicted: Vec<Detection> = tracked
            .iter_mut()
            .map(|(detection, filter)| {
                filter.predict(1.0);
                Detection {
                    bbox: filter.bbox(),
                    ..detection.clone()
                }
            })
            .collect();

        if let Some(annotated) = Self::annotated_image(&envelope.image, &predicted, true) {
            envelope.image = annotated;
        }
        envelope.metadata.detections = Some(predicted);
        envelope.metadata.predicted = Some(true);
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

    let detector = HttpDetector::new(
        &args.detector_endpoint,
        Duration::from_millis(args.detector_timeout_ms),
    )
    .map_err(|e| StageError::ModelLoad(e.to_string()))?;
    detector
        .ready()
        .await
        .map_err(|e| StageError::ModelLoad(e.to_string()))?;

    let runtime = StageRuntime::new(
        &args.common_kafka_options,
        &args.pipeline,
        Stage::Detection,
        Some(args.frame_sync.clone()),
        Duration::from_secs(1),
    )?;

    let mut handler = DetectionHandler::new(
        detector,
        args.confidence_score,
        args.classes.clone(),
        args.prediction,
    );

    component_info_metric("detection");
    runtime.run(&mut handler).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use super::detector::DetectorError;
    use mcmot_messages::{CameraMetadata, StageMetadata};

    struct FixedDetector {
        detections: Vec<Detection>,
    }

    impl Detector for FixedDetector {
        async fn detect(&self, _image: &TensorData) -> Result<Vec<Detection>, DetectorError> {
            Ok(self.detections.clone())
        }

        async fn ready(&self) -> Result<(), DetectorError> {
            Ok(())
        }
    }

    fn detection(score: f32, class_id: &str) -> Detection {
        Detection {
            bbox: [10.0, 10.0, 20.0, 20.0],
            score,
            class_id: class_id.to_owned(),
        }
    }

    fn envelope() -> FrameEnvelope {
        FrameEnvelope {
            camera_id: "cam-0".to_owned(),
            frame_number: 1,
            frame_timestamp: 0.033,
            fps: 30,
            image: TensorData::from_jpeg(vec![0u8; 4], 48, 64),
            metadata: StageMetadata::default(),
            camera_metadata: CameraMetadata::default(),
        }
    }

    fn handler(detections: Vec<Detection>, prediction: bool) -> DetectionHandler<FixedDetector> {
        DetectionHandler::new(
            FixedDetector { detections },
            0.5,
            vec!["car".to_owned()],
            prediction,
        )
    }

    #[tokio::test]
    async fn detections_are_filtered_by_score_and_class() {
        let mut handler = handler(
            vec![
                detection(0.9, "car"),
                detection(0.3, "car"),
                detection(0.9, "person"),
            ],
            false,
        );

        let records = handler.on_envelope(envelope()).await.expect("callback");
        let out = FrameEnvelope::from_payload(&records.first().expect("one record").payload)
            .expect("decodes");
        let kept = out.metadata.detections.expect("detections present");
        assert_eq!(kept.len(), 1);
        assert_eq!(kept.first().map(|d| d.score), Some(0.9));
    }

    #[tokio::test]
    async fn skipped_frames_emit_predicted_boxes_when_enabled() {
        let mut handler = handler(vec![detection(0.9, "car")], true);

        handler.on_envelope(envelope()).await.expect("callback");
        let records = handler
            .on_skip(envelope(), SkipReason::Stale)
            .await
            .expect("skip callback");
        let out = FrameEnvelope::from_payload(&records.first().expect("one record").payload)
            .expect("decodes");
        assert_eq!(out.metadata.predicted, Some(true));
        assert_eq!(out.metadata.detections.map(|d| d.len()), Some(1));
    }

    #[tokio::test]
    async fn skipped_duplicates_emit_nothing() {
        let mut handler = handler(vec![detection(0.9, "car")], true);
        handler.on_envelope(envelope()).await.expect("callback");
        let records = handler
            .on_skip(envelope(), SkipReason::Duplicate)
            .await
            .expect("skip callback");
        assert!(records.is_empty());
    }
}
