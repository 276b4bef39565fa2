use crate::tensor::TensorData;
use mcmot_common::{CameraId, FrameNumber, SyncKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to decode payload: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to encode payload: {0}")]
    Encode(#[source] serde_json::Error),
}

/// A single object found by the detection stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    /// Pixel-space `[x, y, w, h]` of the top-left anchored box.
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: String,
}

/// A track assignment emitted by the tracker stage.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TrackRecord {
    pub bbox: [f32; 4],
    pub track_id: String,
    pub class_id: String,
    pub confirmed: bool,
}

/// Metadata accumulated as an envelope traverses the stages. Every field
/// is appended by exactly one stage and left untouched by the others.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct StageMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detections: Option<Vec<Detection>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tracks: Option<Vec<TrackRecord>>,

    /// Globally consistent per-detection identities, parallel to
    /// `detections`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reid: Option<Vec<String>>,

    /// Set when the detections were produced by Kalman prediction rather
    /// than the detector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub predicted: Option<bool>,
}

/// Static per-camera properties, stamped by capture and never modified.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CameraMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compression: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bitrate: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
}

/// The unit crossing every stage topic.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FrameEnvelope {
    pub camera_id: CameraId,
    pub frame_number: FrameNumber,
    /// Seconds since the Unix epoch.
    pub frame_timestamp: f64,
    /// Declared source rate. Zero means "use the frame-sync config value".
    pub fps: u32,
    pub image: TensorData,
    #[serde(default)]
    pub metadata: StageMetadata,
    #[serde(default)]
    pub camera_metadata: CameraMetadata,
}

impl FrameEnvelope {
    pub fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(payload).map_err(EnvelopeError::Decode)
    }
}

/// Per-frame part of a [UnifiedGroup]: everything except the image bytes.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedFrame {
    pub camera_id: CameraId,
    pub frame_number: FrameNumber,
    pub frame_timestamp: f64,
    pub metadata: StageMetadata,
}

/// The unification stage's output: one contemporaneous group of frames
/// from all cameras, with the composed grid image.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct UnifiedGroup {
    pub sync_key: SyncKey,
    /// `false` when the group was emitted on retention expiry with one or
    /// more cameras missing.
    pub complete: bool,
    pub cameras: Vec<CameraId>,
    pub frames: Vec<UnifiedFrame>,
    pub image: TensorData,
}

impl UnifiedGroup {
    pub fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(payload).map_err(EnvelopeError::Decode)
    }

    pub fn total_tracks(&self) -> usize {
        self.frames
            .iter()
            .filter_map(|frame| frame.metadata.tracks.as_ref())
            .map(Vec::len)
            .sum()
    }
}
