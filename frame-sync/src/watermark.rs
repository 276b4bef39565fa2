use mcmot_common::{FrameNumber, SyncKey};
use std::time::Instant;

/// The last accepted frame of one camera, with its wall-clock arrival.
/// Admission decisions for subsequent frames are derived from this alone.
#[derive(Clone, Copy, Debug)]
pub struct CameraWatermark {
    pub key: SyncKey,
    pub frame_number: FrameNumber,
    pub timestamp: f64,
    pub arrival: Instant,
}

impl CameraWatermark {
    pub fn new(key: SyncKey, frame_number: FrameNumber, timestamp: f64, arrival: Instant) -> Self {
        Self {
            key,
            frame_number,
            timestamp,
            arrival,
        }
    }
}
