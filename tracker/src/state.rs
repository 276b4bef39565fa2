//! Per-camera tracker state shared by the two consumer loops.
use mcmot_common::{CameraId, SyncKey};
use mcmot_messages::{FrameEnvelope, TrackRecord};
use mcmot_tracking::{CameraTracks, Track, TrackObservation, TrackerSettings};
use std::collections::{BTreeSet, HashMap};

/// Detection sync keys remembered per camera, enough to cover any
/// realistic detection/capture interleaving.
const SEEN_KEY_CAPACITY: usize = 4096;

#[derive(Clone, Debug)]
pub(crate) struct TrackerConfig {
    pub(crate) settings: TrackerSettings,
    /// Cap on the fraction of capture frames answered with predictions.
    pub(crate) prediction_factor: f64,
    /// Disables Kalman-on-capture entirely.
    pub(crate) ignore_capture: bool,
}

#[derive(Default)]
struct CameraState {
    tracks: CameraTracks,
    detection_keys: BTreeSet<SyncKey>,
    captures_seen: u64,
    predicted: u64,
}

/// All cameras' tracks. One instance lives behind a mutex; the detection
/// loop and the capture loop both lock it per message.
#[derive(Default)]
pub(crate) struct TrackerState {
    cameras: HashMap<CameraId, CameraState>,
}

fn to_records(tracks: &[Track]) -> Vec<TrackRecord> {
    tracks
        .iter()
        .map(|track| TrackRecord {
            bbox: track.bbox(),
            track_id: track.id.clone(),
            class_id: track.class_id.clone(),
            confirmed: track.is_confirmed(),
        })
        .collect()
}

impl TrackerState {
    /// One detection batch: associate, update lifecycles, stamp the track
    /// list onto the envelope.
    pub(crate) fn handle_detection(
        &mut self,
        config: &TrackerConfig,
        key: SyncKey,
        envelope: &mut FrameEnvelope,
    ) {
        let camera = self.cameras.entry(envelope.camera_id.clone()).or_default();

        camera.detection_keys.insert(key);
        if camera.detection_keys.len() > SEEN_KEY_CAPACITY {
            camera.detection_keys.pop_first();
        }

        let observations: Vec<TrackObservation> = envelope
            .metadata
            .detections
            .as_deref()
            .unwrap_or_default()
            .iter()
            .map(|detection| TrackObservation {
                bbox: detection.bbox,
                score: detection.score,
                class_id: detection.class_id.clone(),
            })
            .collect();

        let emitted = camera.tracks.step(&observations, &config.settings);
        envelope.metadata.tracks = Some(to_records(&emitted));
    }

    /// One capture frame: when its key never showed up on the detection
    /// stream and the prediction budget allows, roll confirmed tracks
    /// forward and stamp the predictions onto the envelope. Returns
    /// `false` when the frame should produce no output.
    pub(crate) fn handle_capture(
        &mut self,
        config: &TrackerConfig,
        key: SyncKey,
        envelope: &mut FrameEnvelope,
    ) -> bool {
        if config.ignore_capture {
            return false;
        }

        let camera = self.cameras.entry(envelope.camera_id.clone()).or_default();
        camera.captures_seen += 1;

        if camera.detection_keys.contains(&key) {
            return false;
        }

        let fraction = camera.predicted as f64 / camera.captures_seen as f64;
        if fraction >= config.prediction_factor {
            return false;
        }

        let emitted = camera.tracks.predict_only();
        if emitted.is_empty() {
            return false;
        }

        camera.predicted += 1;
        envelope.metadata.tracks = Some(to_records(&emitted));
        envelope.metadata.predicted = Some(true);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mcmot_messages::{CameraMetadata, Detection, StageMetadata, TensorData};

    fn config(prediction_factor: f64, ignore_capture: bool) -> TrackerConfig {
        TrackerConfig {
            settings: TrackerSettings {
                n_init: 1,
                ..Default::default()
            },
            prediction_factor,
            ignore_capture,
        }
    }

    fn envelope(frame_number: u64, detections: Option<Vec<Detection>>) -> FrameEnvelope {
        FrameEnvelope {
            camera_id: "cam-0".to_owned(),
            frame_number,
            frame_timestamp: frame_number as f64 / 30.0,
            fps: 30,
            image: TensorData::from_jpeg(vec![0u8; 2], 1, 1),
            metadata: StageMetadata {
                detections,
                ..Default::default()
            },
            camera_metadata: CameraMetadata::default(),
        }
    }

    fn detection(x: f32) -> Detection {
        Detection {
            bbox: [x, 0.0, 10.0, 10.0],
            score: 0.9,
            class_id: "car".to_owned(),
        }
    }

    #[test]
    fn detections_produce_track_records() {
        let mut state = TrackerState::default();
        let config = config(0.5, false);

        let mut env = envelope(0, Some(vec![detection(0.0)]));
        state.handle_detection(&config, 0, &mut env);
        let tracks = env.metadata.tracks.expect("tracks stamped");
        assert_eq!(tracks.len(), 1);
        assert!(tracks.first().is_some_and(|t| t.confirmed));
    }

    #[test]
    fn capture_of_a_detected_key_is_silent() {
        let mut state = TrackerState::default();
        let config = config(1.0, false);

        let mut env = envelope(0, Some(vec![detection(0.0)]));
        state.handle_detection(&config, 0, &mut env);

        let mut capture = envelope(0, None);
        assert!(!state.handle_capture(&config, 0, &mut capture));
    }

    #[test]
    fn ignore_capture_disables_prediction_regardless_of_factor() {
        let mut state = TrackerState::default();
        let config = config(1.0, true);

        let mut env = envelope(0, Some(vec![detection(0.0)]));
        state.handle_detection(&config, 0, &mut env);

        let mut capture = envelope(1, None);
        assert!(!state.handle_capture(&config, 1, &mut capture));
    }

    #[test]
    fn slow_detector_is_bridged_by_predictions_up_to_the_factor() {
        // Capture at 30 fps, detections on every third frame, budget 0.5:
        // of the 67 undetected frames, predictions must cover at least 45.
        let mut state = TrackerState::default();
        let config = config(0.5, false);

        let mut real = 0;
        let mut predicted = 0;
        for frame in 0..100u64 {
            if frame % 3 == 0 {
                let mut env = envelope(frame, Some(vec![detection(frame as f32)]));
                state.handle_detection(&config, frame as i64, &mut env);
                real += 1;
            }
            let mut capture = envelope(frame, None);
            if state.handle_capture(&config, frame as i64, &mut capture) {
                predicted += 1;
                assert_eq!(capture.metadata.predicted, Some(true));
                assert!(capture.metadata.tracks.is_some());
            }
        }

        assert_eq!(real, 34);
        assert!(predicted >= 45, "only {predicted} predicted frames");
        // The budget is honoured.
        assert!(predicted <= 50);
    }
}
