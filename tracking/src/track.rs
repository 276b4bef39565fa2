//! Track lifecycle and per-camera association.
use crate::{
    assignment::{assign, nms},
    kalman::KalmanBoxFilter,
};
use serde::Deserialize;
use tracing::debug;
use uuid::Uuid;

/// Lifecycle of one track.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrackState {
    /// Seen, but not yet for `n_init` consecutive frames.
    Tentative,
    Confirmed,
    /// Unmatched for longer than `max_age`; kept only until the next
    /// sweep.
    Deleted,
}

/// Association and lifecycle parameters.
#[derive(Clone, Debug, PartialEq, clap::Args, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct TrackerSettings {
    /// Assignment gate on cost `1 - IoU`.
    #[clap(long, default_value = "0.7")]
    pub max_iou_distance: f64,

    /// Frames a track survives without an update.
    #[clap(long, default_value = "30")]
    pub max_age: u32,

    /// Consecutive hits before a tentative track is confirmed.
    #[clap(long, default_value = "3")]
    pub n_init: u32,

    /// Overlap beyond which weaker detections are suppressed before
    /// association.
    #[clap(long, default_value = "0.7")]
    pub nms_max_overlap: f64,

    /// Emit confirmed tracks only.
    #[clap(long)]
    pub only_confirmed_tracks: bool,
}

impl Default for TrackerSettings {
    fn default() -> Self {
        Self {
            max_iou_distance: 0.7,
            max_age: 30,
            n_init: 3,
            nms_max_overlap: 0.7,
            only_confirmed_tracks: false,
        }
    }
}

/// A detection handed to the tracker: box, class and score.
#[derive(Clone, Debug)]
pub struct TrackObservation {
    pub bbox: [f32; 4],
    pub score: f32,
    pub class_id: String,
}

/// The tracker's view of one object.
#[derive(Clone, Debug)]
pub struct Track {
    pub id: String,
    pub class_id: String,
    pub state: TrackState,
    filter: KalmanBoxFilter,
    hits: u32,
    /// Frames since the last detection update.
    time_since_update: u32,
}

impl Track {
    fn new(observation: &TrackObservation) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            class_id: observation.class_id.clone(),
            state: TrackState::Tentative,
            filter: KalmanBoxFilter::new(observation.bbox),
            hits: 1,
            time_since_update: 0,
        }
    }

    pub fn bbox(&self) -> [f32; 4] {
        self.filter.bbox()
    }

    pub fn is_confirmed(&self) -> bool {
        self.state == TrackState::Confirmed
    }

    fn predict(&mut self) {
        self.filter.predict(1.0);
    }

    fn update(&mut self, observation: &TrackObservation, n_init: u32) {
        self.filter.update(observation.bbox);
        self.hits += 1;
        self.time_since_update = 0;
        if self.state == TrackState::Tentative && self.hits >= n_init {
            self.state = TrackState::Confirmed;
        }
    }

    fn mark_missed(&mut self, max_age: u32) {
        self.time_since_update += 1;
        // A tentative track dies on its first miss; its hit streak broke.
        if self.state == TrackState::Tentative || self.time_since_update > max_age {
            self.state = TrackState::Deleted;
        }
    }
}

/// All tracks of one camera. The tracker stage holds one of these per
/// camera behind a mutex shared by its two consumer loops.
#[derive(Debug, Default)]
pub struct CameraTracks {
    tracks: Vec<Track>,
}

impl CameraTracks {
    /// One association step over a detection batch: NMS, per-class
    /// Hungarian assignment, lifecycle updates. Returns the emitted
    /// tracks.
    pub fn step(&mut self, observations: &[TrackObservation], settings: &TrackerSettings) -> Vec<Track> {
        let boxes: Vec<[f32; 4]> = observations.iter().map(|o| o.bbox).collect();
        let scores: Vec<f32> = observations.iter().map(|o| o.score).collect();
        let kept = nms(&boxes, &scores, settings.nms_max_overlap);
        let observations: Vec<&TrackObservation> = kept
            .into_iter()
            .filter_map(|index| observations.get(index))
            .collect();

        for track in &mut self.tracks {
            track.predict();
        }

        // Gate per class: a detection never matches a track of another
        // class.
        let mut matched_tracks = vec![false; self.tracks.len()];
        let mut matched_observations = vec![false; observations.len()];

        let mut classes: Vec<String> = observations
            .iter()
            .map(|o| o.class_id.clone())
            .chain(self.tracks.iter().map(|t| t.class_id.clone()))
            .collect();
        classes.sort();
        classes.dedup();

        for class in classes {
            let track_indices: Vec<usize> = self
                .tracks
                .iter()
                .enumerate()
                .filter(|(_, t)| t.class_id == class && t.state != TrackState::Deleted)
                .map(|(i, _)| i)
                .collect();
            let observation_indices: Vec<usize> = observations
                .iter()
                .enumerate()
                .filter(|(_, o)| o.class_id == class)
                .map(|(i, _)| i)
                .collect();

            let track_boxes: Vec<[f32; 4]> = track_indices
                .iter()
                .filter_map(|&i| self.tracks.get(i).map(Track::bbox))
                .collect();
            let observation_boxes: Vec<[f32; 4]> = observation_indices
                .iter()
                .filter_map(|&i| observations.get(i).map(|o| o.bbox))
                .collect();

            let outcome = assign(&track_boxes, &observation_boxes, settings.max_iou_distance);
            for (track_offset, observation_offset) in outcome.matches {
                let (Some(&track_index), Some(&observation_index)) = (
                    track_indices.get(track_offset),
                    observation_indices.get(observation_offset),
                ) else {
                    continue;
                };
                if let (Some(track), Some(observation)) = (
                    self.tracks.get_mut(track_index),
                    observations.get(observation_index),
                ) {
                    track.update(observation, settings.n_init);
                    if let Some(flag) = matched_tracks.get_mut(track_index) {
                        *flag = true;
                    }
                    if let Some(flag) = matched_observations.get_mut(observation_index) {
                        *flag = true;
                    }
                }
            }
        }

        for (index, track) in self.tracks.iter_mut().enumerate() {
            if !matched_tracks.get(index).copied().unwrap_or(false) {
                track.mark_missed(settings.max_age);
            }
        }

        // Unmatched detections start new tentative tracks.
        for (index, observation) in observations.iter().enumerate() {
            if !matched_observations.get(index).copied().unwrap_or(false) {
                let track = Track::new(observation);
                debug!(track_id = %track.id, class_id = %track.class_id, "new tentative track");
                self.tracks.push(track);
            }
        }

        self.tracks.retain(|track| track.state != TrackState::Deleted);
        self.emit(settings)
    }

    /// Kalman predict-only pass over confirmed tracks, used for frames
    /// the detector never saw. Hit counts are not advanced.
    pub fn predict_only(&mut self) -> Vec<Track> {
        for track in &mut self.tracks {
            if track.is_confirmed() {
                track.predict();
            }
        }
        self.tracks
            .iter()
            .filter(|track| track.is_confirmed())
            .cloned()
            .collect()
    }

    fn emit(&self, settings: &TrackerSettings) -> Vec<Track> {
        self.tracks
            .iter()
            .filter(|track| {
                track.state != TrackState::Deleted
                    && (!settings.only_confirmed_tracks || track.is_confirmed())
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
