//! Motion and association kernels for multi-object tracking: a constant
//! velocity Kalman filter over bounding boxes, IoU-based association with
//! Hungarian assignment, and the track lifecycle state machine.
mod assignment;
mod kalman;
mod track;

pub use assignment::{AssignmentOutcome, assign, iou, nms};
pub use kalman::KalmanBoxFilter;
pub use track::{CameraTracks, Track, TrackObservation, TrackState, TrackerSettings};
