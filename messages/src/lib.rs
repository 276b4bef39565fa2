//! Wire types for every topic of the MCMOT pipeline.
//!
//! All payloads are JSON documents; binary fields (JPEG planes, embedding
//! vectors) are carried as base64 strings inside a [TensorData] triple of
//! shape, dtype and bytes.
mod control;
mod envelope;
mod tensor;
mod topics;

pub use control::{ControlMessage, Signal};
pub use envelope::{
    CameraMetadata, Detection, EnvelopeError, FrameEnvelope, StageMetadata, TrackRecord,
    UnifiedFrame, UnifiedGroup,
};
pub use tensor::{TensorData, TensorError};
pub use topics::{Stage, control_topic, dlq_topic, group_id, stage_topic};
