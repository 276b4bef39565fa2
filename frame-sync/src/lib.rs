//! Frame synchronisation for the MCMOT pipeline.
//!
//! One engine, two uses:
//! * **Intra-camera** admission ([FrameSync::skip_or_wait]): decides per
//!   incoming frame whether to process it, drop it, or delay it so a stage
//!   keeps up with its source under variable latency.
//! * **Inter-camera** grouping ([FrameSync::deposit] / [FrameSync::poll]):
//!   buffers contemporaneous frames from all cameras under a common sync
//!   key and emits them as groups once complete, expired, or squeezed out
//!   by backlog pressure.
//!
//! All engine state sits behind a single mutex; emitted groups are handed
//! back to the caller so stage callbacks always run outside the lock.
mod config;
mod engine;
mod group;
mod watermark;

pub use config::{SyncConfig, SyncType};
pub use engine::{FrameSync, SkipReason, SyncDecision, SyncGroup};
pub use watermark::CameraWatermark;
