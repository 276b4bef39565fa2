use mcmot_common::SyncKey;
use serde::{Deserialize, Serialize};

/// Which key space frames are aligned in.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    /// Align by frame number; assumes all cameras started counting
    /// together.
    Number,
    /// Align by capture timestamp, bucketed at `1/fps`.
    Timestamp,
    /// No synchronisation; every frame is accepted.
    #[default]
    None,
}

/// Frame-sync options, shared between stage command lines (as a flattened
/// clap group) and the per-stage JSON config (`frame-sync` section).
#[derive(Clone, Debug, PartialEq, clap::Args, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct SyncConfig {
    #[clap(long = "sync-type", value_enum, default_value = "none")]
    #[serde(rename = "type")]
    pub sync_type: SyncType,

    /// Maximum number of pending groups before the oldest are forced out.
    #[clap(long, default_value = "30")]
    pub backlog_threshold: usize,

    /// Seconds between backlog checks.
    #[clap(long, default_value = "1.0")]
    pub backlog_check_interval: f64,

    /// Nominal frame rate, used when an envelope declares fps of zero.
    #[clap(long, default_value = "30")]
    pub fps: u32,

    /// Seconds a pending group may wait for missing cameras before being
    /// emitted incomplete.
    #[clap(long, default_value = "5.0")]
    pub retention_time: f64,

    /// Seconds of lateness beyond which a frame is dropped to catch up.
    #[clap(long, default_value = "2.0")]
    pub latency_threshold: f64,

    /// Skip the wait phase until the first emission, so the pipeline warms
    /// up immediately.
    #[clap(long)]
    pub ignore_initial_delay: bool,

    /// Reorder out-of-order per-camera arrivals in a small priority buffer
    /// before depositing.
    #[clap(long)]
    pub enable_sequencing: bool,

    /// Always process the most recently arrived frame, discarding anything
    /// in flight.
    #[clap(long)]
    pub seek_to_end: bool,

    /// Emit only groups holding one frame from every known camera.
    #[clap(long)]
    pub unify: bool,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sync_type: SyncType::None,
            backlog_threshold: 30,
            backlog_check_interval: 1.0,
            fps: 30,
            retention_time: 5.0,
            latency_threshold: 2.0,
            ignore_initial_delay: false,
            enable_sequencing: false,
            seek_to_end: false,
            unify: false,
        }
    }
}

impl SyncConfig {
    /// Declared fps wins over the configured nominal rate; zero means
    /// "use the config".
    pub fn effective_fps(&self, declared: u32) -> u32 {
        if declared > 0 { declared } else { self.fps.max(1) }
    }

    /// The admission tolerance in seconds: one frame period in timestamp
    /// mode, one second in number mode.
    pub fn tol(&self, declared_fps: u32) -> f64 {
        match self.sync_type {
            SyncType::Timestamp => 1.0 / f64::from(self.effective_fps(declared_fps)),
            SyncType::Number | SyncType::None => 1.0,
        }
    }

    /// Seconds between consecutive frames of a source.
    pub fn period(&self, declared_fps: u32) -> f64 {
        1.0 / f64::from(self.effective_fps(declared_fps))
    }

    /// The integer bucket frames are aligned in. In number mode this is
    /// the frame number itself; in timestamp mode the timestamp quantised
    /// at `tol`, nudged by an epsilon so exact multiples of the frame
    /// period do not straddle bucket borders.
    pub fn sync_key(&self, frame_number: u64, frame_timestamp: f64, declared_fps: u32) -> SyncKey {
        match self.sync_type {
            SyncType::Number | SyncType::None => frame_number as SyncKey,
            SyncType::Timestamp => {
                (frame_timestamp * f64::from(self.effective_fps(declared_fps)) + 1e-6).floor()
                    as SyncKey
            }
        }
    }
}
