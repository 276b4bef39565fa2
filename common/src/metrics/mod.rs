//! Metric names and label helpers shared by all pipeline components.
use metrics::counter;

pub mod names {
    use const_format::concatcp;

    pub const METRIC_NAME_PREFIX: &str = "mcmot_";

    pub const MESSAGES_RECEIVED: &str = concatcp!(METRIC_NAME_PREFIX, "messages_received");
    pub const MESSAGES_PROCESSED: &str = concatcp!(METRIC_NAME_PREFIX, "messages_processed");
    pub const FAILURES: &str = concatcp!(METRIC_NAME_PREFIX, "failures");
    pub const FRAMES_SENT: &str = concatcp!(METRIC_NAME_PREFIX, "frames_sent");
    pub const FRAMES_SKIPPED: &str = concatcp!(METRIC_NAME_PREFIX, "frames_skipped");
    pub const GROUPS_EMITTED: &str = concatcp!(METRIC_NAME_PREFIX, "groups_emitted");
    pub const LAST_MESSAGE_FRAME_NUMBER: &str =
        concatcp!(METRIC_NAME_PREFIX, "last_message_frame_number");
    pub const LAST_MESSAGE_TIMESTAMP: &str =
        concatcp!(METRIC_NAME_PREFIX, "last_message_timestamp");
    pub const COMPONENT_INFO: &str = concatcp!(METRIC_NAME_PREFIX, "component_info");
}

pub mod messages_received {
    #[derive(Clone, Copy, Debug)]
    pub enum MessageKind {
        Frame,
        Control,
        Unified,
        Unexpected,
    }

    pub fn get_label(kind: MessageKind) -> (&'static str, String) {
        (
            "message_kind",
            match kind {
                MessageKind::Frame => "frame",
                MessageKind::Control => "control",
                MessageKind::Unified => "unified",
                MessageKind::Unexpected => "unexpected",
            }
            .to_owned(),
        )
    }
}

pub mod failures {
    #[derive(Clone, Copy, Debug)]
    pub enum FailureKind {
        UnableToDecodeMessage,
        InvalidEnvelope,
        KafkaPublishFailed,
        DeadLettered,
        ModelInvocationFailed,
        FileWriteFailed,
    }

    pub fn get_label(kind: FailureKind) -> (&'static str, String) {
        (
            "failure_kind",
            match kind {
                FailureKind::UnableToDecodeMessage => "unable_to_decode_message",
                FailureKind::InvalidEnvelope => "invalid_envelope",
                FailureKind::KafkaPublishFailed => "kafka_publish_failed",
                FailureKind::DeadLettered => "dead_lettered",
                FailureKind::ModelInvocationFailed => "model_invocation_failed",
                FailureKind::FileWriteFailed => "file_write_failed",
            }
            .to_owned(),
        )
    }
}

pub mod skips {
    #[derive(Clone, Copy, Debug)]
    pub enum SkipKind {
        Duplicate,
        Stale,
    }

    pub fn get_label(kind: SkipKind) -> (&'static str, String) {
        (
            "skip_kind",
            match kind {
                SkipKind::Duplicate => "duplicate",
                SkipKind::Stale => "stale",
            }
            .to_owned(),
        )
    }
}

/// Emits a constant `component_info` counter carrying the component name,
/// so deployed component versions can be queried from Prometheus.
pub fn component_info_metric(component_name: &'static str) {
    counter!(
        names::COMPONENT_INFO,
        &[("component", component_name.to_owned())]
    )
    .increment(1);
}
