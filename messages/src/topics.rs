//! Topic and consumer-group naming conventions.
//!
//! Stage data topics are named `<stage>-<pipeline>-topic`; the capture
//! stage's inbound control topic is `camera-<pipeline>-topic`; dead-letter
//! topics are `<stage>-<pipeline>-dlq`.

/// The fixed stage chain of a pipeline, in data-flow order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    serde::Serialize,
    serde::Deserialize,
    strum::Display,
    strum::EnumString,
    strum::EnumIter,
    clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Stage {
    Capture,
    Detection,
    Reid,
    Tracker,
    Unification,
    Analytics,
}

impl Stage {
    /// The stage whose output topic this stage consumes, [None] for
    /// capture (which reads a video source).
    pub fn upstream(self) -> Option<Stage> {
        match self {
            Stage::Capture => None,
            Stage::Detection => Some(Stage::Capture),
            Stage::Reid => Some(Stage::Detection),
            Stage::Tracker => Some(Stage::Reid),
            Stage::Unification => Some(Stage::Tracker),
            Stage::Analytics => Some(Stage::Unification),
        }
    }

    /// Stages that must not be replicated beyond a single worker.
    pub fn single_instance(self) -> bool {
        matches!(self, Stage::Unification | Stage::Analytics)
    }
}

pub fn stage_topic(stage: Stage, pipeline: &str) -> String {
    format!("{stage}-{pipeline}-topic")
}

pub fn control_topic(pipeline: &str) -> String {
    format!("camera-{pipeline}-topic")
}

pub fn dlq_topic(stage: Stage, pipeline: &str) -> String {
    format!("{stage}-{pipeline}-dlq")
}

/// Consumer group id for one of a stage's consumer roles. Workers of the
/// same stage share the group, so partitions are balanced across replicas.
pub fn group_id(pipeline: &str, stage: Stage, role: &str) -> String {
    format!("{pipeline}-{stage}-{role}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn topic_names_follow_the_convention() {
        assert_eq!(stage_topic(Stage::Detection, "traffic"), "detection-traffic-topic");
        assert_eq!(control_topic("traffic"), "camera-traffic-topic");
        assert_eq!(dlq_topic(Stage::Reid, "traffic"), "reid-traffic-dlq");
        assert_eq!(group_id("traffic", Stage::Tracker, "detections"), "traffic-tracker-detections");
    }

    #[test]
    fn stage_parses_from_lowercase() {
        assert_eq!(Stage::from_str("unification").expect("parses"), Stage::Unification);
        assert!(Stage::from_str("Unification").is_err());
    }

    #[test]
    fn only_terminal_stages_are_single_instance() {
        assert!(Stage::Unification.single_instance());
        assert!(Stage::Analytics.single_instance());
        assert!(!Stage::Tracker.single_instance());
    }
}
