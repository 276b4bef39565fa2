use crate::envelope::EnvelopeError;
use serde::{Deserialize, Serialize};

/// Lifecycle signal addressed to the capture stage of a pipeline.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
    clap::ValueEnum,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum Signal {
    /// Begin reading the source.
    Start,
    /// Drain and exit.
    Stop,
    /// Pause after flushing the current frame.
    Hold,
    /// Continue from the held position.
    Resume,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub pipeline: String,
    pub signal: Signal,
    /// How many times to replay a finite source. Only meaningful with
    /// [Signal::Start].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loop_count: Option<u32>,
}

impl ControlMessage {
    pub fn to_payload(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(EnvelopeError::Encode)
    }

    pub fn from_payload(payload: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(payload).map_err(EnvelopeError::Decode)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signals_serialize_uppercase() {
        let message = ControlMessage {
            pipeline: "traffic".to_owned(),
            signal: Signal::Start,
            loop_count: Some(2),
        };
        let json: serde_json::Value =
            serde_json::from_slice(&message.to_payload().expect("encodes")).expect("is json");
        assert_eq!(json["signal"], "START");
        assert_eq!(json["loop_count"], 2);
    }

    #[test]
    fn hold_without_loop_count_roundtrips() {
        let payload = br#"{"pipeline":"traffic","signal":"HOLD"}"#;
        let message = ControlMessage::from_payload(payload).expect("decodes");
        assert_eq!(message.signal, Signal::Hold);
        assert_eq!(message.loop_count, None);
    }
}
