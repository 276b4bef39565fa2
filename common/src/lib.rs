//! Shared building blocks for the MCMOT pipeline components.
//!
//! Every stage binary uses this crate for:
//! * Kafka client configuration and consumer creation.
//! * The [CommonKafkaOpts] clap group shared by all command lines.
//! * Metric names and label helpers (see [metrics]).
pub mod metrics;

use rdkafka::{
    ClientConfig,
    config::RDKafkaLogLevel,
    consumer::{Consumer, StreamConsumer},
    error::KafkaError,
};
use thiserror::Error;

/// Identifies a camera stream. Used as the partition key on every
/// per-camera topic.
pub type CameraId = String;

/// Monotonically increasing per-camera frame counter.
pub type FrameNumber = u64;

/// Integer bucket used to align frames across cameras, either a frame
/// number or a quantised timestamp.
pub type SyncKey = i64;

/// Expands to the crate version of the calling binary, suffixed with the
/// git revision when available.
#[macro_export]
macro_rules! version {
    () => {
        const_format::concatcp!(
            clap::crate_version!(),
            "-",
            git_version::git_version!(args = ["--always"], fallback = "unknown")
        )
    };
}

/// Kafka broker options shared by every pipeline component.
#[derive(Clone, Debug, clap::Args)]
pub struct CommonKafkaOpts {
    /// Address of the Kafka broker
    #[clap(long)]
    pub broker: String,

    /// Optional Kafka username
    #[clap(long)]
    pub username: Option<String>,

    /// Optional Kafka password
    #[clap(long)]
    pub password: Option<String>,
}

#[derive(Debug, Error)]
pub enum KafkaClientError {
    #[error("failed to create Kafka client: {0}")]
    Create(#[source] KafkaError),

    #[error("failed to subscribe to topics: {0}")]
    Subscribe(#[source] KafkaError),
}

/// Builds a [ClientConfig] with broker address and, when both are given,
/// SASL credentials. Further settings can be chained before `create()`.
pub fn generate_kafka_client_config(
    broker_address: &str,
    username: &Option<String>,
    password: &Option<String>,
) -> ClientConfig {
    let mut client_config = ClientConfig::new();

    client_config
        .set("bootstrap.servers", broker_address)
        .set_log_level(RDKafkaLogLevel::Warning);

    // Allow for no authentication
    if let (Some(user), Some(pass)) = (username, password) {
        client_config
            .set("security.protocol", "sasl_plaintext")
            .set("sasl.mechanisms", "SCRAM-SHA-256")
            .set("sasl.username", user)
            .set("sasl.password", pass);
    }

    client_config
}

/// Creates a [StreamConsumer] with the settings used throughout the
/// pipeline: manual offset commits and a short session timeout.
/// If `topics_to_subscribe` is [None] the caller is expected to subscribe
/// later.
pub fn create_default_consumer(
    broker_address: &str,
    username: &Option<String>,
    password: &Option<String>,
    consumer_group: &str,
    topics_to_subscribe: Option<&[&str]>,
) -> Result<StreamConsumer, KafkaClientError> {
    let consumer: StreamConsumer =
        generate_kafka_client_config(broker_address, username, password)
            .set("group.id", consumer_group)
            .set("enable.partition.eof", "false")
            .set("session.timeout.ms", "6000")
            .set("enable.auto.commit", "false")
            .create()
            .map_err(KafkaClientError::Create)?;

    if let Some(topics) = topics_to_subscribe {
        consumer
            .subscribe(topics)
            .map_err(KafkaClientError::Subscribe)?;
    }

    Ok(consumer)
}

/// Installs the fmt tracing subscriber honouring `RUST_LOG`.
pub fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_config_without_credentials_has_no_sasl() {
        let config = generate_kafka_client_config("localhost:9092", &None, &None);
        assert_eq!(config.get("bootstrap.servers"), Some("localhost:9092"));
        assert!(config.get("sasl.username").is_none());
    }

    #[test]
    fn client_config_with_credentials_sets_sasl() {
        let config = generate_kafka_client_config(
            "localhost:9092",
            &Some("user".into()),
            &Some("pass".into()),
        );
        assert_eq!(config.get("sasl.username"), Some("user"));
        assert_eq!(config.get("security.protocol"), Some("sasl_plaintext"));
    }
}
