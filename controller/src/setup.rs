//! Topic provisioning: recreate every topic of a pipeline.
use crate::config::SetupConfig;
use mcmot_messages::{control_topic, dlq_topic, stage_topic};
use rdkafka::{
    ClientConfig,
    admin::{AdminClient, AdminOptions, NewTopic, TopicReplication},
    client::DefaultClientContext,
    error::KafkaError,
    types::RDKafkaErrorCode,
    util::Timeout,
};
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

const ADMIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub(crate) enum SetupError {
    #[error("failed to create admin client: {0}")]
    Client(#[source] KafkaError),

    #[error("topic operation failed: {0}")]
    Admin(#[source] KafkaError),

    #[error("failed to create topic {topic}: {code}")]
    Create {
        topic: String,
        code: RDKafkaErrorCode,
    },
}

/// Deletes and recreates the pipeline's stage, dead-letter and control
/// topics with the configured partition counts.
pub(crate) async fn setup(config: &SetupConfig) -> Result<(), SetupError> {
    let admin: AdminClient<DefaultClientContext> = ClientConfig::new()
        .set("bootstrap.servers", config.bootstrap_servers.join(","))
        .create()
        .map_err(SetupError::Client)?;

    let mut topics: Vec<(String, i32)> = Vec::new();
    for (stage, partitions) in &config.topics {
        topics.push((stage_topic(*stage, &config.pipeline), (*partitions).max(1)));
        topics.push((dlq_topic(*stage, &config.pipeline), 1));
    }
    topics.push((control_topic(&config.pipeline), 1));

    let options = AdminOptions::new().operation_timeout(Some(Timeout::After(ADMIN_TIMEOUT)));

    let names: Vec<&str> = topics.iter().map(|(name, _)| name.as_str()).collect();
    let deletions = admin
        .delete_topics(&names, &options)
        .await
        .map_err(SetupError::Admin)?;
    for deletion in deletions {
        match deletion {
            Ok(topic) => info!(topic, "deleted topic"),
            Err((_, RDKafkaErrorCode::UnknownTopicOrPartition)) => {}
            Err((topic, code)) => warn!(topic, %code, "topic deletion failed"),
        }
    }

    let new_topics: Vec<NewTopic> = topics
        .iter()
        .map(|(name, partitions)| NewTopic::new(name, *partitions, TopicReplication::Fixed(1)))
        .collect();
    let creations = admin
        .create_topics(new_topics.iter(), &options)
        .await
        .map_err(SetupError::Admin)?;
    for creation in creations {
        match creation {
            Ok(topic) => info!(topic, "created topic"),
            Err((_, RDKafkaErrorCode::TopicAlreadyExists)) => {}
            Err((topic, code)) => return Err(SetupError::Create { topic, code }),
        }
    }

    Ok(())
}
