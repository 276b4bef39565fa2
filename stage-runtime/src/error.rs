use mcmot_messages::EnvelopeError;
use rdkafka::error::KafkaError;
use thiserror::Error;

/// Fatal worker errors. Each maps to the process exit code contract:
/// 2 for configuration errors, 3 when the broker is unreachable, 4 when a
/// model or source fails to load.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("broker unreachable: {0}")]
    Broker(#[source] KafkaError),

    #[error(transparent)]
    KafkaClient(#[from] mcmot_common::KafkaClientError),

    #[error("model or source failed to load: {0}")]
    ModelLoad(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StageError {
    pub fn exit_code(&self) -> i32 {
        match self {
            StageError::Config(_) | StageError::Io(_) => 2,
            StageError::Broker(_) | StageError::KafkaClient(_) => 3,
            StageError::ModelLoad(_) => 4,
        }
    }
}

/// Logs a fatal error and exits with its mapped code; exits 0 otherwise.
pub fn finish(result: Result<(), StageError>) -> ! {
    match result {
        Ok(()) => std::process::exit(0),
        Err(error) => {
            tracing::error!("{error}");
            std::process::exit(error.exit_code())
        }
    }
}

/// Errors a stage callback may raise for a single message. Anything but
/// [CallbackError::Fatal] leaves the worker alive: the message is
/// redelivered and eventually dead-lettered.
#[derive(Debug, Error)]
pub enum CallbackError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("{0}")]
    Other(String),

    /// Escalates to worker shutdown with a nonzero exit code.
    #[error(transparent)]
    Fatal(#[from] StageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_codes_follow_the_contract() {
        assert_eq!(StageError::Config("bad".into()).exit_code(), 2);
        assert_eq!(StageError::ModelLoad("missing".into()).exit_code(), 4);
        assert_eq!(
            StageError::Broker(KafkaError::Subscription("t".into())).exit_code(),
            3
        );
    }
}
