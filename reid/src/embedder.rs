//! The re-identification embedder boundary.
use mcmot_messages::TensorData;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum EmbedderError {
    #[error("embedder request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("embedder endpoint unhealthy: status {0}")]
    Unhealthy(u16),

    #[error("embedder returned a malformed embedding: {0}")]
    Malformed(String),
}

#[derive(Serialize)]
struct EmbedRequest<'a> {
    image: &'a TensorData,
}

#[derive(Deserialize)]
struct EmbedResponse {
    embedding: Vec<f32>,
}

/// The embedder capability: a fixed-dimension vector per image crop.
#[allow(async_fn_in_trait)]
pub(crate) trait Embedder {
    async fn embed(&self, crop: &TensorData) -> Result<Vec<f32>, EmbedderError>;

    async fn ready(&self) -> Result<(), EmbedderError>;
}

/// Remote embedder speaking `POST /embed` and answering
/// `{"embedding": [f32; N]}`.
pub(crate) struct HttpEmbedder {
    endpoint: String,
    client: reqwest::Client,
    dimension: usize,
}

impl HttpEmbedder {
    pub(crate) fn new(
        endpoint: &str,
        timeout: Duration,
        dimension: usize,
    ) -> Result<Self, EmbedderError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            client,
            dimension,
        })
    }
}

impl Embedder for HttpEmbedder {
    async fn embed(&self, crop: &TensorData) -> Result<Vec<f32>, EmbedderError> {
        let response = self
            .client
            .post(format!("{}/embed", self.endpoint))
            .json(&EmbedRequest { image: crop })
            .send()
            .await?
            .error_for_status()?;
        let body: EmbedResponse = response.json().await?;
        if body.embedding.len() != self.dimension {
            return Err(EmbedderError::Malformed(format!(
                "expected dimension {}, got {}",
                self.dimension,
                body.embedding.len()
            )));
        }
        Ok(body.embedding)
    }

    async fn ready(&self) -> Result<(), EmbedderError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(EmbedderError::Unhealthy(response.status().as_u16()))
        }
    }
}
