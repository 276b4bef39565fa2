//! The multimodal language model boundary.
use base64::{Engine, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum ModelError {
    #[error("model request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("model endpoint unhealthy: status {0}")]
    Unhealthy(u16),
}

#[derive(Serialize)]
struct CaptionRequest<'a> {
    prompt: &'a str,
    image_b64: String,
    metadata: &'a serde_json::Value,
}

#[derive(Deserialize)]
struct CaptionResponse {
    caption: String,
}

/// The caption capability: analysis text from prompt + combined image +
/// group metadata.
#[allow(async_fn_in_trait)]
pub(crate) trait CaptionModel {
    async fn caption(
        &self,
        prompt: &str,
        image: &[u8],
        metadata: &serde_json::Value,
    ) -> Result<String, ModelError>;

    async fn ready(&self) -> Result<(), ModelError>;
}

/// Remote model speaking `POST /caption` and answering `{"caption": ...}`.
pub(crate) struct HttpCaptionModel {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpCaptionModel {
    pub(crate) fn new(endpoint: &str, timeout: Duration) -> Result<Self, ModelError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            client,
        })
    }
}

impl CaptionModel for HttpCaptionModel {
    async fn caption(
        &self,
        prompt: &str,
        image: &[u8],
        metadata: &serde_json::Value,
    ) -> Result<String, ModelError> {
        let response = self
            .client
            .post(format!("{}/caption", self.endpoint))
            .json(&CaptionRequest {
                prompt,
                image_b64: STANDARD.encode(image),
                metadata,
            })
            .send()
            .await?
            .error_for_status()?;
        let body: CaptionResponse = response.json().await?;
        Ok(body.caption)
    }

    async fn ready(&self) -> Result<(), ModelError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(ModelError::Unhealthy(response.status().as_u16()))
        }
    }
}
