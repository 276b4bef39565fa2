//! The object detector boundary: a JSON-over-HTTP inference endpoint.
use mcmot_messages::{Detection, TensorData};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub(crate) enum DetectorError {
    #[error("detector request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("detector endpoint unhealthy: status {0}")]
    Unhealthy(u16),
}

#[derive(Serialize)]
struct DetectRequest<'a> {
    image: &'a TensorData,
}

#[derive(Deserialize)]
struct DetectResponse {
    detections: Vec<Detection>,
}

/// The detector capability the stage is generic over.
#[allow(async_fn_in_trait)]
pub(crate) trait Detector {
    /// Bounding boxes for one JPEG frame.
    async fn detect(&self, image: &TensorData) -> Result<Vec<Detection>, DetectorError>;

    /// Startup probe; failure is a model-load error.
    async fn ready(&self) -> Result<(), DetectorError>;
}

/// Remote detector speaking `POST /detect` with the envelope's image
/// triple and answering `{"detections": [{bbox, score, class_id}]}`.
pub(crate) struct HttpDetector {
    endpoint: String,
    client: reqwest::Client,
}

impl HttpDetector {
    pub(crate) fn new(endpoint: &str, timeout: Duration) -> Result<Self, DetectorError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            endpoint: endpoint.trim_end_matches('/').to_owned(),
            client,
        })
    }
}

impl Detector for HttpDetector {
    async fn detect(&self, image: &TensorData) -> Result<Vec<Detection>, DetectorError> {
        let response = self
            .client
            .post(format!("{}/detect", self.endpoint))
            .json(&DetectRequest { image })
            .send()
            .await?
            .error_for_status()?;
        let body: DetectResponse = response.json().await?;
        Ok(body.detections)
    }

    async fn ready(&self) -> Result<(), DetectorError> {
        let response = self
            .client
            .get(format!("{}/health", self.endpoint))
            .send()
            .await?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DetectorError::Unhealthy(response.status().as_u16()))
        }
    }
}
