//! Base64-framed binary arrays, the JSON stand-in for in-memory ndarrays.
use base64::{Engine, engine::general_purpose::STANDARD};
use ndarray::{ArrayD, IxDyn};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TensorError {
    #[error("dtype mismatch: expected {expected}, found {found}")]
    DtypeMismatch {
        expected: &'static str,
        found: String,
    },

    #[error("byte length {bytes} does not match shape {shape:?}")]
    ShapeMismatch { bytes: usize, shape: Vec<usize> },
}

/// A shape + dtype + bytes triple. JPEG images use dtype `"u8"` with the
/// shape of the decoded frame; embedding vectors use dtype `"f32"`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TensorData {
    pub shape: Vec<usize>,
    pub dtype: String,
    #[serde(rename = "b64", with = "base64_bytes")]
    pub data: Vec<u8>,
}

impl TensorData {
    /// Wraps encoded JPEG bytes. The shape records the decoded dimensions
    /// `[height, width, channels]`, not the compressed length.
    pub fn from_jpeg(data: Vec<u8>, height: usize, width: usize) -> Self {
        Self {
            shape: vec![height, width, 3],
            dtype: "u8".to_owned(),
            data,
        }
    }

    pub fn from_f32_array(array: &ArrayD<f32>) -> Self {
        let data = array.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self {
            shape: array.shape().to_vec(),
            dtype: "f32".to_owned(),
            data,
        }
    }

    pub fn to_f32_array(&self) -> Result<ArrayD<f32>, TensorError> {
        if self.dtype != "f32" {
            return Err(TensorError::DtypeMismatch {
                expected: "f32",
                found: self.dtype.clone(),
            });
        }
        let expected_len: usize = self.shape.iter().product::<usize>() * size_of::<f32>();
        if self.data.len() != expected_len {
            return Err(TensorError::ShapeMismatch {
                bytes: self.data.len(),
                shape: self.shape.clone(),
            });
        }
        let values: Vec<f32> = self
            .data
            .chunks_exact(size_of::<f32>())
            .map(|chunk| {
                let mut bytes = [0u8; size_of::<f32>()];
                bytes.copy_from_slice(chunk);
                f32::from_le_bytes(bytes)
            })
            .collect();
        ArrayD::from_shape_vec(IxDyn(&self.shape), values).map_err(|_| {
            TensorError::ShapeMismatch {
                bytes: self.data.len(),
                shape: self.shape.clone(),
            }
        })
    }
}

mod base64_bytes {
    use super::{Engine, STANDARD};
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub(super) fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub(super) fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(D::Error::custom)
    }
}
