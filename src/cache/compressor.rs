//! Cold tier payload codec.
//!
//! Values leaving process memory are wrapped in a [`ColdRecord`], serialized
//! as JSON and, above a size threshold, zstd-compressed. The first byte of
//! every payload records which of the two encodings follows.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ColdConfig;

const FORMAT_JSON: u8 = 0;
const FORMAT_JSON_ZSTD: u8 = 1;

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Zstd compression failed: {0}")]
    ZstdError(#[from] std::io::Error),

    #[error("Serialization failed: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Unknown payload format byte {0}")]
    UnknownFormat(u8),

    #[error("Payload is empty")]
    Empty,
}

/// What the cold tier stores for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColdRecord<V> {
    /// Unix time in milliseconds when the value was first cached.
    pub inserted_at_ms: u64,
    pub value: V,
}

/// Encodes and decodes cold tier payloads.
#[derive(Debug, Clone)]
pub struct Compressor {
    threshold: usize,
    level: i32,
}

impl Compressor {
    pub fn new(config: &ColdConfig) -> Self {
        Self {
            threshold: config.compress_threshold,
            level: config.zstd_level,
        }
    }

    pub fn encode<V: Serialize>(&self, record: &ColdRecord<V>) -> Result<bytes::Bytes, CodecError> {
        let json = serde_json::to_vec(record)?;

        let (format, body) = if json.len() >= self.threshold {
            (FORMAT_JSON_ZSTD, zstd::encode_all(json.as_slice(), self.level)?)
        } else {
            (FORMAT_JSON, json)
        };

        let mut out = Vec::with_capacity(body.len() + 1);
        out.push(format);
        out.extend_from_slice(&body);
        Ok(out.into())
    }

    pub fn decode<V: DeserializeOwned>(&self, payload: &[u8]) -> Result<ColdRecord<V>, CodecError> {
        let (&format, body) = payload.split_first().ok_or(CodecError::Empty)?;
        match format {
            FORMAT_JSON => Ok(serde_json::from_slice(body)?),
            FORMAT_JSON_ZSTD => {
                let json = zstd::decode_all(body)?;
                Ok(serde_json::from_slice(&json)?)
            }
            other => Err(CodecError::UnknownFormat(other)),
        }
    }
}
