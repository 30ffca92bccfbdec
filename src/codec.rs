//! The JSON codec seam.
//!
//! The pipeline never calls `serde_json` for wire bytes directly. It goes
//! through a [`Codec`] so applications can swap in a different encoder
//! (pretty printing, a SIMD parser, a size-capped decoder) without touching
//! handlers. Values cross the seam as [`serde_json::Value`], which keeps the
//! trait object-safe; typed conversion happens on either side of it.

use serde::de::DeserializeOwned;
use serde_json::Value;

/// Failure to encode or decode a body.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("{0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Message(String),
}

/// Encodes response values and decodes request bodies.
pub trait Codec: Send + Sync + 'static {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError>;
    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError>;
}

/// The default codec, backed by `serde_json`.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    fn encode(&self, value: &Value) -> Result<Vec<u8>, CodecError> {
        Ok(serde_json::to_vec(value)?)
    }

    fn decode(&self, bytes: &[u8]) -> Result<Value, CodecError> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Decodes `bytes` through `codec` into a concrete `T`.
pub fn decode_as<T: DeserializeOwned>(codec: &dyn Codec, bytes: &[u8]) -> Result<T, CodecError> {
    let value = codec.decode(bytes)?;
    Ok(serde_json::from_value(value)?)
}
