//! Pluggable payload serialization.
//!
//! The core only requires round-trip fidelity; the binary format is an
//! external choice. JSON is the default the rest of the workspace uses.

use bytes::Bytes;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::{CatgaError, Result};

pub trait Serializer: Send + Sync {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes>;

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T>;
}

/// serde_json-backed serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

impl Serializer for JsonSerializer {
    fn serialize<T: Serialize>(&self, value: &T) -> Result<Bytes> {
        let vec = serde_json::to_vec(value).map_err(|e| CatgaError::Serialization(e.to_string()))?;
        Ok(Bytes::from(vec))
    }

    fn deserialize<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        serde_json::from_slice(bytes).map_err(|e| CatgaError::Serialization(e.to_string()))
    }
}
