//! Versioned, opaque byte payloads
//!
//! Step parameters, adviser parameters, facilitator parameters, outputs and
//! task data are all carried as a [`Payload`]: a kind tag, a codec version,
//! and the encoded bytes. The engine never looks inside; each step or
//! adviser decodes its own payload through [`PayloadType`].
//!
//! Large payloads are zstd-compressed (the same fast level-3 setting the
//! undo snapshots use) once they cross a caller-chosen threshold.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ContractError, Result};

/// zstd level used for compressed payloads
const COMPRESSION_LEVEL: i32 = 3;

/// Kind tag of the empty payload
pub const EMPTY_KIND: &str = "empty";

/// A type with an explicit payload codec.
///
/// `KIND` must be unique per type; `VERSION` is bumped when the encoded
/// shape changes incompatibly. Payloads written by a newer version are
/// rejected on decode.
pub trait PayloadType: Serialize + DeserializeOwned {
    const KIND: &'static str;
    const VERSION: u16 = 1;
}

/// How the payload bytes are encoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadEncoding {
    /// No bytes
    #[default]
    Empty,
    /// UTF-8 JSON
    Json,
    /// zstd-compressed JSON
    JsonZstd,
}

/// Opaque versioned payload
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Payload {
    pub kind: String,
    pub version: u16,
    #[serde(default)]
    pub encoding: PayloadEncoding,
    #[serde(default)]
    pub bytes: Vec<u8>,
}

impl Payload {
    /// The empty payload (no parameters)
    pub fn empty() -> Self {
        Self {
            kind: EMPTY_KIND.to_string(),
            version: 0,
            encoding: PayloadEncoding::Empty,
            bytes: Vec::new(),
        }
    }

    /// Encode a value as uncompressed JSON
    pub fn encode<T: PayloadType>(value: &T) -> Result<Self> {
        Ok(Self {
            kind: T::KIND.to_string(),
            version: T::VERSION,
            encoding: PayloadEncoding::Json,
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Encode a value, compressing it when the JSON exceeds `threshold` bytes
    pub fn encode_compressed_above<T: PayloadType>(value: &T, threshold: usize) -> Result<Self> {
        let mut payload = Self::encode(value)?;
        if payload.bytes.len() > threshold {
            payload.bytes = zstd::encode_all(&payload.bytes[..], COMPRESSION_LEVEL)
                .map_err(|e| ContractError::Compression(e.to_string()))?;
            payload.encoding = PayloadEncoding::JsonZstd;
        }
        Ok(payload)
    }

    /// Wrap an untyped JSON value under an explicit kind tag
    pub fn from_json(kind: impl Into<String>, value: &serde_json::Value) -> Result<Self> {
        Ok(Self {
            kind: kind.into(),
            version: 1,
            encoding: PayloadEncoding::Json,
            bytes: serde_json::to_vec(value)?,
        })
    }

    /// Whether this payload carries no bytes
    pub fn is_empty(&self) -> bool {
        self.encoding == PayloadEncoding::Empty || self.bytes.is_empty()
    }

    /// Decode into a typed value, checking kind and version
    pub fn decode<T: PayloadType>(&self) -> Result<T> {
        if self.kind != T::KIND {
            return Err(ContractError::KindMismatch {
                expected: T::KIND.to_string(),
                found: self.kind.clone(),
            });
        }
        if self.version > T::VERSION {
            return Err(ContractError::UnsupportedVersion {
                kind: self.kind.clone(),
                found: self.version,
                supported: T::VERSION,
            });
        }
        let json = self.json_bytes()?;
        Ok(serde_json::from_slice(&json)?)
    }

    /// Decode, falling back to `T::default()` for the empty payload
    pub fn decode_or_default<T: PayloadType + Default>(&self) -> Result<T> {
        if self.is_empty() {
            return Ok(T::default());
        }
        self.decode()
    }

    /// Decode as an untyped JSON value regardless of kind
    pub fn to_json(&self) -> Result<serde_json::Value> {
        if self.is_empty() {
            return Ok(serde_json::Value::Null);
        }
        let json = self.json_bytes()?;
        Ok(serde_json::from_slice(&json)?)
    }

    fn json_bytes(&self) -> Result<Vec<u8>> {
        match self.encoding {
            PayloadEncoding::Empty => Ok(b"null".to_vec()),
            PayloadEncoding::Json => Ok(self.bytes.clone()),
            PayloadEncoding::JsonZstd => zstd::decode_all(&self.bytes[..])
                .map_err(|e| ContractError::Compression(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Default, Serialize, Deserialize)]
    struct Sample {
        name: String,
        count: u32,
    }

    impl PayloadType for Sample {
        const KIND: &'static str = "sample";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct Other {}

    impl PayloadType for Other {
        const KIND: &'static str = "other";
    }

    #[derive(Debug, Serialize, Deserialize)]
    struct SampleV2 {
        name: String,
    }

    impl PayloadType for SampleV2 {
        const KIND: &'static str = "sample";
        const VERSION: u16 = 2;
    }

    #[test]
    fn test_kind_mismatch_rejected() {
        let payload = Payload::encode(&Other {}).unwrap();
        let err = payload.decode::<Sample>().unwrap_err();
        assert!(matches!(err, ContractError::KindMismatch { .. }));
    }

    #[test]
    fn test_newer_version_rejected() {
        let payload = Payload::encode(&SampleV2 { name: "x".into() }).unwrap();
        let err = payload.decode::<Sample>().unwrap_err();
        assert!(matches!(err, ContractError::UnsupportedVersion { found: 2, .. }));
    }

    #[test]
    fn test_compression_kicks_in_above_threshold() {
        let value = Sample {
            name: "a".repeat(2048),
            count: 7,
        };
        let small = Payload::encode_compressed_above(&value, usize::MAX).unwrap();
        assert_eq!(small.encoding, PayloadEncoding::Json);

        let compressed = Payload::encode_compressed_above(&value, 64).unwrap();
        assert_eq!(compressed.encoding, PayloadEncoding::JsonZstd);
        assert!(compressed.bytes.len() < small.bytes.len());
        assert_eq!(compressed.decode::<Sample>().unwrap(), value);
    }

    #[test]
    fn test_empty_payload_defaults() {
        let payload = Payload::empty();
        assert!(payload.is_empty());
        assert_eq!(payload.decode_or_default::<Sample>().unwrap(), Sample::default());
        assert_eq!(payload.to_json().unwrap(), serde_json::Value::Null);
    }
}
