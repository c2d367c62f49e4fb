//! Tensor payloads
//!
//! Inputs and outputs travel through the pipeline as [`Payload`] values. The
//! variants share their buffers behind `Arc`, so handing a payload to the
//! cache, a batch or a callback never copies tensor data.
//!
//! Callers pick the output representation with a type parameter; the
//! conversions form the closed set of [`FromPayload`] implementations.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{ExecutorError, Result};

/// Kind tag of a payload, used for errors, fingerprints and size estimation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PayloadKind {
    Floats,
    Bytes,
    Text,
    Structured,
}

impl fmt::Display for PayloadKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PayloadKind::Floats => "floats",
            PayloadKind::Bytes => "bytes",
            PayloadKind::Text => "text",
            PayloadKind::Structured => "structured",
        };
        f.write_str(name)
    }
}

/// Opaque tensor payload
#[derive(Debug, Clone)]
pub enum Payload {
    /// Flat f32 buffer
    Floats(Arc<[f32]>),
    /// Raw byte buffer; numeric backends read it as little-endian f32
    Bytes(Arc<[u8]>),
    /// Free text
    Text(Arc<str>),
    /// Structured (JSON) value
    Structured(Arc<serde_json::Value>),
}

impl Payload {
    /// Zero-filled float payload with `len` elements
    pub fn zeros(len: usize) -> Self {
        Payload::Floats(vec![0.0; len].into())
    }

    pub fn kind(&self) -> PayloadKind {
        match self {
            Payload::Floats(_) => PayloadKind::Floats,
            Payload::Bytes(_) => PayloadKind::Bytes,
            Payload::Text(_) => PayloadKind::Text,
            Payload::Structured(_) => PayloadKind::Structured,
        }
    }

    /// Number of f32 elements for numeric payloads
    pub fn element_count(&self) -> Option<usize> {
        match self {
            Payload::Floats(values) => Some(values.len()),
            Payload::Bytes(bytes) if bytes.len() % 4 == 0 => Some(bytes.len() / 4),
            _ => None,
        }
    }

    pub fn is_numeric(&self) -> bool {
        matches!(self, Payload::Floats(_) | Payload::Bytes(_))
    }

    /// Borrow the float buffer if this is a `Floats` payload
    pub fn as_floats(&self) -> Option<&[f32]> {
        match self {
            Payload::Floats(values) => Some(values),
            _ => None,
        }
    }

    /// Decode a numeric payload into f32 values
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        match self {
            Payload::Floats(values) => Ok(values.to_vec()),
            Payload::Bytes(bytes) => decode_f32_le(bytes),
            other => Err(ExecutorError::OutputConversion {
                from: other.kind().to_string(),
                to: "f32 sequence".to_string(),
            }),
        }
    }

    /// Structural equality; floats compare by bit pattern so the relation is
    /// consistent with the fingerprint hash (NaN equals an identical NaN)
    pub fn content_eq(&self, other: &Payload) -> bool {
        match (self, other) {
            (Payload::Floats(a), Payload::Floats(b)) => {
                a.len() == b.len() && a.iter().zip(b.iter()).all(|(x, y)| x.to_bits() == y.to_bits())
            }
            (Payload::Bytes(a), Payload::Bytes(b)) => a == b,
            (Payload::Text(a), Payload::Text(b)) => a == b,
            (Payload::Structured(a), Payload::Structured(b)) => a == b,
            _ => false,
        }
    }
}

/// Decode little-endian f32 values from a byte buffer
pub fn decode_f32_le(bytes: &[u8]) -> Result<Vec<f32>> {
    if bytes.len() % 4 != 0 {
        return Err(ExecutorError::ShapeMismatch {
            expected: "a multiple of 4 bytes".to_string(),
            actual: format!("{} bytes", bytes.len()),
        });
    }
    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

/// Encode f32 values as little-endian bytes
pub fn encode_f32_le(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl From<Vec<f32>> for Payload {
    fn from(values: Vec<f32>) -> Self {
        Payload::Floats(values.into())
    }
}

impl From<&[f32]> for Payload {
    fn from(values: &[f32]) -> Self {
        Payload::Floats(values.into())
    }
}

impl<const N: usize> From<[f32; N]> for Payload {
    fn from(values: [f32; N]) -> Self {
        Payload::Floats(values.to_vec().into())
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Bytes(bytes.into())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Text(text.into())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Text(text.into())
    }
}

impl From<serde_json::Value> for Payload {
    fn from(value: serde_json::Value) -> Self {
        Payload::Structured(Arc::new(value))
    }
}

/// Conversion from a raw model output into the representation a caller asked for
pub trait FromPayload: Sized + Send + 'static {
    /// Name used in conversion errors
    fn type_name() -> &'static str;

    fn from_payload(payload: &Payload) -> Result<Self>;
}

fn conversion_error<T: FromPayload>(payload: &Payload) -> ExecutorError {
    ExecutorError::OutputConversion {
        from: payload.kind().to_string(),
        to: T::type_name().to_string(),
    }
}

impl FromPayload for Payload {
    fn type_name() -> &'static str {
        "payload"
    }

    fn from_payload(payload: &Payload) -> Result<Self> {
        Ok(payload.clone())
    }
}

impl FromPayload for Vec<f32> {
    fn type_name() -> &'static str {
        "Vec<f32>"
    }

    fn from_payload(payload: &Payload) -> Result<Self> {
        match payload {
            Payload::Floats(values) => Ok(values.to_vec()),
            Payload::Bytes(bytes) => decode_f32_le(bytes),
            other => Err(conversion_error::<Self>(other)),
        }
    }
}

impl FromPayload for Box<[f32]> {
    fn type_name() -> &'static str {
        "Box<[f32]>"
    }

    fn from_payload(payload: &Payload) -> Result<Self> {
        Vec::<f32>::from_payload(payload)
            .map(Vec::into_boxed_slice)
            .map_err(|_| conversion_error::<Self>(payload))
    }
}

impl FromPayload for Vec<u8> {
    fn type_name() -> &'static str {
        "Vec<u8>"
    }

    fn from_payload(payload: &Payload) -> Result<Self> {
        match payload {
            Payload::Bytes(bytes) => Ok(bytes.to_vec()),
            Payload::Floats(values) => Ok(encode_f32_le(values)),
            other => Err(conversion_error::<Self>(other)),
        }
    }
}

impl FromPayload for String {
    fn type_name() -> &'static str {
        "String"
    }

    fn from_payload(payload: &Payload) -> Result<Self> {
        match payload {
            Payload::Text(text) => Ok(text.to_string()),
            other => Err(conversion_error::<Self>(other)),
        }
    }
}

impl FromPayload for serde_json::Value {
    fn type_name() -> &'static str {
        "serde_json::Value"
    }

    fn from_payload(payload: &Payload) -> Result<Self> {
        match payload {
            Payload::Structured(value) => Ok(value.as_ref().clone()),
            Payload::Floats(values) => Ok(serde_json::Value::from(values.to_vec())),
            Payload::Text(text) => Ok(serde_json::Value::String(text.to_string())),
            other => Err(conversion_error::<Self>(other)),
        }
    }
}
