//! Canonical JSON serialization for deterministic fingerprinting.
//!
//! Fingerprints are stable content hashes over task inputs and method
//! specs, so the serialized form has to be identical across processes and
//! restarts. Canonical JSON here means:
//!
//! - Object keys sorted lexicographically (UTF-8 byte order)
//! - No whitespace
//! - Floats quantized to a declared number of decimal digits before
//!   serialization, then written in their shortest round-trip form
//! - NaN and infinities rejected
//!
//! Numeric quantization implements the workflow-level tolerance: two inputs
//! that differ below the tolerance hash to the same fingerprint.

use serde::Serialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

/// Default number of decimal digits kept in canonical floats.
pub const DEFAULT_FLOAT_DECIMALS: u32 = 9;

/// Errors that can occur during canonical serialization.
#[derive(Debug, thiserror::Error)]
pub enum CanonicalError {
    /// Serde JSON conversion failed.
    #[error("serde_json error: {0}")]
    Serde(#[from] serde_json::Error),

    /// A non-finite number (NaN, Infinity) was encountered.
    ///
    /// Non-finite values have no canonical text form and would poison the
    /// cache key space, so they are rejected at ingress.
    #[error("non-finite number not allowed in canonical JSON")]
    NonFiniteNumber,
}

/// Serializes `value` into canonical JSON bytes.
///
/// # Errors
///
/// Returns `CanonicalError::Serde` if serialization fails, or
/// `CanonicalError::NonFiniteNumber` if the value contains NaN or infinity.
#[must_use = "canonical bytes should be used for hashing"]
pub fn to_canonical_bytes<T: Serialize>(
    value: &T,
    float_decimals: u32,
) -> Result<Vec<u8>, CanonicalError> {
    let value = serde_json::to_value(value)?;
    let mut out = Vec::new();
    write_value(&value, float_decimals, &mut out)?;
    Ok(out)
}

/// Serializes `value` into a canonical JSON string.
///
/// # Errors
///
/// Same failure modes as [`to_canonical_bytes`].
#[must_use = "canonical string should be used for hashing"]
pub fn to_canonical_string<T: Serialize>(
    value: &T,
    float_decimals: u32,
) -> Result<String, CanonicalError> {
    let bytes = to_canonical_bytes(value, float_decimals)?;
    // write_value only emits output produced by serde_json, which is UTF-8.
    Ok(String::from_utf8(bytes).unwrap_or_default())
}

/// Computes the SHA-256 fingerprint of `value`'s canonical form, hex encoded.
///
/// # Errors
///
/// Same failure modes as [`to_canonical_bytes`].
pub fn fingerprint_hex<T: Serialize>(
    value: &T,
    float_decimals: u32,
) -> Result<String, CanonicalError> {
    let bytes = to_canonical_bytes(value, float_decimals)?;
    let digest = Sha256::digest(&bytes);
    Ok(format!("{digest:x}"))
}

fn quantize(v: f64, float_decimals: u32) -> Result<f64, CanonicalError> {
    if !v.is_finite() {
        return Err(CanonicalError::NonFiniteNumber);
    }
    let scale = 10f64.powi(i32::try_from(float_decimals).unwrap_or(i32::MAX));
    let quantized = (v * scale).round() / scale;
    if quantized.is_finite() {
        Ok(quantized)
    } else {
        Err(CanonicalError::NonFiniteNumber)
    }
}

fn write_value(
    value: &Value,
    float_decimals: u32,
    out: &mut Vec<u8>,
) -> Result<(), CanonicalError> {
    match value {
        Value::Null => out.extend_from_slice(b"null"),
        Value::Bool(b) => out.extend_from_slice(if *b { b"true" } else { b"false" }),
        Value::Number(n) => {
            if let Some(f) = n.as_f64().filter(|_| !n.is_i64() && !n.is_u64()) {
                let quantized = quantize(f, float_decimals)?;
                let number =
                    serde_json::Number::from_f64(quantized).ok_or(CanonicalError::NonFiniteNumber)?;
                out.extend_from_slice(number.to_string().as_bytes());
            } else {
                out.extend_from_slice(n.to_string().as_bytes());
            }
        }
        Value::String(s) => out.extend_from_slice(serde_json::to_string(s)?.as_bytes()),
        Value::Array(items) => {
            out.push(b'[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                write_value(item, float_decimals, out)?;
            }
            out.push(b']');
        }
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort_unstable();
            out.push(b'{');
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(b',');
                }
                out.extend_from_slice(serde_json::to_string(key)?.as_bytes());
                out.push(b':');
                write_value(&map[key.as_str()], float_decimals, out)?;
            }
            out.push(b'}');
        }
    }
    Ok(())
}
