//! Binary codec for wire payloads
//!
//! All payloads go through one bincode configuration: varint integers, a hard
//! size limit, and no trailing bytes.

use bincode::Options;
use serde::{de::DeserializeOwned, Serialize};
use thiserror::Error;

/// Largest payload accepted in either direction.
pub const MAX_PAYLOAD_BYTES: u64 = 64 * 1024;

#[derive(Debug, Error)]
pub enum WireError {
    #[error("codec failure: {0}")]
    Codec(#[from] bincode::Error),
    #[error("payload is empty")]
    Empty,
}

fn options() -> impl Options {
    bincode::options()
        .with_limit(MAX_PAYLOAD_BYTES)
        .reject_trailing_bytes()
}

pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, WireError> {
    Ok(options().serialize(value)?)
}

pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, WireError> {
    Ok(options().deserialize(bytes)?)
}

/// Encode `value` behind a one-byte code.
pub fn encode_tagged<T: Serialize>(code: u8, value: &T) -> Result<Vec<u8>, WireError> {
    let body = encode(value)?;
    let mut bytes = Vec::with_capacity(body.len() + 1);
    bytes.push(code);
    bytes.extend_from_slice(&body);
    Ok(bytes)
}

/// Split a tagged payload into its code and body.
pub fn split_tagged(bytes: &[u8]) -> Result<(u8, &[u8]), WireError> {
    match bytes.split_first() {
        Some((&code, body)) => Ok((code, body)),
        None => Err(WireError::Empty),
    }
}
