//! Chunk payload encoding
//!
//! A chunk is an ordered JSON array of item identifiers. With the
//! `compression` feature, payloads are written zstd-compressed; readers
//! detect the zstd frame magic so uncompressed payloads stay readable.

use bytes::Bytes;
use std::fmt;

/// zstd frame magic number (little-endian 0xFD2FB528)
#[cfg_attr(not(feature = "compression"), allow(dead_code))]
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

#[cfg(feature = "compression")]
const ZSTD_LEVEL: i32 = 3;

/// Chunk payload decode/encode errors
#[derive(Debug)]
pub enum CodecError {
    Json(serde_json::Error),
    Compression(std::io::Error),
}

impl fmt::Display for CodecError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CodecError::Json(e) => write!(f, "invalid chunk payload: {}", e),
            CodecError::Compression(e) => write!(f, "chunk compression error: {}", e),
        }
    }
}

impl std::error::Error for CodecError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            CodecError::Json(e) => Some(e),
            CodecError::Compression(e) => Some(e),
        }
    }
}

impl From<serde_json::Error> for CodecError {
    fn from(e: serde_json::Error) -> Self {
        CodecError::Json(e)
    }
}

/// Serialize an ordered item list into a chunk payload
pub fn encode_items(items: &[String]) -> Result<Bytes, CodecError> {
    let json = serde_json::to_vec(items)?;

    #[cfg(feature = "compression")]
    {
        let compressed =
            zstd::encode_all(json.as_slice(), ZSTD_LEVEL).map_err(CodecError::Compression)?;
        Ok(Bytes::from(compressed))
    }

    #[cfg(not(feature = "compression"))]
    {
        Ok(Bytes::from(json))
    }
}

/// Deserialize a chunk payload, preserving item order and duplicates
pub fn decode_items(data: &[u8]) -> Result<Vec<String>, CodecError> {
    if data.starts_with(&ZSTD_MAGIC) {
        return decode_compressed(data);
    }
    Ok(serde_json::from_slice(data)?)
}

#[cfg(feature = "compression")]
fn decode_compressed(data: &[u8]) -> Result<Vec<String>, CodecError> {
    let json = zstd::decode_all(data).map_err(CodecError::Compression)?;
    Ok(serde_json::from_slice(&json)?)
}

#[cfg(not(feature = "compression"))]
fn decode_compressed(_data: &[u8]) -> Result<Vec<String>, CodecError> {
    Err(CodecError::Compression(std::io::Error::new(
        std::io::ErrorKind::Unsupported,
        "compressed chunk payload but the compression feature is disabled",
    )))
}
