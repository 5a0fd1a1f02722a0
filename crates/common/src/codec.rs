//! Gzip-framed output blobs.
//!
//! Both instruction output blobs are a gzip stream whose inflated content is
//! a JSON document. For one-time output the document maps instruction name to
//! the base64 encoding of the combined output bytes; for periodic output it
//! maps instruction name to [`PeriodicInstructionOutput`]. An empty blob
//! decodes to an empty map, so first runs need no special casing.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("gzip framing error: {0}")]
    Gzip(#[from] std::io::Error),
    #[error("output document error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("output value was not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Serde adapter encoding `Vec<u8>` as a base64 string, matching the wire
/// format of byte-valued JSON fields.
pub mod base64_bytes {
    use super::{Engine, BASE64};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&BASE64.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        BASE64.decode(encoded).map_err(serde::de::Error::custom)
    }
}

/// Last-run record for one periodic instruction.
///
/// `failures` counts consecutive failing runs and resets to zero on success.
/// The run-time fields are UnixDate-formatted strings, empty when that kind
/// of run has never happened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PeriodicInstructionOutput {
    pub name: String,
    #[serde(with = "base64_bytes")]
    pub stdout: Vec<u8>,
    #[serde(with = "base64_bytes")]
    pub stderr: Vec<u8>,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_successful_run_time: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub last_failed_run_time: String,
    pub failures: u32,
}

fn gzip(payload: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(payload)?;
    Ok(encoder.finish()?)
}

fn gunzip(blob: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut inflated = Vec::new();
    GzDecoder::new(blob).read_to_end(&mut inflated)?;
    Ok(inflated)
}

/// Encode a one-time output map (name → combined output bytes).
pub fn encode_one_time(outputs: &BTreeMap<String, Vec<u8>>) -> Result<Vec<u8>, CodecError> {
    let document: BTreeMap<&str, String> = outputs
        .iter()
        .map(|(name, bytes)| (name.as_str(), BASE64.encode(bytes)))
        .collect();
    gzip(&serde_json::to_vec(&document)?)
}

/// Decode a one-time output blob. An empty blob is an empty map.
pub fn decode_one_time(blob: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, CodecError> {
    if blob.is_empty() {
        return Ok(BTreeMap::new());
    }
    let document: BTreeMap<String, String> = serde_json::from_slice(&gunzip(blob)?)?;
    document
        .into_iter()
        .map(|(name, encoded)| Ok((name, BASE64.decode(encoded)?)))
        .collect()
}

/// Encode a periodic output map (name → last-run record).
pub fn encode_periodic(
    outputs: &BTreeMap<String, PeriodicInstructionOutput>,
) -> Result<Vec<u8>, CodecError> {
    gzip(&serde_json::to_vec(outputs)?)
}

/// Decode a periodic output blob. An empty blob is an empty map.
pub fn decode_periodic(
    blob: &[u8],
) -> Result<BTreeMap<String, PeriodicInstructionOutput>, CodecError> {
    if blob.is_empty() {
        return Ok(BTreeMap::new());
    }
    Ok(serde_json::from_slice(&gunzip(blob)?)?)
}
