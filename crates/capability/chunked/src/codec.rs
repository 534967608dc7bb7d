use crate::ChunkedCallError;
use base64::{Engine as _, engine::general_purpose};
use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde_json::Value;
use std::io::{Read, Write};

/// `json -> gzip`，返回压缩字节。
pub fn compress_json(body: &Value) -> Result<Vec<u8>, ChunkedCallError> {
    let json = serde_json::to_vec(body).map_err(|err| ChunkedCallError::Encode(err.to_string()))?;
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(&json)
        .map_err(|err| ChunkedCallError::Encode(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| ChunkedCallError::Encode(err.to_string()))
}

/// `base64 -> gunzip -> json`。
pub fn decompress_json(encoded: &str) -> Result<Value, ChunkedCallError> {
    let compressed = general_purpose::STANDARD
        .decode(encoded.trim())
        .map_err(|err| ChunkedCallError::Decode(err.to_string()))?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut json = Vec::new();
    decoder
        .read_to_end(&mut json)
        .map_err(|err| ChunkedCallError::Decode(err.to_string()))?;
    serde_json::from_slice(&json).map_err(|err| ChunkedCallError::Decode(err.to_string()))
}

pub(crate) fn encode_base64(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}
