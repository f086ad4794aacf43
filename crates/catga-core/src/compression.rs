//! Opt-in payload compression, orthogonal to serialization.
//!
//! Compressed payloads carry a one-byte algorithm header so
//! [`decompress`] is self-describing. Payloads below the configured
//! threshold are wrapped uncompressed.

use std::io::{Read, Write};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{CatgaError, Result};

const HEADER_PLAIN: u8 = b'P';
const HEADER_GZIP: u8 = b'G';
const HEADER_BROTLI: u8 = b'B';
const HEADER_DEFLATE: u8 = b'D';

const BROTLI_BUFFER: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    #[default]
    Gzip,
    Brotli,
    Deflate,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    pub algorithm: CompressionAlgorithm,
    /// Payloads smaller than this stay uncompressed.
    pub min_size_bytes: usize,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self { algorithm: CompressionAlgorithm::Gzip, min_size_bytes: 1024 }
    }
}

/// Compress `data` with the given algorithm, prefixing the header byte.
pub fn compress(data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
    let mut out = Vec::with_capacity(data.len() / 2 + 1);
    match algorithm {
        CompressionAlgorithm::Gzip => {
            out.push(HEADER_GZIP);
            let mut enc = flate2::write::GzEncoder::new(out, flate2::Compression::default());
            enc.write_all(data).map_err(|e| CatgaError::Serialization(e.to_string()))?;
            out = enc.finish().map_err(|e| CatgaError::Serialization(e.to_string()))?;
        }
        CompressionAlgorithm::Deflate => {
            out.push(HEADER_DEFLATE);
            let mut enc = flate2::write::DeflateEncoder::new(out, flate2::Compression::default());
            enc.write_all(data).map_err(|e| CatgaError::Serialization(e.to_string()))?;
            out = enc.finish().map_err(|e| CatgaError::Serialization(e.to_string()))?;
        }
        CompressionAlgorithm::Brotli => {
            out.push(HEADER_BROTLI);
            let mut enc =
                brotli::CompressorWriter::new(out, BROTLI_BUFFER, BROTLI_QUALITY, BROTLI_LG_WINDOW);
            enc.write_all(data).map_err(|e| CatgaError::Serialization(e.to_string()))?;
            out = enc.into_inner();
        }
    }
    Ok(Bytes::from(out))
}

/// Compress only when `data` crosses the configured size threshold;
/// smaller payloads are wrapped with the plain header.
pub fn compress_with_threshold(data: &[u8], config: &CompressionConfig) -> Result<Bytes> {
    if data.len() < config.min_size_bytes {
        let mut out = Vec::with_capacity(data.len() + 1);
        out.push(HEADER_PLAIN);
        out.extend_from_slice(data);
        return Ok(Bytes::from(out));
    }
    compress(data, config.algorithm)
}

/// Decompress a payload produced by [`compress`] or
/// [`compress_with_threshold`], auto-detecting the algorithm.
pub fn decompress(data: &[u8]) -> Result<Bytes> {
    let (&header, body) = data
        .split_first()
        .ok_or_else(|| CatgaError::Serialization("empty compressed payload".into()))?;

    let out = match header {
        HEADER_PLAIN => body.to_vec(),
        HEADER_GZIP => {
            let mut out = Vec::new();
            flate2::read::GzDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| CatgaError::Serialization(e.to_string()))?;
            out
        }
        HEADER_DEFLATE => {
            let mut out = Vec::new();
            flate2::read::DeflateDecoder::new(body)
                .read_to_end(&mut out)
                .map_err(|e| CatgaError::Serialization(e.to_string()))?;
            out
        }
        HEADER_BROTLI => {
            let mut out = Vec::new();
            brotli::Decompressor::new(body, BROTLI_BUFFER)
                .read_to_end(&mut out)
                .map_err(|e| CatgaError::Serialization(e.to_string()))?;
            out
        }
        other => {
            return Err(CatgaError::Serialization(format!(
                "unknown compression header byte 0x{other:02x}"
            )))
        }
    };
    Ok(Bytes::from(out))
}

/// Ratio of bytes saved, e.g. 0.75 when 1000 bytes shrink to 250.
pub fn estimate_compression_ratio(before: usize, after: usize) -> f64 {
    if before == 0 {
        return 0.0;
    }
    1.0 - (after as f64 / before as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        // Repetitive enough that every algorithm shrinks it.
        "the quick brown fox jumps over the lazy dog ".repeat(64).into_bytes()
    }

    #[test]
    fn round_trip_all_algorithms() {
        let data = sample();
        for algo in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Brotli,
            CompressionAlgorithm::Deflate,
        ] {
            let compressed = compress(&data, algo).unwrap();
            assert!(compressed.len() < data.len(), "{algo:?} should shrink sample");
            let restored = decompress(&compressed).unwrap();
            assert_eq!(&restored[..], &data[..], "{algo:?} must round-trip");
        }
    }

    #[test]
    fn below_threshold_stays_plain() {
        let config = CompressionConfig { min_size_bytes: 1024, ..Default::default() };
        let small = b"tiny";
        let wrapped = compress_with_threshold(small, &config).unwrap();
        assert_eq!(wrapped[0], HEADER_PLAIN);
        assert_eq!(&decompress(&wrapped).unwrap()[..], small);
    }

    #[test]
    fn unknown_header_rejected() {
        assert!(decompress(&[0xff, 1, 2, 3]).is_err());
        assert!(decompress(&[]).is_err());
    }

    #[test]
    fn ratio_estimate() {
        assert!((estimate_compression_ratio(1000, 250) - 0.75).abs() < f64::EPSILON);
        assert_eq!(estimate_compression_ratio(0, 10), 0.0);
    }
}
