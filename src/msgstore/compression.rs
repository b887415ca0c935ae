//! Payload Compression for Durable Stores
//!
//! LZ4 compression with automatic fallback to the raw payload whenever
//! compressing does not pay off.
//!
//! # Example
//!
//! ```
//! use tiered_msgstore::msgstore::compression::{CompressionAlgorithm, PayloadCodec};
//!
//! let codec = PayloadCodec::new(CompressionAlgorithm::Lz4, 16);
//!
//! let data = b"Hello, this is test data that should compress well! Hello, this is test data.";
//! let (encoded, algorithm) = codec.encode(data);
//!
//! let decoded = codec.decode(&encoded, algorithm).unwrap();
//! assert_eq!(decoded.as_ref(), data);
//! ```

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Compression Algorithm
// =============================================================================

/// Supported compression algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// No compression
    None,
    /// LZ4 - fast compression
    #[default]
    Lz4,
}

impl CompressionAlgorithm {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionAlgorithm::None => "none",
            CompressionAlgorithm::Lz4 => "lz4",
        }
    }
}

impl std::fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the algorithm identifier
    fn algorithm(&self) -> CompressionAlgorithm;

    /// Compress data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress data
    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>>;
}

/// Pass-through compressor
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::None
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compressor; the block carries its uncompressed size
pub struct Lz4Compressor;

impl Compressor for Lz4Compressor {
    fn algorithm(&self) -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::compress(data, Some(lz4::block::CompressionMode::DEFAULT), true).map_err(
            |e| Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            },
        )
    }

    fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        lz4::block::decompress(data, None).map_err(|e| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason: e.to_string(),
        })
    }
}

// =============================================================================
// Payload Codec
// =============================================================================

/// Encodes payloads for storage with fallback to the raw bytes
pub struct PayloadCodec {
    algorithm: CompressionAlgorithm,
    min_size_bytes: u64,
    noop: NoopCompressor,
    lz4: Lz4Compressor,
}

impl PayloadCodec {
    /// Codec using `algorithm` for payloads of at least `min_size_bytes`
    pub fn new(algorithm: CompressionAlgorithm, min_size_bytes: u64) -> Self {
        Self {
            algorithm,
            min_size_bytes,
            noop: NoopCompressor,
            lz4: Lz4Compressor,
        }
    }

    fn compressor(&self, algorithm: CompressionAlgorithm) -> &dyn Compressor {
        match algorithm {
            CompressionAlgorithm::None => &self.noop,
            CompressionAlgorithm::Lz4 => &self.lz4,
        }
    }

    /// Encode a payload.
    ///
    /// Returns (encoded_data, algorithm_used). Small payloads, failures and
    /// results that are not smaller than the input are stored raw.
    pub fn encode(&self, data: &[u8]) -> (Bytes, CompressionAlgorithm) {
        if self.algorithm == CompressionAlgorithm::None
            || (data.len() as u64) < self.min_size_bytes
        {
            return (Bytes::copy_from_slice(data), CompressionAlgorithm::None);
        }

        match self.compressor(self.algorithm).compress(data) {
            Ok(compressed) if compressed.len() < data.len() => {
                (Bytes::from(compressed), self.algorithm)
            }
            Ok(_) => (Bytes::copy_from_slice(data), CompressionAlgorithm::None),
            Err(e) => {
                tracing::warn!("Compression failed, storing payload uncompressed: {}", e);
                (Bytes::copy_from_slice(data), CompressionAlgorithm::None)
            }
        }
    }

    /// Decode a payload stored with `algorithm`
    pub fn decode(&self, data: &[u8], algorithm: CompressionAlgorithm) -> Result<Bytes> {
        let decompressed = self.compressor(algorithm).decompress(data)?;
        Ok(Bytes::from(decompressed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_DATA: &[u8] = b"Hello, this is test data that should compress well. \
        It has some repetition: Hello, this is test data that should compress well.";

    #[test]
    fn test_lz4_roundtrip() {
        let compressor = Lz4Compressor;

        let compressed = compressor.compress(TEST_DATA).unwrap();
        assert!(compressed.len() < TEST_DATA.len());

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(decompressed, TEST_DATA);
    }

    #[test]
    fn test_small_payload_stays_raw() {
        let codec = PayloadCodec::new(CompressionAlgorithm::Lz4, 1024);
        let (encoded, algorithm) = codec.encode(b"tiny");
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(encoded.as_ref(), b"tiny");
    }

    #[test]
    fn test_disabled_codec_never_compresses() {
        let codec = PayloadCodec::new(CompressionAlgorithm::None, 0);
        let (encoded, algorithm) = codec.encode(TEST_DATA);
        assert_eq!(algorithm, CompressionAlgorithm::None);
        assert_eq!(encoded.as_ref(), TEST_DATA);
    }

    #[test]
    fn test_incompressible_data_falls_back() {
        let codec = PayloadCodec::new(CompressionAlgorithm::Lz4, 0);
        let random_data: Vec<u8> = (0..64u32).map(|i| (i.wrapping_mul(2654435761) >> 13) as u8).collect();

        let (result, algorithm) = codec.encode(&random_data);
        if algorithm == CompressionAlgorithm::None {
            assert_eq!(result.len(), random_data.len());
        } else {
            assert!(result.len() < random_data.len());
        }
        assert_eq!(codec.decode(&result, algorithm).unwrap().as_ref(), &random_data[..]);
    }

    #[test]
    fn test_corrupt_block_is_reported() {
        let codec = PayloadCodec::new(CompressionAlgorithm::Lz4, 0);
        let err = codec
            .decode(&[0xff, 0xff, 0xff, 0xff, 1, 2, 3], CompressionAlgorithm::Lz4)
            .unwrap_err();
        assert!(matches!(err, Error::DecompressionFailed { .. }));
    }

    #[test]
    fn test_algorithm_names() {
        assert_eq!(CompressionAlgorithm::None.name(), "none");
        assert_eq!(CompressionAlgorithm::Lz4.to_string(), "lz4");
    }
}
