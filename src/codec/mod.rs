//! Content-encoding codecs.
//!
//! # Data Flow
//! ```text
//! Inbound:
//!     raw transport body
//!     → chunked.rs (strip transfer framing)
//!     → decompress() (Content-Encoding of the request)
//!     → decoded body cache
//!
//! Outbound:
//!     handler body
//!     → compress() (Content-Encoding of the response)
//!     → owned output buffer
//! ```
//!
//! # Design Decisions
//! - Whole-buffer transforms: bodies are already fully buffered on both sides
//! - Failure is reported, never panics; callers decide the fallback
//! - Header matching is by substring, so `x-gzip` selects gzip

pub mod chunked;

use std::fmt;
use std::io::{Read, Write};

use flate2::read::{GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BROTLI_BUFFER_SIZE: usize = 4096;
const BROTLI_QUALITY: u32 = 5;
const BROTLI_LG_WINDOW: u32 = 22;

/// A supported content-encoding algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compress {
    Gzip,
    Deflate,
    #[serde(rename = "br")]
    Brotli,
}

impl Compress {
    /// Pick the algorithm named by a `Content-Encoding` header value.
    ///
    /// Returns `None` for identity or anything unsupported.
    pub fn from_header(value: &str) -> Option<Self> {
        let value = value.to_ascii_lowercase();
        if value.contains("gzip") {
            Some(Compress::Gzip)
        } else if value.contains("deflate") {
            Some(Compress::Deflate)
        } else if value.contains("br") {
            Some(Compress::Brotli)
        } else {
            None
        }
    }

    /// The token written into a `Content-Encoding` header.
    pub fn as_str(&self) -> &'static str {
        match self {
            Compress::Gzip => "gzip",
            Compress::Deflate => "deflate",
            Compress::Brotli => "br",
        }
    }
}

impl fmt::Display for Compress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by a codec transform.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("{algorithm} compression failed: {source}")]
    Compress {
        algorithm: Compress,
        source: std::io::Error,
    },

    #[error("{algorithm} decompression failed: {source}")]
    Decompress {
        algorithm: Compress,
        source: std::io::Error,
    },
}

/// Compress `data` under `algorithm` into a new buffer.
pub fn compress(data: &[u8], algorithm: Compress) -> Result<Vec<u8>, CodecError> {
    let wrap = |source| CodecError::Compress { algorithm, source };
    match algorithm {
        Compress::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
            encoder.write_all(data).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        Compress::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), Compression::default());
            encoder.write_all(data).map_err(wrap)?;
            encoder.finish().map_err(wrap)
        }
        Compress::Brotli => {
            let mut writer = brotli::CompressorWriter::new(
                Vec::with_capacity(data.len() / 2),
                BROTLI_BUFFER_SIZE,
                BROTLI_QUALITY,
                BROTLI_LG_WINDOW,
            );
            writer.write_all(data).map_err(wrap)?;
            writer.flush().map_err(wrap)?;
            Ok(writer.into_inner())
        }
    }
}

/// Decompress `data` that was encoded under `algorithm`.
pub fn decompress(data: &[u8], algorithm: Compress) -> Result<Vec<u8>, CodecError> {
    let wrap = |source| CodecError::Decompress { algorithm, source };
    let mut out = Vec::with_capacity(data.len() * 2);
    match algorithm {
        Compress::Gzip => {
            GzDecoder::new(data).read_to_end(&mut out).map_err(wrap)?;
        }
        Compress::Deflate => {
            ZlibDecoder::new(data).read_to_end(&mut out).map_err(wrap)?;
        }
        Compress::Brotli => {
            brotli::Decompressor::new(data, BROTLI_BUFFER_SIZE)
                .read_to_end(&mut out)
                .map_err(wrap)?;
        }
    }
    Ok(out)
}
