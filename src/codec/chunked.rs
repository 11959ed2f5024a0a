//! Chunked transfer-coding decoder.
//!
//! Reassembles a `Transfer-Encoding: chunked` body into one contiguous
//! buffer. Chunk extensions and trailer fields are discarded.

use thiserror::Error;

/// Chunked framing errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ChunkedError {
    #[error("chunk size line is not terminated")]
    UnterminatedSizeLine,

    #[error("invalid chunk size: {0}")]
    InvalidSize(String),

    #[error("chunk data truncated: expected {expected} bytes, {available} available")]
    Truncated { expected: usize, available: usize },

    #[error("chunk data is not followed by CRLF")]
    MissingDataTerminator,
}

/// Decode a chunked body.
///
/// A body that ends before the terminating zero-size chunk is accepted as
/// long as every chunk it contains is complete.
pub fn decode(input: &[u8]) -> Result<Vec<u8>, ChunkedError> {
    let mut out = Vec::with_capacity(input.len());
    let mut pos = 0;

    while pos < input.len() {
        let line_end = find_crlf(&input[pos..])
            .ok_or(ChunkedError::UnterminatedSizeLine)?
            + pos;
        let line = String::from_utf8_lossy(&input[pos..line_end]);
        let size_str = line.split(';').next().unwrap_or(&line).trim();
        let size = usize::from_str_radix(size_str, 16)
            .map_err(|_| ChunkedError::InvalidSize(size_str.to_string()))?;
        pos = line_end + 2;

        if size == 0 {
            // Trailer section follows; nothing in it belongs to the body.
            break;
        }

        let available = input.len() - pos;
        if available < size {
            return Err(ChunkedError::Truncated { expected: size, available });
        }
        out.extend_from_slice(&input[pos..pos + size]);
        pos += size;

        if input.get(pos..pos + 2) != Some(b"\r\n") {
            return Err(ChunkedError::MissingDataTerminator);
        }
        pos += 2;
    }

    Ok(out)
}

/// Frame `data` as a chunked body split into chunks of at most `chunk_size`.
pub fn encode(data: &[u8], chunk_size: usize) -> Vec<u8> {
    let chunk_size = chunk_size.max(1);
    let mut out = Vec::with_capacity(data.len() + 16);
    for chunk in data.chunks(chunk_size) {
        out.extend_from_slice(format!("{:x}\r\n", chunk.len()).as_bytes());
        out.extend_from_slice(chunk);
        out.extend_from_slice(b"\r\n");
    }
    out.extend_from_slice(b"0\r\n\r\n");
    out
}

fn find_crlf(haystack: &[u8]) -> Option<usize> {
    haystack.windows(2).position(|w| w == b"\r\n")
}
