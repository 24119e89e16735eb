//! Incremental `content-encoding` decoding.
//!
//! Chunks are pushed as they arrive from the wire and the inflated bytes
//! available so far are handed back, so the same decoder serves the
//! buffered, `writeStream` and live-stream output paths.

use std::fmt;
use std::io::{self, Write};
use std::mem;

use bytes::Bytes;
use flate2::write::{GzDecoder, ZlibDecoder};
use http::header::CONTENT_ENCODING;
use http::HeaderMap;

pub(crate) enum ContentDecoder {
    Gzip(GzDecoder<Vec<u8>>),
    Deflate(ZlibDecoder<Vec<u8>>),
}

impl ContentDecoder {
    /// Decoder for a `content-encoding` token. Unknown codecs yield `None`
    /// and the body passes through untouched.
    pub(crate) fn for_encoding(encoding: &str) -> Option<Self> {
        match encoding.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(ContentDecoder::Gzip(GzDecoder::new(Vec::new()))),
            "deflate" => Some(ContentDecoder::Deflate(ZlibDecoder::new(Vec::new()))),
            _ => None,
        }
    }

    pub(crate) fn from_headers(headers: &HeaderMap) -> Option<Self> {
        headers
            .get(CONTENT_ENCODING)
            .and_then(|v| v.to_str().ok())
            .and_then(Self::for_encoding)
    }

    pub(crate) fn encoding(&self) -> &'static str {
        match self {
            ContentDecoder::Gzip(_) => "gzip",
            ContentDecoder::Deflate(_) => "deflate",
        }
    }

    /// Feed one compressed chunk, returning whatever inflated output is ready.
    pub(crate) fn push(&mut self, chunk: &[u8]) -> io::Result<Bytes> {
        match self {
            ContentDecoder::Gzip(decoder) => {
                decoder.write_all(chunk)?;
                Ok(Bytes::from(mem::take(decoder.get_mut())))
            }
            ContentDecoder::Deflate(decoder) => {
                decoder.write_all(chunk)?;
                Ok(Bytes::from(mem::take(decoder.get_mut())))
            }
        }
    }

    /// Flush the trailing output. Fails on a truncated stream.
    pub(crate) fn finish(self) -> io::Result<Bytes> {
        match self {
            ContentDecoder::Gzip(decoder) => decoder.finish().map(Bytes::from),
            ContentDecoder::Deflate(decoder) => decoder.finish().map(Bytes::from),
        }
    }

    /// Inflate a fully buffered body.
    pub(crate) fn decode_all(mut self, raw: &[u8]) -> io::Result<Bytes> {
        let head = self.push(raw)?;
        let tail = self.finish()?;
        if head.is_empty() {
            return Ok(tail);
        }
        let mut out = Vec::with_capacity(head.len() + tail.len());
        out.extend_from_slice(&head);
        out.extend_from_slice(&tail);
        Ok(Bytes::from(out))
    }
}

impl fmt::Debug for ContentDecoder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("ContentDecoder").field(&self.encoding()).finish()
    }
}
