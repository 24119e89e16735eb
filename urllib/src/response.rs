//! The terminal result of a successful call.

use std::collections::BTreeMap;
use std::fmt;
use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use http::header::SET_COOKIE;
use http::{HeaderMap, StatusCode};
use hyper::body::HttpBody;
use hyper::Body;
use tokio::sync::OwnedSemaphorePermit;
use url::Url;

use crate::decoder::ContentDecoder;

/// Response headers keyed by lower-cased name. Repeated headers are joined
/// with `", "`, except `set-cookie` whose values are joined with `"\n"`.
pub type Headers = BTreeMap<String, String>;

#[derive(Debug)]
pub enum ResponseData {
    Bytes(Bytes),
    Text(String),
    Json(serde_json::Value),
    Stream(ResponseStream),
}

#[derive(Debug)]
pub struct Response {
    pub status: StatusCode,
    pub headers: Headers,
    pub raw_headers: HeaderMap,
    /// `None` for an empty body and when the body went to a write stream.
    pub data: Option<ResponseData>,
    /// Every url requested during the call, redirect hops included.
    pub request_urls: Vec<Url>,
    /// Wall time of the whole call.
    pub rt: Duration,
    /// Body bytes received on the wire for the terminal response. Stays `0`
    /// in stream mode.
    pub size: u64,
}

impl Response {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(String::as_str)
    }

    pub fn json(&self) -> Option<&serde_json::Value> {
        match &self.data {
            Some(ResponseData::Json(value)) => Some(value),
            _ => None,
        }
    }

    pub fn bytes(&self) -> Option<&Bytes> {
        match &self.data {
            Some(ResponseData::Bytes(bytes)) => Some(bytes),
            _ => None,
        }
    }

    pub fn text(&self) -> Option<&str> {
        match &self.data {
            Some(ResponseData::Text(text)) => Some(text),
            Some(ResponseData::Bytes(bytes)) => std::str::from_utf8(bytes).ok(),
            _ => None,
        }
    }

    pub fn into_stream(self) -> Option<ResponseStream> {
        match self.data {
            Some(ResponseData::Stream(stream)) => Some(stream),
            _ => None,
        }
    }

    /// Url that produced this response.
    pub fn url(&self) -> Option<&Url> {
        self.request_urls.last()
    }
}

pub(crate) fn join_headers(raw: &HeaderMap) -> Headers {
    let mut joined = Headers::new();
    for name in raw.keys() {
        let separator = if name == SET_COOKIE { "\n" } else { ", " };
        let value = raw
            .get_all(name)
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect::<Vec<_>>()
            .join(separator);
        joined.insert(name.as_str().to_string(), value);
    }
    joined
}

/// Live response body handed out in stream mode.
///
/// Yields the body as received, inflated when decompression was requested
/// and the encoding is supported. The host slot of the request is released
/// once the stream ends, fails, or is dropped.
pub struct ResponseStream {
    body: Body,
    decoder: Option<ContentDecoder>,
    permit: Option<OwnedSemaphorePermit>,
    received: u64,
    done: bool,
}

impl ResponseStream {
    pub(crate) fn new(
        body: Body,
        decoder: Option<ContentDecoder>,
        permit: Option<OwnedSemaphorePermit>,
    ) -> Self {
        Self {
            body,
            decoder,
            permit,
            received: 0,
            done: false,
        }
    }

    /// Bytes received on the wire so far.
    pub fn received(&self) -> u64 {
        self.received
    }

    /// Reads the rest of the stream into memory.
    pub async fn bytes(mut self) -> io::Result<Bytes> {
        let mut out = BytesMut::new();
        while let Some(chunk) = self.next().await {
            out.extend_from_slice(&chunk?);
        }
        Ok(out.freeze())
    }

    fn finish(&mut self) {
        self.done = true;
        self.permit.take();
    }
}

impl Stream for ResponseStream {
    type Item = io::Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            if this.done {
                return Poll::Ready(None);
            }
            match ready!(Pin::new(&mut this.body).poll_data(cx)) {
                Some(Ok(chunk)) => {
                    this.received += chunk.len() as u64;
                    let Some(decoder) = this.decoder.as_mut() else {
                        return Poll::Ready(Some(Ok(chunk)));
                    };
                    match decoder.push(&chunk) {
                        Ok(out) if out.is_empty() => continue,
                        Ok(out) => return Poll::Ready(Some(Ok(out))),
                        Err(e) => {
                            this.finish();
                            return Poll::Ready(Some(Err(e)));
                        }
                    }
                }
                Some(Err(e)) => {
                    this.finish();
                    return Poll::Ready(Some(Err(io::Error::new(
                        io::ErrorKind::ConnectionAborted,
                        e,
                    ))));
                }
                None => {
                    this.finish();
                    // An empty body has no compressed stream to close.
                    let tail = match this.decoder.take() {
                        Some(decoder) if this.received > 0 => decoder.finish(),
                        _ => return Poll::Ready(None),
                    };
                    return match tail {
                        Ok(tail) if tail.is_empty() => Poll::Ready(None),
                        Ok(tail) => Poll::Ready(Some(Ok(tail))),
                        Err(e) => Poll::Ready(Some(Err(e))),
                    };
                }
            }
        }
    }
}

impl fmt::Debug for ResponseStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResponseStream")
            .field("decoder", &self.decoder)
            .field("received", &self.received)
            .field("done", &self.done)
            .finish()
    }
}

#[cfg(test)]
mod test {
    use std::io::Write;

    use flate2::write::GzEncoder;
    use flate2::Compression;
    use http::HeaderValue;

    use super::*;

    #[test]
    fn repeated_headers_are_joined() {
        let mut raw = HeaderMap::new();
        raw.append("X-Foo", HeaderValue::from_static("a"));
        raw.append("X-Foo", HeaderValue::from_static("b"));
        raw.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        raw.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        raw.insert("Content-Type", HeaderValue::from_static("text/plain"));

        let joined = join_headers(&raw);
        assert_eq!(joined["x-foo"], "a, b");
        assert_eq!(joined["set-cookie"], "a=1\nb=2");
        assert_eq!(joined["content-type"], "text/plain");
    }

    #[tokio::test]
    async fn stream_inflates_and_counts_wire_bytes() -> anyhow::Result<()> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello world")?;
        let compressed = encoder.finish()?;
        let wire = compressed.len() as u64;

        let (mut sender, body) = Body::channel();
        let (first, second) = compressed.split_at(compressed.len() / 2);
        let (first, second) = (Bytes::copy_from_slice(first), Bytes::copy_from_slice(second));
        tokio::spawn(async move {
            for chunk in [first, second] {
                if sender.send_data(chunk).await.is_err() {
                    break;
                }
            }
        });

        let mut stream = ResponseStream::new(body, ContentDecoder::for_encoding("gzip"), None);
        let mut out = Vec::new();
        while let Some(chunk) = stream.next().await {
            out.extend_from_slice(&chunk?);
        }
        assert_eq!(out, b"hello world");
        assert_eq!(stream.received(), wire);
        Ok(())
    }

    #[tokio::test]
    async fn empty_encoded_body_ends_cleanly() -> anyhow::Result<()> {
        let mut stream =
            ResponseStream::new(Body::empty(), ContentDecoder::for_encoding("gzip"), None);
        assert!(stream.next().await.is_none());
        assert_eq!(stream.received(), 0);
        Ok(())
    }

    #[tokio::test]
    async fn aborted_body_surfaces_as_an_error() -> anyhow::Result<()> {
        let (mut sender, body) = Body::channel();
        assert!(sender
            .send_data(Bytes::from_static(b"partial"))
            .await
            .is_ok());
        sender.abort();

        let mut stream = ResponseStream::new(body, None, None);
        assert_eq!(stream.next().await.unwrap()?, "partial");
        let err = stream.next().await.unwrap().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionAborted);
        assert!(stream.next().await.is_none());
        Ok(())
    }
}
