//! Failure taxonomy for a single logical request.
//!
//! Every variant maps onto one of the failure kinds callers branch on:
//! transport, remote close, the two timeout phases, redirect protocol,
//! and response format. [`RequestError::name`] gives the stable kind name,
//! [`RequestError::status`] the status the failure is reported with.

use std::time::Duration;

use bytes::Bytes;
use http::{HeaderMap, StatusCode};
use lazy_static::lazy_static;
use thiserror::Error;

/// Status reported when no response head was received.
pub const NO_STATUS: i32 = -1;

/// Status reported for both timeout phases.
pub const TIMEOUT_STATUS: i32 = 408;

lazy_static! {
    static ref EMPTY_HEADERS: HeaderMap = HeaderMap::new();
}

#[derive(Error, Debug)]
pub enum RequestError {
    /// Connection refused or reset, name resolution failure, or the socket
    /// closed before a single response byte arrived.
    #[error("{cause}")]
    Transport { cause: String },

    /// The response head arrived but the connection went away before the
    /// body completed.
    #[error("Remote socket was terminated before the response was completed")]
    RemoteClosed {
        status: StatusCode,
        headers: HeaderMap,
        partial: Bytes,
        cause: String,
    },

    #[error("timeout of {}ms exceeded", .timeout.as_millis())]
    ConnectionTimeout { timeout: Duration },

    #[error("timeout of {}ms exceeded", .timeout.as_millis())]
    ResponseTimeout {
        timeout: Duration,
        status: StatusCode,
        headers: HeaderMap,
        partial: Bytes,
    },

    #[error("Got statusCode {} but cannot resolve next location from headers", .status.as_u16())]
    FollowRedirect { status: StatusCode, headers: HeaderMap },

    #[error("Got statusCode {} but the streamed request body cannot be sent again", .status.as_u16())]
    UnreplayableBody { status: StatusCode, headers: HeaderMap },

    #[error(
        "Exceeded {max} maxRedirects. Probably stuck in a redirect loop (last {} to {location})",
        .status.as_u16()
    )]
    MaxRedirects {
        max: u32,
        status: StatusCode,
        headers: HeaderMap,
        location: String,
    },

    /// The body did not parse as JSON. `body` holds the bytes that were parsed.
    #[error("{cause}")]
    ResponseFormat {
        cause: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    /// The body claimed a supported `content-encoding` but failed to inflate.
    /// `body` holds the raw bytes as received.
    #[error("failed to decode {encoding} response body: {cause}")]
    ContentDecode {
        encoding: &'static str,
        cause: String,
        status: StatusCode,
        headers: HeaderMap,
        body: Bytes,
    },

    #[error("invalid request: {cause}")]
    InvalidRequest { cause: String },

    #[error("beforeRequest hook failed: {cause}")]
    BeforeRequest { cause: String },

    #[error("failed to write response body: {source}")]
    WriteStream {
        status: StatusCode,
        headers: HeaderMap,
        #[source]
        source: std::io::Error,
    },

    #[error("request aborted")]
    Aborted,
}

impl RequestError {
    /// Stable kind name of the failure.
    pub fn name(&self) -> &'static str {
        match self {
            RequestError::Transport { .. } => "RequestError",
            RequestError::RemoteClosed { .. } => "RemoteSocketClosedError",
            RequestError::ConnectionTimeout { .. } => "ConnectionTimeoutError",
            RequestError::ResponseTimeout { .. } => "ResponseTimeoutError",
            RequestError::FollowRedirect { .. } | RequestError::UnreplayableBody { .. } => {
                "FollowRedirectError"
            }
            RequestError::MaxRedirects { .. } => "MaxRedirectError",
            RequestError::ResponseFormat { .. } => "JSONResponseFormatError",
            RequestError::ContentDecode { .. } => "ContentDecodeError",
            RequestError::InvalidRequest { .. } => "InvalidRequestError",
            RequestError::BeforeRequest { .. } => "BeforeRequestError",
            RequestError::WriteStream { .. } => "WriteStreamError",
            RequestError::Aborted => "AbortError",
        }
    }

    /// Status the failure is reported with: the received HTTP status when a
    /// response head arrived, `408` for timeouts, [`NO_STATUS`] otherwise.
    pub fn status(&self) -> i32 {
        match self {
            RequestError::ConnectionTimeout { .. } | RequestError::ResponseTimeout { .. } => {
                TIMEOUT_STATUS
            }
            RequestError::RemoteClosed { status, .. }
            | RequestError::FollowRedirect { status, .. }
            | RequestError::UnreplayableBody { status, .. }
            | RequestError::MaxRedirects { status, .. }
            | RequestError::ResponseFormat { status, .. }
            | RequestError::ContentDecode { status, .. }
            | RequestError::WriteStream { status, .. } => i32::from(status.as_u16()),
            RequestError::Transport { .. }
            | RequestError::InvalidRequest { .. }
            | RequestError::BeforeRequest { .. }
            | RequestError::Aborted => NO_STATUS,
        }
    }

    /// Response headers received before the failure. Empty when none were.
    pub fn headers(&self) -> &HeaderMap {
        match self {
            RequestError::RemoteClosed { headers, .. }
            | RequestError::ResponseTimeout { headers, .. }
            | RequestError::FollowRedirect { headers, .. }
            | RequestError::UnreplayableBody { headers, .. }
            | RequestError::MaxRedirects { headers, .. }
            | RequestError::ResponseFormat { headers, .. }
            | RequestError::ContentDecode { headers, .. }
            | RequestError::WriteStream { headers, .. } => headers,
            _ => &EMPTY_HEADERS,
        }
    }

    /// Body bytes attached for diagnosis: the partial body for remote closes
    /// and response timeouts, the full body for format failures.
    pub fn body(&self) -> Option<&Bytes> {
        match self {
            RequestError::RemoteClosed { partial, .. }
            | RequestError::ResponseTimeout { partial, .. } => Some(partial),
            RequestError::ResponseFormat { body, .. } | RequestError::ContentDecode { body, .. } => {
                Some(body)
            }
            _ => None,
        }
    }

    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            RequestError::ConnectionTimeout { .. } | RequestError::ResponseTimeout { .. }
        )
    }
}
