//! A single-request HTTP client.
//!
//! One call to [`request`] (or [`Urllib::request`]) runs one logical
//! request to completion: separate connect and response timeouts, optional
//! redirect following up to `max_redirects` hops, transparent gzip/deflate
//! decoding, JSON decoding, and three ways of taking the body (buffered,
//! piped into a writer, or as a live stream). Failures are reported as
//! [`RequestError`], whose variants tell transport trouble, remote closes,
//! the two timeout phases, redirect protocol errors and format errors apart.
//!
//! ```no_run
//! use urllib::{DataType, RequestOptions};
//!
//! # async fn run() -> Result<(), urllib::RequestError> {
//! let response = urllib::request(
//!     "http://127.0.0.1:8080/json",
//!     RequestOptions {
//!         data_type: DataType::Json,
//!         timeout: Some(urllib::Timeout::from_millis(500)),
//!         ..Default::default()
//!     },
//! )
//! .await?;
//! println!("{} {:?}", response.status, response.json());
//! # Ok(())
//! # }
//! ```

pub mod core;
mod decoder;
pub mod error;
mod executor;
pub mod options;
pub mod pool;
mod redirect;
pub mod response;

pub(crate) mod providers {
    pub mod http_client_hyper;
}

pub use crate::core::{Config, RequestHandle, RequestService, Urllib, DEFAULT_USER_AGENT};
pub use crate::error::{RequestError, NO_STATUS, TIMEOUT_STATUS};
pub use crate::options::{
    BeforeRequest, BodyStream, DataType, PreparedRequest, RequestBody, RequestOptions, Timeout,
    WriteStream, DEFAULT_MAX_REDIRECTS,
};
pub use crate::pool::{Agent, Pool, PoolConfig, DEFAULT_MAX_SOCKETS_PER_HOST};
pub use crate::response::{Headers, Response, ResponseData, ResponseStream};

/// Runs a request on the process-wide client.
///
/// The global client keeps idle connections alive between calls, and hyper
/// ties each connection to the tokio runtime that opened it. Programs that
/// call this from more than one runtime (separate `#[tokio::test]`s, for
/// example) should build their own [`Urllib`] per runtime instead.
pub async fn request(
    url: impl Into<String>,
    options: RequestOptions,
) -> Result<Response, RequestError> {
    Urllib::global().request(url, options).await
}
