//! Provides the [hyper](https://crates.io/crates/hyper)-backed transport.
//! Everything that touches hyper types directly lives here: building the
//! pooled client with its TLS connector and turning a prepared request into
//! a `hyper::Request`.

use hyper::client::HttpConnector;
use hyper::{Body, Client, Request, Uri};
use hyper_tls::HttpsConnector;

use crate::error::RequestError;
use crate::options::{PreparedBody, PreparedRequest};
use crate::pool::PoolConfig;

pub(crate) type HyperClient = Client<HttpsConnector<HttpConnector>, Body>;

pub(crate) fn new_client(
    config: &PoolConfig,
    reject_unauthorized: bool,
) -> Result<HyperClient, RequestError> {
    let mut http = HttpConnector::new();
    http.enforce_http(false);
    http.set_nodelay(true);

    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(!reject_unauthorized)
        .danger_accept_invalid_hostnames(!reject_unauthorized)
        .build()
        .map_err(|e| RequestError::Transport {
            cause: format!("failed to build tls connector: {e}"),
        })?;
    let https = HttpsConnector::from((http, tokio_native_tls::TlsConnector::from(tls)));

    let client = Client::builder()
        .pool_max_idle_per_host(config.max_idle_per_host)
        .pool_idle_timeout(config.idle_timeout)
        .build(https);
    Ok(client)
}

/// Builds the wire request for one hop. A streamed body is moved out, so a
/// second call for the same request fails.
pub(crate) fn build_request(request: &mut PreparedRequest) -> Result<Request<Body>, RequestError> {
    let body = match &mut request.body {
        PreparedBody::Empty => Body::empty(),
        PreparedBody::Full(bytes) => Body::from(bytes.clone()),
        PreparedBody::Stream(stream) => match stream.take() {
            Some(stream) => Body::wrap_stream(stream),
            None => {
                return Err(RequestError::InvalidRequest {
                    cause: "streamed request body was already sent".into(),
                })
            }
        },
    };

    let uri: Uri = request
        .url
        .as_str()
        .parse()
        .map_err(|e| RequestError::InvalidRequest {
            cause: format!("invalid uri {}: {e}", request.url),
        })?;

    let mut req = Request::new(body);
    *req.method_mut() = request.method.clone();
    *req.uri_mut() = uri;
    *req.headers_mut() = request.headers.clone();
    Ok(req)
}

impl From<hyper::Error> for RequestError {
    fn from(value: hyper::Error) -> Self {
        let cause = value.to_string();
        RequestError::Transport { cause }
    }
}

#[cfg(test)]
mod test {
    use bytes::Bytes;
    use futures::StreamExt;
    use http::header::{CONTENT_LENGTH, USER_AGENT};
    use http::{HeaderMap, HeaderValue, Method};
    use hyper::body::HttpBody;
    use url::Url;

    use super::*;

    fn prepared(body: PreparedBody) -> PreparedRequest {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, HeaderValue::from_static("test"));
        headers.insert(CONTENT_LENGTH, HeaderValue::from_static("5"));
        PreparedRequest {
            method: Method::PUT,
            url: Url::parse("http://127.0.0.1:8080/method?x=1").unwrap(),
            headers,
            body,
        }
    }

    #[tokio::test]
    async fn buffered_bodies_can_be_built_twice() -> anyhow::Result<()> {
        let mut request = prepared(PreparedBody::Full(Bytes::from_static(b"hello")));
        for _ in 0..2 {
            let mut req = build_request(&mut request)?;
            assert_eq!(req.method(), Method::PUT);
            assert_eq!(req.uri(), "http://127.0.0.1:8080/method?x=1");
            assert_eq!(req.headers()[USER_AGENT], "test");
            let data = req.body_mut().data().await.unwrap()?;
            assert_eq!(data, "hello");
        }
        Ok(())
    }

    #[test]
    fn streamed_bodies_are_sent_once() {
        let chunks: Vec<std::io::Result<Bytes>> = vec![Ok(Bytes::from_static(b"hello"))];
        let stream = futures::stream::iter(chunks);
        let mut request = prepared(PreparedBody::Stream(Some(stream.boxed())));
        assert!(build_request(&mut request).is_ok());
        let err = build_request(&mut request).unwrap_err();
        assert_eq!(err.name(), "InvalidRequestError");
    }
}
