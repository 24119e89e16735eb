//! Runs one logical request: normalize once, then dispatch and consume hop
//! by hop until a terminal response or failure.
//!
//! Each phase owns its timer. The connect limit wraps pool checkout plus the
//! wait for the response head, the response limit wraps reading or piping the
//! body. Leaving a phase for any reason drops its timer and, on failure, the
//! in-flight exchange with it.
//!
//! The host slot of the current hop lives in a `Slot` shared with the
//! caller, so a cancel handle can free it without waiting for this future to
//! be polled again.

use std::future::Future;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use http::header::CONNECTION;
use http::{HeaderMap, HeaderValue, StatusCode};
use hyper::body::HttpBody;
use hyper::Body;
use log::{debug, trace};
use tokio::io::AsyncWriteExt;
use url::Url;

use crate::core::Config;
use crate::decoder::ContentDecoder;
use crate::error::RequestError;
use crate::options::{normalize, DataType, PreparedRequest, RequestOptions, Settings, WriteStream};
use crate::pool::{Agent, Pool, Slot};
use crate::providers::http_client_hyper::build_request;
use crate::redirect::{self, RedirectPolicy};
use crate::response::{join_headers, Response, ResponseData, ResponseStream};

pub(crate) async fn execute(
    options: RequestOptions,
    config: &Config,
    shared: &Pool,
    slot: &Slot,
) -> Result<Response, RequestError> {
    let _release = slot.release_on_drop();
    let started = Instant::now();
    let (mut request, mut settings) = normalize(options, config)?;
    debug!("{} {}", request.method, request.url);

    let mut redirects = RedirectPolicy::new(settings.max_redirects);
    let mut request_urls = Vec::new();
    loop {
        request_urls.push(request.url.clone());
        let agent = agent_for(&settings, &request.url);
        let target = Target {
            pool: agent.resolve(shared),
            close: agent.is_disabled(),
            connect: settings.timeout.connect,
            reject_unauthorized: settings.reject_unauthorized,
        };
        let response = dispatch(&mut request, target, slot).await?;

        if settings.follow_redirect && redirect::is_redirect(response.status()) {
            let status = response.status();
            let next = redirects.next_location(&request.url, status, response.headers())?;
            debug!("{} {} redirected to {}", status.as_u16(), request.url, next);
            request = redirect::next_hop(&request, status, response.headers(), next)?;
            // Free the slot before the next hop queues for one.
            drop(response);
            slot.release();
            continue;
        }

        let exchange = Exchange {
            request_urls,
            started,
        };
        return consume(response, slot, &mut settings, exchange).await;
    }
}

fn agent_for<'a>(settings: &'a Settings, url: &Url) -> &'a Agent {
    if url.scheme() == "https" {
        &settings.https_agent
    } else {
        &settings.agent
    }
}

/// Where and how one hop is sent. Owned so the request future does not
/// borrow the caller's settings across awaits.
struct Target {
    pool: Pool,
    close: bool,
    connect: Option<Duration>,
    reject_unauthorized: bool,
}

/// Connect phase of one hop: a pool slot, the wire request and the response
/// head, all under the connect limit.
async fn dispatch(
    request: &mut PreparedRequest,
    target: Target,
    slot: &Slot,
) -> Result<hyper::Response<Body>, RequestError> {
    let mut req = build_request(request)?;
    if target.close {
        req.headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }
    trace!("dispatching {} {}", request.method, request.url);

    let url = &request.url;
    let Target {
        pool,
        connect: limit,
        reject_unauthorized,
        ..
    } = target;
    let connect = async {
        let checkout = pool.checkout(url, reject_unauthorized).await?;
        slot.hold(checkout.permit);
        let response = checkout.client.request(req).await?;
        Ok::<_, RequestError>(response)
    };
    within(limit, connect)
        .await
        .map_err(|timeout| {
            debug!("{url}: no response head within {timeout:?}");
            RequestError::ConnectionTimeout { timeout }
        })?
}

struct Exchange {
    request_urls: Vec<Url>,
    started: Instant,
}

impl Exchange {
    fn respond(
        self,
        status: StatusCode,
        raw_headers: HeaderMap,
        data: Option<ResponseData>,
        size: u64,
    ) -> Response {
        let rt = self.started.elapsed();
        if let Some(url) = self.request_urls.last() {
            debug!("{} {} in {:?} ({} bytes)", status.as_u16(), url, rt, size);
        }
        Response {
            status,
            headers: join_headers(&raw_headers),
            raw_headers,
            data,
            request_urls: self.request_urls,
            rt,
            size,
        }
    }
}

/// Response phase: hand off the live body, pipe it into the write stream, or
/// buffer and shape it.
async fn consume(
    response: hyper::Response<Body>,
    slot: &Slot,
    settings: &mut Settings,
    exchange: Exchange,
) -> Result<Response, RequestError> {
    let (parts, mut body) = response.into_parts();
    let status = parts.status;
    let headers = parts.headers;
    let decoder = if settings.decompress {
        ContentDecoder::from_headers(&headers)
    } else {
        None
    };

    if settings.streaming {
        let stream = ResponseStream::new(body, decoder, slot.take());
        return Ok(exchange.respond(status, headers, Some(ResponseData::Stream(stream)), 0));
    }

    let limit = settings.timeout.response;

    if let Some(mut sink) = settings.write_stream.take() {
        let mut received = 0;
        let piped = within(limit, pipe(&mut body, decoder, &mut sink, &mut received)).await;
        drop(body);
        slot.release();
        return match piped {
            Ok(Ok(())) => Ok(exchange.respond(status, headers, None, received)),
            Ok(Err(PipeError::Remote(e))) => Err(RequestError::RemoteClosed {
                status,
                headers,
                partial: Bytes::new(),
                cause: e.to_string(),
            }),
            Ok(Err(PipeError::Decode(encoding, e))) => Err(RequestError::ContentDecode {
                encoding,
                cause: e.to_string(),
                status,
                headers,
                body: Bytes::new(),
            }),
            Ok(Err(PipeError::Write(source))) => Err(RequestError::WriteStream {
                status,
                headers,
                source,
            }),
            Err(timeout) => Err(RequestError::ResponseTimeout {
                timeout,
                status,
                headers,
                partial: Bytes::new(),
            }),
        };
    }

    let mut raw = BytesMut::new();
    let read = within(limit, read_body(&mut body, &mut raw)).await;
    drop(body);
    slot.release();
    match read {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            debug!("body of {} ended early: {e}", status.as_u16());
            return Err(RequestError::RemoteClosed {
                status,
                headers,
                partial: raw.freeze(),
                cause: e.to_string(),
            });
        }
        Err(timeout) => {
            return Err(RequestError::ResponseTimeout {
                timeout,
                status,
                headers,
                partial: raw.freeze(),
            })
        }
    }

    let size = raw.len() as u64;
    let raw = raw.freeze();
    let body = match decoder {
        Some(decoder) if !raw.is_empty() => {
            let encoding = decoder.encoding();
            match decoder.decode_all(&raw) {
                Ok(decoded) => decoded,
                Err(e) => {
                    return Err(RequestError::ContentDecode {
                        encoding,
                        cause: e.to_string(),
                        status,
                        headers,
                        body: raw,
                    })
                }
            }
        }
        _ => raw,
    };

    match shape(body, settings) {
        Ok(data) => Ok(exchange.respond(status, headers, data, size)),
        Err((cause, body)) => Err(RequestError::ResponseFormat {
            cause,
            status,
            headers,
            body,
        }),
    }
}

/// Turns a buffered body into the requested data type. An empty body is
/// `None` whatever the type.
fn shape(body: Bytes, settings: &Settings) -> Result<Option<ResponseData>, (String, Bytes)> {
    if body.is_empty() {
        return Ok(None);
    }
    match settings.data_type {
        DataType::Raw => Ok(Some(ResponseData::Bytes(body))),
        DataType::Text => Ok(Some(ResponseData::Text(
            String::from_utf8_lossy(&body).into_owned(),
        ))),
        DataType::Json => {
            let body = if settings.fix_json_ctl_chars {
                strip_ctl_chars(&body)
            } else {
                body
            };
            match serde_json::from_slice(&body) {
                Ok(value) => Ok(Some(ResponseData::Json(value))),
                Err(e) => {
                    let cause = format!(
                        "{e} (data json format: {:?})",
                        String::from_utf8_lossy(&body)
                    );
                    Err((cause, body))
                }
            }
        }
    }
}

fn strip_ctl_chars(body: &Bytes) -> Bytes {
    if !body.iter().any(|b| *b < 0x20) {
        return body.clone();
    }
    body.iter().copied().filter(|b| *b >= 0x20).collect()
}

async fn read_body(body: &mut Body, out: &mut BytesMut) -> Result<(), hyper::Error> {
    while let Some(chunk) = body.data().await {
        out.extend_from_slice(&chunk?);
    }
    Ok(())
}

enum PipeError {
    Remote(hyper::Error),
    Decode(&'static str, std::io::Error),
    Write(std::io::Error),
}

async fn pipe(
    body: &mut Body,
    mut decoder: Option<ContentDecoder>,
    sink: &mut WriteStream,
    received: &mut u64,
) -> Result<(), PipeError> {
    while let Some(chunk) = body.data().await {
        let chunk = chunk.map_err(PipeError::Remote)?;
        *received += chunk.len() as u64;
        let out = match decoder.as_mut() {
            Some(decoder) => {
                let encoding = decoder.encoding();
                decoder
                    .push(&chunk)
                    .map_err(|e| PipeError::Decode(encoding, e))?
            }
            None => chunk,
        };
        sink.write_all(&out).await.map_err(PipeError::Write)?;
    }
    if let Some(decoder) = decoder.filter(|_| *received > 0) {
        let encoding = decoder.encoding();
        let tail = decoder
            .finish()
            .map_err(|e| PipeError::Decode(encoding, e))?;
        sink.write_all(&tail).await.map_err(PipeError::Write)?;
    }
    sink.flush().await.map_err(PipeError::Write)?;
    sink.shutdown().await.map_err(PipeError::Write)
}

/// Runs `fut` under an optional limit, yielding the limit on expiry.
async fn within<F: Future>(limit: Option<Duration>, fut: F) -> Result<F::Output, Duration> {
    match limit {
        Some(limit) => tokio::time::timeout(limit, fut).await.map_err(|_| limit),
        None => Ok(fut.await),
    }
}

#[cfg(test)]
mod test {
    use crate::options::Timeout;

    use super::*;

    fn settings(data_type: DataType, fix_json_ctl_chars: bool) -> Settings {
        Settings {
            timeout: Timeout::none(),
            data_type,
            fix_json_ctl_chars,
            follow_redirect: false,
            max_redirects: 10,
            decompress: false,
            reject_unauthorized: true,
            agent: Agent::Shared,
            https_agent: Agent::Shared,
            write_stream: None,
            streaming: false,
        }
    }

    #[test]
    fn empty_bodies_have_no_data() {
        for data_type in [DataType::Raw, DataType::Text, DataType::Json] {
            assert!(shape(Bytes::new(), &settings(data_type, false))
                .unwrap()
                .is_none());
        }
    }

    #[test]
    fn invalid_json_keeps_the_payload() {
        let body = Bytes::from_static(b"{\"foo\":\"\n\"}");
        let (cause, payload) = shape(body.clone(), &settings(DataType::Json, false)).unwrap_err();
        assert!(cause.contains("data json format"));
        assert_eq!(payload, body);
    }

    #[test]
    fn control_characters_can_be_stripped_before_parsing() {
        let body = Bytes::from_static(b"{\"foo\":\"a\x01b\nc\"}");
        match shape(body, &settings(DataType::Json, true)).unwrap() {
            Some(ResponseData::Json(value)) => assert_eq!(value["foo"], "abc"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn text_is_decoded_lossily() {
        match shape(Bytes::from_static(b"hi \xff"), &settings(DataType::Text, false)).unwrap() {
            Some(ResponseData::Text(text)) => assert_eq!(text, "hi \u{fffd}"),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn https_urls_use_the_https_agent() {
        let mut settings = settings(DataType::Raw, false);
        settings.https_agent = Agent::Disabled;
        let https = Url::parse("https://a.test/").unwrap();
        let http = Url::parse("http://a.test/").unwrap();
        assert!(agent_for(&settings, &https).is_disabled());
        assert!(!agent_for(&settings, &http).is_disabled());
    }

    #[tokio::test]
    async fn limits_are_optional() {
        assert_eq!(within(None, async { 1 }).await, Ok(1));
        let expired = within(
            Some(Duration::from_millis(5)),
            tokio::time::sleep(Duration::from_secs(5)),
        )
        .await;
        assert_eq!(expired, Err(Duration::from_millis(5)));
    }
}
