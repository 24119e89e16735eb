//! The default fault-injection script used by the client tests.

use std::io::Write;
use std::time::Duration;

use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use hyper::header::{
    HeaderName, AUTHORIZATION, CONTENT_ENCODING, CONTENT_TYPE, HOST, LOCATION, USER_AGENT,
};
use hyper::{Body, Request, Response, StatusCode};
use log::debug;
use serde_json::{json, Map, Value};
use tower::BoxError;

use crate::router::{script, Router};

const JSON: &str = "application/json; charset=utf-8";
const TEXT: &str = "text/plain; charset=utf-8";

/// Body of `/corrupt-gzip`.
pub const CORRUPT_GZIP: &[u8] = b"this is not gzip";

/// Number of chunks `/slow` sends.
pub const SLOW_CHUNKS: usize = 40;

/// Gap between streamed chunks.
pub const CHUNK_INTERVAL: Duration = Duration::from_millis(100);

/// How long the connection-killing routes stream before aborting.
pub const ABORT_AFTER: Duration = Duration::from_millis(500);

pub fn default_router() -> Router {
    Router::new()
        .route("/sleep", script(sleep))
        .route("/wrongjson", script(wrong_json))
        .route("/json", script(json_ok))
        .route("/destroy", script(destroy))
        .prefix("/qs", script(query))
        .prefix("/post", script(post))
        .route("/ua", script(user_agent))
        .route("/direct", script(direct))
        .route("/auth", script(auth))
        .route("/method", script(method))
        .route("/headers", script(headers))
        .route("/301", script(|_| redirect(StatusCode::MOVED_PERMANENTLY, "/204")))
        .route("/302", script(|_| redirect(StatusCode::FOUND, "/204")))
        .route("/303", script(|_| redirect(StatusCode::SEE_OTHER, "/method")))
        .route("/307", script(|_| redirect(StatusCode::TEMPORARY_REDIRECT, "/method")))
        .route("/308", script(|_| redirect(StatusCode::PERMANENT_REDIRECT, "/method")))
        .route("/redirect_no_location", script(redirect_no_location))
        .route("/204", script(no_content))
        .route("/loop_redirect", script(|_| redirect(StatusCode::FOUND, "/loop_redirect")))
        .route("/redirect_to_localhost", script(redirect_to_localhost))
        .route("/content-encoding", script(unknown_encoding))
        .route("/gzip", script(gzip))
        .route("/deflate", script(deflate))
        .route("/corrupt-gzip", script(corrupt_gzip))
        .route("/slow", script(slow))
        .route("/socket.destroy", script(abort_midway))
        .route("/res-connection-end", script(abort_midway))
}

fn respond(
    status: StatusCode,
    content_type: &str,
    body: impl Into<Body>,
) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .status(status)
        .header(CONTENT_TYPE, content_type)
        .body(body.into())?)
}

fn json_response(value: Value) -> Result<Response<Body>, BoxError> {
    respond(StatusCode::OK, JSON, serde_json::to_vec(&value)?)
}

async fn redirect(status: StatusCode, location: &str) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .status(status)
        .header(LOCATION, location)
        .header(CONTENT_TYPE, TEXT)
        .body(Body::from(format!("Redirecting to {location}")))?)
}

fn header_str<'a>(req: &'a Request<Body>, name: HeaderName) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok())
}

async fn sleep(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    tokio::time::sleep(Duration::from_secs(1)).await;
    respond(StatusCode::OK, TEXT, Body::empty())
}

async fn wrong_json(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    respond(StatusCode::OK, JSON, "{foo:bar}")
}

async fn json_ok(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    json_response(json!({ "foo": "bar" }))
}

async fn destroy(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    debug!("/destroy: dropping the connection");
    Err("connection destroyed by script".into())
}

fn pairs_to_object(pairs: url::form_urlencoded::Parse<'_>) -> Value {
    let object: Map<String, Value> = pairs
        .map(|(k, v)| (k.into_owned(), Value::String(v.into_owned())))
        .collect();
    Value::Object(object)
}

async fn query(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let query = req.uri().query().unwrap_or_default();
    json_response(pairs_to_object(url::form_urlencoded::parse(query.as_bytes())))
}

async fn post(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let content_type = header_str(&req, CONTENT_TYPE).map(str::to_string);
    let raw = hyper::body::to_bytes(req.into_body()).await?;
    let is_json = content_type
        .as_deref()
        .map(|ct| ct.contains("json"))
        .unwrap_or(false);
    let body = if is_json {
        serde_json::from_slice(&raw).unwrap_or(Value::Null)
    } else {
        pairs_to_object(url::form_urlencoded::parse(&raw))
    };
    json_response(json!({ "body": body, "content-type": content_type }))
}

async fn user_agent(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    json_response(json!({ "ua": header_str(&req, USER_AGENT) }))
}

async fn direct(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let raw = hyper::body::to_bytes(req.into_body()).await?;
    respond(StatusCode::OK, "application/octet-stream", raw)
}

async fn auth(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let credentials = header_str(&req, AUTHORIZATION)
        .and_then(|v| v.strip_prefix("Basic "))
        .and_then(|v| STANDARD.decode(v).ok())
        .map(|v| String::from_utf8_lossy(&v).into_owned());
    let Some(credentials) = credentials else {
        return respond(StatusCode::UNAUTHORIZED, TEXT, "missing basic auth");
    };
    let (user, pass) = credentials.split_once(':').unwrap_or((credentials.as_str(), ""));
    json_response(json!({ "user": user, "pass": pass }))
}

async fn method(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let method = req.method().to_string();
    let raw = hyper::body::to_bytes(req.into_body()).await?;
    json_response(json!({ "method": method, "body": String::from_utf8_lossy(&raw) }))
}

async fn headers(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let object: Map<String, Value> = req
        .headers()
        .iter()
        .map(|(k, v)| {
            (
                k.to_string(),
                Value::String(String::from_utf8_lossy(v.as_bytes()).into_owned()),
            )
        })
        .collect();
    json_response(Value::Object(object))
}

async fn redirect_no_location(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    respond(StatusCode::FOUND, TEXT, "I am 302 body")
}

async fn no_content(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Body::empty())?)
}

/// Sends the client to the same server under another host name.
async fn redirect_to_localhost(req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let port = header_str(&req, HOST)
        .and_then(|host| host.rsplit_once(':'))
        .map(|(_, port)| port.to_string())
        .ok_or("request has no host port")?;
    let location = format!("http://localhost:{port}/headers");
    redirect(StatusCode::FOUND, &location).await
}

async fn unknown_encoding(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .header(CONTENT_ENCODING, "foo")
        .body(Body::from("bar"))?)
}

async fn gzip(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(br#"{"foo":"bar"}"#)?;
    compressed("gzip", encoder.finish()?)
}

async fn deflate(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(br#"{"foo":"bar"}"#)?;
    compressed("deflate", encoder.finish()?)
}

/// Claims gzip but sends a body that is not.
async fn corrupt_gzip(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    compressed("gzip", CORRUPT_GZIP.to_vec())
}

fn compressed(encoding: &str, body: Vec<u8>) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .header(CONTENT_TYPE, JSON)
        .header(CONTENT_ENCODING, encoding)
        .body(Body::from(body))?)
}

fn chunk(i: usize) -> Bytes {
    Bytes::from(format!("chunk {i:02}\n"))
}

/// Streams [`SLOW_CHUNKS`] chunks, the first right away.
async fn slow(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        for i in 0..SLOW_CHUNKS {
            if i > 0 {
                tokio::time::sleep(CHUNK_INTERVAL).await;
            }
            if sender.send_data(chunk(i)).await.is_err() {
                debug!("/slow: client went away after {i} chunks");
                return;
            }
        }
    });
    respond(StatusCode::OK, TEXT, body)
}

/// Streams like `/slow`, then kills the connection mid-body.
async fn abort_midway(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    let (mut sender, body) = Body::channel();
    tokio::spawn(async move {
        let deadline = tokio::time::Instant::now() + ABORT_AFTER;
        let mut i = 0;
        while tokio::time::Instant::now() < deadline {
            if sender.send_data(chunk(i)).await.is_err() {
                return;
            }
            i += 1;
            tokio::time::sleep(CHUNK_INTERVAL).await;
        }
        debug!("aborting response after {i} chunks");
        sender.abort();
    });
    respond(StatusCode::OK, TEXT, body)
}
