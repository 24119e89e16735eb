use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use hyper::{Body, Request, Response, StatusCode};
use log::trace;
use tower::util::BoxCloneService;
use tower::BoxError;

/// One scripted behaviour. Returning an error makes hyper drop the
/// connection without writing a response.
pub type Script = BoxCloneService<Request<Body>, Response<Body>, BoxError>;

/// Wraps an async handler into a [`Script`].
pub fn script<F, Fut>(handler: F) -> Script
where
    F: Fn(Request<Body>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Result<Response<Body>, BoxError>> + Send + 'static,
{
    BoxCloneService::new(tower::service_fn(handler))
}

#[derive(Debug)]
enum Matcher {
    Exact(String),
    Prefix(String),
}

impl Matcher {
    fn matches(&self, path: &str) -> bool {
        match self {
            Matcher::Exact(exact) => path == exact,
            Matcher::Prefix(prefix) => path.starts_with(prefix.as_str()),
        }
    }
}

/// Hit counts per request path, shared between the router and whoever
/// started the server.
#[derive(Clone, Debug, Default)]
pub struct Hits(Arc<Mutex<HashMap<String, usize>>>);

impl Hits {
    pub fn get(&self, path: &str) -> usize {
        self.lock().get(path).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.lock().values().sum()
    }

    fn record(&self, path: &str) {
        *self.lock().entry(path.to_string()).or_insert(0) += 1;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, usize>> {
        self.0.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Maps request paths to scripts. Routes are tried in registration order,
/// unmatched paths get a 404.
pub struct Router {
    routes: Vec<(Matcher, Script)>,
    fallback: Script,
    hits: Hits,
}

impl Router {
    pub fn new() -> Self {
        Self {
            routes: Vec::new(),
            fallback: script(not_found),
            hits: Hits::default(),
        }
    }

    pub fn route(mut self, path: &str, script: Script) -> Self {
        self.routes.push((Matcher::Exact(path.to_string()), script));
        self
    }

    /// Matches every path starting with `prefix`.
    pub fn prefix(mut self, prefix: &str, script: Script) -> Self {
        self.routes.push((Matcher::Prefix(prefix.to_string()), script));
        self
    }

    pub fn hits(&self) -> Hits {
        self.hits.clone()
    }

    /// Records the hit and hands out the script serving `path`.
    pub(crate) fn script_for(&self, path: &str) -> Script {
        self.hits.record(path);
        let script = self
            .routes
            .iter()
            .find(|(matcher, _)| matcher.matches(path))
            .map(|(_, script)| script)
            .unwrap_or(&self.fallback);
        trace!("routing {path}");
        script.clone()
    }
}

impl Default for Router {
    fn default() -> Self {
        Router::new()
    }
}

async fn not_found(_req: Request<Body>) -> Result<Response<Body>, BoxError> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(Body::empty())?)
}
