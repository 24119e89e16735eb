//! A scripted HTTP server for exercising clients against slow, broken and
//! redirecting endpoints.
//!
//! Each path is served by a boxed tower service (a [`Script`]). The server
//! counts hits per path so callers can assert how many requests a client
//! actually made.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use hyper::server::conn::AddrStream;
use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Server};
use log::{error, info, trace};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower::ServiceExt;

mod router;
pub mod scripts;

pub use router::{script, Hits, Router, Script};
pub use scripts::default_router;

/// A running server. Dropping the handle shuts the server down.
pub struct ServerHandle {
    addr: SocketAddr,
    hits: Hits,
    shutdown: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute url of `path` on this server.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Requests seen so far for `path` (query excluded).
    pub fn hits(&self, path: &str) -> usize {
        self.hits.get(path)
    }

    /// Stops accepting connections and waits for in-flight ones to finish.
    pub async fn stop(mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    /// Serves until the process is interrupted.
    pub async fn wait(mut self) {
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for ServerHandle {
    fn drop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

/// Binds `addr` (port `0` picks a free one) and serves `router` in the
/// background.
pub async fn start(router: Router, addr: SocketAddr) -> anyhow::Result<ServerHandle> {
    let hits = router.hits();
    let router = Arc::new(Mutex::new(router));

    let make_svc = make_service_fn(move |conn: &AddrStream| {
        trace!("http connection from {}", conn.remote_addr());
        let router = router.clone();
        async move {
            Ok::<_, Infallible>(service_fn(move |req: Request<Body>| {
                // Pick the script before awaiting; the router lock is never
                // held across a request.
                let script = router
                    .lock()
                    .unwrap_or_else(|poisoned| poisoned.into_inner())
                    .script_for(req.uri().path());
                script.oneshot(req)
            }))
        }
    });

    let server = Server::try_bind(&addr)?.serve(make_svc);
    let addr = server.local_addr();
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let server = server.with_graceful_shutdown(async move {
        let _ = shutdown_rx.await;
    });

    let task = tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("development server failed: {e}");
        }
    });
    info!("development server listening on http://{addr}");

    Ok(ServerHandle {
        addr,
        hits,
        shutdown: Some(shutdown_tx),
        task: Some(task),
    })
}

#[cfg(test)]
mod test {
    use hyper::body::to_bytes;
    use hyper::{Client, StatusCode};

    use super::*;

    async fn local() -> anyhow::Result<ServerHandle> {
        start(default_router(), SocketAddr::from(([127, 0, 0, 1], 0))).await
    }

    #[tokio::test]
    async fn serves_the_default_script() -> anyhow::Result<()> {
        let server = local().await?;
        let client = Client::new();

        let res = client.get(server.url("/json").parse()?).await?;
        assert_eq!(res.status(), StatusCode::OK);
        assert_eq!(to_bytes(res.into_body()).await?, r#"{"foo":"bar"}"#);

        let res = client.get(server.url("/qs?a=1&b=2").parse()?).await?;
        let body: serde_json::Value = serde_json::from_slice(&to_bytes(res.into_body()).await?)?;
        assert_eq!(body, serde_json::json!({ "a": "1", "b": "2" }));

        let res = client.get(server.url("/302").parse()?).await?;
        assert_eq!(res.status(), StatusCode::FOUND);
        assert_eq!(res.headers()["location"], "/204");

        assert_eq!(server.hits("/json"), 1);
        assert_eq!(server.hits("/qs"), 1);
        server.stop().await;
        Ok(())
    }

    #[tokio::test]
    async fn destroy_closes_without_a_response() -> anyhow::Result<()> {
        let server = local().await?;
        let err = Client::new()
            .get(server.url("/destroy").parse()?)
            .await
            .unwrap_err();
        assert!(err.is_incomplete_message() || err.is_closed());
        Ok(())
    }

    #[tokio::test]
    async fn unknown_paths_are_not_found() -> anyhow::Result<()> {
        let server = local().await?;
        let res = Client::new().get(server.url("/missing").parse()?).await?;
        assert_eq!(res.status(), StatusCode::NOT_FOUND);
        Ok(())
    }
}
