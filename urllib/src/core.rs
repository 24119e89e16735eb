//! The client façade.
//!
//! [`Urllib`] bundles client defaults with a connection pool and exposes the
//! executor as an async call, a callback call, an abortable call and a
//! [`tower::Service`].

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::{AbortHandle, Abortable};
use lazy_static::lazy_static;
use log::{debug, warn};
use tokio::task::JoinHandle;
use tower::util::BoxService;
use tower::Service;

use crate::error::RequestError;
use crate::executor;
use crate::options::{RequestOptions, Timeout};
use crate::pool::{Pool, PoolConfig, Slot};
use crate::response::Response;

lazy_static! {
    /// `urllib/<version> <os>/<arch>`, sent when the caller sets no user-agent.
    pub static ref DEFAULT_USER_AGENT: String = format!(
        "urllib/{} {}/{}",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    );
    static ref DEFAULT_CLIENT: Urllib = Urllib::default();
}

/// A request executor behind a boxed tower service.
pub type RequestService = BoxService<RequestOptions, Response, RequestError>;

/// Client-wide defaults applied to every request that does not override them.
#[derive(Clone, Debug)]
pub struct Config {
    pub user_agent: String,
    pub timeout: Timeout,
    pub pool: PoolConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.clone(),
            timeout: Timeout::none(),
            pool: PoolConfig::default(),
        }
    }
}

#[derive(Clone, Debug)]
pub struct Urllib {
    config: Arc<Config>,
    pool: Pool,
}

impl Urllib {
    pub fn new(config: Config) -> Self {
        let pool = Pool::new(config.pool.clone());
        Self {
            config: Arc::new(config),
            pool,
        }
    }

    /// The process-wide client used by [`crate::request`]. Its idle
    /// keep-alive connections belong to the tokio runtime that opened them.
    pub fn global() -> &'static Urllib {
        &DEFAULT_CLIENT
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn pool(&self) -> &Pool {
        &self.pool
    }

    pub async fn request(
        &self,
        url: impl Into<String>,
        mut options: RequestOptions,
    ) -> Result<Response, RequestError> {
        options.url = url.into();
        self.execute(options).await
    }

    /// Runs a request whose url is already set on `options`.
    pub async fn execute(&self, options: RequestOptions) -> Result<Response, RequestError> {
        let slot = Slot::default();
        executor::execute(options, &self.config, &self.pool, &slot).await
    }

    /// Spawns the request and hands its outcome to `callback` exactly once.
    pub fn request_with_callback<F>(
        &self,
        url: impl Into<String>,
        options: RequestOptions,
        callback: F,
    ) -> JoinHandle<()>
    where
        F: FnOnce(Result<Response, RequestError>) + Send + 'static,
    {
        let client = self.clone();
        let url = url.into();
        tokio::spawn(async move {
            let result = client.request(url, options).await;
            callback(result);
        })
    }

    /// Returns the request future together with a handle that cancels it.
    /// A cancelled request frees its host slot before [`RequestHandle::abort`]
    /// returns, drops its in-flight exchange on the next poll and resolves
    /// with [`RequestError::Aborted`].
    pub fn request_abortable(
        &self,
        url: impl Into<String>,
        mut options: RequestOptions,
    ) -> (
        impl Future<Output = Result<Response, RequestError>> + Send + 'static,
        RequestHandle,
    ) {
        let (abort, registration) = AbortHandle::new_pair();
        let slot = Slot::default();
        let handle = RequestHandle {
            abort,
            slot: slot.clone(),
        };
        let client = self.clone();
        options.url = url.into();
        let call = async move {
            let url_for_log = options.url.clone();
            let run = executor::execute(options, &client.config, &client.pool, &slot);
            match Abortable::new(run, registration).await {
                Ok(result) => result,
                Err(_) => {
                    warn!("request to {url_for_log} aborted");
                    Err(RequestError::Aborted)
                }
            }
        };
        (call, handle)
    }

    pub fn boxed(&self) -> RequestService {
        BoxService::new(self.clone())
    }
}

/// Cancels a request started with [`Urllib::request_abortable`].
#[derive(Clone, Debug)]
pub struct RequestHandle {
    abort: AbortHandle,
    slot: Slot,
}

impl RequestHandle {
    /// Aborts the request and frees the host slot it holds. Has no effect
    /// once the request has resolved.
    pub fn abort(&self) {
        self.abort.abort();
        if self.slot.release() {
            debug!("freed the host slot of an aborted request");
        }
    }

    pub fn is_aborted(&self) -> bool {
        self.abort.is_aborted()
    }
}

impl Default for Urllib {
    fn default() -> Self {
        Urllib::new(Config::default())
    }
}

impl Service<RequestOptions> for Urllib {
    type Response = Response;

    type Error = RequestError;

    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        // Backpressure comes from the per-host ceiling inside the call.
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, options: RequestOptions) -> Self::Future {
        let client = self.clone();
        Box::pin(async move { client.execute(options).await })
    }
}

#[cfg(test)]
mod test {
    use tower::ServiceExt;

    use super::*;

    #[test]
    fn default_user_agent_names_client_and_platform() {
        let ua = DEFAULT_USER_AGENT.as_str();
        assert!(ua.starts_with(&format!("urllib/{} ", env!("CARGO_PKG_VERSION"))));
        assert!(ua.ends_with(&format!("{}/{}", std::env::consts::OS, std::env::consts::ARCH)));
        assert_eq!(Config::default().user_agent, ua);
    }

    #[tokio::test]
    async fn service_reports_local_failures() -> anyhow::Result<()> {
        let service = Urllib::default().boxed();
        let err = service
            .oneshot(RequestOptions::new("not a url"))
            .await
            .unwrap_err();
        assert_eq!(err.name(), "InvalidRequestError");
        Ok(())
    }

    #[tokio::test]
    async fn abort_before_dispatch_resolves_as_aborted() -> anyhow::Result<()> {
        let (call, handle) = Urllib::default().request_abortable(
            "http://127.0.0.1:9/never",
            RequestOptions::default(),
        );
        handle.abort();
        let err = call.await.unwrap_err();
        assert_eq!(err.name(), "AbortError");
        Ok(())
    }
}
