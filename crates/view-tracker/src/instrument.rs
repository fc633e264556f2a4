//! Install-once instrumentation over the process HTTP client.
//!
//! [`install`] wires a [`ViewTracker`] in front of a `reqwest::Client`
//! exactly once per process; later calls return the existing instance
//! instead of wrapping a wrapper. Call sites keep issuing plain requests
//! through [`InstrumentedClient::execute`], which tags trackable calls
//! with session headers, times them, and feeds the live session's
//! bookkeeping. Errors from the underlying call propagate unchanged.

use std::sync::Arc;

use once_cell::sync::OnceCell;
use reqwest::header::HeaderValue;
use reqwest::{Request, Response};
use tokio::time::Instant;
use url::Url;

use crate::{normalize_route, ViewTracker};

/// Request header carrying the view session id to the backend.
pub const SESSION_HEADER: &str = "x-view-session-id";
/// Request header carrying the normalized route.
pub const ROUTE_HEADER: &str = "x-view-route";
/// Response header with the server-measured runtime.
pub const RUNTIME_HEADER: &str = "x-runtime-ms";
/// Response header with the server-side cost estimate.
pub const COST_HEADER: &str = "x-runtime-cost";

static INSTALLED: OnceCell<Arc<InstrumentedClient>> = OnceCell::new();

/// Wire the tracker in front of the given client. Idempotent: only the
/// first call installs; subsequent calls return the existing instance.
pub fn install(client: reqwest::Client, tracker: Arc<ViewTracker>) -> Arc<InstrumentedClient> {
    INSTALLED
        .get_or_init(|| Arc::new(InstrumentedClient::new(client, tracker)))
        .clone()
}

/// The process-wide instrumented client, if one was installed.
pub fn installed() -> Option<Arc<InstrumentedClient>> {
    INSTALLED.get().cloned()
}

pub struct InstrumentedClient {
    inner: reqwest::Client,
    tracker: Arc<ViewTracker>,
}

impl InstrumentedClient {
    pub fn new(inner: reqwest::Client, tracker: Arc<ViewTracker>) -> Self {
        Self { inner, tracker }
    }

    /// The unwrapped client, for calls that must bypass tracking.
    pub fn plain(&self) -> &reqwest::Client {
        &self.inner
    }

    pub fn tracker(&self) -> &Arc<ViewTracker> {
        &self.tracker
    }

    pub async fn get(&self, url: &str) -> reqwest::Result<Response> {
        let request = self.inner.get(url).build()?;
        self.execute(request).await
    }

    /// Execute a request with bookkeeping. Trackable calls are attributed
    /// to the live session; everything else falls through untouched.
    pub async fn execute(&self, mut request: Request) -> reqwest::Result<Response> {
        if !self.trackable(request.url()) {
            return self.inner.execute(request).await;
        }
        let endpoint = normalize_route(request.url().path());
        let Some(token) = self.tracker.begin_call(&endpoint) else {
            return self.inner.execute(request).await;
        };

        if let Ok(value) = HeaderValue::from_str(&token.session_id().to_string()) {
            request.headers_mut().insert(SESSION_HEADER, value);
        }
        if let Ok(value) = HeaderValue::from_str(token.route()) {
            request.headers_mut().insert(ROUTE_HEADER, value);
        }

        let started = Instant::now();
        let result = self.inner.execute(request).await;
        let wall_ms = started.elapsed().as_millis() as u64;
        let (server_runtime, server_cost) = match &result {
            Ok(response) => (
                header_u64(response, RUNTIME_HEADER),
                header_f64(response, COST_HEADER),
            ),
            Err(_) => (None, None),
        };
        token.complete(wall_ms, server_runtime, server_cost);
        result
    }

    fn trackable(&self, url: &Url) -> bool {
        let config = self.tracker.config();
        let path = url.path();
        if !path.starts_with(config.api_prefix.as_str()) {
            return false;
        }
        if path == config.beacon_path {
            return false;
        }
        let Some(host) = url.host_str() else {
            return false;
        };
        if config.page_host.is_none() && config.backend_host.is_none() {
            // No host pinning configured; treat every host as our own.
            return true;
        }
        config.page_host.as_deref() == Some(host) || config.backend_host.as_deref() == Some(host)
    }
}

fn header_u64(response: &Response, name: &str) -> Option<u64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

fn header_f64(response: &Response, name: &str) -> Option<f64> {
    response.headers().get(name)?.to_str().ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrackerConfig;
    use axum::http::HeaderMap;
    use axum::routing::get;
    use axum::Router;
    use pagepulse_beacon::MemorySink;
    use std::net::SocketAddr;

    async fn spawn_stub_backend() -> SocketAddr {
        let app = Router::new()
            .route(
                "/api/deps",
                get(|headers: HeaderMap| async move {
                    // Echo whether the session headers arrived.
                    assert!(headers.contains_key(SESSION_HEADER));
                    assert!(headers.contains_key(ROUTE_HEADER));
                    (
                        [(RUNTIME_HEADER, "5"), (COST_HEADER, "0.25")],
                        "[]".to_string(),
                    )
                }),
            )
            .route("/public/page", get(|| async { "html" }));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind");
        let addr = listener.local_addr().expect("addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("serve");
        });
        addr
    }

    fn tracked_config() -> TrackerConfig {
        TrackerConfig {
            sample_rate: 1.0,
            ..TrackerConfig::default()
        }
    }

    #[test]
    fn install_returns_the_same_instance_every_time() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(tracked_config(), sink);

        let first = install(reqwest::Client::new(), tracker.clone());
        // A second install must hand back the existing instance and
        // discard the new client instead of wrapping a wrapper.
        let second = install(reqwest::Client::new(), tracker.clone());
        assert!(Arc::ptr_eq(&first, &second));
        assert!(Arc::ptr_eq(first.tracker(), &tracker));

        let found = installed().expect("instrumentation installed");
        assert!(Arc::ptr_eq(&found, &first));
    }

    #[tokio::test]
    async fn tracks_api_calls_and_prefers_server_runtime() {
        let addr = spawn_stub_backend().await;
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(tracked_config(), sink);
        let client = InstrumentedClient::new(reqwest::Client::new(), tracker.clone());

        let _view = tracker.open_view("/project/[id]").expect("sampled");
        let response = client
            .get(&format!("http://{}/api/deps", addr))
            .await
            .expect("request succeeds");
        assert!(response.status().is_success());

        let session = tracker.current_session().expect("session open");
        assert_eq!(session.api_call_count, 1);
        assert_eq!(session.api_runtime_ms, 5);
        assert!((session.api_runtime_cost - 0.25).abs() < f64::EPSILON);
        assert_eq!(session.active_requests, 0);
    }

    #[tokio::test]
    async fn non_api_paths_fall_through_untracked() {
        let addr = spawn_stub_backend().await;
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(tracked_config(), sink);
        let client = InstrumentedClient::new(reqwest::Client::new(), tracker.clone());

        let _view = tracker.open_view("/project/[id]").expect("sampled");
        client
            .get(&format!("http://{}/public/page", addr))
            .await
            .expect("request succeeds");

        let session = tracker.current_session().expect("session open");
        assert_eq!(session.api_call_count, 0);
    }

    #[tokio::test]
    async fn beacon_endpoint_is_never_tracked() {
        let sink = MemorySink::new();
        let config = TrackerConfig {
            beacon_path: "/api/beacon".to_string(),
            ..tracked_config()
        };
        let tracker = ViewTracker::new(config, sink);
        let client = InstrumentedClient::new(reqwest::Client::new(), tracker.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        // Unreachable target: the call fails, but it must not have been
        // attributed to the session in the first place.
        let result = client.get("http://127.0.0.1:9/api/beacon").await;
        assert!(result.is_err());
        let session = tracker.current_session().expect("session open");
        assert_eq!(session.api_call_count, 0);
    }

    #[tokio::test]
    async fn transport_errors_propagate_after_bookkeeping() {
        let sink = MemorySink::new();
        let tracker = ViewTracker::new(tracked_config(), sink);
        let client = InstrumentedClient::new(reqwest::Client::new(), tracker.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        let result = client.get("http://127.0.0.1:9/api/deps").await;
        assert!(result.is_err());

        let session = tracker.current_session().expect("session open");
        assert_eq!(session.api_call_count, 1);
        assert_eq!(session.active_requests, 0);
    }

    #[tokio::test]
    async fn host_pinning_excludes_foreign_hosts() {
        let sink = MemorySink::new();
        let config = TrackerConfig {
            backend_host: Some("backend.internal".to_string()),
            page_host: Some("dash.internal".to_string()),
            ..tracked_config()
        };
        let tracker = ViewTracker::new(config, sink);
        let client = InstrumentedClient::new(reqwest::Client::new(), tracker.clone());
        let _view = tracker.open_view("/project/[id]").expect("sampled");

        let result = client.get("http://127.0.0.1:9/api/deps").await;
        assert!(result.is_err());
        let session = tracker.current_session().expect("session open");
        assert_eq!(session.api_call_count, 0);
    }
}
