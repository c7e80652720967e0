//! Local HTTP server for network round-trip tests.
//!
//! Binds to an ephemeral port on 127.0.0.1. Routes:
//!
//! | Route | Behaviour |
//! |-------|-----------|
//! | `ANY /echo` | JSON `{ method, path, query, headers, body }` describing the request |
//! | `GET /text` | plain text body [`TEXT_BODY`] |
//! | `ANY /status/:code` | responds with `code` and a short text body |
//! | `GET /slow/:ms` | sleeps `ms` milliseconds, then responds `"slow"` |
//! | `GET /redirect` | `302` to `/echo` |
//! | `GET /large/:bytes` | a body of `bytes` ASCII `x` characters |

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::{Path, RawQuery};
use axum::http::{HeaderMap, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Redirect, Response};
use axum::routing::{any, get};
use axum::{Json, Router};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

/// Body served by `GET /text`.
pub const TEXT_BODY: &str = "hello from the test server";

/// What `/echo` reports back.
#[derive(Debug, Serialize)]
pub struct EchoReply {
    /// Request method.
    pub method: String,
    /// Request path.
    pub path: String,
    /// Raw query string, if any.
    pub query: Option<String>,
    /// Request headers, lowercased names.
    pub headers: BTreeMap<String, String>,
    /// Request body decoded as UTF-8 (lossy).
    pub body: String,
}

/// Build the router.
pub fn router() -> Router {
    Router::new()
        .route("/echo", any(echo))
        .route("/text", get(|| async { TEXT_BODY }))
        .route("/status/:code", any(status))
        .route("/slow/:ms", get(slow))
        .route("/redirect", get(|| async { Redirect::to("/echo") }))
        .route("/large/:bytes", get(large))
}

async fn echo(
    method: Method,
    uri: Uri,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    body: Bytes,
) -> Json<EchoReply> {
    let headers = headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect();
    Json(EchoReply {
        method: method.to_string(),
        path: uri.path().to_string(),
        query,
        headers,
        body: String::from_utf8_lossy(&body).into_owned(),
    })
}

async fn status(Path(code): Path<u16>) -> Response {
    match StatusCode::from_u16(code) {
        Ok(status) => (status, format!("status {code}")).into_response(),
        Err(_) => (StatusCode::BAD_REQUEST, "invalid status").into_response(),
    }
}

async fn slow(Path(ms): Path<u64>) -> &'static str {
    tokio::time::sleep(Duration::from_millis(ms)).await;
    "slow"
}

async fn large(Path(bytes): Path<usize>) -> String {
    "x".repeat(bytes)
}

/// A running server. Dropping it shuts the server down.
pub struct TestServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TestServer {
    /// Bind to an ephemeral port and start serving in the background.
    pub async fn start() -> anyhow::Result<Self> {
        Self::bind("127.0.0.1:0").await
    }

    /// Bind to `addr` and start serving in the background.
    pub async fn bind(addr: &str) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        let addr = listener.local_addr()?;
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            let served = axum::serve(listener, router())
                .with_graceful_shutdown(async {
                    let _ = shutdown_rx.await;
                })
                .await;
            if let Err(e) = served {
                tracing::warn!(error = %e, "test server stopped with error");
            }
        });

        tracing::debug!(%addr, "test server listening");
        Ok(Self {
            addr,
            shutdown: Some(shutdown_tx),
            handle: Some(handle),
        })
    }

    /// Bound address.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Absolute URL for `path`.
    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// Stop the server and wait for it to finish.
    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
    }
}
