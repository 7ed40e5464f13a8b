//! Mock target server for integration testing.
//!
//! Records every request it receives together with its arrival time, and
//! answers with a configurable status after an optional delay. Requests to
//! `/stall` get response headers and one chunk, then the body never ends.

use axum::{
    Router,
    body::{Body, Bytes},
    extract::State,
    http::{HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::Response,
};
use futures_util::stream::{self, StreamExt};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// One request as seen by the mock.
#[derive(Debug, Clone)]
pub struct Arrival {
    pub at: Instant,
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Builder for the mock target.
#[derive(Debug, Clone)]
pub struct MockUpstream {
    status: StatusCode,
    delay: Duration,
    body: &'static str,
}

#[derive(Debug)]
struct MockState {
    status: StatusCode,
    delay: Duration,
    body: &'static str,
    arrivals: Mutex<Vec<Arrival>>,
}

impl MockUpstream {
    #[must_use]
    pub fn new() -> Self {
        Self {
            status: StatusCode::OK,
            delay: Duration::ZERO,
            body: "mock response",
        }
    }

    #[must_use]
    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }

    /// Delay before answering each request.
    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn with_body(mut self, body: &'static str) -> Self {
        self.body = body;
        self
    }

    /// Start serving on an ephemeral loopback port.
    pub async fn start(self) -> (SocketAddr, MockServerHandle) {
        let state = Arc::new(MockState {
            status: self.status,
            delay: self.delay,
            body: self.body,
            arrivals: Mutex::new(Vec::new()),
        });

        let app = Router::new().fallback(handle).with_state(state.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        (addr, MockServerHandle { state, handle })
    }
}

impl Default for MockUpstream {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a running mock target.
pub struct MockServerHandle {
    state: Arc<MockState>,
    handle: JoinHandle<()>,
}

impl MockServerHandle {
    /// Requests received so far, in arrival order.
    pub async fn arrivals(&self) -> Vec<Arrival> {
        self.state.arrivals.lock().await.clone()
    }

    pub async fn request_count(&self) -> usize {
        self.state.arrivals.lock().await.len()
    }
}

impl Drop for MockServerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn handle(
    State(state): State<Arc<MockState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let stall = uri.path().starts_with("/stall");
    state.arrivals.lock().await.push(Arrival {
        at: Instant::now(),
        method,
        uri,
        headers,
        body,
    });

    if !state.delay.is_zero() {
        tokio::time::sleep(state.delay).await;
    }

    let body = if stall {
        let first = stream::once(async { Ok::<_, Infallible>(Bytes::from_static(b"partial")) });
        Body::from_stream(first.chain(stream::pending()))
    } else {
        Body::from(state.body)
    };

    let mut response = Response::new(body);
    *response.status_mut() = state.status;
    response
        .headers_mut()
        .insert("x-mock", HeaderValue::from_static("true"));
    response
}

/// An address nothing is listening on.
pub async fn closed_port_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    addr
}
