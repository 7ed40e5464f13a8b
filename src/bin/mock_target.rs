use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri},
};
use serde_json::{Value, json};
use std::{net::SocketAddr, sync::Arc, time::Instant};
use tokio::sync::Mutex;

/// Arrival bookkeeping, so spacing between requests shows up in the logs.
struct Arrivals {
    started: Instant,
    last: Mutex<Option<Instant>>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let port: u16 = std::env::var("MOCK_PORT")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(8080);

    let state = Arc::new(Arrivals {
        started: Instant::now(),
        last: Mutex::new(None),
    });
    let app = Router::new().fallback(echo).with_state(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    tracing::info!("pacegate mock target listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await.map_err(|e| {
        tracing::error!("Failed to bind to {}: {}", addr, e);
        e
    })?;

    axum::serve(listener, app).await.map_err(|e| {
        tracing::error!("Server error: {}", e);
        e
    })?;

    Ok(())
}

/// Echo the request back and log how long it has been since the previous one.
async fn echo(
    State(arrivals): State<Arc<Arrivals>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Json<Value> {
    let now = Instant::now();
    let since_previous_ms = {
        let mut last = arrivals.last.lock().await;
        let gap = last.map(|prev| now.duration_since(prev).as_millis() as u64);
        *last = Some(now);
        gap
    };

    tracing::info!(
        method = %method,
        uri = %uri,
        at_ms = now.duration_since(arrivals.started).as_millis() as u64,
        since_previous_ms = ?since_previous_ms,
        "Request arrived"
    );

    let headers: serde_json::Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();

    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "query": uri.query(),
        "headers": headers,
        "body": String::from_utf8_lossy(&body),
        "since_previous_ms": since_previous_ms,
    }))
}
