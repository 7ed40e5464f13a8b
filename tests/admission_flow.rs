//! Admission behavior of the proxy service against a live target.
//!
//! Requests are handed to `ProxyService::handle_request` directly; the target
//! is a real axum server on loopback so arrival times are measured where the
//! spacing matters.

mod helpers;

use bytes::Bytes;
use helpers::memory_sink::MemorySink;
use helpers::mock_upstream::MockUpstream;
use helpers::{TEST_LIMIT, TOLERANCE, test_config};
use http::{Request, Response, StatusCode};
use http_body_util::{BodyExt, Full};
use pacegate::audit::Outcome;
use pacegate::config::ProxyConfig;
use pacegate::exchange_body::ProxyBody;
use pacegate::proxy_service::ProxyService;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};

fn proxy(config: ProxyConfig) -> (ProxyService, Arc<MemorySink>) {
    let sink = Arc::new(MemorySink::new());
    let service = ProxyService::new(config, sink.clone()).unwrap();
    (service, sink)
}

fn request_to(target: &str, seq: &str) -> Request<Full<Bytes>> {
    Request::get("/")
        .header("x-proxy-to", target)
        .header("x-seq", seq)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

async fn read_body(response: Response<ProxyBody>) -> (StatusCode, Bytes) {
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn seq_of(arrival: &helpers::mock_upstream::Arrival) -> String {
    arrival.headers["x-seq"].to_str().unwrap().to_string()
}

fn target(addr: SocketAddr, path: &str) -> String {
    format!("http://{addr}{path}")
}

/// A at t≈0, B at t≈LIMIT, C at t≈2·LIMIT, in arrival order.
#[tokio::test]
async fn test_three_requests_released_fifo_with_spacing() {
    let (upstream_addr, upstream) = MockUpstream::new().start().await;
    let (service, sink) = proxy(test_config());
    let started = Instant::now();

    let mut tasks = Vec::new();
    for seq in ["A", "B", "C"] {
        let service = service.clone();
        let req = request_to(&target(upstream_addr, "/"), seq);
        tasks.push(tokio::spawn(async move {
            read_body(service.handle_request(req).await).await
        }));
        sleep(Duration::from_millis(10)).await;
    }
    for task in tasks {
        let (status, body) = task.await.unwrap();
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "mock response");
    }
    let elapsed = started.elapsed();

    let arrivals = upstream.arrivals().await;
    let order: Vec<_> = arrivals.iter().map(seq_of).collect();
    assert_eq!(order, ["A", "B", "C"]);

    for pair in arrivals.windows(2) {
        let gap = pair[1].at.duration_since(pair[0].at);
        assert!(
            gap + TOLERANCE >= TEST_LIMIT,
            "releases only {gap:?} apart, expected at least {TEST_LIMIT:?}"
        );
    }
    assert!(elapsed >= TEST_LIMIT * 2 - TOLERANCE, "finished too early: {elapsed:?}");
    assert!(elapsed < TEST_LIMIT * 2 + Duration::from_secs(2), "took too long: {elapsed:?}");

    assert!(service.queue().is_empty());
    let records = sink.wait_for(3, Duration::from_secs(1)).await;
    assert!(records.iter().all(|r| r.outcome == Outcome::Success));
    assert!(records.iter().all(|r| r.released_at.is_some()));
}

/// A request alone in an idle proxy is not delayed.
#[tokio::test]
async fn test_lone_request_is_not_delayed() {
    let (upstream_addr, _upstream) = MockUpstream::new().start().await;
    let (service, _sink) = proxy(test_config());

    let started = Instant::now();
    let (status, _) = read_body(
        service
            .handle_request(request_to(&target(upstream_addr, "/"), "A"))
            .await,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() < TEST_LIMIT, "waited {:?}", started.elapsed());
    assert_eq!(service.gate().releases(), 1);
}

/// While the head is in flight nobody else is released, even after the
/// spacing has elapsed.
#[tokio::test]
async fn test_head_in_flight_holds_followers() {
    let upstream_delay = TEST_LIMIT * 2;
    let (upstream_addr, upstream) = MockUpstream::new()
        .with_delay(upstream_delay)
        .start()
        .await;
    let (service, _sink) = proxy(test_config());

    let first = {
        let service = service.clone();
        let req = request_to(&target(upstream_addr, "/"), "A");
        tokio::spawn(async move { read_body(service.handle_request(req).await).await })
    };
    sleep(Duration::from_millis(10)).await;
    let second = {
        let service = service.clone();
        let req = request_to(&target(upstream_addr, "/"), "B");
        tokio::spawn(async move { read_body(service.handle_request(req).await).await })
    };

    first.await.unwrap();
    second.await.unwrap();

    let arrivals = upstream.arrivals().await;
    assert_eq!(arrivals.len(), 2);
    let gap = arrivals[1].at.duration_since(arrivals[0].at);
    assert!(
        gap + TOLERANCE >= upstream_delay,
        "B released after {gap:?} while A was still in flight"
    );
}

/// Request line, headers and body reach the target rewritten for it, and the
/// target's answer comes back verbatim.
#[tokio::test]
async fn test_request_and_response_are_relayed() {
    let (upstream_addr, upstream) = MockUpstream::new()
        .with_status(StatusCode::CREATED)
        .with_body("{\"id\":7}")
        .start()
        .await;
    let (service, sink) = proxy(test_config());

    let req = Request::post("/Leads?y=2")
        .header("host", "localhost:5000")
        .header("x-proxy-to", target(upstream_addr, "/crm/v2?x=1"))
        .header("authorization", "Zoho-oauthtoken secret")
        .header("content-type", "application/json")
        .body(Full::new(Bytes::from("{\"name\":\"lead\"}")))
        .unwrap();

    let response = service.handle_request(req).await;
    assert_eq!(response.headers()["x-mock"], "true");
    let (status, body) = read_body(response).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body, "{\"id\":7}");

    let arrivals = upstream.arrivals().await;
    assert_eq!(arrivals.len(), 1);
    let seen = &arrivals[0];
    assert_eq!(seen.method, "POST");
    assert_eq!(seen.uri.path(), "/crm/v2/Leads");
    assert_eq!(seen.uri.query(), Some("x=1&y=2"));
    assert_eq!(seen.headers["host"], upstream_addr.to_string());
    assert_eq!(seen.headers["authorization"], "Zoho-oauthtoken secret");
    assert!(seen.headers.get("x-proxy-to").is_none());
    assert_eq!(seen.body, "{\"name\":\"lead\"}");

    let records = sink.wait_for(1, Duration::from_secs(1)).await;
    let record = &records[0];
    assert_eq!(record.outcome, Outcome::Success);
    assert_eq!(record.request.method, "POST");
    assert_eq!(record.request.body, "{\"name\":\"lead\"}");
    let response = record.response.as_ref().unwrap();
    assert_eq!(response.status, 201);
    assert_eq!(response.body, "{\"id\":7}");
}

/// A target answering with an error status is still a relayed exchange.
#[tokio::test]
async fn test_target_error_status_is_relayed_verbatim() {
    let (upstream_addr, _upstream) = MockUpstream::new()
        .with_status(StatusCode::TOO_MANY_REQUESTS)
        .start()
        .await;
    let (service, sink) = proxy(test_config());

    let (status, _) = read_body(
        service
            .handle_request(request_to(&target(upstream_addr, "/"), "A"))
            .await,
    )
    .await;

    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let records = sink.wait_for(1, Duration::from_secs(1)).await;
    assert_eq!(records[0].outcome, Outcome::Success);
    assert_eq!(records[0].response.as_ref().unwrap().status, 429);
}

/// An unreachable target yields 502, one record, and a free queue.
#[tokio::test]
async fn test_unreachable_target_is_502() {
    let dead = helpers::mock_upstream::closed_port_addr().await;
    let (service, sink) = proxy(test_config());

    let (status, body) = read_body(
        service
            .handle_request(request_to(&target(dead, "/"), "A"))
            .await,
    )
    .await;

    assert_eq!(status, StatusCode::BAD_GATEWAY);
    assert_eq!(body, "There was an error proxying your request");
    assert!(service.queue().is_empty());

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::UpstreamError);
    assert!(records[0].response.is_none());
    assert!(records[0].error.is_some());
}

/// A caller that goes away, whether while queued or mid-response, frees its
/// slot so later requests proceed.
#[tokio::test]
async fn test_disconnected_callers_do_not_stall_the_queue() {
    let (upstream_addr, upstream) = MockUpstream::new().start().await;
    let (service, sink) = proxy(test_config());

    // A: response headers arrive, the body never finishes; A holds the head.
    let response = service
        .handle_request(request_to(&target(upstream_addr, "/stall"), "A"))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let mut a_body = response.into_body();
    let first = a_body.frame().await.unwrap().unwrap();
    assert_eq!(first.into_data().unwrap(), "partial");
    assert_eq!(service.queue().len(), 1);

    // B: queued behind A, then its caller disappears.
    let b_task = {
        let service = service.clone();
        let req = request_to(&target(upstream_addr, "/"), "B");
        tokio::spawn(async move { service.handle_request(req).await })
    };
    sleep(Duration::from_millis(50)).await;
    assert_eq!(service.queue().len(), 2);
    b_task.abort();
    assert!(b_task.await.unwrap_err().is_cancelled());
    assert_eq!(service.queue().len(), 1);

    // A's caller disconnects mid-body.
    drop(a_body);
    assert!(service.queue().is_empty());

    // C goes through within one spacing interval.
    let started = Instant::now();
    let (status, _) = timeout(
        TEST_LIMIT + Duration::from_secs(2),
        async {
            read_body(
                service
                    .handle_request(request_to(&target(upstream_addr, "/"), "C"))
                    .await,
            )
            .await
        },
    )
    .await
    .expect("queue stalled after disconnects");
    assert_eq!(status, StatusCode::OK);
    assert!(started.elapsed() <= TEST_LIMIT + Duration::from_secs(1));

    let order: Vec<_> = upstream.arrivals().await.iter().map(seq_of).collect();
    assert_eq!(order, ["A", "C"]);

    let records = sink.wait_for(3, Duration::from_secs(1)).await;
    let outcomes: Vec<_> = records.iter().map(|r| r.outcome).collect();
    assert_eq!(
        outcomes,
        [Outcome::InternalError, Outcome::InternalError, Outcome::Success]
    );
    assert_eq!(
        records[0].error.as_deref(),
        Some(pacegate::exchange::ABANDONED_MESSAGE)
    );
    assert_eq!(
        records[1].error.as_deref(),
        Some(pacegate::exchange_body::DISCONNECTED_MESSAGE)
    );
}

/// A target that stops sending mid-body is cut off by the idle timeout.
#[tokio::test]
async fn test_stalled_target_is_cut_off() {
    let (upstream_addr, _upstream) = MockUpstream::new().start().await;
    let config = ProxyConfig {
        upstream_idle_timeout: Duration::from_millis(200),
        ..test_config()
    };
    let (service, sink) = proxy(config);

    let response = service
        .handle_request(request_to(&target(upstream_addr, "/stall"), "A"))
        .await;
    let result = timeout(Duration::from_secs(5), response.into_body().collect())
        .await
        .expect("idle timeout did not fire");
    assert!(result.is_err());
    assert!(service.queue().is_empty());

    let records = sink.records();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].outcome, Outcome::UpstreamError);
    assert_eq!(records[0].response.as_ref().unwrap().body, "partial");
}
