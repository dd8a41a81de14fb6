// End-to-end pipeline tests: interceptor -> engine -> mode policy ->
// forwarder -> event sink, with a scripted origin instead of sockets.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, Response, StatusCode, header};
use http_body_util::BodyExt;
use palisade::{
    adapters::{ProxyHandler, ProxyMode, RequestInterceptor},
    core::waf::RuleEngine,
    events::{CSV_HEADER, EventSink, SinkOptions},
    ports::http_client::{HttpClient, HttpClientError, HttpClientResult},
};

/// Scripted origin that records every forwarded request body and URI.
struct Origin {
    calls: Mutex<Vec<(String, Vec<u8>)>>,
    response_body: &'static str,
    fail: bool,
}

impl Origin {
    fn ok(response_body: &'static str) -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            response_body,
            fail: false,
        })
    }

    fn failing() -> Arc<Self> {
        Arc::new(Self {
            calls: Mutex::new(Vec::new()),
            response_body: "",
            fail: true,
        })
    }

    fn call_count(&self) -> usize {
        self.calls.lock().expect("lock").len()
    }

    fn forwarded_bodies(&self) -> Vec<Vec<u8>> {
        self.calls
            .lock()
            .expect("lock")
            .iter()
            .map(|(_, b)| b.clone())
            .collect()
    }
}

#[async_trait]
impl HttpClient for Origin {
    async fn send_request(&self, req: Request<Body>) -> HttpClientResult<Response<Body>> {
        let uri = req.uri().to_string();
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| HttpClientError::Unavailable(e.to_string()))?
            .to_bytes()
            .to_vec();
        self.calls.lock().expect("lock").push((uri, body));

        if self.fail {
            return Err(HttpClientError::Unavailable("connection refused".into()));
        }

        Ok(Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_LENGTH, self.response_body.len())
            .body(Body::from(self.response_body))
            .expect("response"))
    }
}

fn pipeline(origin: Arc<Origin>, mode: ProxyMode) -> (ProxyHandler, Arc<EventSink>) {
    let sink = Arc::new(
        EventSink::new(SinkOptions {
            max_events: 64,
            ..SinkOptions::default()
        })
        .expect("sink"),
    );
    let handler = ProxyHandler::new(
        Arc::new(RuleEngine::with_default_rules()),
        origin,
        sink.clone(),
        RequestInterceptor::new(1 << 20, Duration::from_secs(5)),
        "http://origin.test:3000",
        mode,
    );
    (handler, sink)
}

fn client_addr() -> Option<SocketAddr> {
    Some("198.51.100.7:55321".parse().expect("addr"))
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .method("GET")
        .uri(uri)
        .header(header::HOST, "waf.test")
        .body(Body::empty())
        .expect("request")
}

fn post(uri: &str, body: impl Into<Vec<u8>>) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header(header::HOST, "waf.test")
        .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(Body::from(body.into()))
        .expect("request")
}

async fn body_string(response: Response<Body>) -> String {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body")
        .to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

#[tokio::test]
async fn sqli_request_is_refused_with_fixed_body() {
    let origin = Origin::ok("hello");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let response = handler
        .handle_request(get("/?id=1%27%20OR%20%271%27%3D%271"), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(
        response.headers().get(header::CONTENT_TYPE).unwrap(),
        "text/plain"
    );
    assert_eq!(body_string(response).await, "Forbidden");

    // No upstream connection is opened for an enforced block.
    assert_eq!(origin.call_count(), 0);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(events[0].blocked);
    assert_eq!(events[0].rule_id, "1001");
    assert!(events[0].reason.starts_with("Rule 1001:"));
}

#[tokio::test]
async fn plus_encoded_sqli_is_refused() {
    // Spaces arrive as '+' under form encoding; the ARGS decoder must
    // still surface the SQLi token to rule 1001.
    let origin = Origin::ok("hello");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let response = handler
        .handle_request(get("/?id=1%27+OR+%271%27%3D%271"), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(origin.call_count(), 0);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].rule_id, "1001");
    assert!(events[0].blocked);
}

#[tokio::test]
async fn allowed_request_streams_origin_response_verbatim() {
    let origin = Origin::ok("origin says hi");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let response = handler
        .handle_request(get("/api/data"), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_string(response).await, "origin says hi");
    assert_eq!(origin.call_count(), 1);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].blocked);
    assert_eq!(events[0].rule_id, "");
    assert_eq!(events[0].status_code, 200);
}

#[tokio::test]
async fn dry_run_attempts_upstream_for_every_request() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::DryRun);

    // A request the engine would block, and one it would allow.
    handler
        .handle_request(get("/?x=%3Cscript%3Ealert(1)%3C%2Fscript%3E"), client_addr())
        .await
        .expect("handled");
    handler
        .handle_request(get("/healthy"), client_addr())
        .await
        .expect("handled");

    assert_eq!(origin.call_count(), 2);

    let events = sink.events();
    assert_eq!(events.len(), 2);
    let demoted = &events[0];
    assert!(!demoted.blocked);
    assert_eq!(demoted.reason, "Rule 1002: Cross-Site Scripting (XSS)");
    assert_eq!(demoted.status_code, 200);
}

#[tokio::test]
async fn engine_and_forwarder_see_identical_body_bytes() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let payload = "field=value&note=plain text body";
    handler
        .handle_request(post("/submit", payload), client_addr())
        .await
        .expect("handled");

    assert_eq!(origin.forwarded_bodies(), vec![payload.as_bytes().to_vec()]);

    let events = sink.events();
    assert_eq!(events[0].request_size, payload.len() as u64);
    assert_eq!(events[0].payload, payload);
}

#[tokio::test]
async fn body_phase_block_prevents_forwarding() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let response = handler
        .handle_request(post("/login", "user=admin' --"), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(origin.call_count(), 0);
    assert_eq!(sink.events()[0].rule_id, "1007");
}

#[tokio::test]
async fn high_entropy_body_is_logged_not_blocked() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    // Printable, token-free, high-entropy payload.
    let body: String = (0..512)
        .map(|i| char::from(b'0' + ((i * 37 + i / 64) % 64) as u8))
        .collect();
    let response = handler
        .handle_request(post("/upload", body.clone()), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(origin.call_count(), 1);

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert!(!events[0].blocked);
    assert_eq!(events[0].rule_id, "1006");
    assert_eq!(events[0].rule_action, "log");
    assert!(events[0].payload_entropy > 4.0);
}

#[tokio::test]
async fn upstream_failure_becomes_bad_gateway() {
    let origin = Origin::failing();
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let response = handler
        .handle_request(get("/api"), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
    assert_eq!(body_string(response).await, "Bad Gateway");

    let events = sink.events();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].status_code, 502);
}

#[tokio::test]
async fn exactly_one_event_per_request_across_outcomes() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    handler
        .handle_request(get("/clean"), client_addr())
        .await
        .expect("handled");
    handler
        .handle_request(get("/?id=1%27%20OR%201%3D1"), client_addr())
        .await
        .expect("handled");
    handler
        .handle_request(post("/data", "regular form body"), client_addr())
        .await
        .expect("handled");

    let stats = sink.statistics();
    assert_eq!(stats.total_events, 3);
    assert_eq!(stats.blocked_events, 1);
    assert_eq!(stats.allowed_events, 2);
}

#[tokio::test]
async fn csv_export_carries_the_contractual_header() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    handler
        .handle_request(get("/one"), client_addr())
        .await
        .expect("handled");

    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("events.csv");
    sink.export_csv(&path).expect("export");

    let contents = std::fs::read_to_string(&path).expect("readable");
    let mut lines = contents.lines();
    assert_eq!(
        lines.next(),
        Some("Timestamp,EventID,EventType,Severity,SourceIP,Method,URL,StatusCode,Blocked,RuleID,RuleName,Reason")
    );
    assert_eq!(lines.next().map(|l| l.contains("/one")), Some(true));
    assert_eq!(CSV_HEADER, contents.lines().next().unwrap());
}

#[tokio::test]
async fn path_traversal_is_blocked_in_the_uri_phase() {
    let origin = Origin::ok("ok");
    let (handler, sink) = pipeline(origin.clone(), ProxyMode::Enforce);

    let response = handler
        .handle_request(get("/files/..%2f..%2fetc/passwd"), client_addr())
        .await
        .expect("handled");

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    assert_eq!(sink.events()[0].rule_id, "1003");
    assert_eq!(origin.call_count(), 0);
}
