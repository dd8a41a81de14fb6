//! The proxy request pipeline: intercept body, evaluate rules, apply the
//! mode policy, forward or refuse, and emit exactly one event.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body as AxumBody, Bytes};
use axum::http::{StatusCode, header};
use eyre::{Result, WrapErr};
use hyper::{Request, Response};
use tracing::Instrument;
use uuid::Uuid;

use crate::adapters::interceptor::RequestInterceptor;
use crate::adapters::prompt::OperatorPrompt;
use crate::core::waf::{Decision, Evaluation, RequestContext, RuleEngine, shannon_entropy};
use crate::events::{EVENT_TYPE_BLOCKED, EVENT_TYPE_REQUEST, Event, EventSink};
use crate::ports::http_client::HttpClient;
use crate::tracing_setup;

/// Bytes of the request body echoed into the event payload sample.
const PAYLOAD_SAMPLE_BYTES: usize = 256;

/// The proxy's operating mode. Modes are disjoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProxyMode {
    /// Block decisions refuse the request (default).
    Enforce,
    /// Everything is evaluated and recorded, nothing is refused.
    DryRun,
    /// Block decisions pause the request and ask the operator.
    Interactive,
}

impl ProxyMode {
    /// Resolve the mode from the runtime flags. Interactive takes
    /// precedence over dry-run when both are set.
    pub fn from_flags(dry_run: bool, interactive: bool) -> Self {
        if interactive {
            ProxyMode::Interactive
        } else if dry_run {
            ProxyMode::DryRun
        } else {
            ProxyMode::Enforce
        }
    }

    /// Get string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            ProxyMode::Enforce => "enforce",
            ProxyMode::DryRun => "dry-run",
            ProxyMode::Interactive => "interactive",
        }
    }
}

/// Drives one request through interceptor, engine, mode policy and
/// forwarder, then records the lifecycle event.
pub struct ProxyHandler {
    engine: Arc<RuleEngine>,
    http_client: Arc<dyn HttpClient>,
    sink: Arc<EventSink>,
    prompt: Arc<OperatorPrompt>,
    interceptor: RequestInterceptor,
    /// Origin base URL, scheme included, no trailing slash.
    origin: String,
    mode: ProxyMode,
}

impl ProxyHandler {
    pub fn new(
        engine: Arc<RuleEngine>,
        http_client: Arc<dyn HttpClient>,
        sink: Arc<EventSink>,
        interceptor: RequestInterceptor,
        origin: impl Into<String>,
        mode: ProxyMode,
    ) -> Self {
        let origin = origin.into().trim_end_matches('/').to_string();
        Self {
            engine,
            http_client,
            sink,
            prompt: Arc::new(OperatorPrompt::new()),
            interceptor,
            origin,
            mode,
        }
    }

    /// Handle one client request end to end. Exactly one event is emitted
    /// per call, after the decision is final, regardless of the upstream
    /// outcome.
    pub async fn handle_request(
        &self,
        req: Request<AxumBody>,
        client_addr: Option<SocketAddr>,
    ) -> Result<Response<AxumBody>> {
        let started = Instant::now();
        let request_id = Uuid::new_v4().to_string();

        let span = tracing_setup::create_request_span(
            req.method().as_str(),
            req.uri().path(),
            &request_id,
        );

        async {
            let (parts, body) = req.into_parts();

            // Buffer the body before any matcher runs so the engine and
            // the forwarder read identical bytes.
            let intercepted = self.interceptor.intercept(body).await;
            if let Some(fault) = &intercepted.fault {
                tracing::warn!(fault = %fault, "request body not buffered");
            }

            let ctx = RequestContext::new(
                parts.method.as_str(),
                parts.uri.to_string(),
                parts.headers.clone(),
                intercepted.bytes.clone(),
                client_addr,
            );

            let evaluation = self.engine.evaluate(&ctx);
            let refused = self.apply_mode_policy(&evaluation).await;

            let response = if refused {
                tracing::warn!(reason = %evaluation.reason, "request blocked");
                refusal_response()?
            } else {
                self.forward(parts, intercepted.bytes, client_addr).await
            };

            let status = response.status();
            tracing::Span::current().record("http.status_code", status.as_u16());

            let event = self.build_event(
                &ctx,
                &evaluation,
                refused,
                intercepted.fault.as_deref(),
                status,
                response_size(&response),
                started.elapsed().as_millis() as i64,
            );
            self.sink.log_event(event);

            Ok(response)
        }
        .instrument(span)
        .await
    }

    /// Translate the engine decision through the operating mode. Returns
    /// whether the request is refused.
    async fn apply_mode_policy(&self, evaluation: &Evaluation) -> bool {
        if evaluation.decision != Decision::Block {
            return false;
        }

        match self.mode {
            ProxyMode::Enforce => true,
            ProxyMode::DryRun => {
                tracing::info!(reason = %evaluation.reason, "dry-run: block demoted to observation");
                false
            }
            ProxyMode::Interactive => !self.prompt.authorize(&evaluation.reason).await,
        }
    }

    /// Rewrite the request onto the origin and stream the response back
    /// verbatim. Upstream failures surface as 502.
    async fn forward(
        &self,
        mut parts: hyper::http::request::Parts,
        body: Bytes,
        client_addr: Option<SocketAddr>,
    ) -> Response<AxumBody> {
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or("/");
        let target = format!("{}{}", self.origin, path_and_query);

        let target_uri = match target.parse::<hyper::Uri>() {
            Ok(uri) => uri,
            Err(e) => {
                tracing::error!(error = %e, target = %target, "origin URI rewrite failed");
                return bad_gateway();
            }
        };

        let original_host = parts
            .headers
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        parts.uri = target_uri;

        // Append rather than insert: a value set by an earlier proxy hop
        // is preserved.
        let headers = &mut parts.headers;
        if let Some(addr) = client_addr {
            if let Ok(value) = addr.ip().to_string().parse() {
                headers.append("X-Forwarded-For", value);
            }
        }
        headers.append(
            "X-Forwarded-Proto",
            header::HeaderValue::from_static("http"),
        );
        if !original_host.is_empty() {
            if let Ok(value) = original_host.parse() {
                headers.append("X-Forwarded-Host", value);
            }
        }

        let outgoing = Request::from_parts(parts, AxumBody::from(body));
        match self.http_client.send_request(outgoing).await {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(error = %e, "upstream forward failed");
                bad_gateway()
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn build_event(
        &self,
        ctx: &RequestContext,
        evaluation: &Evaluation,
        refused: bool,
        body_fault: Option<&str>,
        status: StatusCode,
        response_size: u64,
        response_time_ms: i64,
    ) -> Event {
        let mut metadata: HashMap<String, serde_json::Value> = HashMap::new();
        if !evaluation.faults.is_empty() {
            metadata.insert(
                "faults".to_string(),
                serde_json::Value::from(evaluation.faults.clone()),
            );
        }
        if let Some(fault) = body_fault {
            metadata.insert("body_fault".to_string(), serde_json::Value::from(fault));
        }
        if evaluation.decision == Decision::Block && !refused {
            metadata.insert(
                "mode".to_string(),
                serde_json::Value::from(self.mode.as_str()),
            );
        }

        let blocked_decision = evaluation.decision == Decision::Block;
        let (headers, query_params) = if blocked_decision {
            (header_map(ctx), query_map(ctx))
        } else {
            (HashMap::new(), HashMap::new())
        };

        let (payload, payload_entropy) = if ctx.body.is_empty() {
            (String::new(), 0.0)
        } else {
            let body = ctx.body_str();
            let sample: String = body.chars().take(PAYLOAD_SAMPLE_BYTES).collect();
            (sample, shannon_entropy(&body))
        };

        let (rule_id, rule_name, rule_action, severity) = match &evaluation.matched {
            Some(m) => (
                m.id.to_string(),
                m.name.clone(),
                m.action.as_str().to_string(),
                m.severity.as_str().to_string(),
            ),
            None => Default::default(),
        };

        Event {
            timestamp: Some(ctx.received_at),
            event_type: if refused {
                EVENT_TYPE_BLOCKED.to_string()
            } else {
                EVENT_TYPE_REQUEST.to_string()
            },
            severity,
            source_ip: ctx
                .remote_addr
                .map(|a| a.ip().to_string())
                .unwrap_or_default(),
            method: ctx.method.clone(),
            url: ctx.uri.clone(),
            user_agent: header_value(ctx, header::USER_AGENT.as_str()),
            content_type: header_value(ctx, header::CONTENT_TYPE.as_str()),
            request_size: ctx.body.len() as u64,
            response_size,
            status_code: status.as_u16(),
            rule_id,
            rule_name,
            rule_action,
            blocked: refused,
            reason: evaluation.reason.clone(),
            payload,
            payload_entropy,
            headers,
            query_params,
            metadata,
            response_time_ms,
            // event_id assigned by the sink
            ..Event::default()
        }
    }
}

/// Fixed refusal response: 403, `text/plain`, body `Forbidden`.
fn refusal_response() -> Result<Response<AxumBody>> {
    const BODY: &str = "Forbidden";
    Response::builder()
        .status(StatusCode::FORBIDDEN)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, BODY.len())
        .body(AxumBody::from(BODY))
        .wrap_err("failed to build refusal response")
}

/// Fixed upstream-failure response: 502, body `Bad Gateway`.
fn bad_gateway() -> Response<AxumBody> {
    const BODY: &str = "Bad Gateway";
    Response::builder()
        .status(StatusCode::BAD_GATEWAY)
        .header(header::CONTENT_TYPE, "text/plain")
        .header(header::CONTENT_LENGTH, BODY.len())
        .body(AxumBody::from(BODY))
        .unwrap_or_else(|_| Response::new(AxumBody::from(BODY)))
}

fn response_size(response: &Response<AxumBody>) -> u64 {
    response
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}

fn header_value(ctx: &RequestContext, name: &str) -> String {
    ctx.headers
        .get(name)
        .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
        .unwrap_or_default()
}

fn header_map(ctx: &RequestContext) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (name, value) in ctx.headers.iter() {
        map.entry(name.as_str().to_string())
            .or_insert_with(|| String::from_utf8_lossy(value.as_bytes()).into_owned());
    }
    map
}

fn query_map(ctx: &RequestContext) -> HashMap<String, String> {
    let mut map = HashMap::new();
    for (key, value) in ctx.query_pairs() {
        map.entry(key).or_insert(value);
    }
    map
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;

    use super::*;
    use crate::ports::http_client::{HttpClientError, HttpClientResult};

    /// Scripted origin: records forwarded requests, returns a canned
    /// response or an error.
    struct ScriptedOrigin {
        forwarded: Mutex<Vec<String>>,
        fail: bool,
    }

    impl ScriptedOrigin {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                forwarded: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn forwarded_uris(&self) -> Vec<String> {
            self.forwarded.lock().expect("lock").clone()
        }
    }

    #[async_trait]
    impl HttpClient for ScriptedOrigin {
        async fn send_request(
            &self,
            req: Request<AxumBody>,
        ) -> HttpClientResult<Response<AxumBody>> {
            self.forwarded
                .lock()
                .expect("lock")
                .push(req.uri().to_string());

            if self.fail {
                return Err(HttpClientError::Unavailable("connection refused".into()));
            }

            Ok(Response::builder()
                .status(StatusCode::OK)
                .header(header::CONTENT_LENGTH, 2)
                .body(AxumBody::from("ok"))
                .expect("response"))
        }
    }

    fn handler(origin: Arc<ScriptedOrigin>, mode: ProxyMode) -> (ProxyHandler, Arc<EventSink>) {
        let sink = Arc::new(EventSink::in_memory(64));
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

    fn request(uri: &str, body: &str) -> Request<AxumBody> {
        Request::builder()
            .method(if body.is_empty() { "GET" } else { "POST" })
            .uri(uri)
            .header(header::HOST, "waf.test")
            .body(AxumBody::from(body.to_string()))
            .expect("request")
    }

    fn client() -> Option<SocketAddr> {
        Some("203.0.113.9:4242".parse().expect("addr"))
    }

    #[tokio::test]
    async fn enforce_mode_blocks_without_touching_upstream() {
        let origin = ScriptedOrigin::new(false);
        let (handler, sink) = handler(origin.clone(), ProxyMode::Enforce);

        let response = handler
            .handle_request(request("/?id=1%27%20OR%20%271%27%3D%271", ""), client())
            .await
            .expect("handled");

        assert_eq!(response.status(), StatusCode::FORBIDDEN);
        assert!(origin.forwarded_uris().is_empty());

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(event.blocked);
        assert_eq!(event.rule_id, "1001");
        assert!(event.reason.starts_with("Rule 1001:"));
        assert_eq!(event.status_code, 403);
        assert_eq!(event.event_type, "blocked");
        assert_eq!(event.source_ip, "203.0.113.9");
    }

    #[tokio::test]
    async fn allowed_request_passes_through_verbatim() {
        let origin = ScriptedOrigin::new(false);
        let (handler, sink) = handler(origin.clone(), ProxyMode::Enforce);

        let response = handler
            .handle_request(request("/api/data", ""), client())
            .await
            .expect("handled");

        assert_eq!(response.status(), StatusCode::OK);
        let uris = origin.forwarded_uris();
        assert_eq!(uris, vec!["http://origin.test:3000/api/data".to_string()]);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert!(!events[0].blocked);
        assert_eq!(events[0].rule_id, "");
        assert_eq!(events[0].status_code, 200);
    }

    #[tokio::test]
    async fn dry_run_forwards_blocked_requests_but_keeps_the_reason() {
        let origin = ScriptedOrigin::new(false);
        let (handler, sink) = handler(origin.clone(), ProxyMode::DryRun);

        let response = handler
            .handle_request(
                request("/?x=%3Cscript%3Ealert(1)%3C%2Fscript%3E", ""),
                client(),
            )
            .await
            .expect("handled");

        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(origin.forwarded_uris().len(), 1);

        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(!event.blocked);
        assert_eq!(event.reason, "Rule 1002: Cross-Site Scripting (XSS)");
        assert_eq!(event.metadata.get("mode").and_then(|v| v.as_str()), Some("dry-run"));
    }

    #[tokio::test]
    async fn entropy_log_rule_annotates_without_blocking() {
        let origin = ScriptedOrigin::new(false);
        let (handler, sink) = handler(origin.clone(), ProxyMode::Enforce);

        // 64 distinct bytes: 6 bits of entropy, no attack tokens.
        let body: String = (b'0'..b'0' + 64).map(char::from).collect();
        let response = handler
            .handle_request(request("/upload", &body), client())
            .await
            .expect("handled");

        assert_eq!(response.status(), StatusCode::OK);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        let event = &events[0];
        assert!(!event.blocked);
        assert_eq!(event.rule_id, "1006");
        assert_eq!(event.rule_action, "log");
        assert!(event.payload_entropy > 4.5);
        assert_eq!(event.status_code, 200);
    }

    #[tokio::test]
    async fn upstream_failure_surfaces_as_bad_gateway() {
        let origin = ScriptedOrigin::new(true);
        let (handler, sink) = handler(origin.clone(), ProxyMode::Enforce);

        let response = handler
            .handle_request(request("/api/data", ""), client())
            .await
            .expect("handled");

        assert_eq!(response.status(), StatusCode::BAD_GATEWAY);
        let events = sink.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].status_code, 502);
        assert!(!events[0].blocked);
    }

    #[tokio::test]
    async fn forwarded_headers_are_augmented() {
        struct CapturingOrigin {
            headers: Mutex<Option<hyper::HeaderMap>>,
        }

        #[async_trait]
        impl HttpClient for CapturingOrigin {
            async fn send_request(
                &self,
                req: Request<AxumBody>,
            ) -> HttpClientResult<Response<AxumBody>> {
                *self.headers.lock().expect("lock") = Some(req.headers().clone());
                Ok(Response::new(AxumBody::empty()))
            }
        }

        let origin = Arc::new(CapturingOrigin {
            headers: Mutex::new(None),
        });
        let sink = Arc::new(EventSink::in_memory(8));
        let handler = ProxyHandler::new(
            Arc::new(RuleEngine::with_default_rules()),
            origin.clone(),
            sink,
            RequestInterceptor::new(1 << 20, Duration::from_secs(5)),
            "http://origin.test:3000/",
            ProxyMode::Enforce,
        );

        handler
            .handle_request(request("/api", ""), client())
            .await
            .expect("handled");

        let headers = origin.headers.lock().expect("lock").clone().expect("captured");
        assert_eq!(headers.get("X-Forwarded-For").unwrap(), "203.0.113.9");
        assert_eq!(headers.get("X-Forwarded-Proto").unwrap(), "http");
        assert_eq!(headers.get("X-Forwarded-Host").unwrap(), "waf.test");

        // A value set by an earlier hop in a proxy chain is preserved, the
        // new one appended after it.
        let mut chained = request("/api", "");
        chained
            .headers_mut()
            .insert("X-Forwarded-For", "192.0.2.1".parse().expect("valid header"));
        handler
            .handle_request(chained, client())
            .await
            .expect("handled");

        let headers = origin.headers.lock().expect("lock").clone().expect("captured");
        let forwarded_for: Vec<String> = headers
            .get_all("X-Forwarded-For")
            .iter()
            .map(|v| String::from_utf8_lossy(v.as_bytes()).into_owned())
            .collect();
        assert_eq!(forwarded_for, vec!["192.0.2.1", "203.0.113.9"]);
    }
}
