//! Per-route request pipeline.
//!
//! Every matched route runs the same ordered stages: trace stamping and
//! in-flight accounting, chaos injection (possibly short-circuiting),
//! schema validation (possibly rejecting), response headers, fan-out
//! spawning, template rendering, response write, transaction capture, and
//! duration observation. The body is buffered exactly once so validation,
//! templating and capture all read the same bytes.

use crate::batcher::Batcher;
use crate::chaos::{ChaosEngine, ChaosOutcome};
use crate::config::Location;
use crate::fanout::{self, FanoutContext};
use crate::observability::{self, InFlightGuard};
use crate::random::RandomCaches;
use crate::schema::SchemaCache;
use crate::store::TransactionRecord;
use crate::template::{self, RequestInput};
use axum::body::Body;
use axum::extract::{Query, Request};
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode, Uri};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use chrono::Utc;
use serde_json::json;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Correlation header honored on ingress and emitted on responses.
pub const TRANSACTION_ID_HEADER: &str = "X-Transaction-ID";
/// Reception correlation header; synthesized when absent.
pub const RECEPTION_ID_HEADER: &str = "X-Recepcion-ID";
/// Sender correlation header; synthesized when absent.
pub const SENDER_ID_HEADER: &str = "X-Sender-ID";

/// Everything one route's handler needs, captured at listener build time.
/// Handlers hold an immutable snapshot of their location.
pub struct RouteState {
    pub location: Location,
    pub server_name: String,
    pub request_logging: bool,
    pub schemas: Arc<SchemaCache>,
    pub chaos: Arc<ChaosEngine>,
    pub caches: Arc<RandomCaches>,
    pub batcher: Arc<Batcher>,
    pub http_client: reqwest::Client,
}

/// The response the pipeline decided to send, tracked separately from the
/// `axum` response so capture can read the exact bytes written.
struct Reply {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl Reply {
    fn status_only(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Vec::new(),
        }
    }

    fn json(status: StatusCode, body: serde_json::Value) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
        Self {
            status,
            headers,
            body: body.to_string().into_bytes(),
        }
    }
}

/// Handle one request against its location snapshot.
pub async fn handle(state: Arc<RouteState>, req: Request) -> Response {
    let started = Instant::now();
    let location = &state.location;
    let method = location.method;
    let route_path = location.path.as_str();

    let trace_id = Uuid::new_v4();
    let _in_flight = InFlightGuard::new(method.as_str(), route_path);

    let (parts, body) = req.into_parts();
    let body_bytes = match axum::body::to_bytes(body, usize::MAX).await {
        Ok(bytes) => bytes.to_vec(),
        Err(e) => {
            warn!(%trace_id, error = %e, "Failed to read request body");
            Vec::new()
        }
    };

    let endpoint = parts.uri.path().to_string();
    let query = first_value_query(&parts.uri);
    let transaction_id = header_value(&parts.headers, TRANSACTION_ID_HEADER)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    if state.request_logging {
        debug!(
            server = %state.server_name,
            %trace_id,
            method = %method,
            path = %endpoint,
            "Handling request"
        );
    }

    // Chaos short-circuits skip straight to capture.
    if let Some(chaos) = &location.chaos_injection {
        match state.chaos.apply(chaos).await {
            ChaosOutcome::Pass => {}
            ChaosOutcome::Abort(code) => {
                warn!(server = %state.server_name, %trace_id, code, "Request aborted by chaos injection");
                observability::record_handler_error(method.as_str(), route_path, "chaos_aborted");
                let reply = Reply::status_only(status_from(code));
                return finish(&state, &parts.headers, &endpoint, &body_bytes, reply, started).await;
            }
            ChaosOutcome::Error { code, body } => {
                warn!(server = %state.server_name, %trace_id, code, "Error injected by chaos");
                observability::record_handler_error(method.as_str(), route_path, "chaos_error");
                let mut reply = Reply::status_only(status_from(code));
                reply.body = body.into_bytes();
                return finish(&state, &parts.headers, &endpoint, &body_bytes, reply, started).await;
            }
        }
    }

    // Schema validation rejects with a diagnostic 400.
    if state.schemas.contains(route_path, method) {
        if let Err(e) = state.schemas.validate(route_path, method, &body_bytes) {
            error!(server = %state.server_name, %trace_id, error = %e, "Schema validation failed");
            observability::record_handler_error(method.as_str(), route_path, "schema_validation");
            let reply = Reply::json(
                StatusCode::BAD_REQUEST,
                json!({ "error": format!("Schema validation failed: {e}") }),
            );
            return finish(&state, &parts.headers, &endpoint, &body_bytes, reply, started).await;
        }
    }

    // Configured response headers; Content-Type defaults to JSON only when
    // the location did not set its own.
    let mut headers = HeaderMap::new();
    if let Some(configured) = &location.headers {
        for (name, value) in configured {
            if let (Ok(name), Ok(value)) = (
                HeaderName::try_from(name.as_str()),
                HeaderValue::try_from(value.as_str()),
            ) {
                headers.insert(name, value);
            }
        }
    }
    if !location.response.is_empty() && !headers.contains_key(header::CONTENT_TYPE) {
        headers.insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("application/json"),
        );
    }
    if let Ok(value) = HeaderValue::try_from(transaction_id.as_str()) {
        headers.insert(HeaderName::from_static("x-transaction-id"), value);
    }

    let input = RequestInput {
        body: body_bytes.clone(),
        content_type: header_value(&parts.headers, header::CONTENT_TYPE.as_str()),
        query,
    };
    let cache = state.caches.get_or_create(&transaction_id);

    // Fan-out calls start in declared order and complete concurrently.
    if let Some(calls) = &location.asyncs {
        if !calls.is_empty() {
            let ctx = FanoutContext {
                scheme: "http".to_string(),
                host: header_value(&parts.headers, header::HOST.as_str()).unwrap_or_default(),
                transaction_id: transaction_id.clone(),
                input: input.clone(),
                cache: Arc::clone(&cache),
            };
            info!(
                server = %state.server_name,
                %trace_id,
                calls = calls.len(),
                "Starting fan-out calls"
            );
            fanout::spawn_all(&state.http_client, calls, &ctx);
        }
    }

    // Render the response template.
    let body = if location.response.is_empty() {
        Vec::new()
    } else {
        match template::render_bytes(&location.response, &input, &cache) {
            Ok(rendered) => rendered,
            Err(e) => {
                error!(server = %state.server_name, %trace_id, error = %e, "Error processing response template");
                observability::record_handler_error(method.as_str(), route_path, "template");
                let reply = Reply::json(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    json!({ "error": "Error processing response template" }),
                );
                return finish(&state, &parts.headers, &endpoint, &body_bytes, reply, started)
                    .await;
            }
        }
    };

    if state.request_logging {
        info!(
            server = %state.server_name,
            %trace_id,
            status = location.status_code,
            "Request completed"
        );
    }

    let reply = Reply {
        status: status_from(location.status_code),
        headers,
        body,
    };
    finish(&state, &parts.headers, &endpoint, &body_bytes, reply, started).await
}

/// Capture middleware for static-files mounts: the directory service
/// produces the response, and the transaction is still recorded.
pub async fn capture_static(state: Arc<RouteState>, req: Request, next: Next) -> Response {
    let started = Instant::now();
    let _in_flight = InFlightGuard::new(state.location.method.as_str(), &state.location.path);

    // Nesting strips the mount prefix from the request URI; the original
    // URI extension still carries the full path for the capture record.
    let endpoint = req
        .extensions()
        .get::<axum::extract::OriginalUri>()
        .map(|uri| uri.0.path().to_string())
        .unwrap_or_else(|| req.uri().path().to_string());
    let request_headers = req.headers().clone();
    let response = next.run(req).await;

    let record = TransactionRecord {
        uuid: Uuid::new_v4().to_string(),
        reception_id: header_value(&request_headers, RECEPTION_ID_HEADER)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        sender_id: header_value(&request_headers, SENDER_ID_HEADER)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        request_headers: headers_to_json(&request_headers),
        request_method: state.location.method.to_string(),
        request_endpoint: endpoint,
        request_body: Vec::new(),
        response_headers: headers_to_json(response.headers()),
        response_body: Vec::new(),
        response_status_code: response.status().as_u16(),
        timestamp: Utc::now(),
    };
    enqueue_capture(&state.batcher, record);

    observability::record_request(
        state.location.method.as_str(),
        &state.location.path,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}

/// Capture the transaction, observe the duration, and materialize the
/// response. Every pipeline exit funnels through here so each served
/// request produces exactly one record.
async fn finish(
    state: &Arc<RouteState>,
    request_headers: &HeaderMap,
    endpoint: &str,
    request_body: &[u8],
    reply: Reply,
    started: Instant,
) -> Response {
    let method = state.location.method;
    let status = reply.status.as_u16();

    let record = TransactionRecord {
        uuid: Uuid::new_v4().to_string(),
        reception_id: header_value(request_headers, RECEPTION_ID_HEADER)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        sender_id: header_value(request_headers, SENDER_ID_HEADER)
            .unwrap_or_else(|| Uuid::new_v4().to_string()),
        request_headers: headers_to_json(request_headers),
        request_method: method.to_string(),
        request_endpoint: endpoint.to_string(),
        // The exact bytes read and written, not a lossy re-encoding, so
        // deliberately malformed bodies survive into the store.
        request_body: request_body.to_vec(),
        response_headers: headers_to_json(&reply.headers),
        response_body: reply.body.clone(),
        response_status_code: status,
        timestamp: Utc::now(),
    };
    enqueue_capture(&state.batcher, record);

    observability::record_request(
        method.as_str(),
        &state.location.path,
        status,
        started.elapsed().as_secs_f64(),
    );

    let mut response = Response::builder().status(reply.status);
    if let Some(headers) = response.headers_mut() {
        headers.extend(reply.headers);
    }
    response
        .body(Body::from(reply.body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Hand the record to the batcher without blocking the response path.
fn enqueue_capture(batcher: &Arc<Batcher>, record: TransactionRecord) {
    let batcher = Arc::clone(batcher);
    let uuid = record.uuid.clone();
    tokio::spawn(async move {
        if let Err(e) = batcher.add(record).await {
            error!(%uuid, error = %e, "Failed to capture transaction");
        }
    });
}

fn status_from(code: u16) -> StatusCode {
    StatusCode::from_u16(code).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

/// First value of each query parameter.
fn first_value_query(uri: &Uri) -> HashMap<String, String> {
    let pairs: Vec<(String, String)> = Query::<Vec<(String, String)>>::try_from_uri(uri)
        .map(|Query(pairs)| pairs)
        .unwrap_or_default();

    let mut map = HashMap::new();
    for (key, value) in pairs {
        map.entry(key).or_insert(value);
    }
    map
}

/// Serialize a header map the way it is stored in the transaction record:
/// a JSON object of name → list of values.
fn headers_to_json(headers: &HeaderMap) -> String {
    let mut map: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in headers {
        map.entry(name.as_str().to_string())
            .or_default()
            .push(value.to_str().unwrap_or_default().to_string());
    }
    serde_json::to_string(&map).unwrap_or_else(|_| "{}".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_value_query_keeps_first_occurrence() {
        let uri: Uri = "/api/test?a=1&b=2&a=3".parse().unwrap();
        let query = first_value_query(&uri);
        assert_eq!(query.get("a"), Some(&"1".to_string()));
        assert_eq!(query.get("b"), Some(&"2".to_string()));
    }

    #[test]
    fn test_first_value_query_empty() {
        let uri: Uri = "/api/test".parse().unwrap();
        assert!(first_value_query(&uri).is_empty());
    }

    #[test]
    fn test_headers_to_json_groups_values() {
        let mut headers = HeaderMap::new();
        headers.append(header::ACCEPT, HeaderValue::from_static("text/plain"));
        headers.append(header::ACCEPT, HeaderValue::from_static("application/json"));

        let encoded = headers_to_json(&headers);
        let parsed: BTreeMap<String, Vec<String>> = serde_json::from_str(&encoded).unwrap();
        assert_eq!(parsed["accept"], vec!["text/plain", "application/json"]);
    }

    #[test]
    fn test_status_from_clamps_invalid_codes() {
        assert_eq!(status_from(204), StatusCode::NO_CONTENT);
        assert_eq!(status_from(0), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
