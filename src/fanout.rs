//! Asynchronous fan-out calls.
//!
//! Each `async` entry on a location fires as its own task once the inbound
//! request reaches the response stage. Bodies are templates rendered with
//! the same transaction cache as the inbound response, so both sides of a
//! fan-out observe identical random values. Outcomes are logged and
//! counted; they never affect the inbound response.

use crate::config::Async;
use crate::observability;
use crate::random::TransactionCache;
use crate::template::{self, RequestInput};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Delay between retry attempts when the descriptor does not set one.
const DEFAULT_RETRY_DELAY_MS: u64 = 100;

/// Request-scoped context a fan-out call renders and resolves against.
#[derive(Clone)]
pub struct FanoutContext {
    /// Scheme of the inbound request, used to resolve relative paths.
    pub scheme: String,
    /// Host of the inbound request, used to resolve relative paths.
    pub host: String,
    /// Transaction id propagated as `X-Transaction-ID`.
    pub transaction_id: String,
    /// Inbound request data for body templating.
    pub input: RequestInput,
    /// Shared random cache for this transaction.
    pub cache: Arc<TransactionCache>,
}

/// Spawn every fan-out call of a location in template-declared order.
/// The calls themselves complete concurrently.
pub fn spawn_all(client: &reqwest::Client, calls: &[Async], ctx: &FanoutContext) {
    for call in calls {
        let client = client.clone();
        let call = call.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move {
            execute(client, call, ctx).await;
        });
    }
}

/// Run one fan-out call: resolve the URL, render the body, then attempt
/// `retries + 1` sends with a fixed delay between attempts.
async fn execute(client: reqwest::Client, call: Async, ctx: FanoutContext) {
    let Some(url) = resolve_url(&call, &ctx) else {
        error!("Fan-out entry has neither url nor path, skipping");
        return;
    };

    let method = if call.method.is_empty() {
        reqwest::Method::GET
    } else {
        match reqwest::Method::from_bytes(call.method.as_bytes()) {
            Ok(method) => method,
            Err(_) => {
                error!(method = %call.method, url = %url, "Invalid fan-out method");
                observability::record_fanout(&url, false);
                return;
            }
        }
    };

    let body = if call.body.is_empty() {
        Vec::new()
    } else {
        match template::render_bytes(&call.body, &ctx.input, &ctx.cache) {
            Ok(bytes) => bytes,
            Err(e) => {
                // Render failures fall back to sending the raw template.
                warn!(url = %url, error = %e, "Fan-out body template failed, sending raw body");
                call.body.clone().into_bytes()
            }
        }
    };

    let attempts = call.retries.unwrap_or(0) + 1;
    let retry_delay =
        Duration::from_millis(call.retry_delay.unwrap_or(DEFAULT_RETRY_DELAY_MS));

    let mut last_error = None;
    for attempt in 1..=attempts {
        let mut request = client.request(method.clone(), &url);

        if let Some(headers) = &call.headers {
            for (key, value) in headers {
                request = request.header(key, value);
            }
        }
        request = request.header("X-Transaction-ID", &ctx.transaction_id);
        if !body.is_empty() {
            let has_content_type = call
                .headers
                .as_ref()
                .map(|h| h.keys().any(|k| k.eq_ignore_ascii_case("content-type")))
                .unwrap_or(false);
            if !has_content_type {
                request = request.header("Content-Type", "application/json");
            }
            request = request.body(body.clone());
        }
        if let Some(timeout_ms) = call.timeout {
            request = request.timeout(Duration::from_millis(timeout_ms));
        }

        match request.send().await {
            Ok(response) => {
                info!(
                    url = %url,
                    method = %method,
                    status = response.status().as_u16(),
                    "Fan-out call completed"
                );
                observability::record_fanout(&url, true);
                return;
            }
            Err(e) => {
                if attempt < attempts {
                    warn!(
                        url = %url,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Fan-out call failed, retrying"
                    );
                    tokio::time::sleep(retry_delay).await;
                }
                last_error = Some(e);
            }
        }
    }

    if let Some(e) = last_error {
        error!(
            url = %url,
            method = %method,
            retries = attempts - 1,
            error = %e,
            "Fan-out call failed after retries"
        );
        observability::record_fanout(&url, false);
    }
}

/// Absolute `url` wins; otherwise `path` is bound to the inbound request's
/// scheme and host.
fn resolve_url(call: &Async, ctx: &FanoutContext) -> Option<String> {
    if !call.url.is_empty() {
        return Some(call.url.clone());
    }
    if !call.path.is_empty() {
        let host = if ctx.host.is_empty() {
            "localhost"
        } else {
            &ctx.host
        };
        debug!(path = %call.path, host, "Resolving relative fan-out path");
        return Some(format!("{}://{}{}", ctx.scheme, host, call.path));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::RandomCaches;

    fn ctx(host: &str) -> FanoutContext {
        FanoutContext {
            scheme: "http".to_string(),
            host: host.to_string(),
            transaction_id: "txn-1".to_string(),
            input: RequestInput::default(),
            cache: RandomCaches::new().get_or_create("txn-1"),
        }
    }

    #[tokio::test]
    async fn test_absolute_url_wins() {
        let call = Async {
            url: "http://upstream:9999/hook".to_string(),
            path: "/ignored".to_string(),
            ..Default::default()
        };
        assert_eq!(
            resolve_url(&call, &ctx("example.test")),
            Some("http://upstream:9999/hook".to_string())
        );
    }

    #[tokio::test]
    async fn test_relative_path_bound_to_request_host() {
        let call = Async {
            path: "/internal/notify".to_string(),
            ..Default::default()
        };
        assert_eq!(
            resolve_url(&call, &ctx("example.test:8080")),
            Some("http://example.test:8080/internal/notify".to_string())
        );
    }

    #[tokio::test]
    async fn test_missing_host_defaults_to_localhost() {
        let call = Async {
            path: "/notify".to_string(),
            ..Default::default()
        };
        assert_eq!(
            resolve_url(&call, &ctx("")),
            Some("http://localhost/notify".to_string())
        );
    }

    #[tokio::test]
    async fn test_no_target_resolves_to_none() {
        assert_eq!(resolve_url(&Async::default(), &ctx("h")), None);
    }
}
