//! Request pipeline.
//!
//! Wraps every request except the configured skip list:
//!
//! - resolves the caller's principal from the bearer token,
//! - applies the rate limit to limited paths,
//! - times the request and writes `METHOD PATH - STATUS (Nms)` to the log,
//! - queues an audit entry for sensitive paths.
//!
//! Rejected requests still pass through timing and auditing.

use std::net::SocketAddr;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderMap, HeaderValue, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use loanflow_audit::{ACTOR_ANONYMOUS, AuditEntry};

use super::auth::resolve_principal;
use crate::error::{ApiError, ErrorDetail, with_stack};
use crate::state::AppState;

pub const HEADER_LIMIT: &str = "x-ratelimit-limit";
pub const HEADER_REMAINING: &str = "x-ratelimit-remaining";

const UNKNOWN_CLIENT: &str = "unknown";

pub async fn request_pipeline(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Response {
    let config = state.config();
    let path = req.uri().path().to_string();

    let principal = resolve_principal(req.headers(), &config.auth);
    if let Some(ref principal) = principal {
        req.extensions_mut().insert(principal.clone());
    }

    if config.audit.is_skipped(&path) {
        return next.run(req).await;
    }

    let started = Instant::now();
    let method = req.method().clone();
    let client = client_identity(&req, config.server.trust_forwarded_for);

    let mut response = if state.limiter().applies_to(&path) {
        limited(&state, &client, req, next).await
    } else {
        next.run(req).await
    };

    if !config.server.environment.is_production() {
        if let Some(detail) = response.extensions().get::<ErrorDetail>().cloned() {
            let headers = response.headers().clone();
            response = with_stack(response.status(), &detail);
            for (name, value) in headers.iter() {
                if name != header::CONTENT_TYPE && name != header::CONTENT_LENGTH {
                    response.headers_mut().insert(name.clone(), value.clone());
                }
            }
        }
    }

    let status = response.status().as_u16();
    let duration_ms = started.elapsed().as_millis() as u64;
    tracing::info!("{} {} - {} ({}ms)", method, path, status, duration_ms);

    if config.audit.is_sensitive(&path) {
        let actor = principal
            .as_ref()
            .map(|p| p.user_id.as_str())
            .unwrap_or(ACTOR_ANONYMOUS);
        state.outbox().submit_or_log(AuditEntry::request(
            actor,
            method.as_str(),
            &path,
            status,
            duration_ms,
            &client,
        ));
    }

    response
}

async fn limited(state: &AppState, client: &str, req: Request, next: Next) -> Response {
    let admission = match state.limiter().check(client).await {
        Ok(admission) => admission,
        Err(err) => {
            // Limiter storage trouble must not take the API down.
            tracing::warn!(client = %client, "Rate limit check failed, admitting request: {}", err);
            return next.run(req).await;
        }
    };

    let mut response = if admission.allowed {
        next.run(req).await
    } else {
        tracing::warn!(client = %client, retry_after = admission.retry_after_secs, "Rate limit exceeded");
        ApiError::RateLimited {
            retry_after_secs: admission.retry_after_secs,
        }
        .into_response()
    };

    let headers = response.headers_mut();
    headers.insert(HEADER_LIMIT, HeaderValue::from(admission.limit));
    headers.insert(HEADER_REMAINING, HeaderValue::from(admission.remaining));
    response
}

/// Client address used for rate limiting and audit metadata.
fn client_identity(req: &Request, trust_forwarded_for: bool) -> String {
    if trust_forwarded_for {
        if let Some(forwarded) = forwarded_for(req.headers()) {
            return forwarded;
        }
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_else(|| UNKNOWN_CLIENT.to_string())
}

fn forwarded_for(headers: &HeaderMap) -> Option<String> {
    let value = headers.get("x-forwarded-for")?.to_str().ok()?;
    let first = value.split(',').next()?.trim();
    (!first.is_empty()).then(|| first.to_string())
}
