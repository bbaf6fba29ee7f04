/// Edge middleware: correlation ids, authentication, plan rate limiting
use crate::context::AppContext;
use crate::error::NexusError;
use crate::identity::models::{AuthUser, Plan};
use axum::{
    async_trait,
    extract::{ConnectInfo, FromRequestParts, Request, State},
    http::{request::Parts, HeaderMap, HeaderValue},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::SocketAddr;
use tracing::{info, warn};
use uuid::Uuid;

pub const CORRELATION_ID_HEADER: &str = "X-Correlation-ID";

/// Correlation id carried through the request
#[derive(Debug, Clone)]
pub struct CorrelationId(pub String);

/// Extract the bearer token from the Authorization header
pub fn extract_bearer_token(headers: &HeaderMap) -> Option<String> {
    headers
        .get("authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|s| s.to_string())
}

/// Correlation-id middleware: read the inbound header or mint a fresh id,
/// stash it in request extensions, and echo it on the response. Error
/// responses carry their `ErrorBody` as a response extension; the body is
/// rewritten here with the correlation id filled in.
pub async fn correlation_id(mut req: Request, next: Next) -> Response {
    let corr_id = req
        .headers()
        .get(CORRELATION_ID_HEADER)
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    info!(
        correlation_id = %corr_id,
        method = %req.method(),
        path = %req.uri().path(),
        "Incoming request"
    );

    req.extensions_mut().insert(CorrelationId(corr_id.clone()));

    let mut response = next.run(req).await;

    if let Some(mut body) = response.extensions_mut().remove::<crate::error::ErrorBody>() {
        body.correlation_id = corr_id.clone();
        response = (response.status(), axum::Json(body)).into_response();
    }

    if let Ok(value) = HeaderValue::from_str(&corr_id) {
        response.headers_mut().insert(CORRELATION_ID_HEADER, value);
    }
    response
}

/// Request metrics middleware
pub async fn track_metrics(req: Request, next: Next) -> Response {
    let method = req.method().to_string();
    let path = req.uri().path().to_string();
    let started = std::time::Instant::now();

    let response = next.run(req).await;

    crate::metrics::HTTP_REQUESTS_TOTAL
        .with_label_values(&[&method, &path, response.status().as_str()])
        .inc();
    crate::metrics::HTTP_REQUEST_DURATION_SECONDS
        .with_label_values(&[&method, &path])
        .observe(started.elapsed().as_secs_f64());

    response
}

/// Plan-based rate limiting. The key is the authenticated user id when a
/// valid bearer is present, else the client IP. A plan whose allowance is
/// zero is never limited.
pub async fn plan_rate_limit(
    State(ctx): State<AppContext>,
    req: Request,
    next: Next,
) -> Result<Response, NexusError> {
    let (key, plan) = match extract_bearer_token(req.headers()) {
        Some(token) => match ctx.identity.validate_token(&token).await {
            Ok(user) => (user.user_id.to_string(), user.plan),
            Err(_) => (client_ip(&req), Plan::Standard),
        },
        None => (client_ip(&req), Plan::Standard),
    };

    if !ctx.rate_limiter.allow(&key, plan) {
        warn!(key = %key, plan = plan.as_str(), "Rate limit exceeded");
        return Err(NexusError::RateLimitExceeded);
    }

    Ok(next.run(req).await)
}

/// Client IP: proxy headers first, then the socket address
fn client_ip(req: &Request) -> String {
    if let Some(ip) = req
        .headers()
        .get("x-forwarded-for")
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    if let Some(ip) = req
        .headers()
        .get("x-real-ip")
        .and_then(|h| h.to_str().ok())
        .filter(|s| !s.is_empty())
    {
        return ip.to_string();
    }
    req.extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Authenticated identity extractor for `/api/*` handlers. Missing or
/// invalid bearers reject with 401 before the handler runs.
#[async_trait]
impl FromRequestParts<AppContext> for AuthUser {
    type Rejection = NexusError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppContext,
    ) -> Result<Self, Self::Rejection> {
        let token = extract_bearer_token(&parts.headers)
            .ok_or_else(|| NexusError::Authentication("missing authorization header".to_string()))?;

        state.identity.validate_token(&token).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_bearer_token() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Bearer abc123".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), Some("abc123".to_string()));
    }

    #[test]
    fn test_extract_bearer_token_rejects_other_schemes() {
        let mut headers = HeaderMap::new();
        headers.insert("authorization", "Basic dXNlcjpwYXNz".parse().unwrap());
        assert_eq!(extract_bearer_token(&headers), None);

        let empty = HeaderMap::new();
        assert_eq!(extract_bearer_token(&empty), None);
    }
}
