/// HTTP server setup and routing
use crate::context::AppContext;
use crate::error::{ErrorBody, NexusError, NexusResult};
use crate::{api, hub, metrics};
use axum::{
    http::{header, HeaderValue, Method, StatusCode},
    middleware,
    response::{IntoResponse, Json, Response},
    routing::get,
    Router,
};
use serde_json::json;
use std::net::SocketAddr;
use tower_http::{
    catch_panic::CatchPanicLayer,
    compression::CompressionLayer,
    cors::{AllowOrigin, Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};

/// Build the full application router
pub fn build_router(ctx: AppContext) -> Router {
    let cors = build_cors_layer(&ctx.config.cors.allowed_origins);

    // WebSocket endpoints bypass the middleware stack: upgrade hijacking is
    // incompatible with wrapping response writers.
    let ws_routes = Router::new()
        .route("/ws", get(api::ws_proxy::websocket_proxy))
        .with_state(ctx.clone());
    let hub_routes = Router::new()
        .route("/internal/ws", get(hub::handler::hub_websocket))
        .with_state(ctx.hub.clone());

    // Outermost first: correlation id -> panic recovery -> metrics -> CORS
    // -> plan rate limit -> handlers
    let api_routes = api::routes()
        .with_state(ctx.clone())
        .layer(middleware::from_fn_with_state(
            ctx.clone(),
            api::middleware::plan_rate_limit,
        ))
        .layer(cors)
        .layer(middleware::from_fn(api::middleware::track_metrics))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(middleware::from_fn(api::middleware::correlation_id));

    Router::new()
        .merge(ws_routes)
        .merge(hub_routes)
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/metrics", get(metrics_endpoint))
        .merge(api_routes)
        .layer(CompressionLayer::new())
        .layer(TraceLayer::new_for_http())
        .fallback(not_found)
}

/// CORS: empty allow-list falls back to `*`; entries support exact matches
/// and a single `*` wildcard per pattern.
fn build_cors_layer(allowed_origins: &[String]) -> CorsLayer {
    let base = CorsLayer::new()
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([
            header::CONTENT_TYPE,
            header::AUTHORIZATION,
            header::HeaderName::from_static("x-correlation-id"),
        ])
        .expose_headers([header::HeaderName::from_static("x-correlation-id")]);

    if allowed_origins.is_empty() {
        return base.allow_origin(Any);
    }

    let patterns = allowed_origins.to_vec();
    base.allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _| {
        let Ok(origin) = origin.to_str() else {
            return false;
        };
        patterns.iter().any(|p| matches_origin(origin, p))
    }))
}

/// Exact match, or a single-`*` wildcard pattern like `https://*.example.com`
pub fn matches_origin(origin: &str, pattern: &str) -> bool {
    if origin == pattern {
        return true;
    }
    if let Some((prefix, suffix)) = pattern.split_once('*') {
        if !suffix.contains('*') {
            return origin.starts_with(prefix)
                && origin.ends_with(suffix)
                && origin.len() >= prefix.len() + suffix.len();
        }
    }
    false
}

/// Panic recovery: a handler panic becomes the structured error body. The
/// `ErrorBody` extension lets the correlation-id middleware fill in the
/// request's id, like any other error response.
fn handle_panic(err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let detail = if let Some(s) = err.downcast_ref::<String>() {
        s.as_str()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s
    } else {
        "unknown panic"
    };
    error!(panic = detail, "Panic recovered");

    let body = ErrorBody {
        error: "Internal Server Error".to_string(),
        message: "Internal server error".to_string(),
        correlation_id: String::new(),
        code: "INTERNAL_ERROR".to_string(),
    };
    let mut response =
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body.clone())).into_response();
    response.extensions_mut().insert(body);
    response
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

async fn ready() -> &'static str {
    "READY"
}

async fn metrics_endpoint() -> String {
    metrics::gather()
}

async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(json!({
            "error": "Not Found",
            "message": "Endpoint not found",
            "code": "NOT_FOUND",
        })),
    )
}

/// Start the HTTP server
pub async fn serve(ctx: AppContext) -> NexusResult<()> {
    let addr = format!(
        "{}:{}",
        ctx.config.service.host, ctx.config.service.port
    );

    info!(addr = %addr, "Nexus Deploy listening");

    let app = build_router(ctx);

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .map_err(|e| NexusError::Internal(format!("Failed to bind to {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .map_err(|e| NexusError::Internal(format!("Server error: {}", e)))?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_matches_origin_exact() {
        assert!(matches_origin("https://app.example.com", "https://app.example.com"));
        assert!(!matches_origin("https://evil.com", "https://app.example.com"));
    }

    #[test]
    fn test_matches_origin_wildcard() {
        assert!(matches_origin(
            "https://staging.example.com",
            "https://*.example.com"
        ));
        assert!(!matches_origin("https://example.org", "https://*.example.com"));
        // The wildcard must actually consume something sensible
        assert!(!matches_origin("https://", "https://*.example.com"));
    }

    #[test]
    fn test_matches_origin_single_wildcard_only() {
        assert!(!matches_origin("https://a.b.example.com", "https://*.*.com"));
    }
}
