/// WebSocket proxy from the edge to the notification hub
///
/// Registered on the outermost router, before the middleware stack: upgrade
/// hijacking is incompatible with wrapping response writers. The proxy
/// upgrades the client, dials the hub (translating http to ws and https to
/// wss, defaulting port 8080 when absent, stripping upgrade headers from the
/// forwarded set), then pumps frames both ways. Each direction carries a
/// 60-second read deadline rearmed on every frame; ping, pong, and close
/// frames are forwarded intact.
use crate::context::AppContext;
use axum::extract::ws::{CloseFrame, Message as AxumMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{RawQuery, State};
use axum::http::HeaderMap;
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::protocol::CloseFrame as TungCloseFrame;
use tokio_tungstenite::tungstenite::Message as TungMessage;
use tracing::{debug, info, warn};

const READ_DEADLINE: Duration = Duration::from_secs(60);
const HUB_WS_PATH: &str = "/internal/ws";

/// GET /ws
pub async fn websocket_proxy(
    ws: WebSocketUpgrade,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
    State(ctx): State<AppContext>,
) -> Response {
    let hub_url = ctx.config.service.hub_url.clone();
    ws.on_upgrade(move |socket| proxy_connection(socket, hub_url, query, headers))
}

async fn proxy_connection(
    client: WebSocket,
    hub_url: String,
    query: Option<String>,
    headers: HeaderMap,
) {
    let target = match hub_ws_url(&hub_url, query.as_deref()) {
        Ok(url) => url,
        Err(e) => {
            warn!(error = %e, "Invalid notification hub URL");
            return;
        }
    };

    info!(url = %target, "Connecting to notification hub");

    let mut request = match target.as_str().into_client_request() {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "Failed to build hub request");
            return;
        }
    };
    for (name, value) in forwardable_headers(&headers) {
        request.headers_mut().insert(name, value);
    }

    let (backend, _) = match tokio_tungstenite::connect_async(request).await {
        Ok(pair) => pair,
        Err(e) => {
            warn!(url = %target, error = %e, "Failed to connect to notification hub");
            return;
        }
    };

    debug!("WebSocket proxy connection established");

    let (mut client_tx, mut client_rx) = client.split();
    let (mut backend_tx, mut backend_rx) = backend.split();

    // Client -> hub
    let upstream = async {
        loop {
            let msg = match timeout(READ_DEADLINE, client_rx.next()).await {
                Err(_) => {
                    debug!("Client read deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Client WebSocket closed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            let forward = axum_to_tungstenite(msg);
            let is_close = matches!(forward, TungMessage::Close(_));
            if backend_tx.send(forward).await.is_err() || is_close {
                break;
            }
        }
    };

    // Hub -> client
    let downstream = async {
        loop {
            let msg = match timeout(READ_DEADLINE, backend_rx.next()).await {
                Err(_) => {
                    debug!("Hub read deadline expired");
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(error = %e, "Hub WebSocket closed");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            };
            let Some(forward) = tungstenite_to_axum(msg) else {
                continue;
            };
            let is_close = matches!(forward, AxumMessage::Close(_));
            if client_tx.send(forward).await.is_err() || is_close {
                break;
            }
        }
    };

    // Either side closing tears down the proxy
    tokio::select! {
        _ = upstream => {}
        _ = downstream => {}
    }

    debug!("WebSocket proxy connection closed");
}

/// Translate the hub's HTTP URL into the WebSocket endpoint URL
fn hub_ws_url(hub_url: &str, query: Option<&str>) -> Result<String, String> {
    let (scheme, rest) = if let Some(rest) = hub_url.strip_prefix("https://") {
        ("wss", rest)
    } else if let Some(rest) = hub_url.strip_prefix("http://") {
        ("ws", rest)
    } else if hub_url.starts_with("ws://") || hub_url.starts_with("wss://") {
        return Ok(append_path(hub_url, query));
    } else {
        return Err(format!("unsupported hub URL: {}", hub_url));
    };

    let host = rest.trim_end_matches('/');
    if host.is_empty() {
        return Err(format!("unsupported hub URL: {}", hub_url));
    }

    let host_with_port = if scheme == "ws" && !host.contains(':') {
        format!("{}:8080", host)
    } else {
        host.to_string()
    };

    Ok(append_path(
        &format!("{}://{}", scheme, host_with_port),
        query,
    ))
}

fn append_path(base: &str, query: Option<&str>) -> String {
    let mut url = format!("{}{}", base.trim_end_matches('/'), HUB_WS_PATH);
    if let Some(q) = query.filter(|q| !q.is_empty()) {
        url.push('?');
        url.push_str(q);
    }
    url
}

/// Headers safe to forward: everything except the upgrade machinery, which
/// the outbound client sets itself.
fn forwardable_headers(
    headers: &HeaderMap,
) -> impl Iterator<Item = (axum::http::HeaderName, axum::http::HeaderValue)> + '_ {
    headers.iter().filter_map(|(name, value)| {
        let lower = name.as_str().to_lowercase();
        if lower.starts_with("sec-websocket")
            || lower == "connection"
            || lower == "upgrade"
            || lower == "host"
        {
            None
        } else {
            Some((name.clone(), value.clone()))
        }
    })
}

fn axum_to_tungstenite(msg: AxumMessage) -> TungMessage {
    match msg {
        AxumMessage::Text(t) => TungMessage::Text(t),
        AxumMessage::Binary(b) => TungMessage::Binary(b),
        AxumMessage::Ping(p) => TungMessage::Ping(p),
        AxumMessage::Pong(p) => TungMessage::Pong(p),
        AxumMessage::Close(frame) => TungMessage::Close(frame.map(|f| TungCloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        })),
    }
}

fn tungstenite_to_axum(msg: TungMessage) -> Option<AxumMessage> {
    match msg {
        TungMessage::Text(t) => Some(AxumMessage::Text(t)),
        TungMessage::Binary(b) => Some(AxumMessage::Binary(b)),
        TungMessage::Ping(p) => Some(AxumMessage::Ping(p)),
        TungMessage::Pong(p) => Some(AxumMessage::Pong(p)),
        TungMessage::Close(frame) => Some(AxumMessage::Close(frame.map(|f| CloseFrame {
            code: f.code.into(),
            reason: f.reason.to_string().into(),
        }))),
        TungMessage::Frame(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hub_ws_url_scheme_translation() {
        assert_eq!(
            hub_ws_url("http://hub:9000", None).unwrap(),
            "ws://hub:9000/internal/ws"
        );
        assert_eq!(
            hub_ws_url("https://hub.example.com", None).unwrap(),
            "wss://hub.example.com/internal/ws"
        );
    }

    #[test]
    fn test_hub_ws_url_default_port() {
        assert_eq!(
            hub_ws_url("http://hub", None).unwrap(),
            "ws://hub:8080/internal/ws"
        );
    }

    #[test]
    fn test_hub_ws_url_forwards_query() {
        assert_eq!(
            hub_ws_url("http://hub:9000", Some("subscribe=a,b")).unwrap(),
            "ws://hub:9000/internal/ws?subscribe=a,b"
        );
    }

    #[test]
    fn test_hub_ws_url_rejects_garbage() {
        assert!(hub_ws_url("ftp://hub", None).is_err());
        assert!(hub_ws_url("http://", None).is_err());
    }

    #[test]
    fn test_forwardable_headers_strip_upgrade_set() {
        let mut headers = HeaderMap::new();
        headers.insert("sec-websocket-key", "k".parse().unwrap());
        headers.insert("connection", "Upgrade".parse().unwrap());
        headers.insert("upgrade", "websocket".parse().unwrap());
        headers.insert("host", "edge".parse().unwrap());
        headers.insert("authorization", "Bearer t".parse().unwrap());
        headers.insert("x-correlation-id", "c1".parse().unwrap());

        let names: Vec<String> = forwardable_headers(&headers)
            .map(|(n, _)| n.as_str().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"authorization".to_string()));
        assert!(names.contains(&"x-correlation-id".to_string()));
    }
}
