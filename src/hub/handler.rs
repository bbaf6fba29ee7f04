/// WebSocket endpoint for the notification hub
///
/// Each connection gets two tasks: a reader that parses subscribe /
/// unsubscribe frames and ACKs them, and a writer that drains the bounded
/// outbound buffer and pings every 54 seconds.
use super::{Hub, CLIENT_BUFFER_SIZE};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

/// Ping cadence on the writer side
const PING_INTERVAL: Duration = Duration::from_secs(54);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

/// Subscribe/unsubscribe frame from the client
#[derive(Debug, Deserialize)]
struct SubscribeFrame {
    action: String,
    channel: String,
}

#[derive(Debug, Deserialize)]
pub struct WsParams {
    /// Comma-separated channels to subscribe on connect
    #[serde(default)]
    pub subscribe: String,
}

/// Upgrade handler for the hub's own WebSocket endpoint
pub async fn hub_websocket(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(hub): State<Hub>,
) -> Response {
    ws.on_upgrade(move |socket| handle_connection(socket, params, hub))
}

async fn handle_connection(socket: WebSocket, params: WsParams, hub: Hub) {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (outbound_tx, outbound_rx) = mpsc::channel::<String>(CLIENT_BUFFER_SIZE);

    hub.register(conn_id, outbound_tx.clone());
    info!(conn_id, "WebSocket client connected");

    // Pre-subscriptions from the query string, ACKed like frame-driven ones
    for channel in params.subscribe.split(',').filter(|c| !c.is_empty()) {
        hub.subscribe(conn_id, channel);
        send_ack(&outbound_tx, "subscribed", channel);
    }

    let (sender, receiver) = socket.split();

    let writer = tokio::spawn(write_pump(sender, outbound_rx));
    read_pump(receiver, conn_id, &hub, &outbound_tx).await;

    hub.unregister(conn_id);
    writer.abort();
    info!(conn_id, "WebSocket client disconnected");
}

async fn read_pump(
    mut receiver: futures_util::stream::SplitStream<WebSocket>,
    conn_id: u64,
    hub: &Hub,
    outbound: &mpsc::Sender<String>,
) {
    while let Some(msg) = receiver.next().await {
        let msg = match msg {
            Ok(m) => m,
            Err(e) => {
                debug!(conn_id, error = %e, "WebSocket read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let frame: SubscribeFrame = match serde_json::from_str(&text) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!(conn_id, error = %e, "Invalid WebSocket message format");
                        continue;
                    }
                };
                match frame.action.as_str() {
                    "subscribe" => {
                        hub.subscribe(conn_id, &frame.channel);
                        send_ack(outbound, "subscribed", &frame.channel);
                    }
                    "unsubscribe" => {
                        hub.unsubscribe(conn_id, &frame.channel);
                        send_ack(outbound, "unsubscribed", &frame.channel);
                    }
                    other => {
                        warn!(conn_id, action = other, "Unknown WebSocket action");
                    }
                }
            }
            Message::Close(_) => {
                debug!(conn_id, "Client closed connection");
                break;
            }
            _ => {}
        }
    }
}

async fn write_pump(
    mut sender: futures_util::stream::SplitSink<WebSocket, Message>,
    mut outbound: mpsc::Receiver<String>,
) {
    let mut ping = interval(PING_INTERVAL);
    ping.tick().await; // first tick fires immediately

    loop {
        tokio::select! {
            msg = outbound.recv() => match msg {
                Some(text) => {
                    if sender.send(Message::Text(text)).await.is_err() {
                        return;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    return;
                }
            },
            _ = ping.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    return;
                }
            }
        }
    }
}

fn send_ack(outbound: &mpsc::Sender<String>, status: &str, channel: &str) {
    let ack = serde_json::json!({
        "type": "ack",
        "status": status,
        "channel": channel,
    });
    // Buffer full: skip the ack, same policy as payloads
    let _ = outbound.try_send(ack.to_string());
}
