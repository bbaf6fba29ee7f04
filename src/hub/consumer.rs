/// Pub/sub to WebSocket bridge
///
/// One subscriber task pattern-subscribes to the bus, normalises each
/// payload, and broadcasts twice: to the literal channel and to the derived
/// `project:{project_id}` channel for clients watching a project without
/// knowing build ids.
use super::Hub;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Patterns the hub consumes. `build_events:*` carries the lifecycle
/// channel from the runner alongside the generic `events:*` namespace.
const PATTERNS: [&str; 4] = [
    "build_logs:*",
    "deployment_logs:*",
    "build_events:*",
    "events:*",
];

/// Normalised message delivered to WebSocket clients
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct NotificationMessage {
    #[serde(rename = "type")]
    pub message_type: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub project_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub build_id: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub timestamp: String,
    pub message: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub level: String,
}

/// Run the bridge until shutdown. Reconnects with a delay on subscription
/// failure.
pub async fn run(client: redis::Client, hub: Hub, mut shutdown: watch::Receiver<bool>) {
    info!(patterns = ?PATTERNS, "Starting pub/sub consumer");

    loop {
        let mut pubsub = match client.get_async_pubsub().await {
            Ok(ps) => ps,
            Err(e) => {
                error!(error = %e, "Failed to open pub/sub connection");
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
                    _ = shutdown.changed() => return,
                }
            }
        };

        if let Err(e) = pubsub.psubscribe(&PATTERNS[..]).await {
            error!(error = %e, "Failed to subscribe to channels");
            tokio::select! {
                _ = tokio::time::sleep(Duration::from_secs(2)) => continue,
                _ = shutdown.changed() => return,
            }
        }

        info!("Subscribed to pub/sub channels");

        let mut stream = pubsub.on_message();
        loop {
            tokio::select! {
                msg = futures_util::StreamExt::next(&mut stream) => match msg {
                    Some(msg) => handle_message(&hub, &msg),
                    None => {
                        error!("Pub/sub stream closed, reconnecting");
                        break;
                    }
                },
                _ = shutdown.changed() => {
                    info!("Stopping pub/sub consumer");
                    return;
                }
            }
        }
    }
}

fn handle_message(hub: &Hub, msg: &redis::Msg) {
    let channel = msg.get_channel_name().to_string();
    let payload: String = match msg.get_payload() {
        Ok(p) => p,
        Err(e) => {
            debug!(channel = %channel, error = %e, "Unreadable pub/sub payload");
            return;
        }
    };

    crate::metrics::PUBSUB_MESSAGES_RECEIVED_TOTAL.inc();

    let normalised = normalize(&channel, &payload);
    let enriched = match serde_json::to_string(&normalised) {
        Ok(s) => s,
        Err(e) => {
            error!(error = %e, "Failed to marshal notification message");
            return;
        }
    };

    hub.broadcast(&channel, enriched.clone());
    if !normalised.project_id.is_empty() {
        let project_channel = format!("project:{}", normalised.project_id);
        hub.broadcast(&project_channel, enriched);
    }
}

/// Normalise a raw bus payload into the client message shape. Accepts
/// either `line` (runner log format) or `message` as the textual field, and
/// fills project/build ids from the channel name when the payload lacks
/// them.
pub fn normalize(channel: &str, payload: &str) -> NotificationMessage {
    let mut out = NotificationMessage::default();

    match serde_json::from_str::<serde_json::Value>(payload) {
        Err(_) => {
            // Not JSON: wrap as a raw message
            out.message = payload.to_string();
        }
        Ok(raw) => {
            out.message = raw
                .get("line")
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .or_else(|| raw.get("message").and_then(|v| v.as_str()))
                .map(|s| s.to_string())
                .unwrap_or_else(|| payload.to_string());

            if let Some(build_id) = raw.get("build_id").and_then(|v| v.as_str()) {
                out.build_id = build_id.to_string();
            }
            if let Some(ts) = raw.get("timestamp") {
                out.timestamp = match ts.as_str() {
                    Some(s) => s.to_string(),
                    None => ts.to_string(),
                };
            }
            if let Some(level) = raw.get("level").and_then(|v| v.as_str()) {
                out.level = level.to_string();
            }
            if let Some(project_id) = raw.get("project_id").and_then(|v| v.as_str()) {
                out.project_id = project_id.to_string();
            }
        }
    }

    if out.project_id.is_empty() {
        out.project_id = extract_project_id(channel);
    }
    if out.build_id.is_empty() {
        out.build_id = extract_build_id(channel);
    }
    out.message_type = message_type(channel).to_string();

    out
}

fn message_type(channel: &str) -> &'static str {
    if channel.starts_with("build_logs:") {
        "build_log"
    } else if channel.starts_with("deployment_logs:") {
        "deployment_log"
    } else if channel.starts_with("build_events:") || channel.starts_with("events:") {
        "event"
    } else {
        "unknown"
    }
}

/// `build_logs:{project_id}:{build_id}` / `deployment_logs:{project_id}`
fn extract_project_id(channel: &str) -> String {
    // Event channels carry a build id, not a project id, in position 1
    if channel.starts_with("build_events:") {
        return String::new();
    }
    channel.split(':').nth(1).unwrap_or_default().to_string()
}

fn extract_build_id(channel: &str) -> String {
    if let Some(build_id) = channel.strip_prefix("build_events:") {
        return build_id.to_string();
    }
    channel.split(':').nth(2).unwrap_or_default().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_runner_log_format() {
        let payload = r#"{"build_id":"b1","timestamp":"2026-01-01T00:00:00Z","line":"npm install ok","level":"info"}"#;
        let msg = normalize("build_logs:p1:b1", payload);
        assert_eq!(msg.message_type, "build_log");
        assert_eq!(msg.project_id, "p1");
        assert_eq!(msg.build_id, "b1");
        assert_eq!(msg.message, "npm install ok");
        assert_eq!(msg.level, "info");
    }

    #[test]
    fn test_normalize_accepts_message_field() {
        let payload = r#"{"message":"deployed","build_id":"b2"}"#;
        let msg = normalize("events:p9", payload);
        assert_eq!(msg.message, "deployed");
        assert_eq!(msg.message_type, "event");
        assert_eq!(msg.project_id, "p9");
        assert_eq!(msg.build_id, "b2");
    }

    #[test]
    fn test_normalize_non_json_payload() {
        let msg = normalize("deployment_logs:p3", "plain text line");
        assert_eq!(msg.message, "plain text line");
        assert_eq!(msg.message_type, "deployment_log");
        assert_eq!(msg.project_id, "p3");
    }

    #[test]
    fn test_normalize_build_events_channel() {
        let payload = r#"{"build_id":"b7","event":"completed","status":"success","message":"done"}"#;
        let msg = normalize("build_events:b7", payload);
        assert_eq!(msg.message_type, "event");
        assert_eq!(msg.build_id, "b7");
        // Event channels have no project segment
        assert_eq!(msg.project_id, "");
    }

    #[test]
    fn test_ids_from_payload_win_over_channel() {
        let payload = r#"{"project_id":"explicit","line":"x"}"#;
        let msg = normalize("build_logs:from-channel:b1", payload);
        assert_eq!(msg.project_id, "explicit");
    }

    #[test]
    fn test_serialized_shape() {
        let msg = normalize("build_logs:p:b", r#"{"line":"hello"}"#);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json.get("type").unwrap(), "build_log");
        assert_eq!(json.get("message").unwrap(), "hello");
        assert_eq!(json.get("project_id").unwrap(), "p");
        assert_eq!(json.get("build_id").unwrap(), "b");
    }
}
