/// Pub/sub bus for ephemeral log and event traffic
///
/// Publishing is fire-and-forget and lossy: a subscriber not currently
/// connected loses the message. The durable mirror lives in the build
/// service's log table. Channel naming is significant:
///
/// - `build_logs:{project_id}:{build_id}` — one line per message
/// - `build_events:{build_id}` — lifecycle milestones
/// - `project:{project_id}` — coarse fan-in, derived by the hub
use crate::error::NexusResult;
use crate::kv::Kv;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;
use uuid::Uuid;

pub const LOG_CHANNEL_PREFIX: &str = "build_logs:";
pub const EVENT_CHANNEL_PREFIX: &str = "build_events:";
pub const PROJECT_CHANNEL_PREFIX: &str = "project:";

/// A log line published to the live channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogMessage {
    pub build_id: String,
    pub timestamp: DateTime<Utc>,
    pub line: String,
    pub level: String, // info, warn, error
}

/// A build lifecycle event
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventMessage {
    pub build_id: String,
    pub event: String, // started, step_complete, completed
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub status: String,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Publishes logs and events onto the bus
#[derive(Clone)]
pub struct Publisher {
    kv: Kv,
}

impl Publisher {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    pub fn log_channel(project_id: &str, build_id: &str) -> String {
        format!("{}{}:{}", LOG_CHANNEL_PREFIX, project_id, build_id)
    }

    pub async fn publish_log(
        &self,
        project_id: &str,
        build_id: &str,
        line: &str,
        level: &str,
    ) -> NexusResult<()> {
        let msg = LogMessage {
            build_id: build_id.to_string(),
            timestamp: Utc::now(),
            line: line.to_string(),
            level: level.to_string(),
        };
        let payload = serde_json::to_string(&msg)
            .map_err(|e| crate::error::NexusError::Internal(format!("marshal log: {}", e)))?;
        self.kv
            .publish(&Self::log_channel(project_id, build_id), &payload)
            .await
    }

    pub async fn publish_event(&self, mut event: EventMessage) -> NexusResult<()> {
        event.timestamp = Utc::now();
        let channel = format!("{}{}", EVENT_CHANNEL_PREFIX, event.build_id);
        let payload = serde_json::to_string(&event)
            .map_err(|e| crate::error::NexusError::Internal(format!("marshal event: {}", e)))?;
        self.kv.publish(&channel, &payload).await
    }

    pub async fn publish_build_started(&self, build_id: &str) {
        let res = self
            .publish_event(EventMessage {
                build_id: build_id.to_string(),
                event: "started".to_string(),
                status: String::new(),
                message: "Build started".to_string(),
                timestamp: Utc::now(),
            })
            .await;
        if let Err(e) = res {
            warn!(build_id, error = %e, "Failed to publish build started event");
        }
    }

    pub async fn publish_step_complete(&self, build_id: &str, step: &str, status: &str) {
        let res = self
            .publish_event(EventMessage {
                build_id: build_id.to_string(),
                event: "step_complete".to_string(),
                status: status.to_string(),
                message: format!("Step '{}' completed with status: {}", step, status),
                timestamp: Utc::now(),
            })
            .await;
        if let Err(e) = res {
            warn!(build_id, step, error = %e, "Failed to publish step event");
        }
    }

    pub async fn publish_build_completed(&self, build_id: &str, status: &str, message: &str) {
        let res = self
            .publish_event(EventMessage {
                build_id: build_id.to_string(),
                event: "completed".to_string(),
                status: status.to_string(),
                message: message.to_string(),
                timestamp: Utc::now(),
            })
            .await;
        if let Err(e) = res {
            warn!(build_id, error = %e, "Failed to publish build completed event");
        }
    }
}

/// Durable sink for collected log batches
#[async_trait]
pub trait LogSink: Send + Sync {
    async fn append(&self, build_id: Uuid, lines: Vec<String>) -> NexusResult<()>;
}

/// Collects log lines for a single build
///
/// Every line is sanitised, published immediately to the live channel, and
/// accumulated into a batch that is handed to the durable sink when full.
/// Batch-flush failure never fails the build; live observers still see
/// everything, durable replay loses at most the unflushed tail.
pub struct LogCollector {
    publisher: Publisher,
    sink: Option<Arc<dyn LogSink>>,
    project_id: String,
    build_id: Uuid,
    batch: Vec<String>,
    batch_size: usize,
}

impl LogCollector {
    pub fn new(
        publisher: Publisher,
        sink: Option<Arc<dyn LogSink>>,
        project_id: &str,
        build_id: Uuid,
        batch_size: usize,
    ) -> Self {
        let batch_size = if batch_size == 0 { 10 } else { batch_size };
        Self {
            publisher,
            sink,
            project_id: project_id.to_string(),
            build_id,
            batch: Vec::with_capacity(batch_size),
            batch_size,
        }
    }

    /// Add a log line: publish live, batch for durable storage
    pub async fn add(&mut self, line: &str) {
        let line = sanitize_utf8(line);
        self.batch.push(line.clone());

        if let Err(e) = self
            .publisher
            .publish_log(&self.project_id, &self.build_id.to_string(), &line, "info")
            .await
        {
            warn!(build_id = %self.build_id, error = %e, "Failed to publish log line");
        }

        if self.batch.len() >= self.batch_size {
            self.flush_batch().await;
        }
    }

    /// Flush any remaining lines. Invoked on every pipeline exit path.
    pub async fn flush(&mut self) {
        self.flush_batch().await;
    }

    async fn flush_batch(&mut self) {
        if self.batch.is_empty() {
            return;
        }
        let Some(sink) = &self.sink else {
            self.batch.clear();
            return;
        };
        let lines = std::mem::take(&mut self.batch);
        if let Err(e) = sink.append(self.build_id, lines.clone()).await {
            warn!(build_id = %self.build_id, error = %e, "Failed to save log batch");
            // Put the batch back so a later flush can retry once more
            self.batch = lines;
        }
    }
}

/// Replace invalid UTF-8 in a byte-safe way. Inputs here are already Rust
/// strings, so this guards against embedded replacement characters and
/// control noise from container output.
pub fn sanitize_utf8(s: &str) -> String {
    String::from_utf8_lossy(s.as_bytes()).into_owned()
}

/// Lossy conversion for raw container output
pub fn sanitize_bytes(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_log_channel_format() {
        assert_eq!(
            Publisher::log_channel("proj-1", "build-2"),
            "build_logs:proj-1:build-2"
        );
    }

    #[test]
    fn test_sanitize_bytes_replaces_invalid() {
        let bytes = [b'o', b'k', 0xff, 0xfe, b'!'];
        let s = sanitize_bytes(&bytes);
        assert!(s.starts_with("ok"));
        assert!(s.ends_with('!'));
        assert!(s.contains('\u{FFFD}'));
    }

    #[test]
    fn test_event_message_serialization() {
        let event = EventMessage {
            build_id: "b1".to_string(),
            event: "step_complete".to_string(),
            status: "success".to_string(),
            message: String::new(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("step_complete"));
        // Empty message is omitted
        assert!(!json.contains("\"message\""));
    }
}
