/// Durable job queue with at-least-once delivery
///
/// Backed by the key-value store: payloads travel on a list, and a per-task
/// guard key provides the idempotency window. While a task with a given id is
/// in flight or retained, a second enqueue with the same id is a no-op. The
/// build id is used as the task id, so re-enqueueing an already-running build
/// is safe. Ordering across tasks is not guaranteed.
use crate::error::{NexusError, NexusResult};
use crate::kv::Kv;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Queue name for build jobs
pub const QUEUE_BUILDS: &str = "queue:builds";

/// Idempotency guard key prefix
const TASK_KEY_PREFIX: &str = "queue:task:";

/// Retention period for the idempotency window
const TASK_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Per-attempt handler timeout
const TASK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Retry backoff base
const RETRY_BASE: Duration = Duration::from_millis(100);

/// Maximum handler retries per delivery
const MAX_RETRIES: u32 = 3;

/// The job payload: the only contract between the build service (producer)
/// and the runner (consumer).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildJobPayload {
    pub build_id: String,
    pub project_id: String,
    pub repo_url: String,
    pub branch: String,
    pub commit_sha: String,
    pub build_command: String,
    pub start_command: String,
    pub preset: String,
    pub port: u16,
    pub secrets: HashMap<String, String>,
}

/// Handler interface for consuming build jobs
#[async_trait]
pub trait BuildJobHandler: Send + Sync {
    async fn handle(&self, payload: BuildJobPayload) -> NexusResult<()>;
}

/// Queue producer and consumer
#[derive(Clone)]
pub struct JobQueue {
    kv: Kv,
}

impl JobQueue {
    pub fn new(kv: Kv) -> Self {
        Self { kv }
    }

    /// Enqueue a build job keyed by build id. Returns false when the task is
    /// already in flight or retained (idempotent no-op).
    pub async fn enqueue_build_job(&self, payload: &BuildJobPayload) -> NexusResult<bool> {
        let guard_key = format!("{}{}", TASK_KEY_PREFIX, payload.build_id);
        let fresh = self.kv.set_nx_ex(&guard_key, "1", TASK_RETENTION).await?;
        if !fresh {
            info!(
                build_id = %payload.build_id,
                "Build job already enqueued, skipping"
            );
            return Ok(false);
        }

        let data = serde_json::to_string(payload)
            .map_err(|e| NexusError::Internal(format!("marshal payload: {}", e)))?;
        self.kv.lpush(QUEUE_BUILDS, &data).await?;

        info!(
            build_id = %payload.build_id,
            project_id = %payload.project_id,
            queue = QUEUE_BUILDS,
            "Build job enqueued"
        );
        Ok(true)
    }

    /// Start `concurrency` worker tasks consuming build jobs. Workers observe
    /// the shutdown signal at every await point and return promptly when it
    /// fires.
    pub fn consume(
        &self,
        handler: Arc<dyn BuildJobHandler>,
        concurrency: usize,
        shutdown: watch::Receiver<bool>,
    ) {
        info!(concurrency, "Starting build job consumers");
        for worker_id in 0..concurrency.max(1) {
            let queue = self.clone();
            let handler = Arc::clone(&handler);
            let shutdown = shutdown.clone();
            tokio::spawn(async move {
                queue.worker_loop(worker_id, handler, shutdown).await;
            });
        }
    }

    async fn worker_loop(
        &self,
        worker_id: usize,
        handler: Arc<dyn BuildJobHandler>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        loop {
            let popped = tokio::select! {
                res = self.kv.brpop(QUEUE_BUILDS, Duration::from_secs(2)) => res,
                _ = shutdown.changed() => {
                    info!(worker_id, "Queue worker shutting down");
                    return;
                }
            };

            let data = match popped {
                Ok(Some(data)) => data,
                Ok(None) => continue,
                Err(e) => {
                    error!(worker_id, error = %e, "Queue pop failed");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                    continue;
                }
            };

            let payload: BuildJobPayload = match serde_json::from_str(&data) {
                Ok(p) => p,
                Err(e) => {
                    error!(worker_id, error = %e, "Failed to parse build job payload");
                    continue;
                }
            };

            info!(
                worker_id,
                build_id = %payload.build_id,
                project_id = %payload.project_id,
                "Received build job"
            );

            self.run_with_retries(&payload, handler.as_ref(), &mut shutdown)
                .await;
        }
    }

    /// Run the handler, retrying with exponential backoff on failure or
    /// timeout. The cancellation signal aborts between attempts and
    /// interrupts the in-flight attempt.
    async fn run_with_retries(
        &self,
        payload: &BuildJobPayload,
        handler: &dyn BuildJobHandler,
        shutdown: &mut watch::Receiver<bool>,
    ) {
        let mut attempt: u32 = 0;
        loop {
            let fut = handler.handle(payload.clone());
            let result = tokio::select! {
                res = tokio::time::timeout(TASK_TIMEOUT, fut) => match res {
                    Ok(inner) => inner,
                    Err(_) => Err(NexusError::DeadlineExceeded("build job timed out".into())),
                },
                _ = shutdown.changed() => {
                    warn!(build_id = %payload.build_id, "Build job cancelled by shutdown");
                    return;
                }
            };

            match result {
                Ok(()) => {
                    info!(build_id = %payload.build_id, "Build job completed successfully");
                    return;
                }
                Err(e) => {
                    if attempt >= MAX_RETRIES {
                        error!(
                            build_id = %payload.build_id,
                            error = %e,
                            attempts = attempt + 1,
                            "Build job failed permanently"
                        );
                        return;
                    }
                    let backoff = RETRY_BASE * 2u32.pow(attempt);
                    warn!(
                        build_id = %payload.build_id,
                        error = %e,
                        attempt = attempt + 1,
                        backoff_ms = backoff.as_millis() as u64,
                        "Build job failed, retrying"
                    );
                    attempt += 1;
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = shutdown.changed() => return,
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_contract_field_names() {
        let payload = BuildJobPayload {
            build_id: "b".into(),
            project_id: "p".into(),
            repo_url: "https://github.com/u/r.git".into(),
            branch: "main".into(),
            commit_sha: "deadbeef".into(),
            build_command: "npm run build".into(),
            start_command: "npm start".into(),
            preset: "nodejs".into(),
            port: 3000,
            secrets: HashMap::from([("K".to_string(), "V".to_string())]),
        };
        let json = serde_json::to_value(&payload).unwrap();
        for field in [
            "build_id",
            "project_id",
            "repo_url",
            "branch",
            "commit_sha",
            "build_command",
            "start_command",
            "preset",
            "port",
            "secrets",
        ] {
            assert!(json.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_payload_round_trip() {
        let payload = BuildJobPayload {
            build_id: "abc".into(),
            port: 8080,
            ..Default::default()
        };
        let data = serde_json::to_string(&payload).unwrap();
        let parsed: BuildJobPayload = serde_json::from_str(&data).unwrap();
        assert_eq!(parsed.build_id, "abc");
        assert_eq!(parsed.port, 8080);
    }

    #[test]
    fn test_backoff_schedule() {
        assert_eq!(RETRY_BASE * 2u32.pow(0), Duration::from_millis(100));
        assert_eq!(RETRY_BASE * 2u32.pow(1), Duration::from_millis(200));
        assert_eq!(RETRY_BASE * 2u32.pow(2), Duration::from_millis(400));
    }
}
