/// Build service: persists builds, steps, and logs; bridges to the queue
///
/// State transitions are validated inside a transaction so competing
/// updaters observe the rejected edge. Log appends replace invalid UTF-8
/// rather than rejecting it.
pub mod models;

use crate::error::{NexusError, NexusResult};
use crate::identity::IdentityService;
use crate::pubsub::{sanitize_utf8, LogSink};
use crate::queue::{BuildJobPayload, JobQueue};
use async_trait::async_trait;
use models::{Build, BuildLog, BuildStatus, BuildStep, StepName, StepStatus};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Parameters for triggering a build
#[derive(Debug, Clone, Default)]
pub struct TriggerBuildParams {
    pub project_id: Uuid,
    pub user_id: Option<Uuid>,
    pub commit_sha: String,
    pub branch: String,
    pub repo_url: String,
}

pub struct BuildService {
    db: PgPool,
    identity: Arc<IdentityService>,
    queue: JobQueue,
    http: reqwest::Client,
    runner_url: String,
}

impl BuildService {
    pub fn new(
        db: PgPool,
        identity: Arc<IdentityService>,
        queue: JobQueue,
        runner_url: String,
    ) -> Self {
        Self {
            db,
            identity,
            queue,
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .expect("build http client"),
            runner_url,
        }
    }

    // ==================== TriggerBuild ====================

    /// Create a build row plus its seven pending steps and enqueue the job.
    /// Rejected when the owner's concurrent-build quota is reached. On
    /// enqueue failure the build is marked failed and the error surfaced.
    pub async fn trigger_build(&self, params: TriggerBuildParams) -> NexusResult<Build> {
        if params.project_id.is_nil() {
            return Err(NexusError::Validation("project_id is required".to_string()));
        }

        if let Some(user_id) = params.user_id {
            let (plan, limits) = self.identity.get_user_plan(user_id).await?;

            let active: i64 = sqlx::query_scalar(
                "SELECT COUNT(*) FROM builds WHERE project_id = $1 AND status = ANY($2)",
            )
            .bind(params.project_id)
            .bind(
                BuildStatus::active_statuses()
                    .iter()
                    .map(|s| s.to_string())
                    .collect::<Vec<_>>(),
            )
            .fetch_one(&self.db)
            .await?;

            if active >= limits.concurrent_builds {
                warn!(
                    user_id = %user_id,
                    active,
                    max = limits.concurrent_builds,
                    plan = plan.as_str(),
                    "Concurrent build quota reached"
                );
                return Err(NexusError::QuotaExceeded(format!(
                    "You have reached the concurrent builds limit for the {} plan \
                     ({} builds). Please wait for current builds to complete or \
                     upgrade your plan.",
                    plan.as_str(),
                    limits.concurrent_builds
                )));
            }
        }

        let build = sqlx::query_as::<_, Build>(
            "INSERT INTO builds (project_id, commit_sha, status) VALUES ($1, $2, 'pending') RETURNING *",
        )
        .bind(params.project_id)
        .bind(&params.commit_sha)
        .fetch_one(&self.db)
        .await?;

        for step in StepName::all() {
            let res = sqlx::query(
                "INSERT INTO build_steps (build_id, step_name, status) VALUES ($1, $2, 'pending')",
            )
            .bind(build.id)
            .bind(step.as_str())
            .execute(&self.db)
            .await;
            if let Err(e) = res {
                warn!(build_id = %build.id, step = step.as_str(), error = %e, "Failed to create build step");
            }
        }

        let payload = BuildJobPayload {
            build_id: build.id.to_string(),
            project_id: params.project_id.to_string(),
            repo_url: params.repo_url,
            branch: params.branch,
            commit_sha: params.commit_sha,
            ..Default::default()
        };

        if let Err(e) = self.queue.enqueue_build_job(&payload).await {
            error!(build_id = %build.id, error = %e, "Failed to enqueue build job");
            let _ = sqlx::query("UPDATE builds SET status = 'failed', finished_at = now(), updated_at = now() WHERE id = $1")
                .bind(build.id)
                .execute(&self.db)
                .await;
            return Err(NexusError::Dependency(
                "failed to enqueue build job".to_string(),
            ));
        }

        crate::metrics::BUILDS_TRIGGERED_TOTAL.inc();
        info!(build_id = %build.id, project_id = %params.project_id, "Build triggered");
        Ok(build)
    }

    // ==================== UpdateBuildStatus ====================

    /// Apply a status transition. Illegal edges are rejected; the check and
    /// the write happen inside one transaction so concurrent updaters see a
    /// serialised decision.
    pub async fn update_build_status(
        &self,
        build_id: Uuid,
        new_status: BuildStatus,
        image_tag: Option<&str>,
        log_lines: Vec<String>,
    ) -> NexusResult<()> {
        let mut tx = self.db.begin().await?;

        let build =
            sqlx::query_as::<_, Build>("SELECT * FROM builds WHERE id = $1 FOR UPDATE")
                .bind(build_id)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(|| NexusError::NotFound("build not found".to_string()))?;

        let current = build.status();
        if !current.can_transition_to(new_status) {
            warn!(
                build_id = %build_id,
                current = current.as_str(),
                requested = new_status.as_str(),
                "Invalid status transition"
            );
            return Err(NexusError::Conflict("invalid status transition".to_string()));
        }

        let set_started = build.started_at.is_none() && new_status != BuildStatus::Pending;
        let set_finished = new_status.is_terminal();

        sqlx::query(
            r#"
            UPDATE builds SET
                status = $1,
                image_tag = COALESCE($2, image_tag),
                started_at = CASE WHEN $3 THEN now() ELSE started_at END,
                finished_at = CASE WHEN $4 THEN now() ELSE finished_at END,
                updated_at = now()
            WHERE id = $5
            "#,
        )
        .bind(new_status.as_str())
        .bind(image_tag.filter(|t| !t.is_empty()))
        .bind(set_started)
        .bind(set_finished)
        .bind(build_id)
        .execute(&mut *tx)
        .await?;

        if !log_lines.is_empty() {
            insert_logs(&mut tx, build_id, &log_lines).await?;
        }

        tx.commit().await?;

        info!(
            build_id = %build_id,
            new_status = new_status.as_str(),
            "Build status updated"
        );
        Ok(())
    }

    /// Record a step's status and duration
    pub async fn update_step_status(
        &self,
        build_id: Uuid,
        step: StepName,
        status: StepStatus,
        duration_ms: Option<i64>,
    ) -> NexusResult<()> {
        sqlx::query(
            "UPDATE build_steps SET status = $1, duration_ms = COALESCE($2, duration_ms)
             WHERE build_id = $3 AND step_name = $4",
        )
        .bind(status.as_str())
        .bind(duration_ms)
        .bind(build_id)
        .bind(step.as_str())
        .execute(&self.db)
        .await?;
        Ok(())
    }

    // ==================== Logs ====================

    /// Bulk insert log lines, replacing any invalid UTF-8
    pub async fn append_build_logs(&self, build_id: Uuid, lines: Vec<String>) -> NexusResult<()> {
        if lines.is_empty() {
            return Ok(());
        }
        let mut tx = self.db.begin().await?;
        insert_logs(&mut tx, build_id, &lines).await?;
        tx.commit().await?;
        Ok(())
    }

    /// Page through a build's logs by ascending id. Fetches `limit + 1` rows
    /// and truncates to compute `has_more`.
    pub async fn get_build_logs(
        &self,
        build_id: Uuid,
        after_id: i64,
        limit: i64,
    ) -> NexusResult<(Vec<BuildLog>, bool)> {
        let limit = if !(1..=1000).contains(&limit) { 500 } else { limit };

        let mut logs = sqlx::query_as::<_, BuildLog>(
            "SELECT * FROM build_logs WHERE build_id = $1 AND id > $2 ORDER BY id ASC LIMIT $3",
        )
        .bind(build_id)
        .bind(after_id)
        .bind(limit + 1)
        .fetch_all(&self.db)
        .await?;

        let has_more = logs.len() as i64 > limit;
        if has_more {
            logs.truncate(limit as usize);
        }
        Ok((logs, has_more))
    }

    // ==================== Queries ====================

    pub async fn get_build(&self, build_id: Uuid) -> NexusResult<(Build, Vec<BuildStep>)> {
        let build = sqlx::query_as::<_, Build>("SELECT * FROM builds WHERE id = $1")
            .bind(build_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| NexusError::NotFound("build not found".to_string()))?;

        let steps = sqlx::query_as::<_, BuildStep>(
            "SELECT * FROM build_steps WHERE build_id = $1 ORDER BY id",
        )
        .bind(build_id)
        .fetch_all(&self.db)
        .await?;

        Ok((build, steps))
    }

    pub async fn list_builds(
        &self,
        project_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> NexusResult<(Vec<Build>, i64)> {
        let page = page.max(1);
        let page_size = if !(1..=100).contains(&page_size) {
            20
        } else {
            page_size
        };
        let offset = (page - 1) * page_size;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM builds WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&self.db)
            .await?;

        let builds = sqlx::query_as::<_, Build>(
            "SELECT * FROM builds WHERE project_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(project_id)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok((builds, total))
    }

    // ==================== DeleteBuildLogs ====================

    /// Delete log rows, step rows, then build rows for a project (optionally
    /// restricted to specific build ids). After the database succeeds, ask
    /// the runner to remove matching workspaces; that call is best-effort.
    pub async fn delete_build_logs(
        &self,
        project_id: Uuid,
        build_ids: Vec<Uuid>,
    ) -> NexusResult<(u64, u64)> {
        let builds: Vec<Build> = if build_ids.is_empty() {
            sqlx::query_as("SELECT * FROM builds WHERE project_id = $1")
                .bind(project_id)
                .fetch_all(&self.db)
                .await?
        } else {
            sqlx::query_as("SELECT * FROM builds WHERE project_id = $1 AND id = ANY($2)")
                .bind(project_id)
                .bind(&build_ids)
                .fetch_all(&self.db)
                .await?
        };

        if builds.is_empty() {
            return Ok((0, 0));
        }

        let ids: Vec<Uuid> = builds.iter().map(|b| b.id).collect();

        let logs_deleted = sqlx::query("DELETE FROM build_logs WHERE build_id = ANY($1)")
            .bind(&ids)
            .execute(&self.db)
            .await?
            .rows_affected();

        sqlx::query("DELETE FROM build_steps WHERE build_id = ANY($1)")
            .bind(&ids)
            .execute(&self.db)
            .await?;

        sqlx::query("DELETE FROM builds WHERE id = ANY($1)")
            .bind(&ids)
            .execute(&self.db)
            .await?;

        if let Err(e) = self.cleanup_runner_workspaces(&ids).await {
            warn!(
                project_id = %project_id,
                error = %e,
                "Failed to cleanup runner workspaces (non-fatal)"
            );
        }

        info!(
            project_id = %project_id,
            builds_affected = ids.len(),
            logs_deleted,
            "Build history deleted"
        );
        Ok((ids.len() as u64, logs_deleted))
    }

    async fn cleanup_runner_workspaces(&self, build_ids: &[Uuid]) -> NexusResult<()> {
        let url = format!(
            "{}/api/cleanup-workspaces",
            self.runner_url.trim_end_matches('/')
        );
        let body = serde_json::json!({
            "build_ids": build_ids.iter().map(|id| id.to_string()).collect::<Vec<_>>(),
        });

        let resp = self
            .http
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("runner cleanup request: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "runner cleanup returned status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

async fn insert_logs(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    build_id: Uuid,
    lines: &[String],
) -> NexusResult<()> {
    for line in lines {
        sqlx::query("INSERT INTO build_logs (build_id, log_line) VALUES ($1, $2)")
            .bind(build_id)
            .bind(sanitize_utf8(line))
            .execute(&mut **tx)
            .await?;
    }
    Ok(())
}

/// The runner hands collected batches to the build service through this sink
#[async_trait]
impl LogSink for BuildService {
    async fn append(&self, build_id: Uuid, lines: Vec<String>) -> NexusResult<()> {
        self.append_build_logs(build_id, lines).await
    }
}
