/// Project service: project, secret, and webhook CRUD
///
/// Enforces the per-plan project quota at creation, registers source-provider
/// webhooks best-effort, and seals secret values with the platform master
/// key. `get_secrets` is the internal bulk-decrypt path: it performs no
/// ownership check and relies on callers having verified access.
pub mod github;
pub mod models;

use crate::crypto;
use crate::error::{NexusError, NexusResult};
use crate::identity::IdentityService;
use github::{parse_repo_url, GitHubClient, Repository};
use models::{Project, Secret, SecretInfo, Webhook};
use rand::Rng;
use sqlx::PgPool;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Ephemeral container-port range assigned when the user leaves it blank
const DEFAULT_PORT_RANGE: std::ops::Range<i32> = 12000..13000;

#[derive(Debug, Clone, Default)]
pub struct CreateProjectParams {
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub preset: String,
    pub build_command: String,
    pub start_command: String,
    pub port: i32,
    pub github_repo_id: i64,
    pub is_private: bool,
}

#[derive(Debug, Clone, Default)]
pub struct UpdateProjectParams {
    pub name: Option<String>,
    pub branch: Option<String>,
    pub preset: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub port: Option<i32>,
}

pub struct ProjectService {
    db: PgPool,
    identity: Arc<IdentityService>,
    github: GitHubClient,
    master_key: String,
    webhook_callback_url: String,
}

impl ProjectService {
    pub fn new(
        db: PgPool,
        identity: Arc<IdentityService>,
        master_key: String,
        webhook_callback_url: String,
    ) -> Self {
        Self {
            db,
            identity,
            github: GitHubClient::new(),
            master_key,
            webhook_callback_url,
        }
    }

    // ==================== Project CRUD ====================

    /// Create a project; rejects when the owner's plan quota is reached.
    /// Webhook registration is best-effort: failure is logged, never fatal.
    pub async fn create_project(
        &self,
        user_id: Uuid,
        params: CreateProjectParams,
        github_token: Option<&str>,
    ) -> NexusResult<Project> {
        if params.name.is_empty() || params.repo_url.is_empty() {
            return Err(NexusError::Validation(
                "name and repo_url are required".to_string(),
            ));
        }

        let (plan, limits) = self.identity.get_user_plan(user_id).await?;

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE user_id = $1")
                .bind(user_id)
                .fetch_one(&self.db)
                .await?;

        if limits.max_projects > 0 && count >= limits.max_projects {
            warn!(
                user_id = %user_id,
                current = count,
                max = limits.max_projects,
                plan = plan.as_str(),
                "Project quota reached"
            );
            return Err(NexusError::QuotaExceeded(format!(
                "You have reached the project limit for the {} plan ({} projects). \
                 Please upgrade your plan to create more projects.",
                plan.as_str(),
                limits.max_projects
            )));
        }

        let branch = if params.branch.is_empty() {
            "main".to_string()
        } else {
            params.branch
        };
        let port = if params.port == 0 {
            rand::thread_rng().gen_range(DEFAULT_PORT_RANGE)
        } else {
            params.port
        };

        let project = sqlx::query_as::<_, Project>(
            r#"
            INSERT INTO projects
                (user_id, name, repo_url, branch, preset, build_command, start_command,
                 port, github_repo_id, is_private)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            RETURNING *
            "#,
        )
        .bind(user_id)
        .bind(&params.name)
        .bind(&params.repo_url)
        .bind(&branch)
        .bind(&params.preset)
        .bind(&params.build_command)
        .bind(&params.start_command)
        .bind(port)
        .bind(params.github_repo_id)
        .bind(params.is_private)
        .fetch_one(&self.db)
        .await?;

        if let Some(token) = github_token {
            self.register_webhook(&project, token).await;
        }

        info!(project_id = %project.id, user_id = %user_id, "Project created");
        Ok(project)
    }

    async fn register_webhook(&self, project: &Project, token: &str) {
        let (owner, repo) = match parse_repo_url(&project.repo_url) {
            Ok(parts) => parts,
            Err(e) => {
                warn!(project_id = %project.id, error = %e, "Cannot parse repo URL for webhook setup");
                return;
            }
        };

        match self
            .github
            .create_webhook(token, &owner, &repo, &self.webhook_callback_url)
            .await
        {
            Ok((hook, secret)) => {
                let res = sqlx::query(
                    "INSERT INTO webhooks (project_id, github_webhook_id, hmac_secret) VALUES ($1, $2, $3)",
                )
                .bind(project.id)
                .bind(hook.id)
                .bind(&secret)
                .execute(&self.db)
                .await;
                if let Err(e) = res {
                    warn!(project_id = %project.id, error = %e, "Failed to save webhook record");
                } else {
                    info!(project_id = %project.id, hook_id = hook.id, "Webhook registered");
                }
            }
            Err(e) => {
                warn!(project_id = %project.id, error = %e, "Failed to register webhook");
            }
        }
    }

    /// Fetch a project; when a user id is supplied, ownership is enforced.
    pub async fn get_project(
        &self,
        project_id: Uuid,
        user_id: Option<Uuid>,
    ) -> NexusResult<Project> {
        let project = sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE id = $1")
            .bind(project_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| NexusError::NotFound("project not found".to_string()))?;

        if let Some(uid) = user_id {
            if project.user_id != uid {
                return Err(NexusError::Authorization("permission denied".to_string()));
            }
        }
        Ok(project)
    }

    /// Locate the target project for a webhook delivery: exact match by the
    /// provider's repository id when given, else case-insensitive
    /// `.git`-stripped URL equality.
    pub async fn get_project_by_repo(
        &self,
        repo_url: Option<&str>,
        github_repo_id: Option<i64>,
    ) -> NexusResult<Project> {
        if let Some(repo_id) = github_repo_id.filter(|id| *id != 0) {
            let found =
                sqlx::query_as::<_, Project>("SELECT * FROM projects WHERE github_repo_id = $1")
                    .bind(repo_id)
                    .fetch_optional(&self.db)
                    .await?;
            if let Some(project) = found {
                return Ok(project);
            }
        }

        if let Some(url) = repo_url.filter(|u| !u.is_empty()) {
            let normalized = normalize_repo_url(url);
            let projects = sqlx::query_as::<_, Project>("SELECT * FROM projects")
                .fetch_all(&self.db)
                .await?;
            if let Some(project) = projects
                .into_iter()
                .find(|p| normalize_repo_url(&p.repo_url) == normalized)
            {
                return Ok(project);
            }
        }

        Err(NexusError::NotFound("project not found".to_string()))
    }

    pub async fn list_projects(
        &self,
        user_id: Uuid,
        page: i64,
        page_size: i64,
    ) -> NexusResult<(Vec<Project>, i64)> {
        let page = page.max(1);
        let page_size = if !(1..=100).contains(&page_size) {
            20
        } else {
            page_size
        };
        let offset = (page - 1) * page_size;

        let total: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM projects WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&self.db)
            .await?;

        let projects = sqlx::query_as::<_, Project>(
            "SELECT * FROM projects WHERE user_id = $1 ORDER BY created_at DESC LIMIT $2 OFFSET $3",
        )
        .bind(user_id)
        .bind(page_size)
        .bind(offset)
        .fetch_all(&self.db)
        .await?;

        Ok((projects, total))
    }

    pub async fn update_project(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        params: UpdateProjectParams,
    ) -> NexusResult<Project> {
        // Ownership check doubles as existence check
        self.get_project(project_id, Some(user_id)).await?;

        let project = sqlx::query_as::<_, Project>(
            r#"
            UPDATE projects SET
                name = COALESCE($1, name),
                branch = COALESCE($2, branch),
                preset = COALESCE($3, preset),
                build_command = COALESCE($4, build_command),
                start_command = COALESCE($5, start_command),
                port = COALESCE($6, port),
                updated_at = now()
            WHERE id = $7
            RETURNING *
            "#,
        )
        .bind(params.name)
        .bind(params.branch)
        .bind(params.preset)
        .bind(params.build_command)
        .bind(params.start_command)
        .bind(params.port)
        .bind(project_id)
        .fetch_one(&self.db)
        .await?;

        Ok(project)
    }

    /// Delete a project: best-effort webhook deregistration, best-effort
    /// build-row cleanup, then the row cascade (secrets, webhooks).
    pub async fn delete_project(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        github_token: Option<&str>,
    ) -> NexusResult<()> {
        let project = self.get_project(project_id, Some(user_id)).await?;

        if let Some(token) = github_token {
            let webhooks = sqlx::query_as::<_, Webhook>(
                "SELECT * FROM webhooks WHERE project_id = $1",
            )
            .bind(project_id)
            .fetch_all(&self.db)
            .await
            .unwrap_or_default();

            if let Ok((owner, repo)) = parse_repo_url(&project.repo_url) {
                for wh in &webhooks {
                    if let Err(e) = self
                        .github
                        .delete_webhook(token, &owner, &repo, wh.github_webhook_id)
                        .await
                    {
                        warn!(
                            project_id = %project_id,
                            hook_id = wh.github_webhook_id,
                            error = %e,
                            "Failed to delete webhook from GitHub"
                        );
                    }
                }
            }
        }

        // Builds live outside the FK cascade; remove them best-effort first
        if let Err(e) = sqlx::query("DELETE FROM builds WHERE project_id = $1")
            .bind(project_id)
            .execute(&self.db)
            .await
        {
            warn!(project_id = %project_id, error = %e, "Failed to delete builds for project");
        }

        sqlx::query("DELETE FROM projects WHERE id = $1")
            .bind(project_id)
            .execute(&self.db)
            .await?;

        info!(project_id = %project_id, "Project deleted");
        Ok(())
    }

    /// The HMAC secret of a project's registered webhook, if any
    pub async fn get_webhook_secret(&self, project_id: Uuid) -> NexusResult<Option<String>> {
        let webhook =
            sqlx::query_as::<_, Webhook>("SELECT * FROM webhooks WHERE project_id = $1 LIMIT 1")
                .bind(project_id)
                .fetch_optional(&self.db)
                .await?;
        Ok(webhook.map(|w| w.hmac_secret))
    }

    // ==================== GitHub integration ====================

    pub async fn list_repositories(&self, github_token: &str) -> NexusResult<Vec<Repository>> {
        if github_token.is_empty() {
            return Err(NexusError::Validation(
                "github access token is required".to_string(),
            ));
        }
        self.github.list_user_repositories(github_token).await
    }

    // ==================== Secrets ====================

    pub async fn add_secret(
        &self,
        project_id: Uuid,
        user_id: Uuid,
        name: &str,
        value: &str,
    ) -> NexusResult<SecretInfo> {
        if name.is_empty() || value.is_empty() {
            return Err(NexusError::Validation(
                "name and value are required".to_string(),
            ));
        }
        self.get_project(project_id, Some(user_id)).await?;

        let sealed = crypto::seal(&self.master_key, value)?;
        let secret = sqlx::query_as::<_, Secret>(
            r#"
            INSERT INTO secrets (project_id, name, sealed_value)
            VALUES ($1, $2, $3)
            ON CONFLICT (project_id, name) DO UPDATE
                SET sealed_value = EXCLUDED.sealed_value, updated_at = now()
            RETURNING *
            "#,
        )
        .bind(project_id)
        .bind(name)
        .bind(&sealed)
        .fetch_one(&self.db)
        .await?;

        Ok(SecretInfo::from(&secret))
    }

    /// List secret names; values are never returned on this path
    pub async fn list_secrets(
        &self,
        project_id: Uuid,
        user_id: Uuid,
    ) -> NexusResult<Vec<SecretInfo>> {
        self.get_project(project_id, Some(user_id)).await?;

        let secrets =
            sqlx::query_as::<_, Secret>("SELECT * FROM secrets WHERE project_id = $1 ORDER BY name")
                .bind(project_id)
                .fetch_all(&self.db)
                .await?;

        Ok(secrets.iter().map(SecretInfo::from).collect())
    }

    pub async fn delete_secret(
        &self,
        project_id: Uuid,
        secret_id: Uuid,
        user_id: Uuid,
    ) -> NexusResult<()> {
        self.get_project(project_id, Some(user_id)).await?;

        let result = sqlx::query("DELETE FROM secrets WHERE id = $1 AND project_id = $2")
            .bind(secret_id)
            .bind(project_id)
            .execute(&self.db)
            .await?;

        if result.rows_affected() == 0 {
            return Err(NexusError::NotFound("secret not found".to_string()));
        }
        Ok(())
    }

    /// Internal bulk-decrypt path. No ownership check: callers (runner,
    /// edge deploy orchestration) have already verified access.
    pub async fn get_secrets(&self, project_id: Uuid) -> NexusResult<HashMap<String, String>> {
        let secrets =
            sqlx::query_as::<_, Secret>("SELECT * FROM secrets WHERE project_id = $1")
                .bind(project_id)
                .fetch_all(&self.db)
                .await?;

        let mut map = HashMap::with_capacity(secrets.len());
        for secret in secrets {
            match crypto::open(&self.master_key, &secret.sealed_value) {
                Ok(value) => {
                    map.insert(secret.name, value);
                }
                Err(e) => {
                    warn!(
                        project_id = %project_id,
                        secret = %secret.name,
                        error = %e,
                        "Failed to decrypt secret, skipping"
                    );
                }
            }
        }
        Ok(map)
    }
}

/// Lowercase, `.git`-stripped form used for URL equality
pub fn normalize_repo_url(url: &str) -> String {
    url.trim_end_matches(".git").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_repo_url() {
        assert_eq!(
            normalize_repo_url("https://GitHub.com/U/R.git"),
            "https://github.com/u/r"
        );
        assert_eq!(
            normalize_repo_url("https://github.com/u/r"),
            "https://github.com/u/r"
        );
    }

    #[test]
    fn test_default_port_range() {
        for _ in 0..100 {
            let port = rand::thread_rng().gen_range(DEFAULT_PORT_RANGE);
            assert!((12000..13000).contains(&port));
        }
    }
}
