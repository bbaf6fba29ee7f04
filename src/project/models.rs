/// Project models: projects, secrets, webhooks
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::FromRow;
use uuid::Uuid;

/// A deployable project
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Project {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub repo_url: String,
    pub branch: String,
    pub preset: String,
    pub build_command: String,
    pub start_command: String,
    pub port: i32,
    pub github_repo_id: i64,
    pub is_private: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A sealed secret. The value never crosses a service boundary except on the
/// internal bulk-decrypt path and is never logged.
#[derive(Debug, Clone, FromRow)]
pub struct Secret {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub sealed_value: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Listing view of a secret: name only, no value
#[derive(Debug, Clone, Serialize)]
pub struct SecretInfo {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub created_at: DateTime<Utc>,
}

impl From<&Secret> for SecretInfo {
    fn from(s: &Secret) -> Self {
        SecretInfo {
            id: s.id,
            project_id: s.project_id,
            name: s.name.clone(),
            created_at: s.created_at,
        }
    }
}

/// A registered source-provider webhook; one per project
#[derive(Debug, Clone, FromRow)]
pub struct Webhook {
    pub id: Uuid,
    pub project_id: Uuid,
    pub github_webhook_id: i64,
    pub hmac_secret: String,
    pub created_at: DateTime<Utc>,
}
