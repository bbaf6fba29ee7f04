/// Project and secret endpoints
use crate::context::AppContext;
use crate::error::NexusResult;
use crate::identity::models::AuthUser;
use crate::project::{CreateProjectParams, UpdateProjectParams};
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

/// GET /api/projects
pub async fn list_projects(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Query(params): Query<PageParams>,
) -> NexusResult<Json<serde_json::Value>> {
    let (projects, total) = ctx
        .projects
        .list_projects(auth.user_id, params.page, params.page_size)
        .await?;
    Ok(Json(json!({ "projects": projects, "total": total })))
}

#[derive(Debug, Deserialize)]
pub struct CreateProjectRequest {
    pub name: String,
    pub repo_url: String,
    #[serde(default)]
    pub branch: String,
    #[serde(default)]
    pub preset: String,
    #[serde(default)]
    pub build_command: String,
    #[serde(default)]
    pub start_command: String,
    #[serde(default)]
    pub port: i32,
    #[serde(default)]
    pub github_repo_id: i64,
    #[serde(default)]
    pub is_private: bool,
}

/// POST /api/projects — the edge fetches the provider token internally so
/// the browser never sees it; webhook registration rides on that token.
pub async fn create_project(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Json(body): Json<CreateProjectRequest>,
) -> NexusResult<(StatusCode, Json<serde_json::Value>)> {
    let github_token = match ctx.identity.get_github_token(auth.user_id).await {
        Ok(token) => Some(token),
        Err(e) => {
            warn!(user_id = %auth.user_id, error = %e, "No provider token for webhook setup");
            None
        }
    };

    let project = ctx
        .projects
        .create_project(
            auth.user_id,
            CreateProjectParams {
                name: body.name,
                repo_url: body.repo_url,
                branch: body.branch,
                preset: body.preset,
                build_command: body.build_command,
                start_command: body.start_command,
                port: body.port,
                github_repo_id: body.github_repo_id,
                is_private: body.is_private,
            },
            github_token.as_deref(),
        )
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "project": project }))))
}

/// GET /api/projects/{id}
pub async fn get_project(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    let project = ctx.projects.get_project(project_id, Some(auth.user_id)).await?;
    Ok(Json(json!({ "project": project })))
}

#[derive(Debug, Deserialize)]
pub struct UpdateProjectRequest {
    pub name: Option<String>,
    pub branch: Option<String>,
    pub preset: Option<String>,
    pub build_command: Option<String>,
    pub start_command: Option<String>,
    pub port: Option<i32>,
}

/// PUT /api/projects/{id}
pub async fn update_project(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
    Json(body): Json<UpdateProjectRequest>,
) -> NexusResult<Json<serde_json::Value>> {
    let project = ctx
        .projects
        .update_project(
            project_id,
            auth.user_id,
            UpdateProjectParams {
                name: body.name,
                branch: body.branch,
                preset: body.preset,
                build_command: body.build_command,
                start_command: body.start_command,
                port: body.port,
            },
        )
        .await?;
    Ok(Json(json!({ "project": project })))
}

/// DELETE /api/projects/{id}
pub async fn delete_project(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    let github_token = ctx.identity.get_github_token(auth.user_id).await.ok();
    ctx.projects
        .delete_project(project_id, auth.user_id, github_token.as_deref())
        .await?;
    Ok(Json(json!({ "success": true })))
}

/// GET /api/repos — list the user's provider repositories
pub async fn list_repos(
    State(ctx): State<AppContext>,
    auth: AuthUser,
) -> NexusResult<Json<serde_json::Value>> {
    let token = ctx.identity.get_github_token(auth.user_id).await?;
    let repos = ctx.projects.list_repositories(&token).await?;
    Ok(Json(json!({ "repositories": repos })))
}

#[derive(Debug, Deserialize)]
pub struct AddSecretRequest {
    pub name: String,
    pub value: String,
}

/// POST /api/projects/{id}/secrets
pub async fn add_secret(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
    Json(body): Json<AddSecretRequest>,
) -> NexusResult<(StatusCode, Json<serde_json::Value>)> {
    let secret = ctx
        .projects
        .add_secret(project_id, auth.user_id, &body.name, &body.value)
        .await?;
    Ok((StatusCode::CREATED, Json(json!({ "secret": secret }))))
}

/// GET /api/projects/{id}/secrets — names only, never values
pub async fn list_secrets(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    let secrets = ctx.projects.list_secrets(project_id, auth.user_id).await?;
    Ok(Json(json!({ "secrets": secrets })))
}

/// DELETE /api/projects/{id}/secrets/{secret_id}
pub async fn delete_secret(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path((project_id, secret_id)): Path<(Uuid, Uuid)>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects
        .delete_secret(project_id, secret_id, auth.user_id)
        .await?;
    Ok(Json(json!({ "success": true })))
}
