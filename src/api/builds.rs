/// Build endpoints: listing, triggering, logs, analysis
use crate::build::TriggerBuildParams;
use crate::context::AppContext;
use crate::error::NexusResult;
use crate::identity::models::AuthUser;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, Deserialize)]
pub struct PageParams {
    #[serde(default)]
    pub page: i64,
    #[serde(default)]
    pub page_size: i64,
}

/// GET /api/projects/{id}/builds
pub async fn list_builds(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
    Query(params): Query<PageParams>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects.get_project(project_id, Some(auth.user_id)).await?;
    let (builds, total) = ctx
        .builds
        .list_builds(project_id, params.page, params.page_size)
        .await?;
    Ok(Json(json!({ "builds": builds, "total": total })))
}

#[derive(Debug, Deserialize, Default)]
pub struct TriggerBuildRequest {
    #[serde(default)]
    pub commit_sha: String,
    #[serde(default)]
    pub branch: String,
}

/// POST /api/projects/{id}/builds — manual build trigger
pub async fn trigger_build(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
    body: Option<Json<TriggerBuildRequest>>,
) -> NexusResult<(StatusCode, Json<serde_json::Value>)> {
    let project = ctx.projects.get_project(project_id, Some(auth.user_id)).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let branch = if body.branch.is_empty() {
        project.branch.clone()
    } else {
        body.branch
    };

    let build = ctx
        .builds
        .trigger_build(TriggerBuildParams {
            project_id,
            user_id: Some(auth.user_id),
            commit_sha: body.commit_sha,
            branch,
            repo_url: project.repo_url,
        })
        .await?;

    Ok((StatusCode::CREATED, Json(json!({ "build": build }))))
}

/// GET /api/builds/{id}
pub async fn get_build(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(build_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    let (build, steps) = ctx.builds.get_build(build_id).await?;
    ctx.projects
        .get_project(build.project_id, Some(auth.user_id))
        .await?;
    Ok(Json(json!({ "build": build, "steps": steps })))
}

#[derive(Debug, Deserialize)]
pub struct LogParams {
    #[serde(default)]
    pub after_id: i64,
    #[serde(default)]
    pub limit: i64,
}

/// GET /api/builds/{id}/logs — cursor paging by log id
pub async fn get_build_logs(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(build_id): Path<Uuid>,
    Query(params): Query<LogParams>,
) -> NexusResult<Json<serde_json::Value>> {
    let (build, _) = ctx.builds.get_build(build_id).await?;
    ctx.projects
        .get_project(build.project_id, Some(auth.user_id))
        .await?;

    let (logs, has_more) = ctx
        .builds
        .get_build_logs(build_id, params.after_id, params.limit)
        .await?;
    Ok(Json(json!({ "logs": logs, "has_more": has_more })))
}

#[derive(Debug, Deserialize, Default)]
pub struct DeleteLogsRequest {
    #[serde(default)]
    pub build_ids: Vec<Uuid>,
}

/// DELETE /api/projects/{id}/builds/logs
pub async fn delete_build_logs(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
    body: Option<Json<DeleteLogsRequest>>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects.get_project(project_id, Some(auth.user_id)).await?;
    let body = body.map(|Json(b)| b).unwrap_or_default();

    let (builds_affected, logs_deleted) = ctx
        .builds
        .delete_build_logs(project_id, body.build_ids)
        .await?;
    Ok(Json(json!({
        "builds_affected": builds_affected,
        "logs_deleted": logs_deleted,
    })))
}

/// POST /api/builds/{id}/analyze — LLM-backed failure analysis
pub async fn analyze_build(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(build_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    let (build, _) = ctx.builds.get_build(build_id).await?;
    ctx.projects
        .get_project(build.project_id, Some(auth.user_id))
        .await?;

    let result = ctx.analyzer.analyze_build(build_id, auth.plan).await?;
    Ok(Json(json!({
        "analysis": result.analysis,
        "suggestions": result.suggestions,
        "cached": result.cached,
    })))
}

#[derive(Debug, Deserialize)]
pub struct CleanupWorkspacesRequest {
    pub build_ids: Vec<String>,
}

/// POST /api/cleanup-workspaces — the runner's workspace cleanup surface,
/// called by the build service after history deletion
pub async fn cleanup_workspaces(
    State(ctx): State<AppContext>,
    Json(body): Json<CleanupWorkspacesRequest>,
) -> Json<serde_json::Value> {
    ctx.runner.executor().cleanup_workspaces(&body.build_ids).await;
    Json(json!({ "success": true }))
}
