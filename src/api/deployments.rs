/// Deployment endpoints, including the deploy orchestration composite
use crate::build::models::BuildStatus;
use crate::context::AppContext;
use crate::deploy::{DeploymentSpec, ResourceLimits};
use crate::error::{NexusError, NexusResult};
use crate::identity::models::AuthUser;
use crate::runner::docker::{image_tag, BuildContext};
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

/// POST /api/projects/{id}/deploy
///
/// The composite: newest successful build (the latest build may still be in
/// flight, so scan up to ten), project config, decrypted secrets, the image
/// tag under the runner's scheme, then the executor.
pub async fn deploy(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    let project = ctx.projects.get_project(project_id, Some(auth.user_id)).await?;

    let (builds, _) = ctx.builds.list_builds(project_id, 1, 10).await?;
    if builds.is_empty() {
        return Err(NexusError::FailedPrecondition(
            "no builds found for this project".to_string(),
        ));
    }

    let latest_success = builds
        .iter()
        .find(|b| b.status() == BuildStatus::Success)
        .ok_or_else(|| {
            NexusError::FailedPrecondition(
                "no successful build found. Please trigger a build first.".to_string(),
            )
        })?;

    let secrets = ctx.projects.get_secrets(project_id).await?;

    // The runner records the tag it produced; recompose under the same
    // scheme when an older row predates that column.
    let tag = if latest_success.image_tag.is_empty() {
        image_tag(
            &ctx.config.registry.url,
            &BuildContext {
                build_id: latest_success.id.to_string(),
                project_id: project_id.to_string(),
                commit_sha: latest_success.commit_sha.clone(),
                ..Default::default()
            },
        )
    } else {
        latest_success.image_tag.clone()
    };

    let deployment = ctx
        .executor
        .deploy(DeploymentSpec {
            project_id: project_id.to_string(),
            build_id: latest_success.id.to_string(),
            image_tag: tag,
            port: project.port as u16,
            domain: String::new(),
            env_vars: Default::default(),
            secrets,
            resources: Some(ResourceLimits {
                memory_mb: 512,
                cpu_cores: 1,
            }),
        })
        .await
        .map_err(|e| match e {
            // Container-runtime failures surface as a client-visible 400
            NexusError::Docker(inner) => {
                NexusError::Validation(format!("deployment failed: {}", inner))
            }
            other => other,
        })?;

    Ok(Json(json!({ "deployment": deployment })))
}

/// POST /api/projects/{id}/stop
pub async fn stop_deployment(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects.get_project(project_id, Some(auth.user_id)).await?;

    let status = ctx.executor.get_status("", &project_id.to_string()).await?;
    ctx.executor.stop(&status.id, &project_id.to_string()).await?;
    Ok(Json(json!({ "success": true })))
}

/// POST /api/projects/{id}/restart
pub async fn restart_deployment(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects.get_project(project_id, Some(auth.user_id)).await?;

    let status = ctx.executor.get_status("", &project_id.to_string()).await?;
    let deployment = ctx
        .executor
        .restart(&status.id, &project_id.to_string())
        .await?;
    Ok(Json(json!({
        "success": true,
        "container_id": deployment.container_id,
    })))
}

/// GET /api/projects/{id}/deployment — absent deployments are a valid
/// state, reported as `deployment: null` with 200
pub async fn deployment_status(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects.get_project(project_id, Some(auth.user_id)).await?;

    match ctx.executor.get_status("", &project_id.to_string()).await {
        Ok(deployment) => Ok(Json(json!({ "deployment": deployment }))),
        Err(NexusError::NotFound(_)) => Ok(Json(json!({ "deployment": null }))),
        Err(e) => Err(e),
    }
}

#[derive(Debug, Deserialize)]
pub struct LogsParams {
    #[serde(default)]
    pub tail: u32,
}

/// GET /api/projects/{id}/deployment/logs
pub async fn deployment_logs(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Path(project_id): Path<Uuid>,
    Query(params): Query<LogsParams>,
) -> NexusResult<Json<serde_json::Value>> {
    ctx.projects.get_project(project_id, Some(auth.user_id)).await?;

    let lines = ctx
        .executor
        .get_logs("", &project_id.to_string(), params.tail)
        .await?;
    Ok(Json(json!({ "logs": lines })))
}
