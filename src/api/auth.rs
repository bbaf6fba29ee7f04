/// Authentication and user endpoints
use crate::context::AppContext;
use crate::error::{NexusError, NexusResult};
use crate::identity::models::{AuthUser, Plan};
use axum::{
    extract::{Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use serde_json::json;
use tracing::warn;

use super::middleware::extract_bearer_token;

#[derive(Debug, Deserialize)]
pub struct LoginParams {
    #[serde(default)]
    pub redirect_url: String,
}

/// GET /auth/github/login — 302 to the provider authorization URL
pub async fn github_login(
    State(ctx): State<AppContext>,
    Query(params): Query<LoginParams>,
) -> NexusResult<Redirect> {
    let redirect = if params.redirect_url.is_empty() {
        None
    } else {
        Some(params.redirect_url.as_str())
    };
    let (auth_url, _state) = ctx.identity.start_oauth_flow(redirect).await?;
    Ok(Redirect::temporary(&auth_url))
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: String,
    #[serde(default)]
    pub state: String,
}

/// GET /auth/github/callback — complete the flow and 302 to the frontend
/// with the token pair in query parameters
pub async fn github_callback(
    State(ctx): State<AppContext>,
    Query(params): Query<CallbackParams>,
) -> Response {
    match ctx
        .identity
        .handle_oauth_callback(&params.code, &params.state)
        .await
    {
        Ok((_user, tokens)) => {
            let url = format!(
                "{}/auth/callback?access_token={}&refresh_token={}&expires_at={}",
                ctx.config.service.frontend_url.trim_end_matches('/'),
                tokens.access_token,
                tokens.refresh_token,
                tokens.expires_at.timestamp(),
            );
            Redirect::temporary(&url).into_response()
        }
        Err(e) => {
            warn!(error = %e, "OAuth callback failed");
            let url = format!(
                "{}/login?error=oauth_failed",
                ctx.config.service.frontend_url.trim_end_matches('/')
            );
            Redirect::temporary(&url).into_response()
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /auth/refresh — rotate the refresh token
pub async fn refresh(
    State(ctx): State<AppContext>,
    Json(body): Json<RefreshRequest>,
) -> NexusResult<Json<serde_json::Value>> {
    let tokens = ctx.identity.refresh(&body.refresh_token).await?;
    Ok(Json(json!({
        "access_token": tokens.access_token,
        "refresh_token": tokens.refresh_token,
        "expires_at": tokens.expires_at.timestamp(),
    })))
}

/// POST /auth/logout — revoke the bearer; 204 either way
pub async fn logout(State(ctx): State<AppContext>, headers: HeaderMap) -> StatusCode {
    if let Some(token) = extract_bearer_token(&headers) {
        if let Err(e) = ctx.identity.revoke_token(&token).await {
            warn!(error = %e, "Token revocation failed");
        }
    }
    StatusCode::NO_CONTENT
}

/// GET /api/user/info
pub async fn user_info(
    State(ctx): State<AppContext>,
    auth: AuthUser,
) -> NexusResult<Json<serde_json::Value>> {
    let user = ctx.identity.get_user(auth.user_id).await?;
    Ok(Json(json!({
        "user_id": user.id,
        "username": user.username,
        "email": user.email,
        "avatar_url": user.avatar_url,
        "plan": user.plan,
        "github_id": user.github_id,
    })))
}

/// GET /api/user/plan
pub async fn get_plan(
    State(ctx): State<AppContext>,
    auth: AuthUser,
) -> NexusResult<Json<serde_json::Value>> {
    let (plan, limits) = ctx.identity.get_user_plan(auth.user_id).await?;
    Ok(Json(json!({
        "plan": plan.as_str(),
        "max_projects": limits.max_projects,
        "max_builds_per_month": limits.max_builds_per_month,
        "concurrent_builds": limits.concurrent_builds,
    })))
}

#[derive(Debug, Deserialize)]
pub struct UpdatePlanRequest {
    pub plan: String,
}

/// PUT /api/user/plan — downgrade validation happens here at the edge:
/// the identity service applies whatever it is told.
pub async fn update_plan(
    State(ctx): State<AppContext>,
    auth: AuthUser,
    Json(body): Json<UpdatePlanRequest>,
) -> NexusResult<Json<serde_json::Value>> {
    let new_plan = Plan::parse_strict(&body.plan).ok_or_else(|| {
        NexusError::Validation("invalid plan. Must be 'standard' or 'premium'".to_string())
    })?;

    let new_limits = new_plan.limits();
    let (_, total) = ctx.projects.list_projects(auth.user_id, 1, 1).await?;
    if total > new_limits.max_projects {
        let excess = total - new_limits.max_projects;
        return Err(NexusError::Validation(format!(
            "cannot downgrade to the {} plan: you own {} projects, {} over the limit of {}. \
             Delete {} project(s) first.",
            new_plan.as_str(),
            total,
            excess,
            new_limits.max_projects,
            excess
        )));
    }

    ctx.identity.update_plan(auth.user_id, &body.plan).await?;
    Ok(Json(json!({ "success": true, "plan": new_plan.as_str() })))
}
