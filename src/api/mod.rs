/// Edge router: HTTP surface and middleware wiring
pub mod auth;
pub mod builds;
pub mod deployments;
pub mod middleware;
pub mod projects;
pub mod webhook;
pub mod ws_proxy;

use crate::context::AppContext;
use axum::routing::{delete, get, post};
use axum::Router;

/// All HTTP routes that live behind the middleware stack. The WebSocket
/// proxy and the hub endpoint are registered on the outermost router in
/// `server` because upgrade hijacking must bypass wrapping layers.
pub fn routes() -> Router<AppContext> {
    Router::new()
        // Public: OAuth and webhook intake
        .route("/auth/github/login", get(auth::github_login))
        .route("/auth/github/callback", get(auth::github_callback))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/webhooks/github", post(webhook::github_webhook))
        // User
        .route("/api/user/info", get(auth::user_info))
        .route("/api/user/plan", get(auth::get_plan).put(auth::update_plan))
        // Projects
        .route(
            "/api/projects",
            get(projects::list_projects).post(projects::create_project),
        )
        .route(
            "/api/projects/:id",
            get(projects::get_project)
                .put(projects::update_project)
                .delete(projects::delete_project),
        )
        .route("/api/repos", get(projects::list_repos))
        // Secrets
        .route(
            "/api/projects/:id/secrets",
            get(projects::list_secrets).post(projects::add_secret),
        )
        .route(
            "/api/projects/:id/secrets/:secret_id",
            delete(projects::delete_secret),
        )
        // Builds
        .route(
            "/api/projects/:id/builds",
            get(builds::list_builds).post(builds::trigger_build),
        )
        .route(
            "/api/projects/:id/builds/logs",
            delete(builds::delete_build_logs),
        )
        .route("/api/builds/:id", get(builds::get_build))
        .route("/api/builds/:id/logs", get(builds::get_build_logs))
        .route("/api/builds/:id/analyze", post(builds::analyze_build))
        // Deployments
        .route("/api/projects/:id/deploy", post(deployments::deploy))
        .route("/api/projects/:id/stop", post(deployments::stop_deployment))
        .route(
            "/api/projects/:id/restart",
            post(deployments::restart_deployment),
        )
        .route(
            "/api/projects/:id/deployment",
            get(deployments::deployment_status),
        )
        .route(
            "/api/projects/:id/deployment/logs",
            get(deployments::deployment_logs),
        )
        // Runner surface (internal)
        .route("/api/cleanup-workspaces", post(builds::cleanup_workspaces))
}
