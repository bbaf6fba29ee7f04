/// Source-provider webhook intake
///
/// Signature verification happens before any parsing: read the body to
/// bytes, require `X-Hub-Signature-256`, and compare HMAC-SHA256 in constant
/// time. After a valid signature the response is always 202 Accepted so the
/// provider does not over-retry; processing failures are logged with the
/// delivery id for monitoring.
use crate::build::TriggerBuildParams;
use crate::context::AppContext;
use crate::error::{NexusError, NexusResult};
use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    Extension,
};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha2::Sha256;
use tracing::{error, info, warn};

type HmacSha256 = Hmac<Sha256>;

const HEADER_SIGNATURE: &str = "x-hub-signature-256";
const HEADER_EVENT: &str = "x-github-event";
const HEADER_DELIVERY: &str = "x-github-delivery";

#[derive(Debug, Deserialize)]
struct PushPayload {
    repository: PushRepository,
    #[serde(default)]
    head_commit: Option<PushCommit>,
    #[serde(default, rename = "ref")]
    git_ref: String,
}

#[derive(Debug, Deserialize)]
struct PushRepository {
    id: i64,
    #[serde(default)]
    full_name: String,
    #[serde(default)]
    clone_url: String,
}

#[derive(Debug, Deserialize)]
struct PushCommit {
    id: String,
}

/// POST /webhooks/github
pub async fn github_webhook(
    State(ctx): State<AppContext>,
    Extension(corr): Extension<super::middleware::CorrelationId>,
    headers: HeaderMap,
    body: Bytes,
) -> NexusResult<StatusCode> {
    let signature = headers
        .get(HEADER_SIGNATURE)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| NexusError::Authentication("missing signature header".to_string()))?;

    let shared_secret = &ctx.config.webhook.secret;
    let mut verified =
        !shared_secret.is_empty() && verify_signature(signature, &body, shared_secret.as_bytes());

    // Fall back to the per-project webhook secret when the shared one
    // doesn't match (projects registered with generated secrets).
    if !verified {
        if let Some(project_secret) = lookup_project_secret(&ctx, &body).await {
            verified = verify_signature(signature, &body, project_secret.as_bytes());
        }
    }

    if !verified {
        return Err(NexusError::Authentication("signature mismatch".to_string()));
    }

    let event = headers
        .get(HEADER_EVENT)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");
    let delivery_id = headers
        .get(HEADER_DELIVERY)
        .and_then(|h| h.to_str().ok())
        .unwrap_or("");

    if event == "push" {
        // Processing never fails the response from here on
        if let Err(e) = process_push(&ctx, &body, delivery_id).await {
            error!(
                correlation_id = %corr.0,
                delivery_id,
                error = %e,
                "Webhook processing failed"
            );
        }
    } else {
        info!(correlation_id = %corr.0, delivery_id, event, "Ignoring webhook event");
    }

    Ok(StatusCode::ACCEPTED)
}

async fn process_push(ctx: &AppContext, body: &[u8], delivery_id: &str) -> NexusResult<()> {
    let payload: PushPayload = serde_json::from_slice(body)
        .map_err(|e| NexusError::Validation(format!("parse webhook payload: {}", e)))?;

    info!(
        delivery_id,
        repo = %payload.repository.full_name,
        git_ref = %payload.git_ref,
        "Processing push event"
    );

    let branch = extract_branch(&payload.git_ref);

    let project = match ctx
        .projects
        .get_project_by_repo(
            Some(&payload.repository.clone_url),
            Some(payload.repository.id),
        )
        .await
    {
        Ok(p) => p,
        Err(e) => {
            warn!(
                delivery_id,
                repo = %payload.repository.full_name,
                github_repo_id = payload.repository.id,
                error = %e,
                "Project not found for repository"
            );
            return Ok(());
        }
    };

    if !project.branch.is_empty() && project.branch != branch {
        info!(
            delivery_id,
            project_id = %project.id,
            project_branch = %project.branch,
            push_branch = %branch,
            "Branch mismatch, skipping build trigger"
        );
        return Ok(());
    }

    let Some(head_commit) = payload.head_commit.filter(|c| !c.id.is_empty()) else {
        warn!(
            delivery_id,
            project_id = %project.id,
            "No head_commit in payload, skipping build trigger"
        );
        return Ok(());
    };

    let build = ctx
        .builds
        .trigger_build(TriggerBuildParams {
            project_id: project.id,
            user_id: None,
            commit_sha: head_commit.id.clone(),
            branch: branch.clone(),
            repo_url: payload.repository.clone_url,
        })
        .await?;

    info!(
        delivery_id,
        project_id = %project.id,
        build_id = %build.id,
        commit_sha = %head_commit.id,
        branch = %branch,
        "Triggered build from webhook"
    );
    Ok(())
}

/// Resolve the project's stored webhook secret by peeking at the payload's
/// repository identifiers. Returns None on any miss.
async fn lookup_project_secret(ctx: &AppContext, body: &[u8]) -> Option<String> {
    let payload: PushPayload = serde_json::from_slice(body).ok()?;
    let project = ctx
        .projects
        .get_project_by_repo(
            Some(&payload.repository.clone_url),
            Some(payload.repository.id),
        )
        .await
        .ok()?;
    ctx.projects.get_webhook_secret(project.id).await.ok()?
}

/// Constant-time HMAC-SHA256 check of `sha256=<hex>` signatures
pub fn verify_signature(signature: &str, payload: &[u8], secret: &[u8]) -> bool {
    let Some(hex_sig) = signature.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(sig_bytes) = hex::decode(hex_sig) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&sig_bytes).is_ok()
}

/// `refs/heads/{branch}` or `refs/tags/{branch}`, else the ref as-is
pub fn extract_branch(git_ref: &str) -> String {
    git_ref
        .strip_prefix("refs/heads/")
        .or_else(|| git_ref.strip_prefix("refs/tags/"))
        .unwrap_or(git_ref)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret).unwrap();
        mac.update(payload);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let secret = b"webhook-secret";
        let sig = sign(payload, secret);
        assert!(verify_signature(&sig, payload, secret));
    }

    #[test]
    fn test_flipped_bit_rejected() {
        let payload = br#"{"ref":"refs/heads/main"}"#.to_vec();
        let secret = b"webhook-secret";
        let sig = sign(&payload, secret);

        let mut tampered = payload.clone();
        tampered[0] ^= 0x01;
        assert!(!verify_signature(&sig, &tampered, secret));
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let payload = br#"{"ref":"refs/heads/main"}"#;
        let sig = sign(payload, b"secret-a");
        assert!(!verify_signature(&sig, payload, b"secret-b"));
    }

    #[test]
    fn test_malformed_signatures_rejected() {
        let payload = b"x";
        assert!(!verify_signature("sha1=abcd", payload, b"s"));
        assert!(!verify_signature("sha256=nothex!!", payload, b"s"));
        assert!(!verify_signature("", payload, b"s"));
    }

    #[test]
    fn test_extract_branch() {
        assert_eq!(extract_branch("refs/heads/main"), "main");
        assert_eq!(extract_branch("refs/heads/feature/x"), "feature/x");
        assert_eq!(extract_branch("refs/tags/v1.0"), "v1.0");
        assert_eq!(extract_branch("main"), "main");
    }

    #[test]
    fn test_push_payload_parse() {
        let body = br#"{
            "repository": {"id": 7, "full_name": "u/r", "clone_url": "https://github.com/u/r.git"},
            "head_commit": {"id": "deadbeefcafebabe"},
            "ref": "refs/heads/main"
        }"#;
        let payload: PushPayload = serde_json::from_slice(body).unwrap();
        assert_eq!(payload.repository.id, 7);
        assert_eq!(payload.head_commit.unwrap().id, "deadbeefcafebabe");
        assert_eq!(extract_branch(&payload.git_ref), "main");
    }
}
