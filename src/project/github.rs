/// GitHub repository API client
///
/// Repository listing and webhook registration on behalf of a user's
/// provider token. Each webhook gets a freshly generated HMAC secret.
use crate::error::{NexusError, NexusResult};
use rand::RngCore;
use serde::Deserialize;
use std::time::Duration;

const GITHUB_API: &str = "https://api.github.com";
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// A repository visible to the user
#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct Repository {
    pub id: i64,
    pub name: String,
    pub full_name: String,
    pub clone_url: String,
    pub html_url: String,
    #[serde(rename = "private")]
    pub is_private: bool,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub default_branch: String,
}

#[derive(Debug, Deserialize)]
pub struct WebhookResponse {
    pub id: i64,
}

pub struct GitHubClient {
    http: reqwest::Client,
}

impl GitHubClient {
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("build http client"),
        }
    }

    /// List repositories the token can see, most recently pushed first
    pub async fn list_user_repositories(&self, token: &str) -> NexusResult<Vec<Repository>> {
        let resp = self
            .http
            .get(format!("{}/user/repos", GITHUB_API))
            .query(&[("sort", "pushed"), ("per_page", "100")])
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "nexus-deploy")
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("github repos api: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "GitHub API error: status {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| NexusError::Dependency(format!("decode repos response: {}", e)))
    }

    /// Register a push + pull_request webhook. Returns the hook id and the
    /// freshly generated HMAC secret.
    pub async fn create_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        callback_url: &str,
    ) -> NexusResult<(WebhookResponse, String)> {
        let secret = generate_webhook_secret();

        let body = serde_json::json!({
            "name": "web",
            "active": true,
            "events": ["push", "pull_request"],
            "config": {
                "url": callback_url,
                "content_type": "json",
                "secret": secret,
                "insecure_ssl": "0",
            },
        });

        let resp = self
            .http
            .post(format!("{}/repos/{}/{}/hooks", GITHUB_API, owner, repo))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "nexus-deploy")
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("github create hook: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "GitHub API error: create hook status {}",
                resp.status()
            )));
        }

        let hook: WebhookResponse = resp
            .json()
            .await
            .map_err(|e| NexusError::Dependency(format!("decode hook response: {}", e)))?;

        Ok((hook, secret))
    }

    /// Deregister a webhook (best-effort at call sites)
    pub async fn delete_webhook(
        &self,
        token: &str,
        owner: &str,
        repo: &str,
        hook_id: i64,
    ) -> NexusResult<()> {
        let resp = self
            .http
            .delete(format!(
                "{}/repos/{}/{}/hooks/{}",
                GITHUB_API, owner, repo, hook_id
            ))
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "nexus-deploy")
            .bearer_auth(token)
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("github delete hook: {}", e)))?;

        if !resp.status().is_success() && resp.status() != reqwest::StatusCode::NOT_FOUND {
            return Err(NexusError::Dependency(format!(
                "GitHub API error: delete hook status {}",
                resp.status()
            )));
        }
        Ok(())
    }
}

impl Default for GitHubClient {
    fn default() -> Self {
        Self::new()
    }
}

/// 32 random bytes, hex-encoded
fn generate_webhook_secret() -> String {
    let mut buf = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut buf);
    hex::encode(buf)
}

/// Extract (owner, repo) from an https repository URL
pub fn parse_repo_url(url: &str) -> NexusResult<(String, String)> {
    let trimmed = url.trim_end_matches(".git").trim_end_matches('/');
    let rest = trimmed
        .strip_prefix("https://github.com/")
        .or_else(|| trimmed.strip_prefix("http://github.com/"))
        .ok_or_else(|| NexusError::Validation(format!("unsupported repo URL: {}", url)))?;

    let mut parts = rest.splitn(2, '/');
    let owner = parts.next().unwrap_or_default();
    let repo = parts.next().unwrap_or_default();
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return Err(NexusError::Validation(format!(
            "unsupported repo URL: {}",
            url
        )));
    }
    Ok((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_repo_url() {
        let (owner, repo) = parse_repo_url("https://github.com/octo/widget.git").unwrap();
        assert_eq!(owner, "octo");
        assert_eq!(repo, "widget");

        let (owner, repo) = parse_repo_url("https://github.com/octo/widget").unwrap();
        assert_eq!(owner, "octo");
        assert_eq!(repo, "widget");
    }

    #[test]
    fn test_parse_repo_url_rejects_garbage() {
        assert!(parse_repo_url("git@github.com:octo/widget.git").is_err());
        assert!(parse_repo_url("https://github.com/octo").is_err());
        assert!(parse_repo_url("https://example.com/octo/widget").is_err());
        assert!(parse_repo_url("https://github.com/a/b/c").is_err());
    }

    #[test]
    fn test_webhook_secret_is_fresh_32_bytes() {
        let a = generate_webhook_secret();
        let b = generate_webhook_secret();
        assert_ne!(a, b);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|c| c.is_ascii_hexdigit()));
    }
}
