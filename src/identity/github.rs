/// GitHub OAuth client
///
/// Owns the state handshake (random state with a 10-minute TTL in the KV
/// store, single-use via atomic delete), the code exchange, and identity
/// lookup against the GitHub API.
use crate::error::{NexusError, NexusResult};
use crate::kv::Kv;
use serde::Deserialize;
use std::time::Duration;
use uuid::Uuid;

const GITHUB_AUTH_URL: &str = "https://github.com/login/oauth/authorize";
const GITHUB_TOKEN_URL: &str = "https://github.com/login/oauth/access_token";
const GITHUB_USER_API: &str = "https://api.github.com/user";
const GITHUB_EMAILS_API: &str = "https://api.github.com/user/emails";

const OAUTH_STATE_PREFIX: &str = "auth:oauth:state:";
const OAUTH_STATE_TTL: Duration = Duration::from_secs(600);
const HTTP_TIMEOUT: Duration = Duration::from_secs(10);

/// User info from the GitHub API
#[derive(Debug, Clone, Deserialize)]
pub struct GitHubUser {
    pub id: i64,
    pub login: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub avatar_url: String,
}

#[derive(Debug, Deserialize)]
struct GitHubEmail {
    email: String,
    primary: bool,
    verified: bool,
}

pub struct GitHubOAuth {
    client_id: String,
    client_secret: String,
    redirect_url: String,
    kv: Kv,
    http: reqwest::Client,
}

impl GitHubOAuth {
    pub fn new(client_id: &str, client_secret: &str, redirect_url: &str, kv: Kv) -> Self {
        Self {
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            redirect_url: redirect_url.to_string(),
            kv,
            http: reqwest::Client::builder()
                .timeout(HTTP_TIMEOUT)
                .build()
                .expect("build http client"),
        }
    }

    pub fn is_configured(&self) -> bool {
        !self.client_id.is_empty() && !self.client_secret.is_empty()
    }

    /// Mint a state, store it with a TTL, and build the authorization URL
    pub async fn generate_auth_url(
        &self,
        custom_redirect_url: Option<&str>,
    ) -> NexusResult<(String, String)> {
        let state = Uuid::new_v4().to_string();
        let state_key = format!("{}{}", OAUTH_STATE_PREFIX, state);
        self.kv.set_ex(&state_key, "1", OAUTH_STATE_TTL).await?;

        let redirect_url = custom_redirect_url
            .filter(|s| !s.is_empty())
            .unwrap_or(&self.redirect_url);

        let mut url = reqwest::Url::parse(GITHUB_AUTH_URL)
            .map_err(|e| NexusError::Internal(format!("parse auth url: {}", e)))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_url)
            .append_pair("state", &state)
            .append_pair("scope", "repo,user:email");

        Ok((url.to_string(), state))
    }

    /// Consume the state key. The delete count is the single-use guarantee:
    /// zero deletions means expired, unknown, or replayed.
    pub async fn validate_state(&self, state: &str) -> NexusResult<()> {
        if state.is_empty() {
            return Err(NexusError::Authentication("missing oauth state".to_string()));
        }
        let state_key = format!("{}{}", OAUTH_STATE_PREFIX, state);
        let deleted = self.kv.del(&state_key).await?;
        if deleted == 0 {
            return Err(NexusError::Authentication(
                "invalid or expired state".to_string(),
            ));
        }
        Ok(())
    }

    /// Exchange the authorization code for a provider access token
    pub async fn exchange_code(&self, code: &str) -> NexusResult<String> {
        #[derive(Deserialize)]
        struct TokenResponse {
            #[serde(default)]
            access_token: String,
            #[serde(default)]
            error: String,
            #[serde(default)]
            error_description: String,
        }

        let resp = self
            .http
            .post(GITHUB_TOKEN_URL)
            .header("Accept", "application/json")
            .json(&serde_json::json!({
                "client_id": self.client_id,
                "client_secret": self.client_secret,
                "code": code,
                "redirect_uri": self.redirect_url,
            }))
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("github token exchange: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "github token exchange failed with status {}",
                resp.status()
            )));
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|e| NexusError::Dependency(format!("decode token response: {}", e)))?;

        if !token.error.is_empty() {
            return Err(NexusError::Dependency(format!(
                "github oauth error: {} - {}",
                token.error, token.error_description
            )));
        }
        if token.access_token.is_empty() {
            return Err(NexusError::Dependency(
                "empty access token from github".to_string(),
            ));
        }
        Ok(token.access_token)
    }

    /// Fetch the user profile; fills in the primary verified email when the
    /// profile email is private.
    pub async fn fetch_user_with_email(&self, access_token: &str) -> NexusResult<GitHubUser> {
        let mut user = self.fetch_user(access_token).await?;
        if user.email.as_deref().unwrap_or("").is_empty() {
            user.email = Some(self.fetch_primary_email(access_token).await?);
        }
        Ok(user)
    }

    async fn fetch_user(&self, access_token: &str) -> NexusResult<GitHubUser> {
        let resp = self
            .http
            .get(GITHUB_USER_API)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "nexus-deploy")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("github user api: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "github user API failed with status {}",
                resp.status()
            )));
        }

        resp.json()
            .await
            .map_err(|e| NexusError::Dependency(format!("decode user response: {}", e)))
    }

    async fn fetch_primary_email(&self, access_token: &str) -> NexusResult<String> {
        let resp = self
            .http
            .get(GITHUB_EMAILS_API)
            .header("Accept", "application/vnd.github+json")
            .header("User-Agent", "nexus-deploy")
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(|e| NexusError::Dependency(format!("github emails api: {}", e)))?;

        if !resp.status().is_success() {
            return Err(NexusError::Dependency(format!(
                "github emails API failed with status {}",
                resp.status()
            )));
        }

        let emails: Vec<GitHubEmail> = resp
            .json()
            .await
            .map_err(|e| NexusError::Dependency(format!("decode emails response: {}", e)))?;

        // Primary verified email wins; fall back to the first one
        if let Some(e) = emails.iter().find(|e| e.primary && e.verified) {
            return Ok(e.email.clone());
        }
        if let Some(e) = emails.first() {
            if !e.email.is_empty() {
                return Ok(e.email.clone());
            }
        }
        Err(NexusError::Dependency(
            "no email returned from github".to_string(),
        ))
    }
}
