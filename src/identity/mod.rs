/// Identity service: OAuth flow, bearer lifecycle, plan lookup
///
/// Access tokens are stateless HS256 statements checked against a KV
/// revocation set; refresh tokens are opaque 48-byte values stored only as
/// digests and rotated on every use.
pub mod github;
pub mod models;

use crate::config::AuthConfig;
use crate::crypto;
use crate::error::{NexusError, NexusResult};
use crate::kv::Kv;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use github::{GitHubOAuth, GitHubUser};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use models::{AuthUser, Plan, PlanLimits, RefreshToken, User};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

const BLACKLIST_KEY_PREFIX: &str = "auth:jwt:blacklist:";
const REFRESH_TOKEN_TTL_DAYS: i64 = 7;

/// JWT claims carried by an access token
#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub uid: String,
    pub username: String,
    pub plan: String,
    pub avatar_url: String,
    pub sub: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Issued token pair
#[derive(Debug, Clone, Serialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

pub struct IdentityService {
    db: PgPool,
    kv: Kv,
    config: AuthConfig,
    oauth: GitHubOAuth,
}

impl IdentityService {
    pub fn new(db: PgPool, kv: Kv, config: AuthConfig) -> Self {
        let oauth = GitHubOAuth::new(
            &config.github_client_id,
            &config.github_client_secret,
            &config.github_redirect_url,
            kv.clone(),
        );
        Self {
            db,
            kv,
            config,
            oauth,
        }
    }

    // ==================== OAuth flow ====================

    /// Start the OAuth flow: mint a state and return the authorization URL
    pub async fn start_oauth_flow(
        &self,
        redirect_url: Option<&str>,
    ) -> NexusResult<(String, String)> {
        if !self.oauth.is_configured() {
            return Err(NexusError::FailedPrecondition(
                "GitHub OAuth is not configured".to_string(),
            ));
        }
        self.oauth.generate_auth_url(redirect_url).await
    }

    /// Complete the OAuth flow: consume the state, exchange the code, upsert
    /// the user, seal the provider token, and issue a bearer pair.
    pub async fn handle_oauth_callback(
        &self,
        code: &str,
        state: &str,
    ) -> NexusResult<(User, TokenPair)> {
        if code.is_empty() || state.is_empty() {
            return Err(NexusError::Validation(
                "code and state are required".to_string(),
            ));
        }

        self.oauth.validate_state(state).await?;

        let gh_token = self.oauth.exchange_code(code).await?;
        let gh_user = self.oauth.fetch_user_with_email(&gh_token).await?;

        let sealed_token = crypto::seal(&self.config.master_key, &gh_token)?;
        let user = self.upsert_user(&gh_user, &sealed_token).await?;
        let tokens = self.generate_tokens_for_user(&user).await?;

        info!(user_id = %user.id, username = %user.username, "OAuth login completed");
        Ok((user, tokens))
    }

    async fn upsert_user(&self, gh_user: &GitHubUser, sealed_token: &str) -> NexusResult<User> {
        let email = gh_user.email.clone().unwrap_or_default();
        let username = if gh_user.login.is_empty() {
            gh_user.name.clone().unwrap_or_default()
        } else {
            gh_user.login.clone()
        };

        let user = sqlx::query_as::<_, User>(
            r#"
            INSERT INTO users (github_id, username, email, avatar_url, plan, github_token_sealed)
            VALUES ($1, $2, $3, $4, 'standard', $5)
            ON CONFLICT (github_id) DO UPDATE SET
                username = EXCLUDED.username,
                email = EXCLUDED.email,
                avatar_url = EXCLUDED.avatar_url,
                github_token_sealed = EXCLUDED.github_token_sealed,
                updated_at = now()
            RETURNING *
            "#,
        )
        .bind(gh_user.id)
        .bind(&username)
        .bind(&email)
        .bind(&gh_user.avatar_url)
        .bind(sealed_token)
        .fetch_one(&self.db)
        .await?;

        Ok(user)
    }

    // ==================== Bearer lifecycle ====================

    /// Issue an access + refresh token pair for a user
    pub async fn generate_tokens_for_user(&self, user: &User) -> NexusResult<TokenPair> {
        let now = Utc::now();
        let expires_at = now + ChronoDuration::from_std(self.config.jwt_ttl)
            .unwrap_or_else(|_| ChronoDuration::minutes(15));
        let jti = Uuid::new_v4().to_string();

        let claims = Claims {
            uid: user.id.to_string(),
            username: user.username.clone(),
            plan: user.plan.clone(),
            avatar_url: user.avatar_url.clone(),
            sub: user.id.to_string(),
            jti,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };

        let access_token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| NexusError::Internal(format!("sign jwt: {}", e)))?;

        let refresh_token = generate_refresh_token();
        let refresh_expires = now + ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS);

        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)
             ON CONFLICT (token_hash) DO UPDATE SET expires_at = EXCLUDED.expires_at",
        )
        .bind(user.id)
        .bind(hash_refresh_token(&refresh_token))
        .bind(refresh_expires)
        .execute(&self.db)
        .await?;

        Ok(TokenPair {
            access_token,
            refresh_token,
            expires_at,
        })
    }

    /// Parse and verify an access token, then check the revocation set
    pub async fn validate_token(&self, token: &str) -> NexusResult<AuthUser> {
        if token.is_empty() {
            return Err(NexusError::Authentication("token is required".to_string()));
        }

        let claims = self.parse_token(token)?;

        if !claims.jti.is_empty() {
            let key = format!("{}{}", BLACKLIST_KEY_PREFIX, claims.jti);
            if self.kv.exists(&key).await? {
                return Err(NexusError::Authentication("token revoked".to_string()));
            }
        }

        let user_id = Uuid::parse_str(&claims.uid)
            .map_err(|_| NexusError::Authentication("invalid token subject".to_string()))?;

        Ok(AuthUser {
            user_id,
            username: claims.username,
            plan: Plan::parse(&claims.plan),
            avatar_url: claims.avatar_url,
        })
    }

    /// Rotate a refresh token: look up by digest, reject absent or expired,
    /// delete the old row and issue a fresh pair in one transaction so two
    /// rows are never simultaneously valid for one lineage.
    pub async fn refresh(&self, refresh_token: &str) -> NexusResult<TokenPair> {
        if refresh_token.is_empty() {
            return Err(NexusError::Validation(
                "refresh_token is required".to_string(),
            ));
        }

        let token_hash = hash_refresh_token(refresh_token);
        let mut tx = self.db.begin().await?;

        let stored = sqlx::query_as::<_, RefreshToken>(
            "SELECT * FROM refresh_tokens WHERE token_hash = $1 FOR UPDATE",
        )
        .bind(&token_hash)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(stored) = stored else {
            return Err(NexusError::Authentication(
                "invalid refresh token".to_string(),
            ));
        };

        if Utc::now() > stored.expires_at {
            sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
                .bind(stored.id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            return Err(NexusError::Authentication(
                "refresh token expired".to_string(),
            ));
        }

        let user = sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(stored.user_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(|| NexusError::NotFound("user not found".to_string()))?;

        sqlx::query("DELETE FROM refresh_tokens WHERE id = $1")
            .bind(stored.id)
            .execute(&mut *tx)
            .await?;

        // Issue the new pair inside the same transaction
        let now = Utc::now();
        let expires_at = now + ChronoDuration::from_std(self.config.jwt_ttl)
            .unwrap_or_else(|_| ChronoDuration::minutes(15));
        let jti = Uuid::new_v4().to_string();
        let claims = Claims {
            uid: user.id.to_string(),
            username: user.username.clone(),
            plan: user.plan.clone(),
            avatar_url: user.avatar_url.clone(),
            sub: user.id.to_string(),
            jti,
            iat: now.timestamp(),
            exp: expires_at.timestamp(),
        };
        let access_token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(self.config.jwt_secret.as_bytes()),
        )
        .map_err(|e| NexusError::Internal(format!("sign jwt: {}", e)))?;

        let new_refresh = generate_refresh_token();
        sqlx::query(
            "INSERT INTO refresh_tokens (user_id, token_hash, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(user.id)
        .bind(hash_refresh_token(&new_refresh))
        .bind(now + ChronoDuration::days(REFRESH_TOKEN_TTL_DAYS))
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(TokenPair {
            access_token,
            refresh_token: new_refresh,
            expires_at,
        })
    }

    /// Revoke an access token: insert its jti into the revocation set with
    /// TTL equal to the remaining lifetime. Best-effort; already-expired
    /// tokens are a no-op.
    pub async fn revoke_token(&self, access_token: &str) -> NexusResult<()> {
        if access_token.is_empty() {
            return Ok(());
        }

        let claims = match self.parse_token(access_token) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "Revoke called with unparseable token");
                return Ok(());
            }
        };

        if claims.jti.is_empty() {
            return Ok(());
        }

        let remaining = claims.exp - Utc::now().timestamp();
        if remaining <= 0 {
            return Ok(());
        }

        let key = format!("{}{}", BLACKLIST_KEY_PREFIX, claims.jti);
        self.kv
            .set_ex(&key, "1", Duration::from_secs(remaining as u64))
            .await?;
        Ok(())
    }

    fn parse_token(&self, token: &str) -> NexusResult<Claims> {
        let mut validation = Validation::default();
        validation.validate_exp = true;
        let data = decode::<Claims>(
            token,
            &DecodingKey::from_secret(self.config.jwt_secret.as_bytes()),
            &validation,
        )
        .map_err(|_| NexusError::Authentication("invalid token".to_string()))?;
        Ok(data.claims)
    }

    // ==================== Plans & profile ====================

    pub async fn get_user(&self, user_id: Uuid) -> NexusResult<User> {
        sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.db)
            .await?
            .ok_or_else(|| NexusError::NotFound("user not found".to_string()))
    }

    pub async fn get_user_plan(&self, user_id: Uuid) -> NexusResult<(Plan, PlanLimits)> {
        let user = self.get_user(user_id).await?;
        let plan = user.plan();
        Ok((plan, plan.limits()))
    }

    /// Update a user's plan. Downgrade validation (excess projects) is the
    /// caller's responsibility; the identity service logs and applies.
    pub async fn update_plan(&self, user_id: Uuid, plan: &str) -> NexusResult<()> {
        let new_plan = Plan::parse_strict(plan).ok_or_else(|| {
            NexusError::Validation("invalid plan. Must be 'standard' or 'premium'".to_string())
        })?;

        let user = self.get_user(user_id).await?;
        let old_plan = user.plan();

        sqlx::query("UPDATE users SET plan = $1, updated_at = now() WHERE id = $2")
            .bind(new_plan.as_str())
            .bind(user_id)
            .execute(&self.db)
            .await?;

        info!(
            user_id = %user_id,
            old_plan = old_plan.as_str(),
            new_plan = new_plan.as_str(),
            "Plan updated"
        );
        Ok(())
    }

    /// Internal: return the decrypted provider token for a user
    pub async fn get_github_token(&self, user_id: Uuid) -> NexusResult<String> {
        let user = self.get_user(user_id).await?;
        if user.github_token_sealed.is_empty() {
            return Err(NexusError::NotFound("github token not found".to_string()));
        }
        Ok(crypto::open(
            &self.config.master_key,
            &user.github_token_sealed,
        )?)
    }

    /// Delete expired refresh token rows; returns the number removed
    pub async fn cleanup_expired_refresh_tokens(&self) -> NexusResult<u64> {
        let result = sqlx::query("DELETE FROM refresh_tokens WHERE expires_at < now()")
            .execute(&self.db)
            .await?;
        Ok(result.rows_affected())
    }
}

fn generate_refresh_token() -> String {
    let mut buf = [0u8; 48];
    rand::thread_rng().fill_bytes(&mut buf);
    URL_SAFE_NO_PAD.encode(buf)
}

fn hash_refresh_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_refresh_token_shape() {
        let a = generate_refresh_token();
        let b = generate_refresh_token();
        assert_ne!(a, b);
        // 48 bytes -> 64 base64url chars, no padding
        assert_eq!(a.len(), 64);
        assert!(!a.contains('='));
    }

    #[test]
    fn test_refresh_token_hash_is_deterministic() {
        let token = "some-refresh-token";
        assert_eq!(hash_refresh_token(token), hash_refresh_token(token));
        assert_ne!(hash_refresh_token(token), hash_refresh_token("other"));
    }

    #[test]
    fn test_claims_round_trip() {
        let secret = "unit-test-secret-key-of-decent-length";
        let now = Utc::now();
        let claims = Claims {
            uid: "11111111-2222-3333-4444-555555555555".to_string(),
            username: "octocat".to_string(),
            plan: "premium".to_string(),
            avatar_url: "https://example/avatar.png".to_string(),
            sub: "11111111-2222-3333-4444-555555555555".to_string(),
            jti: "jti-1".to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + 900,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let decoded = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        )
        .unwrap();
        assert_eq!(decoded.claims.username, "octocat");
        assert_eq!(decoded.claims.plan, "premium");
        assert_eq!(decoded.claims.jti, "jti-1");
    }

    #[test]
    fn test_expired_token_rejected() {
        let secret = "unit-test-secret-key-of-decent-length";
        let now = Utc::now();
        let claims = Claims {
            uid: "u".to_string(),
            username: "octocat".to_string(),
            plan: "standard".to_string(),
            avatar_url: String::new(),
            sub: "u".to_string(),
            jti: "jti-2".to_string(),
            iat: now.timestamp() - 7200,
            exp: now.timestamp() - 3600,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(secret.as_bytes()),
        )
        .unwrap();

        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(secret.as_bytes()),
            &Validation::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_wrong_signature_rejected() {
        let now = Utc::now();
        let claims = Claims {
            uid: "u".to_string(),
            username: "octocat".to_string(),
            plan: "standard".to_string(),
            avatar_url: String::new(),
            sub: "u".to_string(),
            jti: "jti-3".to_string(),
            iat: now.timestamp(),
            exp: now.timestamp() + 900,
        };
        let token = encode(
            &Header::default(),
            &claims,
            &EncodingKey::from_secret(b"secret-one-that-is-long-enough!!"),
        )
        .unwrap();

        let result = decode::<Claims>(
            &token,
            &DecodingKey::from_secret(b"secret-two-that-is-long-enough!!"),
            &Validation::default(),
        );
        assert!(result.is_err());
    }
}
