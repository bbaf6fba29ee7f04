/// Identity models: users, refresh tokens, plans
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Subscription plan
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    Standard,
    Premium,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Standard => "standard",
            Plan::Premium => "premium",
        }
    }

    /// Unknown plan names fall back to standard
    pub fn parse(s: &str) -> Plan {
        match s {
            "premium" => Plan::Premium,
            _ => Plan::Standard,
        }
    }

    /// Strict parse used for plan updates
    pub fn parse_strict(s: &str) -> Option<Plan> {
        match s {
            "standard" => Some(Plan::Standard),
            "premium" => Some(Plan::Premium),
            _ => None,
        }
    }

    /// Authoritative per-plan limits
    pub fn limits(&self) -> PlanLimits {
        match self {
            Plan::Standard => PlanLimits {
                max_projects: 3,
                max_builds_per_month: 1,
                concurrent_builds: 1,
            },
            Plan::Premium => PlanLimits {
                max_projects: 20,
                max_builds_per_month: 5,
                concurrent_builds: 5,
            },
        }
    }
}

/// Limits enforced at service boundaries
#[derive(Debug, Clone, Copy, Serialize)]
pub struct PlanLimits {
    pub max_projects: i64,
    pub max_builds_per_month: i64,
    pub concurrent_builds: i64,
}

/// User record
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub github_id: i64,
    pub username: String,
    pub email: String,
    pub avatar_url: String,
    pub plan: String,
    #[serde(skip_serializing)]
    pub github_token_sealed: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn plan(&self) -> Plan {
        Plan::parse(&self.plan)
    }
}

/// Refresh token record; only the digest of the opaque value is stored
#[derive(Debug, Clone, FromRow)]
pub struct RefreshToken {
    pub id: Uuid,
    pub user_id: Uuid,
    pub token_hash: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

/// Validated bearer identity injected into request context
#[derive(Debug, Clone, Serialize)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub username: String,
    pub plan: Plan,
    pub avatar_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plan_matrix() {
        let standard = Plan::Standard.limits();
        assert_eq!(standard.max_projects, 3);
        assert_eq!(standard.max_builds_per_month, 1);
        assert_eq!(standard.concurrent_builds, 1);

        let premium = Plan::Premium.limits();
        assert_eq!(premium.max_projects, 20);
        assert_eq!(premium.max_builds_per_month, 5);
        assert_eq!(premium.concurrent_builds, 5);
    }

    #[test]
    fn test_plan_parse_falls_back_to_standard() {
        assert_eq!(Plan::parse("premium"), Plan::Premium);
        assert_eq!(Plan::parse("standard"), Plan::Standard);
        assert_eq!(Plan::parse("enterprise"), Plan::Standard);
        assert_eq!(Plan::parse(""), Plan::Standard);
    }

    #[test]
    fn test_plan_parse_strict() {
        assert_eq!(Plan::parse_strict("premium"), Some(Plan::Premium));
        assert_eq!(Plan::parse_strict("standard"), Some(Plan::Standard));
        assert_eq!(Plan::parse_strict("gold"), None);
    }
}
