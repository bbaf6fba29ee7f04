/// Configuration management for Nexus Deploy
use crate::error::{NexusError, NexusResult};
use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Main server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub service: ServiceConfig,
    pub database: DatabaseConfig,
    pub redis: RedisConfig,
    pub auth: AuthConfig,
    pub webhook: WebhookConfig,
    pub runner: RunnerConfig,
    pub deploy: DeployConfig,
    pub registry: RegistryConfig,
    pub llm: LlmConfig,
    pub cors: CorsConfig,
    pub rate_limit: RateLimitConfig,
    pub logging: LoggingConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceConfig {
    pub host: String,
    pub port: u16,
    pub frontend_url: String,
    /// Address of the notification hub's WebSocket endpoint, dialed by the
    /// edge proxy. Defaults to this process.
    pub hub_url: String,
    /// Address of the runner's HTTP surface, called by the build service for
    /// workspace cleanup. Defaults to this process.
    pub runner_url: String,
}

/// PostgreSQL connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub name: String,
    pub max_connections: u32,
}

impl DatabaseConfig {
    pub fn dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}",
            self.user, self.password, self.host, self.port, self.name
        )
    }
}

/// Redis connection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub password: String,
    pub db: i64,
}

impl RedisConfig {
    pub fn url(&self) -> String {
        if self.password.is_empty() {
            format!("redis://{}:{}/{}", self.host, self.port, self.db)
        } else {
            format!("redis://:{}@{}:{}/{}", self.password, self.host, self.port, self.db)
        }
    }
}

/// Authentication configuration: JWT signing plus GitHub OAuth
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    pub jwt_ttl: Duration,
    pub github_client_id: String,
    pub github_client_secret: String,
    pub github_redirect_url: String,
    /// Master key for sealing stored secrets and provider tokens.
    /// Must be 32 bytes in production; shorter keys are zero-padded.
    pub master_key: String,
}

/// Webhook configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    pub secret: String,
    pub callback_url: String,
}

/// Runner configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    pub work_dir: String,
    pub concurrency: usize,
}

/// Deployment executor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployConfig {
    pub traefik_network: String,
    pub traefik_entrypoint: String,
    pub traefik_domain_suffix: String,
    pub port_range_start: u16,
    pub port_range_end: u16,
}

/// Container registry configuration (optional; empty URL disables push)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistryConfig {
    pub url: String,
    pub user: String,
    pub password: String,
}

/// LLM endpoint configuration for build analysis
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    pub api_url: String,
    pub model: String,
}

/// CORS configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CorsConfig {
    /// Allowed origins; empty means "*"
    pub allowed_origins: Vec<String>,
}

/// Plan-based rate limiting configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_secs: u64,
    /// Requests per window for the standard plan; 0 = unlimited
    pub standard_per_window: u32,
    /// Requests per window for the premium plan; 0 = unlimited
    pub premium_per_window: u32,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "console"
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> NexusResult<Self> {
        dotenv::dotenv().ok();

        let host = env::var("SERVER_HOST").unwrap_or_else(|_| "0.0.0.0".to_string());
        let port = env::var("SERVER_PORT")
            .unwrap_or_else(|_| "8000".to_string())
            .parse()
            .map_err(|_| NexusError::Validation("Invalid SERVER_PORT".to_string()))?;
        let frontend_url =
            env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".to_string());
        let hub_url = env::var("NOTIFICATION_HUB_URL")
            .unwrap_or_else(|_| format!("http://127.0.0.1:{}", port));
        let runner_url =
            env::var("RUNNER_URL").unwrap_or_else(|_| format!("http://127.0.0.1:{}", port));

        let database = DatabaseConfig {
            host: env::var("DB_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("DB_PORT")
                .unwrap_or_else(|_| "5432".to_string())
                .parse()
                .unwrap_or(5432),
            user: env::var("DB_USER").unwrap_or_else(|_| "nexus".to_string()),
            password: env::var("DB_PASSWORD").unwrap_or_default(),
            name: env::var("DB_NAME").unwrap_or_else(|_| "nexus".to_string()),
            max_connections: env::var("DB_MAX_CONNECTIONS")
                .unwrap_or_else(|_| "25".to_string())
                .parse()
                .unwrap_or(25),
        };

        let redis = RedisConfig {
            host: env::var("REDIS_HOST").unwrap_or_else(|_| "localhost".to_string()),
            port: env::var("REDIS_PORT")
                .unwrap_or_else(|_| "6379".to_string())
                .parse()
                .unwrap_or(6379),
            password: env::var("REDIS_PASSWORD").unwrap_or_default(),
            db: env::var("REDIS_DB")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
        };

        let jwt_secret = env::var("JWT_SECRET")
            .map_err(|_| NexusError::Validation("JWT_SECRET is required".to_string()))?;
        let jwt_ttl_secs = env::var("JWT_TTL_SECS")
            .unwrap_or_else(|_| "900".to_string())
            .parse()
            .unwrap_or(900);
        let master_key = env::var("MASTER_ENCRYPTION_KEY")
            .map_err(|_| NexusError::Validation("MASTER_ENCRYPTION_KEY is required".to_string()))?;

        let auth = AuthConfig {
            jwt_secret,
            jwt_ttl: Duration::from_secs(jwt_ttl_secs),
            github_client_id: env::var("GITHUB_CLIENT_ID").unwrap_or_default(),
            github_client_secret: env::var("GITHUB_CLIENT_SECRET").unwrap_or_default(),
            github_redirect_url: env::var("GITHUB_REDIRECT_URL").unwrap_or_default(),
            master_key,
        };

        let webhook = WebhookConfig {
            secret: env::var("GITHUB_WEBHOOK_SECRET").unwrap_or_default(),
            callback_url: env::var("GITHUB_WEBHOOK_CALLBACK_URL")
                .unwrap_or_else(|_| "http://localhost:8000/webhooks/github".to_string()),
        };

        let runner = RunnerConfig {
            work_dir: env::var("RUNNER_WORK_DIR")
                .unwrap_or_else(|_| "/tmp/nexus-builds".to_string()),
            concurrency: env::var("RUNNER_CONCURRENCY")
                .unwrap_or_else(|_| "2".to_string())
                .parse()
                .unwrap_or(2),
        };

        let deploy = DeployConfig {
            traefik_network: env::var("TRAEFIK_NETWORK")
                .unwrap_or_else(|_| "traefik-public".to_string()),
            traefik_entrypoint: env::var("TRAEFIK_ENTRYPOINT")
                .unwrap_or_else(|_| "websecure".to_string()),
            traefik_domain_suffix: env::var("TRAEFIK_DOMAIN_SUFFIX")
                .unwrap_or_else(|_| "localhost".to_string()),
            port_range_start: env::var("DEPLOY_PORT_RANGE_START")
                .unwrap_or_else(|_| "12000".to_string())
                .parse()
                .unwrap_or(12000),
            port_range_end: env::var("DEPLOY_PORT_RANGE_END")
                .unwrap_or_else(|_| "12999".to_string())
                .parse()
                .unwrap_or(12999),
        };

        let registry = RegistryConfig {
            url: env::var("REGISTRY_URL").unwrap_or_default(),
            user: env::var("REGISTRY_USER").unwrap_or_default(),
            password: env::var("REGISTRY_PASSWORD").unwrap_or_default(),
        };

        let llm = LlmConfig {
            api_url: env::var("LLM_API_URL")
                .unwrap_or_else(|_| "http://ollama:11434/api/generate".to_string()),
            model: env::var("LLM_MODEL").unwrap_or_else(|_| "deepseek-coder".to_string()),
        };

        let cors = CorsConfig {
            allowed_origins: env::var("CORS_ALLOWED_ORIGINS")
                .unwrap_or_default()
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
        };

        let rate_limit = RateLimitConfig {
            enabled: env::var("RATE_LIMIT_ENABLED")
                .unwrap_or_else(|_| "true".to_string())
                .parse()
                .unwrap_or(true),
            window_secs: env::var("RATE_LIMIT_WINDOW_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .unwrap_or(60),
            standard_per_window: env::var("RATE_LIMIT_STANDARD")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
            premium_per_window: env::var("RATE_LIMIT_PREMIUM")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .unwrap_or(0),
        };

        let logging = LoggingConfig {
            level: env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
            format: env::var("LOG_FORMAT").unwrap_or_else(|_| "console".to_string()),
        };

        Ok(ServerConfig {
            service: ServiceConfig {
                host,
                port,
                frontend_url,
                hub_url,
                runner_url,
            },
            database,
            redis,
            auth,
            webhook,
            runner,
            deploy,
            registry,
            llm,
            cors,
            rate_limit,
            logging,
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> NexusResult<()> {
        if self.auth.jwt_secret.len() < 32 {
            return Err(NexusError::Validation(
                "JWT secret must be at least 32 characters".to_string(),
            ));
        }
        if self.auth.master_key.is_empty() {
            return Err(NexusError::Validation(
                "Master encryption key cannot be empty".to_string(),
            ));
        }
        if self.deploy.port_range_start >= self.deploy.port_range_end {
            return Err(NexusError::Validation(
                "Deployment port range is empty".to_string(),
            ));
        }
        Ok(())
    }
}
