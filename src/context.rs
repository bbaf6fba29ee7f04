/// Application context and dependency wiring
use crate::analyzer::Analyzer;
use crate::build::BuildService;
use crate::config::ServerConfig;
use crate::db;
use crate::deploy::DeploymentExecutor;
use crate::error::NexusResult;
use crate::hub::Hub;
use crate::identity::IdentityService;
use crate::kv::Kv;
use crate::project::ProjectService;
use crate::pubsub::Publisher;
use crate::queue::JobQueue;
use crate::rate_limit::PlanRateLimiter;
use crate::runner::BuildRunner;
use sqlx::PgPool;
use std::sync::Arc;

/// Application context holding all shared services
#[derive(Clone)]
pub struct AppContext {
    pub config: Arc<ServerConfig>,
    pub db: PgPool,
    pub kv: Kv,
    pub queue: JobQueue,
    pub publisher: Publisher,
    pub identity: Arc<IdentityService>,
    pub projects: Arc<ProjectService>,
    pub builds: Arc<BuildService>,
    pub runner: Arc<BuildRunner>,
    pub executor: Arc<DeploymentExecutor>,
    pub analyzer: Arc<Analyzer>,
    pub hub: Hub,
    pub rate_limiter: Arc<PlanRateLimiter>,
}

impl AppContext {
    /// Build the full service graph from configuration
    pub async fn new(config: ServerConfig) -> NexusResult<Self> {
        config.validate()?;

        let db = db::create_pool(&config.database).await?;
        db::run_migrations(&db).await?;
        db::test_connection(&db).await?;

        let kv = Kv::connect(&config.redis.url()).await?;
        let queue = JobQueue::new(kv.clone());
        let publisher = Publisher::new(kv.clone());

        let identity = Arc::new(IdentityService::new(
            db.clone(),
            kv.clone(),
            config.auth.clone(),
        ));

        let projects = Arc::new(ProjectService::new(
            db.clone(),
            Arc::clone(&identity),
            config.auth.master_key.clone(),
            config.webhook.callback_url.clone(),
        ));

        let builds = Arc::new(BuildService::new(
            db.clone(),
            Arc::clone(&identity),
            queue.clone(),
            config.service.runner_url.clone(),
        ));

        let build_executor = Arc::new(
            crate::runner::docker::DockerExecutor::new(
                &config.registry.url,
                &config.registry.user,
                &config.registry.password,
                &config.runner.work_dir,
            )
            .await?,
        );

        let runner = Arc::new(BuildRunner::new(
            Arc::clone(&projects),
            Arc::clone(&builds),
            build_executor,
            publisher.clone(),
        ));

        let executor = Arc::new(DeploymentExecutor::new(config.deploy.clone()).await?);

        let analyzer = Arc::new(Analyzer::new(
            kv.clone(),
            Arc::clone(&builds),
            config.llm.clone(),
        ));

        let hub = Hub::start();
        let rate_limiter = Arc::new(PlanRateLimiter::new(&config.rate_limit));

        Ok(Self {
            config: Arc::new(config),
            db,
            kv,
            queue,
            publisher,
            identity,
            projects,
            builds,
            runner,
            executor,
            analyzer,
            hub,
            rate_limiter,
        })
    }
}
