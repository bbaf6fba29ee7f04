/// Background job scheduler
use crate::context::AppContext;
use std::sync::Arc;
use tokio::time::{interval, Duration};
use tracing::{error, info};

/// Scheduler for periodic maintenance tasks
pub struct JobScheduler {
    context: Arc<AppContext>,
}

impl JobScheduler {
    pub fn new(context: Arc<AppContext>) -> Self {
        Self { context }
    }

    /// Start all background jobs
    pub fn start(self: Arc<Self>) {
        info!("Starting background job scheduler");

        tokio::spawn(Self::expired_token_cleanup_job(Arc::clone(&self)));
        tokio::spawn(Self::rate_limiter_janitor_job(Arc::clone(&self)));

        info!("Background jobs started");
    }

    /// Delete expired refresh tokens (runs every hour)
    async fn expired_token_cleanup_job(scheduler: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(3600));

        loop {
            tick.tick().await;
            match scheduler.context.identity.cleanup_expired_refresh_tokens().await {
                Ok(count) if count > 0 => {
                    info!(count, "Cleaned up expired refresh tokens");
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "Failed to cleanup expired refresh tokens"),
            }
        }
    }

    /// Evict idle rate-limit keys (runs every minute)
    async fn rate_limiter_janitor_job(scheduler: Arc<Self>) {
        let mut tick = interval(Duration::from_secs(60));

        loop {
            tick.tick().await;
            scheduler.context.rate_limiter.cleanup();
        }
    }
}
