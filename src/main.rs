/// Nexus Deploy - self-hosted CI/CD and deployment platform
///
/// One binary hosting the edge router, identity/project/build services, the
/// build runner, the deployment executor, and the notification hub.
mod analyzer;
mod api;
mod build;
mod config;
mod context;
mod crypto;
mod db;
mod deploy;
mod error;
mod hub;
mod identity;
mod jobs;
mod kv;
mod metrics;
mod project;
mod pubsub;
mod queue;
mod rate_limit;
mod runner;
mod server;

use config::ServerConfig;
use context::AppContext;
use error::NexusResult;
use std::sync::Arc;
use tokio::sync::watch;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> NexusResult<()> {
    // Load configuration first so logging respects LOG_LEVEL / LOG_FORMAT
    let config = ServerConfig::from_env()?;
    init_tracing(&config);

    print_banner();

    let ctx = Arc::new(AppContext::new(config).await?);

    // Shutdown signal observed by the queue workers and the hub consumer
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // Build job consumers
    ctx.queue.consume(
        ctx.runner.clone(),
        ctx.config.runner.concurrency,
        shutdown_rx.clone(),
    );

    // Pub/sub -> WebSocket bridge
    tokio::spawn(hub::consumer::run(
        ctx.kv.client().clone(),
        ctx.hub.clone(),
        shutdown_rx,
    ));

    // Periodic maintenance
    let scheduler = Arc::new(jobs::JobScheduler::new(Arc::clone(&ctx)));
    scheduler.start();

    // Flip the shutdown signal on ctrl-c
    {
        let hub = ctx.hub.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Shutdown signal received");
                let _ = shutdown_tx.send(true);
                hub.shutdown();
            }
        });
    }

    server::serve((*ctx).clone()).await?;

    Ok(())
}

fn init_tracing(config: &ServerConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| format!("nexus_deploy={},tower_http=info", config.logging.level).into());

    if config.logging.format == "json" {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}

fn print_banner() {
    println!(
        r#"
    _   __                     ____             __
   / | / /__  _  ____  _______/ __ \___  ____  / /___  __  __
  /  |/ / _ \| |/_/ / / / ___/ / / / _ \/ __ \/ / __ \/ / / /
 / /|  /  __/>  </ /_/ (__  ) /_/ /  __/ /_/ / / /_/ / /_/ /
/_/ |_/\___/_/|_|\__,_/____/_____/\___/ .___/_/\____/\__, /
                                     /_/            /____/

        Nexus Deploy v{}
        "#,
        env!("CARGO_PKG_VERSION")
    );
}
