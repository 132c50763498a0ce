use std::sync::Arc;

use anyhow::Context;

use renderq_api::config::AppConfig;
use renderq_api::handlers::{EchoHandler, HttpForwardHandler};
use renderq_infra::jobs::{JobHandler, JobKind};
use renderq_infra::priority::InMemoryPlanDirectory;
use renderq_infra::queue::JobQueue;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = AppConfig::from_env().context("invalid configuration")?;
    renderq_observability::tracing::init(config.log_format);

    let handler: Arc<dyn JobHandler> = match &config.render_endpoint {
        Some(endpoint) => Arc::new(
            HttpForwardHandler::new(endpoint.clone(), config.scheduler.job_timeout)
                .context("failed to build render client")?,
        ),
        None => {
            tracing::warn!("RENDERQ_RENDER_ENDPOINT not set; jobs are echoed back");
            Arc::new(EchoHandler)
        }
    };

    let plans = Arc::new(InMemoryPlanDirectory::new());
    for (caller, plan) in &config.plans {
        plans.set_plan(caller.clone(), *plan);
    }

    let mut builder = JobQueue::builder()
        .with_scheduler_config(config.scheduler.clone())
        .with_webhook_config(config.webhooks.clone())
        .with_plan_lookup(plans)
        .register_shared(&JobKind::ALL, handler);

    if config.use_persistent_stores {
        builder = builder.with_store(persistent_store(&config).await?);
    }

    let queue = Arc::new(builder.start().context("failed to start job queue")?);
    let app = renderq_api::app::build_app(queue.clone());

    let listener = tokio::net::TcpListener::bind(config.bind_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.bind_addr))?;

    tracing::info!(
        addr = %listener.local_addr()?,
        workers = config.scheduler.max_concurrent,
        "listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    queue.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    tracing::info!("shutdown requested");
}

#[cfg(feature = "postgres")]
async fn persistent_store(
    config: &AppConfig,
) -> anyhow::Result<Arc<dyn renderq_infra::jobs::JobStore>> {
    let url = config
        .database_url
        .as_deref()
        .context("DATABASE_URL is required when USE_PERSISTENT_STORES=true")?;
    let store = renderq_infra::jobs::PostgresJobStore::connect(url)
        .await
        .context("failed to connect to postgres")?;
    tracing::info!("using postgres job store");
    Ok(Arc::new(store))
}

#[cfg(not(feature = "postgres"))]
async fn persistent_store(
    _config: &AppConfig,
) -> anyhow::Result<Arc<dyn renderq_infra::jobs::JobStore>> {
    anyhow::bail!("USE_PERSISTENT_STORES=true requires a build with the `postgres` feature")
}
