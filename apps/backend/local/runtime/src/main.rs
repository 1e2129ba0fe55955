#[cfg(not(any(all(target_os = "macos", target_arch = "aarch64"), target_os = "ios")))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

use std::sync::Arc;

use axum::routing::get;
use dotenv::dotenv;
use jobplane_api::Platform;
use jobplane_api::execution::{LogStatusSink, StatusSink, WebhookStatusSink};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod config;
mod metrics;

#[tokio::main]
async fn main() -> jobplane_types::Result<()> {
    dotenv().ok();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    tracing::info!("Starting jobplane local runtime");

    metrics::init_metrics()?;

    let config = config::Config::from_env()?;
    tracing::info!(
        bind = %config.platform.server.bind,
        capacity = config.platform.worker.capacity,
        visibility_timeout_secs = config.platform.queue.visibility_timeout_secs,
        max_attempts = config.platform.queue.max_attempts,
        "Loaded configuration"
    );

    let status_sink: Arc<dyn StatusSink> = match &config.status_webhook {
        Some(url) => {
            tracing::info!(url = %url, "Publishing status reports to webhook");
            Arc::new(WebhookStatusSink::new(
                url.clone(),
                config.status_webhook_timeout,
                config.status_webhook_retries,
            ))
        }
        None => Arc::new(LogStatusSink),
    };

    let bind = config.platform.server.bind;
    let platform = Platform::builder(config.platform)
        .status_sink(status_sink)
        .build()?;

    let shutdown = CancellationToken::new();
    let dispatcher = platform.spawn_dispatcher(shutdown.clone());

    let app = platform
        .router()
        .route("/metrics", get(metrics::serve_metrics));

    let listener = tokio::net::TcpListener::bind(bind).await?;
    tracing::info!("Runtime listening on {}", bind);

    axum::serve(listener, app)
        .with_graceful_shutdown({
            let shutdown = shutdown.clone();
            async move {
                if let Err(e) = tokio::signal::ctrl_c().await {
                    tracing::error!(error = %e, "Failed to listen for shutdown signal");
                    std::future::pending::<()>().await;
                }
                tracing::info!("Shutdown requested");
                shutdown.cancel();
            }
        })
        .await?;

    shutdown.cancel();
    if let Err(e) = dispatcher.await {
        tracing::warn!(error = %e, "Dispatcher task ended abnormally");
    }

    tracing::info!("Runtime stopped");
    Ok(())
}
