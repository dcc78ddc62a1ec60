//! Batching ingestion service: accepts launch batches over HTTP, queues them
//! and launches everything queued once per consumer cycle.

pub mod config;
pub mod consumer;
pub mod errors;
pub mod metrics_defs;
pub mod queue;
pub mod service;

use consumer::{Consumer, ConsumerStatus};
use errors::BatcherError;
use shared::admin_service::AdminService;
use shared::http::run_http_service;
use std::future::Future;

/// Runs the service until interrupted or until the consumer fails.
pub async fn run(config: config::Config) -> Result<(), BatcherError> {
    run_until(config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    })
    .await
}

pub async fn run_until<F>(config: config::Config, shutdown: F) -> Result<(), BatcherError>
where
    F: Future<Output = ()>,
{
    config.validate()?;
    let launcher = launcher::launcher_from_settings(&config.launch)?;
    let (queue, receiver) = queue::batch_queue();
    let max_launches = config.launch.max_launches;
    let mut consumer = Consumer::start(receiver, launcher, config.poll_interval(), max_launches);

    let batcher_service = service::BatcherService::new(queue, max_launches);
    let admin_service = AdminService::<ConsumerStatus, BatcherError>::new(consumer.status());
    let servers = async {
        tokio::try_join!(
            run_http_service(
                &config.listener.host,
                config.listener.port,
                batcher_service,
                std::future::pending(),
            ),
            run_http_service(
                &config.admin_listener.host,
                config.admin_listener.port,
                admin_service,
                std::future::pending(),
            ),
        )
    };

    tokio::select! {
        served = servers => {
            consumer.stop().await?;
            served.map(|_| ())
        }
        finished = consumer.finished() => finished,
        _ = shutdown => {
            tracing::info!("shutting down");
            consumer.stop().await
        }
    }
}
