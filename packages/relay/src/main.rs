//! Connects to the broker, tracks worker replies and logs domain events.
//!
//! Configuration comes from `QUEUE_*` environment variables.

use std::sync::Arc;

use actors::LoggingHooks;
use broker::AmqpConnector;
use dispatch_core::QueueConfig;
use service::{LogAlertNotifier, QueueService};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let service = QueueService::start(
        QueueConfig::from_env(),
        Arc::new(AmqpConnector::new().with_connection_name("relay")),
        Arc::new(LoggingHooks),
        Arc::new(LogAlertNotifier),
    )
    .await?;

    let subscription = service
        .events()
        .subscribe(|event| {
            if !event.is_routable() {
                tracing::warn!(event = %event.event, "Event cannot be routed");
                return;
            }
            tracing::info!(
                room = %event.room(),
                channel = %event.channel_name(),
                emitter = %event.emitter,
                "Event"
            );
        })
        .await;

    tokio::signal::ctrl_c().await?;
    tracing::info!("Shutting down...");

    subscription.cancel();
    service.shutdown().await;
    Ok(())
}
