//! Domain event fan-out over the event exchange.

use std::time::Duration;

use broker::{BrokerConnection, BrokerError, DeliveryStream, ExchangeKind, PublishProperties};
use dispatch_core::DomainEvent;
use futures_util::StreamExt;
use tokio::task::JoinHandle;

use crate::dispatcher::DispatchOutcome;

const INITIAL_RESUBSCRIBE_DELAY: Duration = Duration::from_millis(100);
const MAX_RESUBSCRIBE_DELAY: Duration = Duration::from_secs(30);

/// Publishes and subscribes to domain events.
#[derive(Clone)]
pub struct EventBus {
    connection: BrokerConnection,
}

impl EventBus {
    pub fn new(connection: BrokerConnection) -> Self {
        Self { connection }
    }

    /// Publish one event to every subscriber. Failures are logged, never returned.
    pub async fn publish(&self, event: &DomainEvent) -> DispatchOutcome {
        let body = match serde_json::to_vec(event) {
            Ok(body) => body,
            Err(e) => {
                tracing::error!(event = %event.event, "Failed to encode event: {}", e);
                return DispatchOutcome::dropped(e.to_string());
            }
        };

        let Some(lease) = self.connection.channel().await else {
            tracing::error!(event = %event.event, "No queue channel, event not published");
            return DispatchOutcome::dropped("broker connection unavailable");
        };
        let exchange = lease.settings.event_exchange.clone();

        let published = async {
            lease
                .channel
                .assert_exchange(&exchange, ExchangeKind::Fanout)
                .await?;
            lease
                .channel
                .publish(&exchange, "", &body, PublishProperties::persistent())
                .await
        };

        let result = published.await;
        match result {
            Ok(()) => {
                tracing::debug!(event = %event.event, %exchange, "Published event");
                DispatchOutcome::Published {
                    target: exchange,
                    consumers: None,
                }
            }
            Err(e) => {
                tracing::error!(event = %event.event, %exchange, "Failed to publish event: {}", e);
                DispatchOutcome::dropped(e.to_string())
            }
        }
    }

    /// Call `callback` with every event published from now on.
    ///
    /// The first binding is made before this returns, so events published
    /// afterwards are not missed. If the connection drops, the subscription
    /// binds again once the connection is back.
    pub async fn subscribe<F>(&self, callback: F) -> Subscription
    where
        F: Fn(DomainEvent) + Send + Sync + 'static,
    {
        let connection = self.connection.clone();
        let first = bind(&connection).await;

        let task = tokio::spawn(async move {
            let mut delay = INITIAL_RESUBSCRIBE_DELAY;
            let mut stream = first;
            loop {
                if let Some(mut deliveries) = stream.take() {
                    delay = INITIAL_RESUBSCRIBE_DELAY;
                    while let Some(delivery) = deliveries.next().await {
                        match serde_json::from_slice::<DomainEvent>(&delivery.data) {
                            Ok(event) => callback(event),
                            Err(e) => tracing::warn!("Skipping malformed event: {}", e),
                        }
                    }
                    tracing::warn!("Event subscription lost, re-subscribing");
                }

                tokio::time::sleep(delay).await;
                delay = (delay * 2).min(MAX_RESUBSCRIBE_DELAY);
                stream = bind(&connection).await;
            }
        });

        Subscription { task }
    }
}

/// Bind a fresh exclusive queue to the event exchange and start consuming.
async fn bind(connection: &BrokerConnection) -> Option<DeliveryStream> {
    let lease = connection.channel().await?;
    let exchange = lease.settings.event_exchange.as_str();

    let result: Result<DeliveryStream, BrokerError> = async {
        lease
            .channel
            .assert_exchange(exchange, ExchangeKind::Fanout)
            .await?;
        let queue = lease.channel.declare_exclusive_queue().await?;
        lease.channel.bind_queue(&queue.name, exchange, "").await?;
        lease.channel.consume(&queue.name).await
    }
    .await;

    match result {
        Ok(stream) => {
            tracing::info!(%exchange, "Subscribed to events");
            Some(stream)
        }
        Err(e) => {
            tracing::error!(%exchange, "Failed to subscribe to events: {}", e);
            None
        }
    }
}

/// A running event subscription. Dropping it unsubscribes.
#[must_use = "dropping a Subscription cancels it"]
pub struct Subscription {
    task: JoinHandle<()>,
}

impl Subscription {
    pub fn cancel(self) {
        drop(self);
    }

    pub fn is_active(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.task.abort();
    }
}
