//! Service bootstrap: wires the listener, connection, dispatcher and event bus.

use std::sync::Arc;

use actors::{ListenerArgs, ListenerHandle, ModelStatusHooks, start_listener};
use broker::{BrokerConnection, BrokerError, Connector};
use dispatch_core::{ConfigError, QueueConfig};
use staging::SharedStagingArea;
use tokio::task::JoinHandle;

use crate::alert::AlertNotifier;
use crate::dispatcher::WorkDispatcher;
use crate::events::EventBus;

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error("failed to start completion listener: {0}")]
    Listener(String),
}

/// A running dispatch service.
pub struct QueueService {
    connection: BrokerConnection,
    listener: ListenerHandle,
    listener_task: JoinHandle<()>,
    dispatcher: WorkDispatcher,
    events: EventBus,
}

impl QueueService {
    /// Start the service.
    ///
    /// This should be called once at startup. It fails if the configuration
    /// is incomplete or the broker cannot be reached.
    pub async fn start(
        config: QueueConfig,
        connector: Arc<dyn Connector>,
        hooks: Arc<dyn ModelStatusHooks>,
        notifier: Arc<dyn AlertNotifier>,
    ) -> Result<Self, ServiceError> {
        let settings = config.validate()?;
        tracing::info!(host = %settings.host, "Initializing queue service...");

        let (listener, listener_task) =
            start_listener(ListenerArgs::new(hooks, settings.shared_storage.clone()))
                .await
                .map_err(|e| ServiceError::Listener(e.to_string()))?;

        let connection =
            BrokerConnection::new(config, connector).with_reply_sink(listener.sink());
        if let Err(e) = connection.connect().await {
            listener.shutdown();
            return Err(e.into());
        }

        let dispatcher = WorkDispatcher::new(
            connection.clone(),
            SharedStagingArea::new(settings.shared_storage),
            notifier,
        )
        .with_listener(listener.clone());
        let events = EventBus::new(connection.clone());

        tracing::info!("Queue service initialized");
        Ok(Self {
            connection,
            listener,
            listener_task,
            dispatcher,
            events,
        })
    }

    pub fn dispatcher(&self) -> &WorkDispatcher {
        &self.dispatcher
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    pub fn listener(&self) -> &ListenerHandle {
        &self.listener
    }

    pub fn connection(&self) -> &BrokerConnection {
        &self.connection
    }

    /// Stop the listener and close the broker connection.
    pub async fn shutdown(self) {
        self.listener.shutdown();
        if let Err(e) = self.listener_task.await {
            tracing::warn!("Completion listener ended abnormally: {}", e);
        }
        self.connection.close().await;
        tracing::info!("Queue service stopped");
    }
}
