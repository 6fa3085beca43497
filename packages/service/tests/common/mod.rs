#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use actors::{HookFuture, ImportFailure, ModelStatus, ModelStatusHooks};
use broker::{BrokerChannel, BrokerError, DeliveryStream, MemoryBroker, PublishProperties};
use dispatch_core::QueueConfig;
use service::{AlertNotifier, QueueService, ServiceError};
use tempfile::TempDir;
use tokio::sync::mpsc;

pub const WORKER_QUEUE: &str = "jobq";
pub const MODEL_QUEUE: &str = "modelq";
pub const CALLBACK_EXCHANGE: &str = "callbackq";
pub const EVENT_EXCHANGE: &str = "eventExchange";

pub fn config(shared: &Path) -> QueueConfig {
    QueueConfig::new()
        .with_host("memory://")
        .with_shared_storage(shared)
        .with_callback_queue(CALLBACK_EXCHANGE)
        .with_worker_queue(WORKER_QUEUE)
        .with_model_queue(MODEL_QUEUE)
        .with_event_exchange(EVENT_EXCHANGE)
}

#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    Status(String, String),
    Success(String, String, PathBuf),
    Fail(ImportFailure),
}

pub struct RecordingHooks(mpsc::UnboundedSender<HookCall>);

impl ModelStatusHooks for RecordingHooks {
    fn set_status(&self, database: String, project: String, _: ModelStatus) -> HookFuture {
        let _ = self.0.send(HookCall::Status(database, project));
        Box::pin(async { Ok(()) })
    }

    fn import_success(
        &self,
        database: String,
        project: String,
        shared_storage: PathBuf,
    ) -> HookFuture {
        let _ = self.0.send(HookCall::Success(database, project, shared_storage));
        Box::pin(async { Ok(()) })
    }

    fn import_fail(&self, failure: ImportFailure) -> HookFuture {
        let _ = self.0.send(HookCall::Fail(failure));
        Box::pin(async { Ok(()) })
    }
}

pub struct RecordingNotifier(mpsc::UnboundedSender<String>);

impl AlertNotifier for RecordingNotifier {
    fn no_consumer_alert(&self, queue: String) -> HookFuture {
        let _ = self.0.send(queue);
        Box::pin(async { Err("mail server down".to_string()) })
    }
}

pub struct Harness {
    pub broker: MemoryBroker,
    pub service: QueueService,
    pub hooks: mpsc::UnboundedReceiver<HookCall>,
    pub alerts: mpsc::UnboundedReceiver<String>,
    pub shared: TempDir,
}

pub async fn start() -> Result<Harness, ServiceError> {
    let shared = tempfile::tempdir().map_err(|e| ServiceError::Listener(e.to_string()))?;
    let broker = MemoryBroker::new();
    let (hooks_tx, hooks) = mpsc::unbounded_channel();
    let (alerts_tx, alerts) = mpsc::unbounded_channel();

    let service = QueueService::start(
        config(shared.path()),
        Arc::new(broker.clone()),
        Arc::new(RecordingHooks(hooks_tx)),
        Arc::new(RecordingNotifier(alerts_tx)),
    )
    .await?;

    Ok(Harness {
        broker,
        service,
        hooks,
        alerts,
        shared,
    })
}

/// A fake worker consuming one work queue.
pub struct Worker {
    pub channel: Arc<dyn BrokerChannel>,
    pub jobs: DeliveryStream,
}

impl Worker {
    pub async fn attach(broker: &MemoryBroker, queue: &str) -> Result<Self, BrokerError> {
        let channel = broker.open_channel().await?;
        channel.assert_queue(queue).await?;
        let jobs = channel.consume(queue).await?;
        Ok(Self { channel, jobs })
    }

    /// Reply to the dispatcher that sent `app_id`, as real workers do.
    pub async fn reply(
        &self,
        app_id: &str,
        correlation_id: &str,
        body: &str,
    ) -> Result<(), BrokerError> {
        self.channel
            .publish(
                CALLBACK_EXCHANGE,
                app_id,
                body.as_bytes(),
                PublishProperties::default().with_correlation_id(correlation_id),
            )
            .await
    }
}

pub async fn within<T>(fut: impl std::future::Future<Output = T>) -> T {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .expect("timed out")
}
