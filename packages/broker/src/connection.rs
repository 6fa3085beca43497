//! Lazily established, self-healing broker connection.
//!
//! One [`BrokerConnection`] is shared by the dispatcher and the event bus.
//! It is opened on first use, validated against the queue configuration,
//! and reopened at most once per [`BrokerConnection::channel`] call after
//! the transport reports it closed.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dispatch_core::{QueueConfig, QueueSettings};
use futures_util::StreamExt;
use parking_lot::RwLock;
use tokio::sync::Mutex;
use ulid::Ulid;

use crate::BrokerError;
use crate::transport::{BrokerChannel, CloseCallback, Connector, ExchangeKind};

/// A reply read from this process's callback queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyDelivery {
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// Receives replies addressed to this process.
pub trait ReplySink: Send + Sync + 'static {
    fn deliver(&self, reply: ReplyDelivery);
}

/// Everything needed to use the connection for one operation.
#[derive(Clone)]
pub struct ChannelLease {
    pub channel: Arc<dyn BrokerChannel>,
    /// Identity of this connection; workers route replies to it.
    pub uid: Arc<str>,
    pub settings: Arc<QueueSettings>,
}

struct Live {
    generation: u64,
    lease: ChannelLease,
}

struct Inner {
    config: QueueConfig,
    connector: Arc<dyn Connector>,
    reply_sink: RwLock<Option<Arc<dyn ReplySink>>>,
    live: RwLock<Option<Live>>,
    connect_lock: Mutex<()>,
    generation: AtomicU64,
}

impl Inner {
    fn healthy_lease(&self) -> Option<ChannelLease> {
        self.live
            .read()
            .as_ref()
            .filter(|live| live.lease.channel.is_open())
            .map(|live| live.lease.clone())
    }

    /// Forget the connection if it is still the one that closed.
    fn closed(&self, generation: u64, reason: Option<String>) {
        let mut live = self.live.write();
        if live.as_ref().is_some_and(|l| l.generation == generation) {
            *live = None;
            match reason {
                Some(reason) => tracing::error!(generation, "[AMQP] connection closed: {}", reason),
                None => tracing::info!(generation, "[AMQP] connection closed"),
            }
        }
    }
}

/// Shared handle to the broker connection.
#[derive(Clone)]
pub struct BrokerConnection {
    inner: Arc<Inner>,
}

impl BrokerConnection {
    pub fn new(config: QueueConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                connector,
                reply_sink: RwLock::new(None),
                live: RwLock::new(None),
                connect_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    /// Consume replies on every (re)connect and hand them to `sink`.
    pub fn with_reply_sink(self, sink: Arc<dyn ReplySink>) -> Self {
        *self.inner.reply_sink.write() = Some(sink);
        self
    }

    /// Whether an open connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.inner.healthy_lease().is_some()
    }

    /// Identity of the current connection, if any.
    pub fn uid(&self) -> Option<Arc<str>> {
        self.inner.live.read().as_ref().map(|l| l.lease.uid.clone())
    }

    /// Open the connection if it is not already open.
    ///
    /// Configuration is validated before any network activity; a missing
    /// field fails with [`BrokerError::Config`].
    pub async fn connect(&self) -> Result<(), BrokerError> {
        if self.is_connected() {
            return Ok(());
        }
        let _guard = self.inner.connect_lock.lock().await;
        if self.is_connected() {
            return Ok(());
        }
        self.establish().await.map(|_| ())
    }

    /// A usable channel, reconnecting once if the previous connection died.
    ///
    /// Returns `None` when the reconnect fails; the failure is logged.
    pub async fn channel(&self) -> Option<ChannelLease> {
        if let Some(lease) = self.inner.healthy_lease() {
            return Some(lease);
        }
        let _guard = self.inner.connect_lock.lock().await;
        if let Some(lease) = self.inner.healthy_lease() {
            return Some(lease);
        }

        tracing::info!("Reconnecting to queue...");
        match self.establish().await {
            Ok(lease) => {
                tracing::info!(uid = %lease.uid, "Reconnected to queue");
                Some(lease)
            }
            Err(e) => {
                tracing::error!("Failed to get channel: {}", e);
                None
            }
        }
    }

    /// Close the current connection, if any.
    pub async fn close(&self) {
        let _guard = self.inner.connect_lock.lock().await;
        let live = self.inner.live.write().take();
        if let Some(live) = live {
            if let Err(e) = live.lease.channel.close().await {
                tracing::warn!("Failed to close queue connection: {}", e);
            }
        }
    }

    /// Callers must hold `connect_lock`.
    async fn establish(&self) -> Result<ChannelLease, BrokerError> {
        let settings = Arc::new(self.inner.config.validate()?);
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let uid: Arc<str> = short_uid().into();

        let weak = Arc::downgrade(&self.inner);
        let on_close: CloseCallback = Box::new(move |reason| {
            if let Some(inner) = weak.upgrade() {
                inner.closed(generation, reason);
            }
        });

        let channel = self
            .inner
            .connector
            .connect(&settings.host, on_close)
            .await?;
        let lease = ChannelLease {
            channel,
            uid,
            settings,
        };

        let sink = self.inner.reply_sink.read().clone();
        if let Some(sink) = sink {
            if let Err(e) = consume_replies(&lease, sink).await {
                if let Err(close_err) = lease.channel.close().await {
                    tracing::warn!("Failed to close queue connection: {}", close_err);
                }
                return Err(e);
            }
        }

        *self.inner.live.write() = Some(Live {
            generation,
            lease: lease.clone(),
        });
        tracing::info!(uid = %lease.uid, host = %lease.settings.host, "Connected to queue");
        Ok(lease)
    }
}

/// Bind an exclusive queue to the callback exchange under our uid and
/// forward everything that arrives on it.
async fn consume_replies(
    lease: &ChannelLease,
    sink: Arc<dyn ReplySink>,
) -> Result<(), BrokerError> {
    let exchange = lease.settings.callback_queue.as_str();
    let channel = &lease.channel;

    channel.assert_exchange(exchange, ExchangeKind::Direct).await?;
    let queue = channel.declare_exclusive_queue().await?;
    channel.bind_queue(&queue.name, exchange, &lease.uid).await?;
    let mut deliveries = channel.consume(&queue.name).await?;

    let uid = lease.uid.clone();
    tokio::spawn(async move {
        while let Some(delivery) = deliveries.next().await {
            tracing::info!(
                correlation_id = delivery.correlation_id.as_deref().unwrap_or("-"),
                "Job request returned with: {}",
                String::from_utf8_lossy(&delivery.data)
            );
            sink.deliver(ReplyDelivery {
                correlation_id: delivery.correlation_id,
                body: delivery.data,
            });
        }
        tracing::debug!(%uid, "Reply consumer stopped");
    });

    Ok(())
}

/// Twelve characters from the random half of a ULID.
fn short_uid() -> String {
    let id = Ulid::new().to_string();
    id[id.len() - 12..].to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
    #![allow(clippy::disallowed_methods)]

    use std::time::Duration;

    use dispatch_core::ConfigError;
    use tokio::sync::mpsc;

    use super::*;
    use crate::MemoryBroker;
    use crate::transport::PublishProperties;

    fn config() -> QueueConfig {
        QueueConfig::new()
            .with_host("memory://")
            .with_shared_storage("/tmp/staging")
            .with_callback_queue("callbacks")
            .with_worker_queue("jobs")
            .with_model_queue("models")
            .with_event_exchange("events")
    }

    struct ChannelSink(mpsc::UnboundedSender<ReplyDelivery>);

    impl ReplySink for ChannelSink {
        fn deliver(&self, reply: ReplyDelivery) {
            let _ = self.0.send(reply);
        }
    }

    #[tokio::test]
    async fn missing_config_fails_before_connecting() {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(
            config().with_model_queue(""),
            Arc::new(broker.clone()),
        );

        let err = conn.connect().await.unwrap_err();
        assert!(matches!(err, BrokerError::Config(ConfigError::Missing("model_queue"))));
        assert_eq!(err.to_string(), "Please define model_queue in queue config");
        assert_eq!(broker.connect_attempts(), 0);
    }

    #[tokio::test]
    async fn connect_is_idempotent() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()));

        conn.connect().await?;
        conn.connect().await?;
        assert!(conn.is_connected());
        assert_eq!(broker.connect_attempts(), 1);
        assert_eq!(broker.open_connections(), 1);
        Ok(())
    }

    #[tokio::test]
    async fn unreachable_broker_surfaces_on_connect() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()));

        assert!(matches!(conn.connect().await, Err(BrokerError::Connection(_))));
        assert!(!conn.is_connected());
    }

    #[tokio::test]
    async fn severed_connection_is_reopened_once_with_a_new_uid() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()));
        conn.connect().await?;
        let first_uid = conn.uid().unwrap();

        broker.sever();
        assert!(!conn.is_connected());

        let lease = conn.channel().await.unwrap();
        assert!(lease.channel.is_open());
        assert_ne!(lease.uid, first_uid);
        assert_eq!(broker.connect_attempts(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn failed_reconnect_yields_no_channel() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()));
        conn.connect().await?;

        broker.set_available(false);
        broker.sever();

        assert!(conn.channel().await.is_none());
        assert_eq!(broker.connect_attempts(), 2);

        broker.set_available(true);
        assert!(conn.channel().await.is_some());
        assert_eq!(broker.connect_attempts(), 3);
        Ok(())
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_reconnect() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()));
        conn.connect().await?;
        broker.sever();

        let (a, b) = tokio::join!(conn.channel(), conn.channel());
        assert_eq!(a.unwrap().uid, b.unwrap().uid);
        assert_eq!(broker.connect_attempts(), 2);
        Ok(())
    }

    #[tokio::test]
    async fn replies_routed_by_uid_reach_the_sink() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()))
            .with_reply_sink(Arc::new(ChannelSink(tx)));
        conn.connect().await?;
        let uid = conn.uid().unwrap();

        let worker = broker.open_channel().await?;
        worker
            .publish(
                "callbacks",
                &uid,
                br#"{"status":"processing"}"#,
                PublishProperties::default().with_correlation_id("job-1"),
            )
            .await?;
        worker
            .publish(
                "callbacks",
                "someone-else",
                b"{}",
                PublishProperties::default().with_correlation_id("job-2"),
            )
            .await?;

        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reply.correlation_id.as_deref(), Some("job-1"));
        assert_eq!(reply.body, br#"{"status":"processing"}"#);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[tokio::test]
    async fn close_releases_the_connection() -> Result<(), BrokerError> {
        let broker = MemoryBroker::new();
        let conn = BrokerConnection::new(config(), Arc::new(broker.clone()));
        conn.connect().await?;

        conn.close().await;
        assert!(!conn.is_connected());
        assert_eq!(broker.open_connections(), 0);
        Ok(())
    }

    #[test]
    fn uid_is_short_and_lowercase() {
        let uid = short_uid();
        assert_eq!(uid.len(), 12);
        assert_eq!(uid, uid.to_ascii_lowercase());
    }
}
