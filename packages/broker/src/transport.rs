//! Transport seam between the connection manager and a concrete broker.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use futures_util::Stream;

use crate::BrokerError;

/// Future type for broker round-trips.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// Stream of deliveries from a consumer. Ends when the channel goes away.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Delivery> + Send>>;

/// Called once by a transport when its connection closes.
/// The argument carries the transport error, if the close was not clean.
pub type CloseCallback = Box<dyn FnOnce(Option<String>) + Send + 'static>;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Deliver to queues bound under the exact routing key.
    Direct,
    /// Deliver to every bound queue, ignoring the routing key.
    Fanout,
}

/// What the broker reported when a queue was declared.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueInfo {
    pub name: String,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Message properties set on publish.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    pub correlation_id: Option<String>,
    /// Identity of the publishing process; workers reply to it.
    pub app_id: Option<String>,
    /// Ask the broker to keep the message across restarts.
    pub persistent: bool,
}

impl PublishProperties {
    pub fn persistent() -> Self {
        Self {
            persistent: true,
            ..Default::default()
        }
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_app_id(mut self, id: impl Into<String>) -> Self {
        self.app_id = Some(id.into());
        self
    }
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub correlation_id: Option<String>,
    pub app_id: Option<String>,
    pub routing_key: String,
    pub data: Vec<u8>,
}

/// An open channel on a broker connection.
pub trait BrokerChannel: Send + Sync + 'static {
    /// Declare a durable named queue, creating it if needed.
    fn assert_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, QueueInfo>;

    /// Declare a server-named queue owned by this connection.
    fn declare_exclusive_queue(&self) -> BrokerFuture<'_, QueueInfo>;

    /// Declare a durable exchange.
    fn assert_exchange<'a>(&'a self, name: &'a str, kind: ExchangeKind) -> BrokerFuture<'a, ()>;

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Publish to an exchange; the empty exchange routes by queue name.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
        properties: PublishProperties,
    ) -> BrokerFuture<'a, ()>;

    /// Start consuming without acknowledgements.
    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream>;

    /// Whether the channel and its connection are still usable.
    fn is_open(&self) -> bool;

    /// Close the underlying connection.
    fn close(&self) -> BrokerFuture<'_, ()>;
}

/// Opens connections to a broker.
pub trait Connector: Send + Sync + 'static {
    /// Connect and open one channel. `on_close` fires once if the
    /// connection later closes or fails.
    fn connect<'a>(
        &'a self,
        url: &'a str,
        on_close: CloseCallback,
    ) -> BrokerFuture<'a, Arc<dyn BrokerChannel>>;
}
