//! Message broker access.
//!
//! [`BrokerConnection`] owns the single shared connection and heals it on
//! demand. Concrete brokers sit behind the [`Connector`] and
//! [`BrokerChannel`] traits:
//! - [`AmqpConnector`] talks to RabbitMQ
//! - [`MemoryBroker`] keeps everything in process, for tests and local runs

mod amqp;
mod connection;
mod error;
mod memory;
mod transport;

pub use amqp::{AmqpChannel, AmqpConnector};
pub use connection::{BrokerConnection, ChannelLease, ReplyDelivery, ReplySink};
pub use error::BrokerError;
pub use memory::{MemoryBroker, MemoryChannel};
pub use transport::{
    BrokerChannel, BrokerFuture, CloseCallback, Connector, Delivery, DeliveryStream, ExchangeKind,
    PublishProperties, QueueInfo,
};
