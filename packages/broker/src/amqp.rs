//! RabbitMQ transport over AMQP 0-9-1, using `lapin`.

use std::sync::Arc;

use futures_util::StreamExt;
use lapin::options::{
    BasicConsumeOptions, BasicPublishOptions, ExchangeDeclareOptions, QueueBindOptions,
    QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};

use crate::BrokerError;
use crate::transport::{
    BrokerChannel, BrokerFuture, CloseCallback, Connector, Delivery, DeliveryStream, ExchangeKind,
    PublishProperties, QueueInfo,
};

/// AMQP delivery mode for messages the broker must write to disk.
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Connects to RabbitMQ.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self {
            connection_name: "model-dispatch".to_string(),
        }
    }

    /// Name shown for this connection in the broker's management UI.
    pub fn with_connection_name(mut self, name: impl Into<String>) -> Self {
        self.connection_name = name.into();
        self
    }
}

impl Default for AmqpConnector {
    fn default() -> Self {
        Self::new()
    }
}

impl Connector for AmqpConnector {
    fn connect<'a>(
        &'a self,
        url: &'a str,
        on_close: CloseCallback,
    ) -> BrokerFuture<'a, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            let connection = Connection::connect(
                url,
                ConnectionProperties::default()
                    .with_connection_name(self.connection_name.clone().into()),
            )
            .await
            .map_err(|e| BrokerError::Connection(format!("RabbitMQ connection failed: {e}")))?;

            let mut on_close = Some(on_close);
            connection.on_error(move |err| {
                tracing::error!("[AMQP] connection error {}", err);
                if let Some(callback) = on_close.take() {
                    callback(Some(err.to_string()));
                }
            });

            let channel = connection.create_channel().await.map_err(|e| {
                BrokerError::Connection(format!("RabbitMQ channel creation failed: {e}"))
            })?;

            Ok(Arc::new(AmqpChannel {
                connection,
                channel,
            }) as Arc<dyn BrokerChannel>)
        })
    }
}

/// One channel on a RabbitMQ connection.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl AmqpChannel {
    async fn declare(
        &self,
        name: &str,
        options: QueueDeclareOptions,
    ) -> Result<QueueInfo, BrokerError> {
        let queue = self
            .channel
            .queue_declare(name, options, FieldTable::default())
            .await
            .map_err(|e| BrokerError::declare(name, e))?;

        Ok(QueueInfo {
            name: queue.name().as_str().to_string(),
            message_count: queue.message_count(),
            consumer_count: queue.consumer_count(),
        })
    }
}

impl BrokerChannel for AmqpChannel {
    fn assert_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, QueueInfo> {
        Box::pin(self.declare(
            name,
            QueueDeclareOptions {
                durable: true,
                ..Default::default()
            },
        ))
    }

    fn declare_exclusive_queue(&self) -> BrokerFuture<'_, QueueInfo> {
        Box::pin(self.declare(
            "",
            QueueDeclareOptions {
                exclusive: true,
                ..Default::default()
            },
        ))
    }

    fn assert_exchange<'a>(&'a self, name: &'a str, kind: ExchangeKind) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let kind = match kind {
                ExchangeKind::Direct => lapin::ExchangeKind::Direct,
                ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
            };
            self.channel
                .exchange_declare(
                    name,
                    kind,
                    ExchangeDeclareOptions {
                        durable: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::declare(name, e))
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.channel
                .queue_bind(
                    queue,
                    exchange,
                    routing_key,
                    QueueBindOptions::default(),
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::declare(queue, format!("bind to {exchange}: {e}")))
        })
    }

    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        body: &'a [u8],
        properties: PublishProperties,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            let target = if exchange.is_empty() {
                routing_key
            } else {
                exchange
            };

            let mut props = BasicProperties::default();
            if properties.persistent {
                props = props.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
            }
            if let Some(id) = properties.correlation_id {
                props = props.with_correlation_id(id.into());
            }
            if let Some(app_id) = properties.app_id {
                props = props.with_app_id(app_id.into());
            }

            self.channel
                .basic_publish(
                    exchange,
                    routing_key,
                    BasicPublishOptions::default(),
                    body,
                    props,
                )
                .await
                .map_err(|e| BrokerError::publish(target, e))?
                .await
                .map_err(|e| BrokerError::publish(target, format!("confirmation failed: {e}")))?;

            Ok(())
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            let consumer = self
                .channel
                .basic_consume(
                    queue,
                    "",
                    BasicConsumeOptions {
                        no_ack: true,
                        ..Default::default()
                    },
                    FieldTable::default(),
                )
                .await
                .map_err(|e| BrokerError::consume(queue, e))?;

            let queue_name = queue.to_string();
            let stream = consumer.filter_map(move |item| {
                let queue_name = queue_name.clone();
                async move {
                    match item {
                        Ok(delivery) => Some(Delivery {
                            correlation_id: delivery
                                .properties
                                .correlation_id()
                                .as_ref()
                                .map(|id| id.as_str().to_string()),
                            app_id: delivery
                                .properties
                                .app_id()
                                .as_ref()
                                .map(|id| id.as_str().to_string()),
                            routing_key: delivery.routing_key.as_str().to_string(),
                            data: delivery.data,
                        }),
                        Err(e) => {
                            tracing::error!(queue = %queue_name, "[AMQP] consumer error {}", e);
                            None
                        }
                    }
                }
            });

            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            if !self.connection.status().connected() {
                return Ok(());
            }
            self.connection
                .close(200, "OK")
                .await
                .map_err(|e| BrokerError::Connection(format!("close failed: {e}")))
        })
    }
}
