//! In-process broker for development and tests.
//!
//! Mirrors the AMQP semantics the dispatcher relies on: the default
//! exchange routes by queue name, direct exchanges route by exact key,
//! fanout exchanges copy to every bound queue, consumers on one queue are
//! served round-robin, and exclusive queues disappear with the connection
//! that declared them. Connections can be severed and the broker made
//! unreachable to exercise reconnect paths.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use crate::BrokerError;
use crate::transport::{
    BrokerChannel, BrokerFuture, CloseCallback, Connector, Delivery, DeliveryStream, ExchangeKind,
    PublishProperties, QueueInfo,
};

struct Consumer {
    connection: u64,
    tx: mpsc::UnboundedSender<Delivery>,
}

#[derive(Default)]
struct MemoryQueue {
    /// Connection that owns an exclusive queue.
    owner: Option<u64>,
    backlog: VecDeque<Delivery>,
    consumers: Vec<Consumer>,
    next: usize,
}

impl MemoryQueue {
    fn live_consumers(&mut self) -> usize {
        self.consumers.retain(|c| !c.tx.is_closed());
        self.consumers.len()
    }

    fn enqueue(&mut self, mut delivery: Delivery) {
        while self.live_consumers() > 0 {
            let idx = self.next % self.consumers.len();
            self.next = self.next.wrapping_add(1);
            match self.consumers[idx].tx.send(delivery) {
                Ok(()) => return,
                Err(mpsc::error::SendError(returned)) => delivery = returned,
            }
        }
        self.backlog.push_back(delivery);
    }

    fn info(&mut self, name: &str) -> QueueInfo {
        QueueInfo {
            name: name.to_string(),
            message_count: saturating_count(self.backlog.len()),
            consumer_count: saturating_count(self.live_consumers()),
        }
    }
}

fn saturating_count(n: usize) -> u32 {
    u32::try_from(n).unwrap_or(u32::MAX)
}

struct MemoryExchange {
    kind: ExchangeKind,
    /// (queue, routing key)
    bindings: Vec<(String, String)>,
}

struct ConnectionEntry {
    open: Arc<AtomicBool>,
    on_close: Option<CloseCallback>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, MemoryQueue>,
    exchanges: HashMap<String, MemoryExchange>,
    connections: HashMap<u64, ConnectionEntry>,
    anonymous_counter: u64,
}

struct MemoryInner {
    state: Mutex<BrokerState>,
    available: AtomicBool,
    connect_attempts: AtomicUsize,
    next_connection: AtomicU64,
}

/// An in-memory broker shared by every channel opened on it.
#[derive(Clone)]
pub struct MemoryBroker {
    inner: Arc<MemoryInner>,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MemoryInner {
                state: Mutex::new(BrokerState::default()),
                available: AtomicBool::new(true),
                connect_attempts: AtomicUsize::new(0),
                next_connection: AtomicU64::new(1),
            }),
        }
    }

    /// Make new connection attempts succeed or fail.
    pub fn set_available(&self, available: bool) {
        self.inner.available.store(available, Ordering::SeqCst);
    }

    /// Number of connection attempts made so far, successful or not.
    pub fn connect_attempts(&self) -> usize {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    /// Number of currently open connections.
    pub fn open_connections(&self) -> usize {
        self.inner.state.lock().connections.len()
    }

    /// Drop every open connection as if the network went away.
    pub fn sever(&self) {
        let ids: Vec<u64> = self.inner.state.lock().connections.keys().copied().collect();
        for id in ids {
            self.inner.close_connection(id, Some("connection severed".to_string()));
        }
    }

    /// Open a channel with no close notification; handy for playing the worker.
    pub async fn open_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError> {
        self.connect("memory://", Box::new(|_| {})).await
    }

    /// Live consumers on a queue, zero if it does not exist.
    pub fn consumer_count(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get_mut(queue)
            .map_or(0, |q| q.live_consumers())
    }

    /// Messages waiting on a queue for a consumer.
    pub fn queue_depth(&self, queue: &str) -> usize {
        self.inner
            .state
            .lock()
            .queues
            .get(queue)
            .map_or(0, |q| q.backlog.len())
    }

    pub fn has_queue(&self, queue: &str) -> bool {
        self.inner.state.lock().queues.contains_key(queue)
    }
}

impl MemoryInner {
    fn close_connection(&self, id: u64, reason: Option<String>) {
        let callback = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let Some(mut entry) = state.connections.remove(&id) else {
                return;
            };
            entry.open.store(false, Ordering::SeqCst);

            state.queues.retain(|_, q| q.owner != Some(id));
            for queue in state.queues.values_mut() {
                queue.consumers.retain(|c| c.connection != id);
            }
            let queues = &state.queues;
            for exchange in state.exchanges.values_mut() {
                exchange.bindings.retain(|(q, _)| queues.contains_key(q));
            }
            entry.on_close.take()
        };

        if let Some(callback) = callback {
            callback(reason);
        }
    }
}

impl Connector for MemoryBroker {
    fn connect<'a>(
        &'a self,
        _url: &'a str,
        on_close: CloseCallback,
    ) -> BrokerFuture<'a, Arc<dyn BrokerChannel>> {
        Box::pin(async move {
            self.inner.connect_attempts.fetch_add(1, Ordering::SeqCst);
            if !self.inner.available.load(Ordering::SeqCst) {
                return Err(BrokerError::Connection("memory broker unavailable".into()));
            }

            let id = self.inner.next_connection.fetch_add(1, Ordering::SeqCst);
            let open = Arc::new(AtomicBool::new(true));
            self.inner.state.lock().connections.insert(
                id,
                ConnectionEntry {
                    open: open.clone(),
                    on_close: Some(on_close),
                },
            );

            Ok(Arc::new(MemoryChannel {
                broker: self.inner.clone(),
                connection: id,
                open,
            }) as Arc<dyn BrokerChannel>)
        })
    }
}

/// Channel on a [`MemoryBroker`] connection.
pub struct MemoryChannel {
    broker: Arc<MemoryInner>,
    connection: u64,
    open: Arc<AtomicBool>,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), BrokerError> {
        if self.open.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BrokerError::ChannelClosed)
        }
    }

    fn route(
        &self,
        exchange: &str,
        routing_key: &str,
        delivery: Delivery,
    ) -> Result<(), BrokerError> {
        let mut state = self.broker.state.lock();

        if exchange.is_empty() {
            // Unroutable messages are dropped, as the default exchange does.
            if let Some(queue) = state.queues.get_mut(routing_key) {
                queue.enqueue(delivery);
            }
            return Ok(());
        }

        let targets: Vec<String> = {
            let ex = state
                .exchanges
                .get(exchange)
                .ok_or_else(|| BrokerError::publish(exchange, "no such exchange"))?;
            let mut targets: Vec<String> = ex
                .bindings
                .iter()
                .filter(|(_, key)| ex.kind == ExchangeKind::Fanout || key == routing_key)
                .map(|(q, _)| q.clone())
                .collect();
            targets.dedup();
            targets
        };

        for name in targets {
            if let Some(queue) = state.queues.get_mut(&name) {
                queue.enqueue(delivery.clone());
            }
        }
        Ok(())
    }
}

impl BrokerChannel for MemoryChannel {
    fn assert_queue<'a>(&'a self, name: &'a str) -> BrokerFuture<'a, QueueInfo> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.state.lock();
            let queue = state.queues.entry(name.to_string()).or_default();
            if queue.owner.is_some_and(|owner| owner != self.connection) {
                return Err(BrokerError::declare(name, "queue is exclusive to another connection"));
            }
            Ok(queue.info(name))
        })
    }

    fn declare_exclusive_queue(&self) -> BrokerFuture<'_, QueueInfo> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.state.lock();
            state.anonymous_counter += 1;
            let name = format!("amq.gen-{}", state.anonymous_counter);
            let queue = state.queues.entry(name.clone()).or_insert_with(|| MemoryQueue {
                owner: Some(self.connection),
                ..Default::default()
            });
            Ok(queue.info(&name))
        })
    }

    fn assert_exchange<'a>(&'a self, name: &'a str, kind: ExchangeKind) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.state.lock();
            let exchange = state
                .exchanges
                .entry(name.to_string())
                .or_insert_with(|| MemoryExchange {
                    kind,
                    bindings: Vec::new(),
                });
            if exchange.kind != kind {
                return Err(BrokerError::declare(name, "exchange exists with another type"));
            }
            Ok(())
        })
    }

    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut state = self.broker.state.lock();
            if !state.queues.contains_key(queue) {
                return Err(BrokerError::declare(queue, "no such queue"));
            }
            let ex = state
                .exchanges
                .get_mut(exchange)
                .ok_or_else(|| BrokerError::declare(exchange, "no such exchange"))?;
            let binding = (queue.to_string(), routing_key.to_string());
            if !ex.bindings.contains(&binding) {
                ex.bindings.push(binding);
            }
            Ok(())
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
            self.ensure_open()?;
            let delivery = Delivery {
                correlation_id: properties.correlation_id,
                app_id: properties.app_id,
                routing_key: routing_key.to_string(),
                data: body.to_vec(),
            };
            self.route(exchange, routing_key, delivery)
        })
    }

    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream> {
        Box::pin(async move {
            self.ensure_open()?;
            let (tx, rx) = mpsc::unbounded_channel();
            {
                let mut state = self.broker.state.lock();
                let q = state
                    .queues
                    .get_mut(queue)
                    .ok_or_else(|| BrokerError::consume(queue, "no such queue"))?;
                while let Some(delivery) = q.backlog.pop_front() {
                    // The receiver is still in scope, so this cannot fail.
                    let _ = tx.send(delivery);
                }
                q.consumers.push(Consumer {
                    connection: self.connection,
                    tx,
                });
            }

            let stream = futures_util::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|delivery| (delivery, rx))
            });
            Ok(Box::pin(stream) as DeliveryStream)
        })
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn close(&self) -> BrokerFuture<'_, ()> {
        Box::pin(async move {
            self.broker.close_connection(self.connection, None);
            Ok(())
        })
    }
}
