//! In-process broker with AMQP-style exchanges, queues and dead-lettering.
//!
//! Each queue is an unbounded mpsc pair; competing consumers share the
//! receiver behind an async mutex so every message reaches exactly one of
//! them. Connections belong to an epoch: severing cancels the epoch, which
//! closes every channel and consumer opened in it.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use dispatch_contract::contract::Envelope;

use super::routing::routes;
use super::{
    ChannelError, Connector, Delivery, ExchangeKind, MessageChannel, MessageConsumer,
    QueueOptions, Settle, DEFAULT_EXCHANGE,
};

#[derive(Debug)]
struct QueuedMessage {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    enqueued_at: Instant,
    redelivered: bool,
}

struct QueueState {
    name: String,
    options: QueueOptions,
    tx: mpsc::UnboundedSender<QueuedMessage>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<QueuedMessage>>,
    consumers: AtomicUsize,
    depth: AtomicUsize,
}

impl QueueState {
    fn new(name: &str, options: QueueOptions) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.to_string(),
            options,
            tx,
            rx: AsyncMutex::new(rx),
            consumers: AtomicUsize::new(0),
            depth: AtomicUsize::new(0),
        }
    }

    fn push(&self, message: QueuedMessage) {
        self.depth.fetch_add(1, Ordering::SeqCst);
        if self.tx.send(message).is_err() {
            self.depth.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

#[derive(Debug)]
struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    bindings: Vec<Binding>,
}

#[derive(Default)]
struct Topology {
    exchanges: HashMap<String, ExchangeState>,
    queues: HashMap<String, Arc<QueueState>>,
}

struct BrokerCore {
    topology: Mutex<Topology>,
    epoch: Mutex<CancellationToken>,
    accepting: AtomicBool,
    connection_attempts: AtomicUsize,
}

impl Default for BrokerCore {
    fn default() -> Self {
        Self {
            topology: Mutex::new(Topology::default()),
            epoch: Mutex::new(CancellationToken::new()),
            accepting: AtomicBool::new(true),
            connection_attempts: AtomicUsize::new(0),
        }
    }
}

impl BrokerCore {
    fn topology(&self) -> MutexGuard<'_, Topology> {
        self.topology.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn current_epoch(&self) -> CancellationToken {
        self.epoch
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn route(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize, ChannelError> {
        let targets: Vec<Arc<QueueState>> = {
            let topology = self.topology();
            if exchange == DEFAULT_EXCHANGE {
                topology.queues.get(routing_key).cloned().into_iter().collect()
            } else {
                let state = topology
                    .exchanges
                    .get(exchange)
                    .ok_or_else(|| ChannelError::UnknownExchange(exchange.to_string()))?;
                let mut seen = HashSet::new();
                state
                    .bindings
                    .iter()
                    .filter(|binding| routes(state.kind, &binding.routing_key, routing_key))
                    .filter(|binding| seen.insert(binding.queue.as_str()))
                    .filter_map(|binding| topology.queues.get(&binding.queue).cloned())
                    .collect()
            }
        };

        if targets.is_empty() {
            debug!(exchange, routing_key, "message unroutable, dropped");
        }
        let enqueued_at = Instant::now();
        for queue in &targets {
            queue.push(QueuedMessage {
                body: body.to_vec(),
                exchange: exchange.to_string(),
                routing_key: routing_key.to_string(),
                enqueued_at,
                redelivered: false,
            });
        }
        Ok(targets.len())
    }

    fn dead_letter(&self, queue: &QueueState, message: QueuedMessage, reason: &'static str) {
        let Some(dead_letter) = &queue.options.dead_letter else {
            debug!(queue = %queue.name, reason, "message discarded");
            return;
        };
        let routing_key = dead_letter
            .routing_key
            .as_deref()
            .unwrap_or(&message.routing_key);
        match self.route(&dead_letter.exchange, routing_key, &message.body) {
            Ok(routed) => debug!(
                queue = %queue.name,
                dead_letter_exchange = %dead_letter.exchange,
                reason,
                routed,
                "message dead-lettered"
            ),
            Err(err) => warn!(
                queue = %queue.name,
                dead_letter_exchange = %dead_letter.exchange,
                error = %err,
                "dead-letter routing failed, message discarded"
            ),
        }
    }
}

/// Shared handle to one in-process broker. Clones address the same broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    core: Arc<BrokerCore>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every open connection. Exclusive queues go with them.
    pub fn sever_connections(&self) {
        let previous = {
            let mut epoch = self.core.epoch.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *epoch, CancellationToken::new())
        };
        previous.cancel();

        let mut topology = self.core.topology();
        let exclusive: Vec<String> = topology
            .queues
            .values()
            .filter(|queue| queue.options.exclusive)
            .map(|queue| queue.name.clone())
            .collect();
        for name in &exclusive {
            topology.queues.remove(name);
        }
        for exchange in topology.exchanges.values_mut() {
            exchange
                .bindings
                .retain(|binding| !exclusive.contains(&binding.queue));
        }
        warn!(dropped_queues = exclusive.len(), "broker connections severed");
    }

    /// While false, `connect` fails with `ConnectionRefused`.
    pub fn set_accepting_connections(&self, accepting: bool) {
        self.core.accepting.store(accepting, Ordering::SeqCst);
    }

    pub fn connection_attempts(&self) -> usize {
        self.core.connection_attempts.load(Ordering::SeqCst)
    }

    /// Messages waiting in a queue, `None` if it is not declared.
    pub fn queue_depth(&self, queue: &str) -> Option<usize> {
        self.core
            .topology()
            .queues
            .get(queue)
            .map(|state| state.depth.load(Ordering::SeqCst))
    }

    /// Publish raw bytes as a foreign producer would, skipping envelope
    /// encoding.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: &[u8]) -> Result<usize, ChannelError> {
        self.core.route(exchange, routing_key, body)
    }

    pub fn consumer_count(&self, queue: &str) -> Option<usize> {
        self.core
            .topology()
            .queues
            .get(queue)
            .map(|state| state.consumers.load(Ordering::SeqCst))
    }
}

impl Connector for InMemoryBroker {
    type Channel = MemoryChannel;

    async fn connect(&self) -> Result<MemoryChannel, ChannelError> {
        self.core.connection_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.core.accepting.load(Ordering::SeqCst) {
            return Err(ChannelError::ConnectionRefused);
        }
        Ok(MemoryChannel {
            core: Arc::clone(&self.core),
            epoch: self.core.current_epoch(),
        })
    }
}

#[derive(Clone)]
pub struct MemoryChannel {
    core: Arc<BrokerCore>,
    epoch: CancellationToken,
}

impl MemoryChannel {
    fn ensure_open(&self) -> Result<(), ChannelError> {
        if self.epoch.is_cancelled() {
            Err(ChannelError::Closed)
        } else {
            Ok(())
        }
    }
}

impl MessageChannel for MemoryChannel {
    type Consumer = MemoryConsumer;

    fn is_closed(&self) -> bool {
        self.epoch.is_cancelled()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let mut topology = self.core.topology();
        match topology.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(ChannelError::ExchangeMismatch {
                exchange: name.to_string(),
                declared: existing.kind,
                requested: kind,
            }),
            Some(_) => Ok(()),
            None => {
                topology.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        bindings: Vec::new(),
                    },
                );
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let mut topology = self.core.topology();
        match topology.queues.get(name) {
            Some(existing) if existing.options != options => {
                Err(ChannelError::QueueMismatch(name.to_string()))
            }
            Some(_) => Ok(()),
            None => {
                topology
                    .queues
                    .insert(name.to_string(), Arc::new(QueueState::new(name, options)));
                Ok(())
            }
        }
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ChannelError> {
        self.ensure_open()?;
        let mut topology = self.core.topology();
        if !topology.queues.contains_key(queue) {
            return Err(ChannelError::UnknownQueue(queue.to_string()));
        }
        let state = topology
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| ChannelError::UnknownExchange(exchange.to_string()))?;
        let already_bound = state
            .bindings
            .iter()
            .any(|binding| binding.queue == queue && binding.routing_key == routing_key);
        if !already_bound {
            state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<usize, ChannelError> {
        self.ensure_open()?;
        let body = envelope
            .to_bytes()
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        self.core.route(exchange, routing_key, &body)
    }

    async fn consume(&self, queue: &str) -> Result<MemoryConsumer, ChannelError> {
        self.ensure_open()?;
        let state = self
            .core
            .topology()
            .queues
            .get(queue)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownQueue(queue.to_string()))?;

        if state.options.exclusive {
            state
                .consumers
                .compare_exchange(0, 1, Ordering::SeqCst, Ordering::SeqCst)
                .map_err(|_| ChannelError::ExclusiveQueueInUse(queue.to_string()))?;
        } else {
            state.consumers.fetch_add(1, Ordering::SeqCst);
        }

        Ok(MemoryConsumer {
            core: Arc::clone(&self.core),
            queue: state,
            epoch: self.epoch.clone(),
        })
    }
}

pub struct MemoryConsumer {
    core: Arc<BrokerCore>,
    queue: Arc<QueueState>,
    epoch: CancellationToken,
}

impl MessageConsumer for MemoryConsumer {
    async fn next(&mut self) -> Result<Delivery, ChannelError> {
        loop {
            if self.epoch.is_cancelled() {
                return Err(ChannelError::Closed);
            }
            let received = {
                let mut rx = tokio::select! {
                    biased;
                    _ = self.epoch.cancelled() => return Err(ChannelError::Closed),
                    rx = self.queue.rx.lock() => rx,
                };
                tokio::select! {
                    biased;
                    _ = self.epoch.cancelled() => return Err(ChannelError::Closed),
                    message = rx.recv() => message,
                }
            };
            let Some(message) = received else {
                return Err(ChannelError::Closed);
            };
            self.queue.depth.fetch_sub(1, Ordering::SeqCst);

            if let Some(ttl) = self.queue.options.message_ttl {
                if message.enqueued_at.elapsed() > ttl {
                    self.core.dead_letter(&self.queue, message, "expired");
                    continue;
                }
            }

            return Ok(Delivery::new(
                message.body.clone(),
                message.exchange.clone(),
                message.routing_key.clone(),
                message.redelivered,
                Box::new(MemorySettle {
                    core: Arc::clone(&self.core),
                    queue: Arc::clone(&self.queue),
                    epoch: self.epoch.clone(),
                    message,
                }),
            ));
        }
    }
}

impl Drop for MemoryConsumer {
    fn drop(&mut self) {
        self.queue.consumers.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MemorySettle {
    core: Arc<BrokerCore>,
    queue: Arc<QueueState>,
    epoch: CancellationToken,
    message: QueuedMessage,
}

impl MemorySettle {
    fn requeue(self) {
        let mut message = self.message;
        message.redelivered = true;
        self.queue.push(message);
    }
}

impl Settle for MemorySettle {
    fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        if self.epoch.is_cancelled() {
            (*self).requeue();
            return Err(ChannelError::Closed);
        }
        Ok(())
    }

    fn reject(self: Box<Self>) -> Result<(), ChannelError> {
        if self.epoch.is_cancelled() {
            (*self).requeue();
            return Err(ChannelError::Closed);
        }
        let settle = *self;
        settle
            .core
            .dead_letter(&settle.queue, settle.message, "rejected");
        Ok(())
    }

    fn release(self: Box<Self>) {
        (*self).requeue();
    }
}
