//! Broker-agnostic message channel.
//!
//! This module provides:
//!
//! - **MessageChannel**: exchange/queue declaration, publish and consume
//! - **Delivery**: a received message settled by `ack` or `reject`
//! - **InMemoryBroker**: the in-process broker used by tests and single-node runs
//! - **AmqpConnector**: a RabbitMQ connection through lapin
//! - **Supervisor**: bounded reconnect shared by publishers and consumers
//! - **run_consumer**: decode, dispatch to a handler, settle, resubscribe
//!
//! Envelopes travel as bare JSON payloads and are decoded once at the
//! consumer boundary, as the kind the subscription names. Rejected messages
//! are never requeued; they go to the queue's dead-letter exchange when one is
//! configured and are dropped otherwise.

mod amqp;
mod consumer;
mod error;
mod memory;
mod reconnect;
mod routing;
mod subscription;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use dispatch_contract::contract::Envelope;

pub use amqp::{AmqpChannel, AmqpConnector, AmqpConsumer};
pub use consumer::{run_consumer, HandlerError, MessageHandler};
pub use error::ChannelError;
pub use memory::{InMemoryBroker, MemoryChannel, MemoryConsumer};
pub use reconnect::{connect_with_backoff, ReconnectPolicy, Supervisor};
pub use routing::{routes, topic_matches};
pub use subscription::{ExchangeBinding, Subscription};

/// Publishing to this exchange addresses the queue named by the routing key.
pub const DEFAULT_EXCHANGE: &str = "";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExchangeKind {
    Direct,
    Topic,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Topic => "topic",
            ExchangeKind::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    /// Replaces the message's routing key when set.
    pub routing_key: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// At most one consumer, removed with the connection that declared it.
    pub exclusive: bool,
    pub dead_letter: Option<DeadLetter>,
    pub message_ttl: Option<Duration>,
}

impl QueueOptions {
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    pub fn exclusive() -> Self {
        Self {
            exclusive: true,
            ..Self::default()
        }
    }

    pub fn with_dead_letter(mut self, exchange: &str, routing_key: Option<&str>) -> Self {
        self.dead_letter = Some(DeadLetter {
            exchange: exchange.to_string(),
            routing_key: routing_key.map(str::to_string),
        });
        self
    }

    pub fn with_message_ttl(mut self, ttl: Duration) -> Self {
        self.message_ttl = Some(ttl);
        self
    }
}

/// Broker-side settlement of one delivery.
pub trait Settle: Send {
    fn ack(self: Box<Self>) -> Result<(), ChannelError>;
    fn reject(self: Box<Self>) -> Result<(), ChannelError>;
    /// Hand the message back unsettled, as when a connection drops.
    fn release(self: Box<Self>);
}

/// A message handed to one consumer.
///
/// Dropping a delivery without settling it returns the message to its queue
/// flagged as redelivered.
pub struct Delivery {
    body: Vec<u8>,
    exchange: String,
    routing_key: String,
    redelivered: bool,
    settle: Option<Box<dyn Settle>>,
}

impl Delivery {
    pub fn new(
        body: Vec<u8>,
        exchange: String,
        routing_key: String,
        redelivered: bool,
        settle: Box<dyn Settle>,
    ) -> Self {
        Self {
            body,
            exchange,
            routing_key,
            redelivered,
            settle: Some(settle),
        }
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn exchange(&self) -> &str {
        &self.exchange
    }

    pub fn routing_key(&self) -> &str {
        &self.routing_key
    }

    pub fn redelivered(&self) -> bool {
        self.redelivered
    }

    pub fn ack(mut self) -> Result<(), ChannelError> {
        self.settle.take().map_or(Ok(()), |settle| settle.ack())
    }

    pub fn reject(mut self) -> Result<(), ChannelError> {
        self.settle.take().map_or(Ok(()), |settle| settle.reject())
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("redelivered", &self.redelivered)
            .field("bytes", &self.body.len())
            .finish()
    }
}

impl Drop for Delivery {
    fn drop(&mut self) {
        if let Some(settle) = self.settle.take() {
            settle.release();
        }
    }
}

/// One open channel to a broker.
pub trait MessageChannel: Clone + Send + Sync + 'static {
    type Consumer: MessageConsumer;

    /// True once the underlying connection is gone.
    fn is_closed(&self) -> bool;

    fn declare_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn declare_queue(
        &self,
        name: &str,
        options: QueueOptions,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    fn bind(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> impl Future<Output = Result<(), ChannelError>> + Send;

    /// Returns how many queues the message was routed to.
    fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<usize, ChannelError>> + Send;

    fn send_to_queue(
        &self,
        queue: &str,
        envelope: &Envelope,
    ) -> impl Future<Output = Result<usize, ChannelError>> + Send {
        self.publish(DEFAULT_EXCHANGE, queue, envelope)
    }

    fn consume(
        &self,
        queue: &str,
    ) -> impl Future<Output = Result<Self::Consumer, ChannelError>> + Send;
}

pub trait MessageConsumer: Send + 'static {
    /// Wait for the next delivery. Fails with `Closed` when the connection drops.
    fn next(&mut self) -> impl Future<Output = Result<Delivery, ChannelError>> + Send;
}

/// Opens channels; the unit a reconnect policy retries.
pub trait Connector: Send + Sync + 'static {
    type Channel: MessageChannel;

    fn connect(&self) -> impl Future<Output = Result<Self::Channel, ChannelError>> + Send;
}
