use dispatch_contract::contract::EnvelopeKind;
use dispatch_contract::topology::dead_letter_queue;

use super::{ChannelError, ExchangeKind, MessageChannel, QueueOptions};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeBinding {
    pub exchange: String,
    pub kind: ExchangeKind,
    pub routing_key: String,
}

/// A queue plus everything that must exist for it to receive messages.
///
/// Declared on every (re)connect; all declarations are idempotent. Every body
/// on the queue is decoded as `carries`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    queue: String,
    carries: EnvelopeKind,
    options: QueueOptions,
    bindings: Vec<ExchangeBinding>,
}

impl Subscription {
    pub fn new(queue: &str, carries: EnvelopeKind, options: QueueOptions) -> Self {
        Self {
            queue: queue.to_string(),
            carries,
            options,
            bindings: Vec::new(),
        }
    }

    pub fn carries(&self) -> EnvelopeKind {
        self.carries
    }

    pub fn bind(mut self, exchange: &str, kind: ExchangeKind, routing_key: &str) -> Self {
        self.bindings.push(ExchangeBinding {
            exchange: exchange.to_string(),
            kind,
            routing_key: routing_key.to_string(),
        });
        self
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn options(&self) -> &QueueOptions {
        &self.options
    }

    pub fn bindings(&self) -> &[ExchangeBinding] {
        &self.bindings
    }

    /// Declare the queue, its dead-letter queue if configured, and bindings.
    pub async fn declare<C: MessageChannel>(&self, channel: &C) -> Result<(), ChannelError> {
        if let Some(dead_letter) = &self.options.dead_letter {
            let parked = dead_letter_queue(&self.queue);
            let key = dead_letter.routing_key.as_deref().unwrap_or(&self.queue);
            channel
                .declare_exchange(&dead_letter.exchange, ExchangeKind::Direct)
                .await?;
            channel
                .declare_queue(&parked, QueueOptions::durable())
                .await?;
            channel.bind(&parked, &dead_letter.exchange, key).await?;
        }

        channel.declare_queue(&self.queue, self.options.clone()).await?;
        for binding in &self.bindings {
            channel
                .declare_exchange(&binding.exchange, binding.kind)
                .await?;
            channel
                .bind(&self.queue, &binding.exchange, &binding.routing_key)
                .await?;
        }
        Ok(())
    }
}
