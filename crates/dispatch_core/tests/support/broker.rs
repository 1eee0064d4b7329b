#![allow(dead_code)]

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use dispatch_contract::contract::{Envelope, EnvelopeKind};
use dispatch_core::channel::{
    run_consumer, ChannelError, Connector, ExchangeKind, InMemoryBroker, MemoryChannel,
    MessageChannel, MessageConsumer, MessageHandler, QueueOptions, Subscription, Supervisor,
};

use super::eventually;

/// Declare `queue` and bind it to `exchange` so a test can inspect what a
/// component publishes there.
pub async fn capture(
    broker: &InMemoryBroker,
    exchange: &str,
    kind: ExchangeKind,
    routing_key: &str,
    queue: &str,
) {
    let channel = broker.connect().await.expect("connect");
    channel
        .declare_exchange(exchange, kind)
        .await
        .expect("declare exchange");
    channel
        .declare_queue(queue, QueueOptions::default())
        .await
        .expect("declare queue");
    channel
        .bind(queue, exchange, routing_key)
        .await
        .expect("bind capture queue");
}

/// Wait for `count` messages on `queue`, then consume, decode as `carries`
/// and ack them.
pub async fn take(
    broker: &InMemoryBroker,
    queue: &str,
    carries: EnvelopeKind,
    count: usize,
) -> Vec<Envelope> {
    eventually(&format!("{count} message(s) on {queue}"), || {
        broker.queue_depth(queue).unwrap_or(0) >= count
    })
    .await;

    let channel = broker.connect().await.expect("connect");
    let mut consumer = channel.consume(queue).await.expect("consume");
    let mut envelopes = Vec::with_capacity(count);
    for _ in 0..count {
        let delivery = consumer.next().await.expect("delivery");
        envelopes.push(Envelope::decode(carries, delivery.body()).expect("envelope decodes"));
        delivery.ack().expect("ack");
    }
    envelopes
}

/// Run `handler` on `subscription` in a background task.
pub fn spawn_consumer<H>(
    supervisor: Arc<Supervisor<InMemoryBroker>>,
    subscription: Subscription,
    handler: Arc<H>,
    shutdown: CancellationToken,
) -> JoinHandle<Result<(), ChannelError>>
where
    H: MessageHandler<MemoryChannel> + 'static,
{
    tokio::spawn(async move { run_consumer(&supervisor, &subscription, &*handler, &shutdown).await })
}

/// Wait until `queue` has at least `count` subscribers.
pub async fn wait_for_consumers(broker: &InMemoryBroker, queue: &str, count: usize) {
    eventually(&format!("{count} consumer(s) on {queue}"), || {
        broker.consumer_count(queue).unwrap_or(0) >= count
    })
    .await;
}
