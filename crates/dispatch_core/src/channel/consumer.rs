//! Consumer loop: decode, handle, settle, resubscribe on connection loss.

use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use dispatch_contract::contract::{Envelope, EnvelopeKind, ValidationError};

use super::{ChannelError, Connector, Delivery, MessageChannel, MessageConsumer, Subscription, Supervisor};
use crate::geo::GeoError;

/// Why a handler refused a message. Every variant except a closed channel
/// rejects the delivery.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unexpected {0} message on this queue")]
    Unexpected(EnvelopeKind),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Geo(#[from] GeoError),

    #[error("collaborator failed: {0}")]
    Collaborator(String),
}

impl From<ValidationError> for HandlerError {
    fn from(err: ValidationError) -> Self {
        HandlerError::Malformed(err.message().to_string())
    }
}

pub trait MessageHandler<C: MessageChannel>: Send + Sync {
    fn handle(
        &self,
        channel: &C,
        envelope: Envelope,
    ) -> impl Future<Output = Result<(), HandlerError>> + Send;
}

/// Consume `subscription` until `shutdown` fires.
///
/// Shutdown is observed between messages; a message being handled is
/// finished and settled first. Returns an error only when the broker cannot be
/// reached within the supervisor's reconnect policy or the topology is
/// rejected.
pub async fn run_consumer<K, H>(
    supervisor: &Supervisor<K>,
    subscription: &Subscription,
    handler: &H,
    shutdown: &CancellationToken,
) -> Result<(), ChannelError>
where
    K: Connector,
    H: MessageHandler<K::Channel>,
{
    let queue = subscription.queue();
    loop {
        let channel = tokio::select! {
            biased;
            _ = shutdown.cancelled() => return Ok(()),
            channel = supervisor.channel() => channel?,
        };
        let mut consumer = match subscribe(&channel, subscription).await {
            Ok(consumer) => consumer,
            Err(ChannelError::Closed) => continue,
            Err(err) => return Err(err),
        };
        info!(queue, "consumer subscribed");

        loop {
            let delivery = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    info!(queue, "consumer stopping");
                    return Ok(());
                }
                delivery = consumer.next() => delivery,
            };
            let settled = match delivery {
                Ok(delivery) => {
                    process(&channel, handler, delivery, queue, subscription.carries()).await
                }
                Err(err) => Err(err),
            };
            match settled {
                Ok(()) => {}
                Err(ChannelError::Closed) => {
                    warn!(queue, "channel closed, resubscribing");
                    break;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

async fn subscribe<C: MessageChannel>(
    channel: &C,
    subscription: &Subscription,
) -> Result<C::Consumer, ChannelError> {
    subscription.declare(channel).await?;
    channel.consume(subscription.queue()).await
}

async fn process<C, H>(
    channel: &C,
    handler: &H,
    delivery: Delivery,
    queue: &str,
    carries: EnvelopeKind,
) -> Result<(), ChannelError>
where
    C: MessageChannel,
    H: MessageHandler<C>,
{
    let envelope = match Envelope::decode(carries, delivery.body()) {
        Ok(envelope) => envelope,
        Err(err) => {
            warn!(
                queue,
                routing_key = delivery.routing_key(),
                expected = %carries,
                error = %err,
                "undecodable message rejected"
            );
            return delivery.reject();
        }
    };

    let kind = envelope.kind();
    match handler.handle(channel, envelope).await {
        Ok(()) => {
            debug!(queue, %kind, "message handled");
            delivery.ack()
        }
        Err(HandlerError::Channel(ChannelError::Closed)) => {
            // Unsettled: dropping hands it back to the broker.
            drop(delivery);
            Err(ChannelError::Closed)
        }
        Err(err) => {
            warn!(queue, %kind, error = %err, "handler failed, message rejected");
            delivery.reject()
        }
    }
}
