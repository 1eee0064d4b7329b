//! RabbitMQ transport over lapin.
//!
//! Channels run in publisher-confirm mode, so `publish` resolves once the
//! broker has taken the message. Settlement is sent from a spawned task;
//! a settle that fails because the connection dropped leaves the message
//! for the broker to redeliver.

use std::sync::Arc;

use futures::StreamExt;
use lapin::message::Delivery as AmqpDelivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicPublishOptions, BasicQosOptions,
    ConfirmSelectOptions, ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable};
use lapin::{acker::Acker, BasicProperties, Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

use dispatch_contract::contract::Envelope;

use super::{
    ChannelError, Connector, Delivery, ExchangeKind, MessageChannel, MessageConsumer,
    QueueOptions, Settle,
};

const CONTENT_TYPE: &str = "application/json";
const PERSISTENT: u8 = 2;

/// Opens one confirm-mode channel per connection to an AMQP broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    uri: String,
    prefetch: u16,
}

impl AmqpConnector {
    pub fn new(uri: &str, prefetch: u16) -> Self {
        Self {
            uri: uri.to_string(),
            prefetch: prefetch.max(1),
        }
    }
}

impl Connector for AmqpConnector {
    type Channel = AmqpChannel;

    async fn connect(&self) -> Result<AmqpChannel, ChannelError> {
        let connection = Connection::connect(&self.uri, ConnectionProperties::default())
            .await
            .map_err(|err| {
                warn!(error = %err, "amqp connection failed");
                ChannelError::ConnectionRefused
            })?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|err| ChannelError::Broker(err.to_string()))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|err| ChannelError::Broker(err.to_string()))?;
        channel
            .basic_qos(self.prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| ChannelError::Broker(err.to_string()))?;
        info!(channel_id = channel.id(), prefetch = self.prefetch, "amqp channel open");
        Ok(AmqpChannel {
            _connection: Arc::new(connection),
            channel,
        })
    }
}

#[derive(Clone)]
pub struct AmqpChannel {
    _connection: Arc<Connection>,
    channel: Channel,
}

impl AmqpChannel {
    fn error(&self, err: lapin::Error) -> ChannelError {
        if self.is_closed() {
            ChannelError::Closed
        } else {
            ChannelError::Broker(err.to_string())
        }
    }
}

impl MessageChannel for AmqpChannel {
    type Consumer = AmqpConsumer;

    fn is_closed(&self) -> bool {
        !self.channel.status().connected()
    }

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), ChannelError> {
        self.channel
            .exchange_declare(
                name,
                exchange_kind(kind),
                ExchangeDeclareOptions {
                    durable: true,
                    ..ExchangeDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.error(err))
    }

    async fn declare_queue(&self, name: &str, options: QueueOptions) -> Result<(), ChannelError> {
        let arguments = queue_arguments(&options);
        self.channel
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.exclusive,
                    ..QueueDeclareOptions::default()
                },
                arguments,
            )
            .await
            .map(|_| ())
            .map_err(|err| self.error(err))
    }

    async fn bind(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<(), ChannelError> {
        self.channel
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.error(err))
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<usize, ChannelError> {
        let body = envelope
            .to_bytes()
            .map_err(|err| ChannelError::Encode(err.to_string()))?;
        let properties = BasicProperties::default()
            .with_content_type(CONTENT_TYPE.into())
            .with_delivery_mode(PERSISTENT);
        let confirm = self
            .channel
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|err| self.error(err))?;
        match confirm.await.map_err(|err| self.error(err))? {
            Confirmation::Nack(_) => Err(ChannelError::Broker(format!(
                "publish to '{exchange}' with key '{routing_key}' was nacked"
            ))),
            Confirmation::Ack(_) | Confirmation::NotRequested => Ok(1),
        }
    }

    async fn consume(&self, queue: &str) -> Result<AmqpConsumer, ChannelError> {
        let consumer = self
            .channel
            .basic_consume(
                queue,
                "",
                BasicConsumeOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(|err| self.error(err))?;
        debug!(queue, "amqp consumer registered");
        Ok(AmqpConsumer {
            channel: self.clone(),
            consumer,
        })
    }
}

pub struct AmqpConsumer {
    channel: AmqpChannel,
    consumer: lapin::Consumer,
}

impl MessageConsumer for AmqpConsumer {
    async fn next(&mut self) -> Result<Delivery, ChannelError> {
        match self.consumer.next().await {
            Some(Ok(delivery)) => Ok(into_delivery(delivery)),
            Some(Err(err)) => Err(self.channel.error(err)),
            None => Err(ChannelError::Closed),
        }
    }
}

fn into_delivery(delivery: AmqpDelivery) -> Delivery {
    Delivery::new(
        delivery.data,
        delivery.exchange.as_str().to_string(),
        delivery.routing_key.as_str().to_string(),
        delivery.redelivered,
        Box::new(AmqpSettle {
            acker: delivery.acker,
        }),
    )
}

struct AmqpSettle {
    acker: Acker,
}

impl AmqpSettle {
    fn nack(self, requeue: bool) {
        tokio::spawn(async move {
            let options = BasicNackOptions {
                requeue,
                ..BasicNackOptions::default()
            };
            if let Err(err) = self.acker.nack(options).await {
                warn!(error = %err, requeue, "nack failed");
            }
        });
    }
}

impl Settle for AmqpSettle {
    fn ack(self: Box<Self>) -> Result<(), ChannelError> {
        let acker = self.acker;
        tokio::spawn(async move {
            if let Err(err) = acker.ack(BasicAckOptions::default()).await {
                warn!(error = %err, "ack failed");
            }
        });
        Ok(())
    }

    fn reject(self: Box<Self>) -> Result<(), ChannelError> {
        (*self).nack(false);
        Ok(())
    }

    fn release(self: Box<Self>) {
        (*self).nack(true);
    }
}

fn exchange_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
    }
}

/// `x-` queue arguments for dead-lettering and message TTL.
fn queue_arguments(options: &QueueOptions) -> FieldTable {
    let mut arguments = FieldTable::default();
    if let Some(dead_letter) = &options.dead_letter {
        arguments.insert(
            "x-dead-letter-exchange".into(),
            AMQPValue::LongString(dead_letter.exchange.clone().into()),
        );
        if let Some(key) = &dead_letter.routing_key {
            arguments.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(key.clone().into()),
            );
        }
    }
    if let Some(ttl) = options.message_ttl {
        let millis = u32::try_from(ttl.as_millis()).unwrap_or(u32::MAX);
        arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(millis));
    }
    arguments
}
