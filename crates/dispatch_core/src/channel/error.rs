use thiserror::Error;

use super::ExchangeKind;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel is closed")]
    Closed,

    #[error("broker refused the connection")]
    ConnectionRefused,

    #[error("gave up reconnecting after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },

    #[error("exchange '{0}' is not declared")]
    UnknownExchange(String),

    #[error("queue '{0}' is not declared")]
    UnknownQueue(String),

    #[error("exchange '{exchange}' already declared as {declared}, not {requested}")]
    ExchangeMismatch {
        exchange: String,
        declared: ExchangeKind,
        requested: ExchangeKind,
    },

    #[error("queue '{0}' already declared with different options")]
    QueueMismatch(String),

    #[error("exclusive queue '{0}' already has a consumer")]
    ExclusiveQueueInUse(String),

    #[error("failed to encode envelope: {0}")]
    Encode(String),

    #[error("broker error: {0}")]
    Broker(String),
}
