//! Bounded reconnect with exponential backoff.

use std::time::Duration;

use tokio::sync::Mutex;
use tracing::{info, warn};

use dispatch_contract::contract::Envelope;

use super::{ChannelError, Connector, ExchangeKind, MessageChannel};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 10;
pub const DEFAULT_BASE_DELAY: Duration = Duration::from_millis(500);
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }
}

impl ReconnectPolicy {
    /// Delay after failed attempt `attempt` (1-based): base doubled per
    /// attempt, capped at `max_delay`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// Connect, retrying per `policy`. Fails with `ReconnectExhausted` once every
/// attempt has been refused.
pub async fn connect_with_backoff<K: Connector>(
    connector: &K,
    policy: &ReconnectPolicy,
) -> Result<K::Channel, ChannelError> {
    let attempts = policy.max_attempts.max(1);
    for attempt in 1..=attempts {
        match connector.connect().await {
            Ok(channel) => {
                if attempt > 1 {
                    info!(attempt, "broker connection re-established");
                }
                return Ok(channel);
            }
            Err(err) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    attempt,
                    max_attempts = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "broker connection failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => {
                warn!(attempt, error = %err, "broker connection failed, giving up");
            }
        }
    }
    Err(ChannelError::ReconnectExhausted { attempts })
}

/// Owns the live channel for one component and replaces it when it closes.
///
/// Every fresh channel has the registered exchanges declared before it is
/// handed out, so publishers never race a missing exchange after an outage.
pub struct Supervisor<K: Connector> {
    connector: K,
    policy: ReconnectPolicy,
    exchanges: Vec<(String, ExchangeKind)>,
    current: Mutex<Option<K::Channel>>,
}

impl<K: Connector> Supervisor<K> {
    pub fn new(connector: K, policy: ReconnectPolicy) -> Self {
        Self {
            connector,
            policy,
            exchanges: Vec::new(),
            current: Mutex::new(None),
        }
    }

    pub fn with_exchange(mut self, name: &str, kind: ExchangeKind) -> Self {
        self.exchanges.push((name.to_string(), kind));
        self
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// The open channel, reconnecting first if the last one closed.
    pub async fn channel(&self) -> Result<K::Channel, ChannelError> {
        let mut current = self.current.lock().await;
        if let Some(channel) = current.as_ref().filter(|channel| !channel.is_closed()) {
            return Ok(channel.clone());
        }
        *current = None;

        let channel = connect_with_backoff(&self.connector, &self.policy).await?;
        for (name, kind) in &self.exchanges {
            channel.declare_exchange(name, *kind).await?;
        }
        *current = Some(channel.clone());
        Ok(channel)
    }

    /// Publish, reconnecting once if the channel closed underneath us.
    pub async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope,
    ) -> Result<usize, ChannelError> {
        let channel = self.channel().await?;
        match channel.publish(exchange, routing_key, envelope).await {
            Err(ChannelError::Closed) => {
                warn!(exchange, routing_key, "channel closed during publish, reconnecting");
                self.channel()
                    .await?
                    .publish(exchange, routing_key, envelope)
                    .await
            }
            other => other,
        }
    }
}
