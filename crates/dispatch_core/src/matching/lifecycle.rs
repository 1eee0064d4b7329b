//! Booking lifecycle consumer: closes requests and frees their drivers.

use std::sync::Arc;

use tracing::{debug, info};

use dispatch_contract::contract::{BookingStatus, BookingUpdate, Envelope, EnvelopeKind};
use dispatch_contract::topology::{
    BOOKINGS_EXCHANGE, BOOKING_CANCELLED_KEY, BOOKING_COMPLETED_KEY, BOOKING_UPDATES_QUEUE,
    DEAD_LETTER_EXCHANGE,
};

use super::ledger::AssignmentLedger;
use super::types::Settlement;
use crate::channel::{
    ExchangeKind, HandlerError, MessageChannel, MessageHandler, QueueOptions, Subscription,
};

/// Completed and cancelled bookings from the bookings exchange.
pub fn lifecycle_subscription() -> Subscription {
    Subscription::new(
        BOOKING_UPDATES_QUEUE,
        EnvelopeKind::BookingUpdated,
        QueueOptions::durable().with_dead_letter(DEAD_LETTER_EXCHANGE, Some(BOOKING_UPDATES_QUEUE)),
    )
    .bind(BOOKINGS_EXCHANGE, ExchangeKind::Topic, BOOKING_COMPLETED_KEY)
    .bind(BOOKINGS_EXCHANGE, ExchangeKind::Topic, BOOKING_CANCELLED_KEY)
}

pub struct BookingLifecycle<L: AssignmentLedger> {
    ledger: Arc<L>,
}

impl<L: AssignmentLedger> BookingLifecycle<L> {
    pub fn new(ledger: Arc<L>) -> Self {
        Self { ledger }
    }

    /// Apply one update. Returns the driver it freed, if any.
    pub async fn apply(&self, update: &BookingUpdate) -> Result<Option<String>, HandlerError> {
        let request_id = update.request_id.trim();
        if request_id.is_empty() {
            return Err(HandlerError::Malformed("requestId cannot be empty".to_string()));
        }
        let settlement = match update.event {
            BookingStatus::Completed => Settlement::Completed,
            BookingStatus::Cancelled => Settlement::Cancelled,
            BookingStatus::Created | BookingStatus::Updated => {
                debug!(request_id, event = update.event.as_str(), "booking update ignored");
                return Ok(None);
            }
        };

        let freed = self
            .ledger
            .settle(request_id, settlement)
            .await
            .map_err(HandlerError::Collaborator)?;
        match &freed {
            Some(worker_id) => info!(
                request_id,
                worker_id = %worker_id,
                event = update.event.as_str(),
                "booking closed, driver released"
            ),
            None => debug!(request_id, event = update.event.as_str(), "booking closed"),
        }
        Ok(freed)
    }
}

impl<C, L> MessageHandler<C> for BookingLifecycle<L>
where
    C: MessageChannel,
    L: AssignmentLedger,
{
    async fn handle(&self, _channel: &C, envelope: Envelope) -> Result<(), HandlerError> {
        match envelope {
            Envelope::BookingUpdated(update) => self.apply(&update).await.map(|_| ()),
            other => Err(HandlerError::Unexpected(other.kind())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matching::ledger::{InMemoryAssignmentLedger, LedgerMode};

    fn update(event: BookingStatus, request_id: &str) -> BookingUpdate {
        BookingUpdate {
            event,
            request_id: request_id.to_string(),
            customer_id: Some("c-1".to_string()),
            worker_id: None,
            timestamp: None,
        }
    }

    #[tokio::test]
    async fn completion_frees_the_assigned_driver() {
        let ledger = Arc::new(InMemoryAssignmentLedger::new(LedgerMode::Permissive));
        ledger.claim("r1", "w1").await.expect("claim");
        let lifecycle = BookingLifecycle::new(ledger.clone());

        let freed = lifecycle
            .apply(&update(BookingStatus::Completed, "r1"))
            .await
            .expect("apply");

        assert_eq!(freed.as_deref(), Some("w1"));
        assert_eq!(ledger.is_available("w1").await, Ok(true));
    }

    #[tokio::test]
    async fn cancellation_before_assignment_closes_the_request() {
        let ledger = Arc::new(InMemoryAssignmentLedger::new(LedgerMode::Permissive));
        let lifecycle = BookingLifecycle::new(ledger.clone());

        lifecycle
            .apply(&update(BookingStatus::Cancelled, "r1"))
            .await
            .expect("apply");

        assert_eq!(
            ledger.claim("r1", "w1").await,
            Ok(crate::matching::ClaimOutcome::UnknownRequest)
        );
    }

    #[tokio::test]
    async fn created_updates_leave_the_ledger_alone() {
        let ledger = Arc::new(InMemoryAssignmentLedger::new(LedgerMode::Permissive));
        let lifecycle = BookingLifecycle::new(ledger.clone());

        let freed = lifecycle
            .apply(&update(BookingStatus::Created, "r1"))
            .await
            .expect("apply");

        assert_eq!(freed, None);
        assert_eq!(ledger.tracked(), (0, 0));
    }

    #[tokio::test]
    async fn blank_request_id_is_malformed() {
        let ledger = Arc::new(InMemoryAssignmentLedger::new(LedgerMode::Permissive));
        let lifecycle = BookingLifecycle::new(ledger);

        let err = lifecycle
            .apply(&update(BookingStatus::Completed, " "))
            .await
            .expect_err("blank id");
        assert!(matches!(err, HandlerError::Malformed(_)));
    }
}
