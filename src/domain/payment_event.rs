use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types the lifecycle understands, keyed by the processor's names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentEventKind {
    CheckoutCompleted,
    SubscriptionCreated,
    SubscriptionUpdated,
    SubscriptionDeleted,
    InvoicePaymentSucceeded,
    InvoicePaymentFailed,
    Other,
}

impl PaymentEventKind {
    pub fn parse(event_type: &str) -> Self {
        match event_type {
            "checkout.session.completed" => PaymentEventKind::CheckoutCompleted,
            "customer.subscription.created" => PaymentEventKind::SubscriptionCreated,
            "customer.subscription.updated" => PaymentEventKind::SubscriptionUpdated,
            "customer.subscription.deleted" => PaymentEventKind::SubscriptionDeleted,
            "invoice.payment_succeeded" | "invoice.paid" => PaymentEventKind::InvoicePaymentSucceeded,
            "invoice.payment_failed" => PaymentEventKind::InvoicePaymentFailed,
            _ => PaymentEventKind::Other,
        }
    }
}

/// The processor's webhook body: `{id, type, created, data: {object}}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookEnvelope {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    /// Unix seconds at which the processor says the event happened.
    #[serde(default)]
    pub created: Option<i64>,
    pub data: WebhookData,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebhookData {
    pub object: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn kind(&self) -> PaymentEventKind {
        PaymentEventKind::parse(&self.event_type)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum LedgerState {
    Processing,
    Completed,
}

/// What the lifecycle did with an event. Stored so replays can echo it.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum EventOutcome {
    Applied,
    Unchanged,
    Superseded,
    /// Sent to the review bucket (unknown status or disallowed transition).
    Flagged,
    /// Payload could never be applied; not retried.
    Rejected,
    Ignored,
}

impl EventOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventOutcome::Applied => "applied",
            EventOutcome::Unchanged => "unchanged",
            EventOutcome::Superseded => "superseded",
            EventOutcome::Flagged => "flagged",
            EventOutcome::Rejected => "rejected",
            EventOutcome::Ignored => "ignored",
        }
    }
}

/// Idempotency ledger row, unique on `event_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentEvent {
    pub event_id: String,
    pub event_type: String,
    pub state: LedgerState,
    pub claimed_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
    pub outcome: Option<EventOutcome>,
}

impl PaymentEvent {
    pub fn claim(event_id: &str, event_type: &str, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event_id.to_string(),
            event_type: event_type.to_string(),
            state: LedgerState::Processing,
            claimed_at: now,
            processed_at: None,
            outcome: None,
        }
    }

    pub fn complete(&mut self, outcome: EventOutcome, now: DateTime<Utc>) {
        self.state = LedgerState::Completed;
        self.processed_at = Some(now);
        self.outcome = Some(outcome);
    }

    /// A processing claim older than `stale_after` belongs to a worker that died.
    pub fn is_stale(&self, now: DateTime<Utc>, stale_after: chrono::Duration) -> bool {
        self.state == LedgerState::Processing && now - self.claimed_at >= stale_after
    }
}

/// Result of trying to claim an event id in the ledger.
#[derive(Debug, Clone, PartialEq)]
pub enum ClaimOutcome {
    Claimed,
    /// Already processed; carries the stored row.
    Completed(PaymentEvent),
    /// Another worker holds a live claim.
    InFlight,
}
