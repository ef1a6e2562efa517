use super::money::Amount;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubscriptionStatus {
    Trial,
    Pending,
    Active,
    PastDue,
    Cancelled,
    /// The processor reported something we do not model. Held for review.
    Unknown,
}

impl SubscriptionStatus {
    /// Maps a processor-reported status string onto the local state set.
    ///
    /// Anything not explicitly listed lands in `Unknown` instead of being
    /// coerced into a neighbouring state.
    pub fn from_processor(status: &str) -> Self {
        match status {
            "active" => SubscriptionStatus::Active,
            "past_due" => SubscriptionStatus::PastDue,
            "canceled" | "cancelled" => SubscriptionStatus::Cancelled,
            "trialing" => SubscriptionStatus::Trial,
            "incomplete" => SubscriptionStatus::Pending,
            _ => SubscriptionStatus::Unknown,
        }
    }

    /// Statuses that count as the user's current subscription.
    pub fn is_live(&self) -> bool {
        matches!(
            self,
            SubscriptionStatus::Trial | SubscriptionStatus::Active | SubscriptionStatus::PastDue
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::Trial => "TRIAL",
            SubscriptionStatus::Pending => "PENDING",
            SubscriptionStatus::Active => "ACTIVE",
            SubscriptionStatus::PastDue => "PAST_DUE",
            SubscriptionStatus::Cancelled => "CANCELLED",
            SubscriptionStatus::Unknown => "UNKNOWN",
        }
    }
}

impl std::fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a verified payment event asks the state machine to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    CheckoutCompleted { trial: bool },
    StatusReported(SubscriptionStatus),
    Deleted,
    PaymentSucceeded,
    PaymentFailed,
}

impl Trigger {
    pub fn target(&self) -> SubscriptionStatus {
        match self {
            Trigger::CheckoutCompleted { trial: true } => SubscriptionStatus::Trial,
            Trigger::CheckoutCompleted { trial: false } => SubscriptionStatus::Active,
            Trigger::StatusReported(status) => *status,
            Trigger::Deleted => SubscriptionStatus::Cancelled,
            Trigger::PaymentSucceeded => SubscriptionStatus::Active,
            Trigger::PaymentFailed => SubscriptionStatus::PastDue,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    To(SubscriptionStatus),
    /// Already in the target state; nothing to record.
    Unchanged,
    Disallowed,
}

/// The transition table. `current` is `None` when no row exists yet.
pub fn transition(current: Option<SubscriptionStatus>, trigger: Trigger) -> Transition {
    use SubscriptionStatus::*;

    let target = trigger.target();
    if current == Some(target) {
        return Transition::Unchanged;
    }

    match (current, trigger) {
        (None | Some(Pending), Trigger::CheckoutCompleted { .. }) => Transition::To(target),
        (_, Trigger::StatusReported(_)) => Transition::To(target),
        (Some(Active | PastDue | Trial | Unknown), Trigger::Deleted) => Transition::To(target),
        (Some(PastDue), Trigger::PaymentSucceeded) => Transition::To(target),
        (Some(Active), Trigger::PaymentFailed) => Transition::To(target),
        // Trial invoices are informational; conversion arrives as a status report.
        (Some(Trial), Trigger::PaymentSucceeded | Trigger::PaymentFailed) => Transition::Unchanged,
        _ => Transition::Disallowed,
    }
}

/// One customer's subscription as mirrored from the payment processor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subscription {
    pub subscription_id: Uuid,
    pub user_id: String,
    /// The processor's identifier (e.g. `sub_123`).
    pub external_ref: String,
    pub plan_type: String,
    pub status: SubscriptionStatus,
    pub current_period_end: Option<DateTime<Utc>>,
    pub amount: Option<Amount>,
    pub currency: Option<String>,
    pub cancel_at_period_end: bool,
    pub needs_review: bool,
    /// Reported (business) time of the event that last set `status`.
    pub status_reported_at: DateTime<Utc>,
    /// Bumped on every committed write; used for compare-and-swap.
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Subscription {
    pub fn new(
        user_id: impl Into<String>,
        external_ref: impl Into<String>,
        plan_type: impl Into<String>,
        status: SubscriptionStatus,
        reported_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            subscription_id: Uuid::new_v4(),
            user_id: user_id.into(),
            external_ref: external_ref.into(),
            plan_type: plan_type.into(),
            status,
            current_period_end: None,
            amount: None,
            currency: None,
            cancel_at_period_end: false,
            needs_review: status == SubscriptionStatus::Unknown,
            status_reported_at: reported_at,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum HistoryDisposition {
    Applied,
    /// Arrived after a newer report; state left alone.
    Superseded,
    /// Implied a transition the table does not allow; sent to review.
    Rejected,
}

impl HistoryDisposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryDisposition::Applied => "applied",
            HistoryDisposition::Superseded => "superseded",
            HistoryDisposition::Rejected => "rejected",
        }
    }
}

/// Immutable audit row. Rows are stored in arrival order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscriptionHistoryEvent {
    pub history_id: Uuid,
    pub subscription_id: Uuid,
    pub user_id: String,
    pub event_id: Option<String>,
    pub event_type: String,
    pub old_status: Option<SubscriptionStatus>,
    pub new_status: SubscriptionStatus,
    pub disposition: HistoryDisposition,
    pub metadata: serde_json::Value,
    pub timestamp: DateTime<Utc>,
}

impl SubscriptionHistoryEvent {
    pub fn record(
        subscription: &Subscription,
        event_id: Option<&str>,
        event_type: &str,
        old_status: Option<SubscriptionStatus>,
        disposition: HistoryDisposition,
        metadata: serde_json::Value,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            history_id: Uuid::new_v4(),
            subscription_id: subscription.subscription_id,
            user_id: subscription.user_id.clone(),
            event_id: event_id.map(str::to_string),
            event_type: event_type.to_string(),
            old_status,
            new_status: subscription.status,
            disposition,
            metadata,
            timestamp,
        }
    }
}
