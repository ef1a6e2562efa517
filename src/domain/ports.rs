//! Storage and collaborator seams.
//!
//! Every invariant that must hold across concurrent requests is enforced
//! inside a single call on one of these traits (a unique insert, a
//! conditional update, a compare-and-swap). Callers never hold a lock across
//! calls.

use super::fingerprint::{DeviceFingerprint, TrialReservation};
use super::fraud::FraudFlag;
use super::payment_event::{ClaimOutcome, EventOutcome, PaymentEvent};
use super::subscription::{Subscription, SubscriptionHistoryEvent};
use super::trial::TrialToken;
use crate::error::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use uuid::Uuid;

#[async_trait]
pub trait FingerprintStore: Send + Sync {
    /// Creates the row on first sight, refreshes `last_seen` otherwise.
    async fn observe(&self, hash: &str, seen_at: DateTime<Utc>) -> Result<DeviceFingerprint>;
    async fn get(&self, hash: &str) -> Result<Option<DeviceFingerprint>>;
    /// Charges one trial to the device unless it is blocked or already at
    /// `max_trials`. Check and increment happen in one step.
    async fn try_reserve_trial(
        &self,
        hash: &str,
        max_trials: u32,
        now: DateTime<Utc>,
    ) -> Result<TrialReservation>;
    async fn block(&self, hash: &str, reason: &str, now: DateTime<Utc>)
    -> Result<DeviceFingerprint>;
    async fn unblock(&self, hash: &str) -> Result<Option<DeviceFingerprint>>;
}

/// Result of an insert guarded by the one-active-token-per-user constraint.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    Created(TrialToken),
    /// The user already holds an active token; carries it.
    AlreadyActive(TrialToken),
}

#[async_trait]
pub trait TrialTokenStore: Send + Sync {
    /// Inserts an active token unless one already exists for the user.
    async fn insert_active(&self, token: TrialToken) -> Result<InsertOutcome>;
    async fn insert_pending(&self, token: TrialToken) -> Result<()>;
    async fn get(&self, token_id: Uuid) -> Result<Option<TrialToken>>;
    async fn active_for_user(&self, user_id: &str) -> Result<Option<TrialToken>>;
    async fn for_user(&self, user_id: &str) -> Result<Vec<TrialToken>>;
    /// Conditional decrement; see [`TrialToken::try_consume`].
    async fn consume(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<TrialToken>;
    /// Moves every active token past its expiry to expired. Returns the moved tokens.
    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<TrialToken>>;
    async fn revoke(&self, token_id: Uuid, reason: &str) -> Result<TrialToken>;
    async fn pending(&self) -> Result<Vec<TrialToken>>;
    /// Promotes a pending token under the same constraint as `insert_active`.
    async fn promote_pending(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<InsertOutcome>;
}

#[async_trait]
pub trait FraudFlagStore: Send + Sync {
    async fn record(&self, flags: &[FraudFlag]) -> Result<()>;
    async fn unresolved_for_user(&self, user_id: &str) -> Result<Vec<FraudFlag>>;
    async fn resolve(&self, flag_id: Uuid) -> Result<Option<FraudFlag>>;
}

/// Durable sliding window of activation attempts per client IP.
#[async_trait]
pub trait ActivationAttemptStore: Send + Sync {
    /// Records one attempt and returns the attempts inside `window`, this one included.
    async fn record_attempt(&self, ip: &str, now: DateTime<Utc>, window: Duration) -> Result<u32>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum CommitOutcome {
    Committed(Subscription),
    /// The row changed (or appeared) since it was read.
    Conflict,
}

#[async_trait]
pub trait SubscriptionStore: Send + Sync {
    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Subscription>>;
    async fn for_user(&self, user_id: &str) -> Result<Vec<Subscription>>;
    /// Inserts a new row and its first history row in one write.
    /// Conflicts when a row with the same `external_ref` exists.
    async fn insert(
        &self,
        subscription: Subscription,
        history: SubscriptionHistoryEvent,
    ) -> Result<CommitOutcome>;
    /// Replaces the row if its stored version is `expected_version`, bumping
    /// the version and appending `history` in the same write.
    async fn compare_and_commit(
        &self,
        expected_version: u64,
        subscription: Subscription,
        history: Option<SubscriptionHistoryEvent>,
    ) -> Result<CommitOutcome>;
    async fn history(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionHistoryEvent>>;
    async fn history_for_user(&self, user_id: &str) -> Result<Vec<SubscriptionHistoryEvent>>;
}

/// Idempotency ledger for inbound payment events.
#[async_trait]
pub trait PaymentEventLedger: Send + Sync {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ClaimOutcome>;
    async fn complete(&self, event_id: &str, outcome: EventOutcome, now: DateTime<Utc>)
    -> Result<()>;
    /// Drops a processing claim so a redelivery can take it.
    async fn release(&self, event_id: &str) -> Result<()>;
    async fn get(&self, event_id: &str) -> Result<Option<PaymentEvent>>;
}

/// The payment processor's own API. Responses are advisory.
#[async_trait]
pub trait PaymentProcessor: Send + Sync {
    async fn cancel_subscription(&self, external_ref: &str, at_period_end: bool) -> Result<()>;
}

pub type SharedFingerprintStore = Arc<dyn FingerprintStore>;
pub type SharedTrialTokenStore = Arc<dyn TrialTokenStore>;
pub type SharedFraudFlagStore = Arc<dyn FraudFlagStore>;
pub type SharedActivationAttemptStore = Arc<dyn ActivationAttemptStore>;
pub type SharedSubscriptionStore = Arc<dyn SubscriptionStore>;
pub type SharedPaymentEventLedger = Arc<dyn PaymentEventLedger>;
pub type SharedPaymentProcessor = Arc<dyn PaymentProcessor>;
