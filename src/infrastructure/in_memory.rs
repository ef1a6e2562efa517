use crate::domain::fingerprint::{DeviceFingerprint, TrialReservation};
use crate::domain::fraud::FraudFlag;
use crate::domain::payment_event::{ClaimOutcome, EventOutcome, LedgerState, PaymentEvent};
use crate::domain::ports::{
    ActivationAttemptStore, CommitOutcome, FingerprintStore, FraudFlagStore, InsertOutcome,
    PaymentEventLedger, SubscriptionStore, TrialTokenStore,
};
use crate::domain::subscription::{Subscription, SubscriptionHistoryEvent};
use crate::domain::trial::{REVOKED_SUPERSEDED, TrialStatus, TrialToken};
use crate::error::{GateError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::RwLock;
use uuid::Uuid;

/// A thread-safe in-memory store for device fingerprints.
///
/// Uses `Arc<RwLock<HashMap<String, DeviceFingerprint>>>`; every mutation
/// happens under one write guard, so increments never lose updates.
#[derive(Default, Clone)]
pub struct InMemoryFingerprintStore {
    fingerprints: Arc<RwLock<HashMap<String, DeviceFingerprint>>>,
}

impl InMemoryFingerprintStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FingerprintStore for InMemoryFingerprintStore {
    async fn observe(&self, hash: &str, seen_at: DateTime<Utc>) -> Result<DeviceFingerprint> {
        let mut fingerprints = self.fingerprints.write().await;
        let fp = fingerprints
            .entry(hash.to_string())
            .or_insert_with(|| DeviceFingerprint::new(hash, seen_at));
        fp.touch(seen_at);
        Ok(fp.clone())
    }

    async fn get(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        let fingerprints = self.fingerprints.read().await;
        Ok(fingerprints.get(hash).cloned())
    }

    async fn try_reserve_trial(
        &self,
        hash: &str,
        max_trials: u32,
        now: DateTime<Utc>,
    ) -> Result<TrialReservation> {
        let mut fingerprints = self.fingerprints.write().await;
        let fp = fingerprints
            .entry(hash.to_string())
            .or_insert_with(|| DeviceFingerprint::new(hash, now));
        Ok(fp.try_reserve_trial(max_trials))
    }

    async fn block(
        &self,
        hash: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceFingerprint> {
        let mut fingerprints = self.fingerprints.write().await;
        let fp = fingerprints
            .entry(hash.to_string())
            .or_insert_with(|| DeviceFingerprint::new(hash, now));
        fp.block(reason);
        Ok(fp.clone())
    }

    async fn unblock(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        let mut fingerprints = self.fingerprints.write().await;
        Ok(fingerprints.get_mut(hash).map(|fp| {
            fp.unblock();
            fp.clone()
        }))
    }
}

/// A thread-safe in-memory store for trial tokens.
#[derive(Default, Clone)]
pub struct InMemoryTrialTokenStore {
    tokens: Arc<RwLock<HashMap<Uuid, TrialToken>>>,
}

impl InMemoryTrialTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Finds the user's stored-active token. One that has run past its expiry is
/// expired in place and no longer blocks a new grant.
fn live_token_for_user(
    tokens: &mut HashMap<Uuid, TrialToken>,
    user_id: &str,
    now: DateTime<Utc>,
) -> Option<TrialToken> {
    let mut live = None;
    for token in tokens.values_mut() {
        if token.user_id != user_id || token.status != TrialStatus::Active {
            continue;
        }
        if token.is_past_expiry(now) {
            token.status = TrialStatus::Expired;
        } else {
            live = Some(token.clone());
        }
    }
    live
}

#[async_trait]
impl TrialTokenStore for InMemoryTrialTokenStore {
    async fn insert_active(&self, token: TrialToken) -> Result<InsertOutcome> {
        let mut tokens = self.tokens.write().await;
        if let Some(existing) = live_token_for_user(&mut tokens, &token.user_id, token.created_at)
        {
            return Ok(InsertOutcome::AlreadyActive(existing));
        }
        tokens.insert(token.token_id, token.clone());
        Ok(InsertOutcome::Created(token))
    }

    async fn insert_pending(&self, token: TrialToken) -> Result<()> {
        let mut tokens = self.tokens.write().await;
        tokens.insert(token.token_id, token);
        Ok(())
    }

    async fn get(&self, token_id: Uuid) -> Result<Option<TrialToken>> {
        let tokens = self.tokens.read().await;
        Ok(tokens.get(&token_id).cloned())
    }

    async fn active_for_user(&self, user_id: &str) -> Result<Option<TrialToken>> {
        let tokens = self.tokens.read().await;
        Ok(tokens
            .values()
            .find(|t| t.user_id == user_id && t.status == TrialStatus::Active)
            .cloned())
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<TrialToken>> {
        let tokens = self.tokens.read().await;
        let mut found: Vec<TrialToken> = tokens
            .values()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn consume(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<TrialToken> {
        let mut tokens = self.tokens.write().await;
        let token = tokens
            .get_mut(&token_id)
            .ok_or_else(|| GateError::NotFound(format!("trial token {}", token_id)))?;
        token.try_consume(now)?;
        Ok(token.clone())
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<TrialToken>> {
        let mut tokens = self.tokens.write().await;
        let mut expired = Vec::new();
        for token in tokens.values_mut() {
            if matches!(token.status, TrialStatus::Active | TrialStatus::Pending)
                && token.is_past_expiry(now)
            {
                token.status = TrialStatus::Expired;
                expired.push(token.clone());
            }
        }
        Ok(expired)
    }

    async fn revoke(&self, token_id: Uuid, reason: &str) -> Result<TrialToken> {
        let mut tokens = self.tokens.write().await;
        let token = tokens
            .get_mut(&token_id)
            .ok_or_else(|| GateError::NotFound(format!("trial token {}", token_id)))?;
        if token.status != TrialStatus::Revoked {
            token.revoke(reason);
        }
        Ok(token.clone())
    }

    async fn pending(&self) -> Result<Vec<TrialToken>> {
        let tokens = self.tokens.read().await;
        let mut found: Vec<TrialToken> = tokens
            .values()
            .filter(|t| t.status == TrialStatus::Pending)
            .cloned()
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn promote_pending(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<InsertOutcome> {
        let mut tokens = self.tokens.write().await;
        let user_id = match tokens.get(&token_id) {
            Some(t) if t.status == TrialStatus::Pending => t.user_id.clone(),
            Some(t) => {
                return Err(GateError::StateError(format!(
                    "trial token {} is {}",
                    token_id,
                    t.status.as_str()
                )));
            }
            None => return Err(GateError::NotFound(format!("trial token {}", token_id))),
        };
        let live = live_token_for_user(&mut tokens, &user_id, now);
        let token = tokens
            .get_mut(&token_id)
            .ok_or_else(|| GateError::NotFound(format!("trial token {}", token_id)))?;
        match live {
            Some(existing) => {
                token.revoke(REVOKED_SUPERSEDED);
                Ok(InsertOutcome::AlreadyActive(existing))
            }
            None => {
                token.promote(now);
                Ok(InsertOutcome::Created(token.clone()))
            }
        }
    }
}

/// A thread-safe in-memory store for fraud flags, kept in creation order.
#[derive(Default, Clone)]
pub struct InMemoryFraudFlagStore {
    flags: Arc<RwLock<Vec<FraudFlag>>>,
}

impl InMemoryFraudFlagStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl FraudFlagStore for InMemoryFraudFlagStore {
    async fn record(&self, flags: &[FraudFlag]) -> Result<()> {
        let mut stored = self.flags.write().await;
        stored.extend_from_slice(flags);
        Ok(())
    }

    async fn unresolved_for_user(&self, user_id: &str) -> Result<Vec<FraudFlag>> {
        let stored = self.flags.read().await;
        Ok(stored
            .iter()
            .filter(|f| f.user_id == user_id && !f.resolved)
            .cloned()
            .collect())
    }

    async fn resolve(&self, flag_id: Uuid) -> Result<Option<FraudFlag>> {
        let mut stored = self.flags.write().await;
        Ok(stored.iter_mut().find(|f| f.flag_id == flag_id).map(|f| {
            f.resolved = true;
            f.clone()
        }))
    }
}

/// IP keys tracked before idle ones are swept out.
const ATTEMPT_SWEEP_THRESHOLD: usize = 4096;

/// Sliding window of attempt timestamps per IP.
///
/// Once more than [`ATTEMPT_SWEEP_THRESHOLD`] IPs are tracked, a call drops
/// every IP with no attempt inside its window.
#[derive(Default, Clone)]
pub struct InMemoryActivationAttemptStore {
    attempts: Arc<RwLock<HashMap<String, VecDeque<DateTime<Utc>>>>>,
}

impl InMemoryActivationAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn tracked_ips(&self) -> usize {
        self.attempts.read().await.len()
    }
}

#[async_trait]
impl ActivationAttemptStore for InMemoryActivationAttemptStore {
    async fn record_attempt(&self, ip: &str, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let mut attempts = self.attempts.write().await;
        let horizon = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        if attempts.len() > ATTEMPT_SWEEP_THRESHOLD {
            attempts.retain(|_, seen| seen.back().is_some_and(|at| *at > horizon));
        }
        let seen = attempts.entry(ip.to_string()).or_default();
        seen.push_back(now);
        seen.retain(|at| *at > horizon);
        Ok(u32::try_from(seen.len()).unwrap_or(u32::MAX))
    }
}

#[derive(Default)]
struct SubscriptionTables {
    rows: HashMap<String, Subscription>,
    history: Vec<SubscriptionHistoryEvent>,
}

/// A thread-safe in-memory subscription store.
///
/// Rows and history share one lock so a status change and its audit row land
/// together.
#[derive(Default, Clone)]
pub struct InMemorySubscriptionStore {
    tables: Arc<RwLock<SubscriptionTables>>,
}

impl InMemorySubscriptionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SubscriptionStore for InMemorySubscriptionStore {
    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Subscription>> {
        let tables = self.tables.read().await;
        Ok(tables.rows.get(external_ref).cloned())
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let tables = self.tables.read().await;
        let mut rows: Vec<Subscription> = tables
            .rows
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.created_at);
        Ok(rows)
    }

    async fn insert(
        &self,
        mut subscription: Subscription,
        history: SubscriptionHistoryEvent,
    ) -> Result<CommitOutcome> {
        let mut tables = self.tables.write().await;
        if tables.rows.contains_key(&subscription.external_ref) {
            return Ok(CommitOutcome::Conflict);
        }
        subscription.version = 1;
        tables
            .rows
            .insert(subscription.external_ref.clone(), subscription.clone());
        tables.history.push(history);
        Ok(CommitOutcome::Committed(subscription))
    }

    async fn compare_and_commit(
        &self,
        expected_version: u64,
        mut subscription: Subscription,
        history: Option<SubscriptionHistoryEvent>,
    ) -> Result<CommitOutcome> {
        let mut tables = self.tables.write().await;
        match tables.rows.get(&subscription.external_ref) {
            Some(stored) if stored.version == expected_version => {}
            _ => return Ok(CommitOutcome::Conflict),
        }
        subscription.version = expected_version + 1;
        tables
            .rows
            .insert(subscription.external_ref.clone(), subscription.clone());
        if let Some(history) = history {
            tables.history.push(history);
        }
        Ok(CommitOutcome::Committed(subscription))
    }

    async fn history(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionHistoryEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.subscription_id == subscription_id)
            .cloned()
            .collect())
    }

    async fn history_for_user(&self, user_id: &str) -> Result<Vec<SubscriptionHistoryEvent>> {
        let tables = self.tables.read().await;
        Ok(tables
            .history
            .iter()
            .filter(|h| h.user_id == user_id)
            .cloned()
            .collect())
    }
}

/// A thread-safe in-memory idempotency ledger.
#[derive(Default, Clone)]
pub struct InMemoryPaymentEventLedger {
    events: Arc<RwLock<HashMap<String, PaymentEvent>>>,
}

impl InMemoryPaymentEventLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PaymentEventLedger for InMemoryPaymentEventLedger {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ClaimOutcome> {
        let mut events = self.events.write().await;
        match events.get(event_id) {
            Some(row) if row.state == LedgerState::Completed => {
                return Ok(ClaimOutcome::Completed(row.clone()));
            }
            Some(row) if !row.is_stale(now, stale_after) => return Ok(ClaimOutcome::InFlight),
            _ => {}
        }
        events.insert(
            event_id.to_string(),
            PaymentEvent::claim(event_id, event_type, now),
        );
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut events = self.events.write().await;
        events
            .entry(event_id.to_string())
            .or_insert_with(|| PaymentEvent::claim(event_id, "", now))
            .complete(outcome, now);
        Ok(())
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let mut events = self.events.write().await;
        if events
            .get(event_id)
            .is_some_and(|row| row.state == LedgerState::Processing)
        {
            events.remove(event_id);
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<PaymentEvent>> {
        let events = self.events.read().await;
        Ok(events.get(event_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::subscription::{HistoryDisposition, SubscriptionStatus};

    #[tokio::test]
    async fn test_fingerprint_reservation_creates_row() {
        let store = InMemoryFingerprintStore::new();
        let now = Utc::now();
        assert_eq!(
            store.try_reserve_trial("fp", 2, now).await.unwrap(),
            TrialReservation::Reserved(1)
        );
        assert_eq!(
            store.try_reserve_trial("fp", 2, now).await.unwrap(),
            TrialReservation::Reserved(2)
        );
        assert_eq!(
            store.try_reserve_trial("fp", 2, now).await.unwrap(),
            TrialReservation::Exhausted(2)
        );
        assert_eq!(store.get("fp").await.unwrap().unwrap().trial_count, 2);
        assert!(store.unblock("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_concurrent_reservations_respect_limit() {
        let store = InMemoryFingerprintStore::new();
        let now = Utc::now();
        let mut handles = Vec::new();
        for _ in 0..50 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.try_reserve_trial("fp", 3, now).await.unwrap()
            }));
        }
        let mut reserved = 0;
        for handle in handles {
            if let TrialReservation::Reserved(_) = handle.await.unwrap() {
                reserved += 1;
            }
        }
        assert_eq!(reserved, 3);
        assert_eq!(store.get("fp").await.unwrap().unwrap().trial_count, 3);
    }

    #[tokio::test]
    async fn test_insert_active_is_unique_per_user() {
        let store = InMemoryTrialTokenStore::new();
        let now = Utc::now();
        let first = TrialToken::active("u1", None, now, Duration::days(7), 3);
        let second = TrialToken::active("u1", None, now, Duration::days(7), 3);

        assert!(matches!(
            store.insert_active(first.clone()).await.unwrap(),
            InsertOutcome::Created(_)
        ));
        match store.insert_active(second).await.unwrap() {
            InsertOutcome::AlreadyActive(existing) => assert_eq!(existing.token_id, first.token_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_insert_active_replaces_lapsed_token() {
        let store = InMemoryTrialTokenStore::new();
        let now = Utc::now();
        let old = TrialToken::active("u1", None, now, Duration::days(1), 3);
        store.insert_active(old.clone()).await.unwrap();

        let later = now + Duration::days(2);
        let fresh = TrialToken::active("u1", None, later, Duration::days(7), 3);
        assert!(matches!(
            store.insert_active(fresh).await.unwrap(),
            InsertOutcome::Created(_)
        ));
        let old = store.get(old.token_id).await.unwrap().unwrap();
        assert_eq!(old.status, TrialStatus::Expired);
    }

    #[tokio::test]
    async fn test_consume_to_zero() {
        let store = InMemoryTrialTokenStore::new();
        let now = Utc::now();
        let token = TrialToken::active("u1", None, now, Duration::days(7), 1);
        store.insert_active(token.clone()).await.unwrap();

        let after = store.consume(token.token_id, now).await.unwrap();
        assert_eq!(after.reports_remaining, 0);
        assert_eq!(after.status, TrialStatus::Expired);
        assert!(matches!(
            store.consume(token.token_id, now).await,
            Err(GateError::NoCreditsRemaining(_))
        ));
        assert!(matches!(
            store.consume(Uuid::new_v4(), now).await,
            Err(GateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_promote_pending_respects_active_token() {
        let store = InMemoryTrialTokenStore::new();
        let now = Utc::now();
        let pending = TrialToken::pending("u1", None, now, Duration::days(7), 3);
        store.insert_pending(pending.clone()).await.unwrap();
        let active = TrialToken::active("u1", None, now, Duration::days(7), 3);
        store.insert_active(active.clone()).await.unwrap();

        let outcome = store.promote_pending(pending.token_id, now).await.unwrap();
        assert!(matches!(outcome, InsertOutcome::AlreadyActive(t) if t.token_id == active.token_id));
        let pending = store.get(pending.token_id).await.unwrap().unwrap();
        assert_eq!(pending.status, TrialStatus::Revoked);
    }

    #[tokio::test]
    async fn test_attempt_window_slides() {
        let store = InMemoryActivationAttemptStore::new();
        let now = Utc::now();
        let window = Duration::minutes(10);
        assert_eq!(store.record_attempt("1.2.3.4", now, window).await.unwrap(), 1);
        assert_eq!(store.record_attempt("1.2.3.4", now, window).await.unwrap(), 2);
        assert_eq!(store.record_attempt("5.6.7.8", now, window).await.unwrap(), 1);
        let later = now + Duration::minutes(11);
        assert_eq!(store.record_attempt("1.2.3.4", later, window).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_idle_ips_are_swept() {
        let store = InMemoryActivationAttemptStore::new();
        let now = Utc::now();
        let window = Duration::minutes(10);
        for i in 0..=ATTEMPT_SWEEP_THRESHOLD {
            store.record_attempt(&format!("ip-{}", i), now, window).await.unwrap();
        }
        assert_eq!(store.tracked_ips().await, ATTEMPT_SWEEP_THRESHOLD + 1);

        let later = now + Duration::minutes(11);
        store.record_attempt("fresh", later, window).await.unwrap();
        assert_eq!(store.tracked_ips().await, 1);
    }

    #[tokio::test]
    async fn test_subscription_compare_and_commit() {
        let store = InMemorySubscriptionStore::new();
        let now = Utc::now();
        let sub = Subscription::new("u1", "sub_1", "pro", SubscriptionStatus::Active, now, now);
        let history = SubscriptionHistoryEvent::record(
            &sub,
            Some("evt_1"),
            "checkout.session.completed",
            None,
            HistoryDisposition::Applied,
            serde_json::Value::Null,
            now,
        );
        let CommitOutcome::Committed(stored) = store.insert(sub.clone(), history.clone()).await.unwrap()
        else {
            panic!("insert conflicted");
        };
        assert_eq!(stored.version, 1);
        assert_eq!(
            store.insert(sub, history).await.unwrap(),
            CommitOutcome::Conflict
        );

        let mut changed = stored.clone();
        changed.status = SubscriptionStatus::PastDue;
        let committed = store
            .compare_and_commit(1, changed.clone(), None)
            .await
            .unwrap();
        assert!(matches!(committed, CommitOutcome::Committed(ref s) if s.version == 2));
        assert_eq!(
            store.compare_and_commit(1, changed, None).await.unwrap(),
            CommitOutcome::Conflict
        );
        assert_eq!(store.history(stored.subscription_id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_ledger_claim_lifecycle() {
        let ledger = InMemoryPaymentEventLedger::new();
        let now = Utc::now();
        let stale = Duration::minutes(30);

        assert_eq!(
            ledger.claim("evt_1", "invoice.paid", now, stale).await.unwrap(),
            ClaimOutcome::Claimed
        );
        assert_eq!(
            ledger.claim("evt_1", "invoice.paid", now, stale).await.unwrap(),
            ClaimOutcome::InFlight
        );

        ledger.release("evt_1").await.unwrap();
        assert_eq!(
            ledger.claim("evt_1", "invoice.paid", now, stale).await.unwrap(),
            ClaimOutcome::Claimed
        );

        ledger
            .complete("evt_1", EventOutcome::Applied, now)
            .await
            .unwrap();
        ledger.release("evt_1").await.unwrap();
        assert!(matches!(
            ledger.claim("evt_1", "invoice.paid", now, stale).await.unwrap(),
            ClaimOutcome::Completed(row) if row.outcome == Some(EventOutcome::Applied)
        ));
    }

    #[tokio::test]
    async fn test_ledger_reclaims_stale_claim() {
        let ledger = InMemoryPaymentEventLedger::new();
        let now = Utc::now();
        let stale = Duration::minutes(30);
        ledger.claim("evt_1", "x", now, stale).await.unwrap();
        assert_eq!(
            ledger
                .claim("evt_1", "x", now + Duration::minutes(31), stale)
                .await
                .unwrap(),
            ClaimOutcome::Claimed
        );
    }
}
