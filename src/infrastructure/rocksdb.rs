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
use rocksdb::{ColumnFamily, ColumnFamilyDescriptor, DB, IteratorMode, Options, WriteBatch};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;
use uuid::Uuid;

pub const CF_FINGERPRINTS: &str = "fingerprints";
pub const CF_TRIAL_TOKENS: &str = "trial_tokens";
pub const CF_FRAUD_FLAGS: &str = "fraud_flags";
pub const CF_ACTIVATION_ATTEMPTS: &str = "activation_attempts";
pub const CF_SUBSCRIPTIONS: &str = "subscriptions";
/// Keyed by a big-endian sequence number so iteration yields arrival order.
pub const CF_SUBSCRIPTION_HISTORY: &str = "subscription_history";
pub const CF_PAYMENT_EVENTS: &str = "payment_events";

const COLUMN_FAMILIES: [&str; 7] = [
    CF_FINGERPRINTS,
    CF_TRIAL_TOKENS,
    CF_FRAUD_FLAGS,
    CF_ACTIVATION_ATTEMPTS,
    CF_SUBSCRIPTIONS,
    CF_SUBSCRIPTION_HISTORY,
    CF_PAYMENT_EVENTS,
];

/// A persistent store implementation using RocksDB.
///
/// Every table lives in its own column family with JSON values. Methods that
/// read, decide and write hold `write_gate` for their whole duration, and
/// multi-row writes go through one `WriteBatch`, so each port call is atomic
/// with respect to every other call on the same store.
///
/// This struct is thread-safe (`Clone` shares the underlying `Arc<DB>`).
#[derive(Clone)]
pub struct RocksDBStore {
    db: Arc<DB>,
    write_gate: Arc<Mutex<()>>,
    history_seq: Arc<AtomicU64>,
}

impl RocksDBStore {
    /// Opens or creates a RocksDB instance at `path`, creating any missing
    /// column family.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let descriptors = COLUMN_FAMILIES
            .iter()
            .map(|name| ColumnFamilyDescriptor::new(*name, Options::default()))
            .collect::<Vec<_>>();
        let db = DB::open_cf_descriptors(&opts, path, descriptors)?;

        let store = Self {
            db: Arc::new(db),
            write_gate: Arc::new(Mutex::new(())),
            history_seq: Arc::new(AtomicU64::new(0)),
        };
        let last = store.last_history_seq()?;
        store.history_seq.store(last, Ordering::SeqCst);
        Ok(store)
    }

    fn cf(&self, name: &str) -> Result<&ColumnFamily> {
        self.db.cf_handle(name).ok_or_else(|| {
            GateError::InternalError(Box::new(std::io::Error::other(format!(
                "{} column family not found",
                name
            ))))
        })
    }

    fn get_json<T: DeserializeOwned>(&self, cf_name: &str, key: &[u8]) -> Result<Option<T>> {
        let cf = self.cf(cf_name)?;
        match self.db.get_pinned_cf(cf, key)? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn put_json<T: Serialize>(&self, cf_name: &str, key: &[u8], value: &T) -> Result<()> {
        let cf = self.cf(cf_name)?;
        self.db.put_cf(cf, key, serde_json::to_vec(value)?)?;
        Ok(())
    }

    fn batch_put<T: Serialize>(
        &self,
        batch: &mut WriteBatch,
        cf_name: &str,
        key: &[u8],
        value: &T,
    ) -> Result<()> {
        let cf = self.cf(cf_name)?;
        batch.put_cf(cf, key, serde_json::to_vec(value)?);
        Ok(())
    }

    fn scan<T: DeserializeOwned>(&self, cf_name: &str) -> Result<Vec<T>> {
        let cf = self.cf(cf_name)?;
        let mut rows = Vec::new();
        for item in self.db.iterator_cf(cf, IteratorMode::Start) {
            let (_key, value) = item?;
            rows.push(serde_json::from_slice(&value)?);
        }
        Ok(rows)
    }

    fn last_history_seq(&self) -> Result<u64> {
        let cf = self.cf(CF_SUBSCRIPTION_HISTORY)?;
        match self.db.iterator_cf(cf, IteratorMode::End).next() {
            Some(item) => {
                let (key, _) = item?;
                let bytes = <[u8; 8]>::try_from(&key[..]).map_err(|_| {
                    GateError::InternalError(Box::new(std::io::Error::other(
                        "malformed subscription history key",
                    )))
                })?;
                Ok(u64::from_be_bytes(bytes))
            }
            None => Ok(0),
        }
    }

    fn batch_history(
        &self,
        batch: &mut WriteBatch,
        history: &SubscriptionHistoryEvent,
    ) -> Result<()> {
        let seq = self.history_seq.fetch_add(1, Ordering::SeqCst) + 1;
        self.batch_put(batch, CF_SUBSCRIPTION_HISTORY, &seq.to_be_bytes(), history)
    }

    /// Same rule as the in-memory store: a lapsed active token is expired in
    /// place and stops blocking a new grant.
    fn live_token_for_user(
        &self,
        batch: &mut WriteBatch,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<TrialToken>> {
        let mut live = None;
        for mut token in self.scan::<TrialToken>(CF_TRIAL_TOKENS)? {
            if token.user_id != user_id || token.status != TrialStatus::Active {
                continue;
            }
            if token.is_past_expiry(now) {
                token.status = TrialStatus::Expired;
                self.batch_put(batch, CF_TRIAL_TOKENS, token.token_id.as_bytes(), &token)?;
            } else {
                live = Some(token);
            }
        }
        Ok(live)
    }

    fn token_or_not_found(&self, token_id: Uuid) -> Result<TrialToken> {
        self.get_json(CF_TRIAL_TOKENS, token_id.as_bytes())?
            .ok_or_else(|| GateError::NotFound(format!("trial token {}", token_id)))
    }
}

#[async_trait]
impl FingerprintStore for RocksDBStore {
    async fn observe(&self, hash: &str, seen_at: DateTime<Utc>) -> Result<DeviceFingerprint> {
        let _guard = self.write_gate.lock().await;
        let mut fp = self
            .get_json(CF_FINGERPRINTS, hash.as_bytes())?
            .unwrap_or_else(|| DeviceFingerprint::new(hash, seen_at));
        fp.touch(seen_at);
        self.put_json(CF_FINGERPRINTS, hash.as_bytes(), &fp)?;
        Ok(fp)
    }

    async fn get(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        self.get_json(CF_FINGERPRINTS, hash.as_bytes())
    }

    async fn try_reserve_trial(
        &self,
        hash: &str,
        max_trials: u32,
        now: DateTime<Utc>,
    ) -> Result<TrialReservation> {
        let _guard = self.write_gate.lock().await;
        let mut fp = self
            .get_json(CF_FINGERPRINTS, hash.as_bytes())?
            .unwrap_or_else(|| DeviceFingerprint::new(hash, now));
        let reservation = fp.try_reserve_trial(max_trials);
        if let TrialReservation::Reserved(_) = reservation {
            self.put_json(CF_FINGERPRINTS, hash.as_bytes(), &fp)?;
        }
        Ok(reservation)
    }

    async fn block(
        &self,
        hash: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceFingerprint> {
        let _guard = self.write_gate.lock().await;
        let mut fp = self
            .get_json(CF_FINGERPRINTS, hash.as_bytes())?
            .unwrap_or_else(|| DeviceFingerprint::new(hash, now));
        fp.block(reason);
        self.put_json(CF_FINGERPRINTS, hash.as_bytes(), &fp)?;
        Ok(fp)
    }

    async fn unblock(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        let _guard = self.write_gate.lock().await;
        let Some(mut fp) = self.get_json::<DeviceFingerprint>(CF_FINGERPRINTS, hash.as_bytes())?
        else {
            return Ok(None);
        };
        fp.unblock();
        self.put_json(CF_FINGERPRINTS, hash.as_bytes(), &fp)?;
        Ok(Some(fp))
    }
}

#[async_trait]
impl TrialTokenStore for RocksDBStore {
    async fn insert_active(&self, token: TrialToken) -> Result<InsertOutcome> {
        let _guard = self.write_gate.lock().await;
        let mut batch = WriteBatch::default();
        let live = self.live_token_for_user(&mut batch, &token.user_id, token.created_at)?;
        let outcome = match live {
            Some(existing) => InsertOutcome::AlreadyActive(existing),
            None => {
                self.batch_put(&mut batch, CF_TRIAL_TOKENS, token.token_id.as_bytes(), &token)?;
                InsertOutcome::Created(token)
            }
        };
        self.db.write(batch)?;
        Ok(outcome)
    }

    async fn insert_pending(&self, token: TrialToken) -> Result<()> {
        self.put_json(CF_TRIAL_TOKENS, token.token_id.as_bytes(), &token)
    }

    async fn get(&self, token_id: Uuid) -> Result<Option<TrialToken>> {
        self.get_json(CF_TRIAL_TOKENS, token_id.as_bytes())
    }

    async fn active_for_user(&self, user_id: &str) -> Result<Option<TrialToken>> {
        Ok(self
            .scan::<TrialToken>(CF_TRIAL_TOKENS)?
            .into_iter()
            .find(|t| t.user_id == user_id && t.status == TrialStatus::Active))
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<TrialToken>> {
        let mut found: Vec<TrialToken> = self
            .scan::<TrialToken>(CF_TRIAL_TOKENS)?
            .into_iter()
            .filter(|t| t.user_id == user_id)
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn consume(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<TrialToken> {
        let _guard = self.write_gate.lock().await;
        let mut token = self.token_or_not_found(token_id)?;
        token.try_consume(now)?;
        self.put_json(CF_TRIAL_TOKENS, token_id.as_bytes(), &token)?;
        Ok(token)
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<TrialToken>> {
        let _guard = self.write_gate.lock().await;
        let mut batch = WriteBatch::default();
        let mut expired = Vec::new();
        for mut token in self.scan::<TrialToken>(CF_TRIAL_TOKENS)? {
            if matches!(token.status, TrialStatus::Active | TrialStatus::Pending)
                && token.is_past_expiry(now)
            {
                token.status = TrialStatus::Expired;
                self.batch_put(&mut batch, CF_TRIAL_TOKENS, token.token_id.as_bytes(), &token)?;
                expired.push(token);
            }
        }
        self.db.write(batch)?;
        Ok(expired)
    }

    async fn revoke(&self, token_id: Uuid, reason: &str) -> Result<TrialToken> {
        let _guard = self.write_gate.lock().await;
        let mut token = self.token_or_not_found(token_id)?;
        if token.status != TrialStatus::Revoked {
            token.revoke(reason);
            self.put_json(CF_TRIAL_TOKENS, token_id.as_bytes(), &token)?;
        }
        Ok(token)
    }

    async fn pending(&self) -> Result<Vec<TrialToken>> {
        let mut found: Vec<TrialToken> = self
            .scan::<TrialToken>(CF_TRIAL_TOKENS)?
            .into_iter()
            .filter(|t| t.status == TrialStatus::Pending)
            .collect();
        found.sort_by_key(|t| t.created_at);
        Ok(found)
    }

    async fn promote_pending(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<InsertOutcome> {
        let _guard = self.write_gate.lock().await;
        let mut token = self.token_or_not_found(token_id)?;
        if token.status != TrialStatus::Pending {
            return Err(GateError::StateError(format!(
                "trial token {} is {}",
                token_id,
                token.status.as_str()
            )));
        }
        let mut batch = WriteBatch::default();
        let outcome = match self.live_token_for_user(&mut batch, &token.user_id, now)? {
            Some(existing) => {
                token.revoke(REVOKED_SUPERSEDED);
                InsertOutcome::AlreadyActive(existing)
            }
            None => {
                token.promote(now);
                InsertOutcome::Created(token.clone())
            }
        };
        self.batch_put(&mut batch, CF_TRIAL_TOKENS, token_id.as_bytes(), &token)?;
        self.db.write(batch)?;
        Ok(outcome)
    }
}

fn flag_key(flag: &FraudFlag) -> Vec<u8> {
    let millis = flag.created_at.timestamp_millis().max(0) as u64;
    let mut key = millis.to_be_bytes().to_vec();
    key.extend_from_slice(flag.flag_id.as_bytes());
    key
}

#[async_trait]
impl FraudFlagStore for RocksDBStore {
    async fn record(&self, flags: &[FraudFlag]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for flag in flags {
            self.batch_put(&mut batch, CF_FRAUD_FLAGS, &flag_key(flag), flag)?;
        }
        self.db.write(batch)?;
        Ok(())
    }

    async fn unresolved_for_user(&self, user_id: &str) -> Result<Vec<FraudFlag>> {
        Ok(self
            .scan::<FraudFlag>(CF_FRAUD_FLAGS)?
            .into_iter()
            .filter(|f| f.user_id == user_id && !f.resolved)
            .collect())
    }

    async fn resolve(&self, flag_id: Uuid) -> Result<Option<FraudFlag>> {
        let _guard = self.write_gate.lock().await;
        let Some(mut flag) = self
            .scan::<FraudFlag>(CF_FRAUD_FLAGS)?
            .into_iter()
            .find(|f| f.flag_id == flag_id)
        else {
            return Ok(None);
        };
        flag.resolved = true;
        self.put_json(CF_FRAUD_FLAGS, &flag_key(&flag), &flag)?;
        Ok(Some(flag))
    }
}

#[async_trait]
impl ActivationAttemptStore for RocksDBStore {
    async fn record_attempt(&self, ip: &str, now: DateTime<Utc>, window: Duration) -> Result<u32> {
        let _guard = self.write_gate.lock().await;
        let mut seen: Vec<DateTime<Utc>> = self
            .get_json(CF_ACTIVATION_ATTEMPTS, ip.as_bytes())?
            .unwrap_or_default();
        let horizon = now.checked_sub_signed(window).unwrap_or(DateTime::<Utc>::MIN_UTC);
        seen.retain(|at| *at > horizon);
        seen.push(now);
        self.put_json(CF_ACTIVATION_ATTEMPTS, ip.as_bytes(), &seen)?;
        Ok(u32::try_from(seen.len()).unwrap_or(u32::MAX))
    }
}

#[async_trait]
impl SubscriptionStore for RocksDBStore {
    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Subscription>> {
        self.get_json(CF_SUBSCRIPTIONS, external_ref.as_bytes())
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        let mut rows: Vec<Subscription> = self
            .scan::<Subscription>(CF_SUBSCRIPTIONS)?
            .into_iter()
            .filter(|s| s.user_id == user_id)
            .collect();
        rows.sort_by_key(|s| s.created_at);
        Ok(rows)
    }

    async fn insert(
        &self,
        mut subscription: Subscription,
        history: SubscriptionHistoryEvent,
    ) -> Result<CommitOutcome> {
        let _guard = self.write_gate.lock().await;
        let key = subscription.external_ref.clone();
        if self
            .get_json::<Subscription>(CF_SUBSCRIPTIONS, key.as_bytes())?
            .is_some()
        {
            return Ok(CommitOutcome::Conflict);
        }
        subscription.version = 1;
        let mut batch = WriteBatch::default();
        self.batch_put(&mut batch, CF_SUBSCRIPTIONS, key.as_bytes(), &subscription)?;
        self.batch_history(&mut batch, &history)?;
        self.db.write(batch)?;
        Ok(CommitOutcome::Committed(subscription))
    }

    async fn compare_and_commit(
        &self,
        expected_version: u64,
        mut subscription: Subscription,
        history: Option<SubscriptionHistoryEvent>,
    ) -> Result<CommitOutcome> {
        let _guard = self.write_gate.lock().await;
        let key = subscription.external_ref.clone();
        match self.get_json::<Subscription>(CF_SUBSCRIPTIONS, key.as_bytes())? {
            Some(stored) if stored.version == expected_version => {}
            _ => return Ok(CommitOutcome::Conflict),
        }
        subscription.version = expected_version + 1;
        let mut batch = WriteBatch::default();
        self.batch_put(&mut batch, CF_SUBSCRIPTIONS, key.as_bytes(), &subscription)?;
        if let Some(history) = &history {
            self.batch_history(&mut batch, history)?;
        }
        self.db.write(batch)?;
        Ok(CommitOutcome::Committed(subscription))
    }

    async fn history(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionHistoryEvent>> {
        Ok(self
            .scan::<SubscriptionHistoryEvent>(CF_SUBSCRIPTION_HISTORY)?
            .into_iter()
            .filter(|h| h.subscription_id == subscription_id)
            .collect())
    }

    async fn history_for_user(&self, user_id: &str) -> Result<Vec<SubscriptionHistoryEvent>> {
        Ok(self
            .scan::<SubscriptionHistoryEvent>(CF_SUBSCRIPTION_HISTORY)?
            .into_iter()
            .filter(|h| h.user_id == user_id)
            .collect())
    }
}

#[async_trait]
impl PaymentEventLedger for RocksDBStore {
    async fn claim(
        &self,
        event_id: &str,
        event_type: &str,
        now: DateTime<Utc>,
        stale_after: Duration,
    ) -> Result<ClaimOutcome> {
        let _guard = self.write_gate.lock().await;
        match self.get_json::<PaymentEvent>(CF_PAYMENT_EVENTS, event_id.as_bytes())? {
            Some(row) if row.state == LedgerState::Completed => {
                return Ok(ClaimOutcome::Completed(row));
            }
            Some(row) if !row.is_stale(now, stale_after) => return Ok(ClaimOutcome::InFlight),
            _ => {}
        }
        let row = PaymentEvent::claim(event_id, event_type, now);
        self.put_json(CF_PAYMENT_EVENTS, event_id.as_bytes(), &row)?;
        Ok(ClaimOutcome::Claimed)
    }

    async fn complete(
        &self,
        event_id: &str,
        outcome: EventOutcome,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        let mut row = self
            .get_json::<PaymentEvent>(CF_PAYMENT_EVENTS, event_id.as_bytes())?
            .unwrap_or_else(|| PaymentEvent::claim(event_id, "", now));
        row.complete(outcome, now);
        self.put_json(CF_PAYMENT_EVENTS, event_id.as_bytes(), &row)
    }

    async fn release(&self, event_id: &str) -> Result<()> {
        let _guard = self.write_gate.lock().await;
        if let Some(row) = self.get_json::<PaymentEvent>(CF_PAYMENT_EVENTS, event_id.as_bytes())?
            && row.state == LedgerState::Processing
        {
            let cf = self.cf(CF_PAYMENT_EVENTS)?;
            self.db.delete_cf(cf, event_id.as_bytes())?;
        }
        Ok(())
    }

    async fn get(&self, event_id: &str) -> Result<Option<PaymentEvent>> {
        self.get_json(CF_PAYMENT_EVENTS, event_id.as_bytes())
    }
}
