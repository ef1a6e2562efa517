#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde_json::{Value, json};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use trialgate::application::engine::TrialEngine;
use trialgate::application::ingress::{IngressReceipt, WebhookVerifier};
use trialgate::config::EngineConfig;
use trialgate::domain::clock::ManualClock;
use trialgate::domain::fingerprint::{DeviceFingerprint, TrialReservation};
use trialgate::domain::fraud::{ActivationRequest, DeviceData};
use trialgate::domain::ports::{
    CommitOutcome, FingerprintStore, InsertOutcome, SubscriptionStore, TrialTokenStore,
};
use trialgate::domain::subscription::{Subscription, SubscriptionHistoryEvent};
use trialgate::domain::trial::TrialToken;
use trialgate::error::{GateError, Result};
use trialgate::infrastructure::Storage;
use trialgate::infrastructure::in_memory::{
    InMemoryFingerprintStore, InMemorySubscriptionStore, InMemoryTrialTokenStore,
};
use trialgate::infrastructure::processor::RecordingProcessor;
use uuid::Uuid;

pub const SECRET: &str = "whsec_test_secret";

/// A fully wired engine over in-memory storage and a manual clock.
pub struct TestApp {
    pub engine: TrialEngine,
    pub storage: Storage,
    pub clock: ManualClock,
    pub processor: Arc<RecordingProcessor>,
    pub config: EngineConfig,
}

pub fn test_config() -> EngineConfig {
    let mut config = EngineConfig::default();
    config.webhook.secret = SECRET.to_string();
    config
}

impl TestApp {
    pub fn new() -> Self {
        Self::with(test_config(), Storage::in_memory())
    }

    pub fn with(config: EngineConfig, storage: Storage) -> Self {
        let clock = ManualClock::new(Utc::now());
        let processor = Arc::new(RecordingProcessor::new());
        let engine = TrialEngine::new(
            &config,
            storage.clone(),
            processor.clone(),
            Arc::new(clock.clone()),
        );
        Self {
            engine,
            storage,
            clock,
            processor,
            config,
        }
    }

    pub fn now(&self) -> DateTime<Utc> {
        use trialgate::domain::clock::Clock;
        self.clock.now()
    }

    /// Signs `body` the way the processor does, at the current clock time.
    pub fn sign(&self, body: &[u8]) -> String {
        WebhookVerifier::new(SECRET, 300)
            .sign(self.now().timestamp(), body)
            .unwrap()
    }

    pub async fn deliver(&self, event: &Value) -> Result<IngressReceipt> {
        let body = serde_json::to_vec(event).unwrap();
        let signature = self.sign(&body);
        self.engine.ingress.receive(Some(&signature), &body).await
    }
}

pub fn request(user: &str, fingerprint: &str) -> ActivationRequest {
    ActivationRequest {
        user_id: user.to_string(),
        fingerprint_hash: fingerprint.to_string(),
        device_data: DeviceData::default(),
        ip_address: None,
        user_agent: None,
    }
}

pub fn random_fingerprint() -> String {
    let bytes: [u8; 16] = rand::thread_rng().r#gen();
    hex::encode(bytes)
}

pub fn checkout_completed(event_id: &str, sub: &str, user: &str, created: i64) -> Value {
    json!({
        "id": event_id,
        "type": "checkout.session.completed",
        "created": created,
        "data": {"object": {
            "id": format!("cs_{}", event_id),
            "subscription": sub,
            "client_reference_id": user,
            "amount_total": 1999,
            "currency": "USD",
            "metadata": {"plan_type": "pro"}
        }}
    })
}

pub fn subscription_event(
    event_id: &str,
    event_type: &str,
    sub: &str,
    status: &str,
    created: i64,
) -> Value {
    json!({
        "id": event_id,
        "type": event_type,
        "created": created,
        "data": {"object": {"id": sub, "status": status}}
    })
}

/// Subscription store that can be switched into a failing mode.
#[derive(Clone, Default)]
pub struct FlakySubscriptionStore {
    pub inner: InMemorySubscriptionStore,
    pub failing: Arc<AtomicBool>,
}

impl FlakySubscriptionStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    fn check(&self) -> Result<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::TransientStorageError("database unavailable".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl SubscriptionStore for FlakySubscriptionStore {
    async fn get_by_external_ref(&self, external_ref: &str) -> Result<Option<Subscription>> {
        self.check()?;
        self.inner.get_by_external_ref(external_ref).await
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<Subscription>> {
        self.check()?;
        self.inner.for_user(user_id).await
    }

    async fn insert(
        &self,
        subscription: Subscription,
        history: SubscriptionHistoryEvent,
    ) -> Result<CommitOutcome> {
        self.check()?;
        self.inner.insert(subscription, history).await
    }

    async fn compare_and_commit(
        &self,
        expected_version: u64,
        subscription: Subscription,
        history: Option<SubscriptionHistoryEvent>,
    ) -> Result<CommitOutcome> {
        self.check()?;
        self.inner
            .compare_and_commit(expected_version, subscription, history)
            .await
    }

    async fn history(&self, subscription_id: Uuid) -> Result<Vec<SubscriptionHistoryEvent>> {
        self.inner.history(subscription_id).await
    }

    async fn history_for_user(&self, user_id: &str) -> Result<Vec<SubscriptionHistoryEvent>> {
        self.inner.history_for_user(user_id).await
    }
}

/// Trial store whose inserts can be switched off; everything else passes
/// through.
#[derive(Clone, Default)]
pub struct FlakyTrialTokenStore {
    pub inner: InMemoryTrialTokenStore,
    pub failing: Arc<AtomicBool>,
    pub pending_failing: Arc<AtomicBool>,
}

impl FlakyTrialTokenStore {
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn set_pending_failing(&self, failing: bool) {
        self.pending_failing.store(failing, Ordering::SeqCst);
    }
}

#[async_trait]
impl TrialTokenStore for FlakyTrialTokenStore {
    async fn insert_active(&self, token: TrialToken) -> Result<InsertOutcome> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(GateError::TransientStorageError("insert timed out".into()));
        }
        self.inner.insert_active(token).await
    }

    async fn insert_pending(&self, token: TrialToken) -> Result<()> {
        if self.pending_failing.load(Ordering::SeqCst) {
            return Err(GateError::TransientStorageError("insert timed out".into()));
        }
        self.inner.insert_pending(token).await
    }

    async fn get(&self, token_id: Uuid) -> Result<Option<TrialToken>> {
        self.inner.get(token_id).await
    }

    async fn active_for_user(&self, user_id: &str) -> Result<Option<TrialToken>> {
        self.inner.active_for_user(user_id).await
    }

    async fn for_user(&self, user_id: &str) -> Result<Vec<TrialToken>> {
        self.inner.for_user(user_id).await
    }

    async fn consume(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<TrialToken> {
        self.inner.consume(token_id, now).await
    }

    async fn expire_due(&self, now: DateTime<Utc>) -> Result<Vec<TrialToken>> {
        self.inner.expire_due(now).await
    }

    async fn revoke(&self, token_id: Uuid, reason: &str) -> Result<TrialToken> {
        self.inner.revoke(token_id, reason).await
    }

    async fn pending(&self) -> Result<Vec<TrialToken>> {
        self.inner.pending().await
    }

    async fn promote_pending(&self, token_id: Uuid, now: DateTime<Utc>) -> Result<InsertOutcome> {
        self.inner.promote_pending(token_id, now).await
    }
}

/// Fingerprint store whose reads take a while, so concurrent activations all
/// score the device before any of them issues.
#[derive(Clone, Default)]
pub struct SlowFingerprintStore {
    pub inner: InMemoryFingerprintStore,
}

impl SlowFingerprintStore {
    async fn lag(&self) {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}

#[async_trait]
impl FingerprintStore for SlowFingerprintStore {
    async fn observe(&self, hash: &str, seen_at: DateTime<Utc>) -> Result<DeviceFingerprint> {
        let fp = self.inner.observe(hash, seen_at).await?;
        self.lag().await;
        Ok(fp)
    }

    async fn get(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        self.inner.get(hash).await
    }

    async fn try_reserve_trial(
        &self,
        hash: &str,
        max_trials: u32,
        now: DateTime<Utc>,
    ) -> Result<TrialReservation> {
        self.inner.try_reserve_trial(hash, max_trials, now).await
    }

    async fn block(
        &self,
        hash: &str,
        reason: &str,
        now: DateTime<Utc>,
    ) -> Result<DeviceFingerprint> {
        self.inner.block(hash, reason, now).await
    }

    async fn unblock(&self, hash: &str) -> Result<Option<DeviceFingerprint>> {
        self.inner.unblock(hash).await
    }
}
