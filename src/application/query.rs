//! Read projections and the cancellation entry point.

use super::ledger::TrialLedger;
use crate::domain::clock::SharedClock;
use crate::domain::fraud::FraudFlag;
use crate::domain::ports::{SharedFraudFlagStore, SharedPaymentProcessor, SharedSubscriptionStore};
use crate::domain::subscription::{Subscription, SubscriptionHistoryEvent, SubscriptionStatus};
use crate::domain::trial::TrialStatus;
use crate::error::{GateError, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Display-ready trial state for one user.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrialStatusView {
    pub has_active_trial: bool,
    pub token_id: Option<Uuid>,
    /// Effective status at read time; `None` when the user never had a trial.
    pub status: Option<TrialStatus>,
    pub reports_remaining: u32,
    pub expires_at: Option<DateTime<Utc>>,
    pub fraud_flags: Vec<FraudFlag>,
}

/// Optimistic acknowledgement; the webhook brings the final state.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelAck {
    pub accepted: bool,
    pub subscription_id: Uuid,
    pub cancel_at_period_end: bool,
}

pub struct SubscriptionQueryService {
    subscriptions: SharedSubscriptionStore,
    ledger: Arc<TrialLedger>,
    flags: SharedFraudFlagStore,
    processor: SharedPaymentProcessor,
    clock: SharedClock,
}

impl SubscriptionQueryService {
    pub fn new(
        subscriptions: SharedSubscriptionStore,
        ledger: Arc<TrialLedger>,
        flags: SharedFraudFlagStore,
        processor: SharedPaymentProcessor,
        clock: SharedClock,
    ) -> Self {
        Self {
            subscriptions,
            ledger,
            flags,
            processor,
            clock,
        }
    }

    /// The user's live subscription (TRIAL, ACTIVE or PAST_DUE), if any.
    pub async fn get_active_subscription(&self, user_id: &str) -> Result<Option<Subscription>> {
        let mut live: Vec<Subscription> = self
            .subscriptions
            .for_user(user_id)
            .await?
            .into_iter()
            .filter(|s| s.status.is_live())
            .collect();
        if live.len() > 1 {
            warn!(user_id, count = live.len(), "user has more than one live subscription");
        }
        live.sort_by_key(|s| s.updated_at);
        Ok(live.pop())
    }

    /// Latest trial token merged with unresolved flags. Expiry is applied
    /// here as well, so a token the sweep has not reached reads as expired.
    pub async fn get_trial_status(&self, user_id: &str) -> Result<TrialStatusView> {
        let now = self.clock.now();
        let latest = self
            .ledger
            .tokens_for_user(user_id)
            .await?
            .into_iter()
            .max_by_key(|t| t.created_at);
        let fraud_flags = self.flags.unresolved_for_user(user_id).await?;

        Ok(match latest {
            Some(token) => {
                let status = token.effective_status(now);
                TrialStatusView {
                    has_active_trial: status == TrialStatus::Active,
                    token_id: Some(token.token_id),
                    status: Some(status),
                    reports_remaining: token.reports_remaining,
                    expires_at: Some(token.expires_at),
                    fraud_flags,
                }
            }
            None => TrialStatusView {
                has_active_trial: false,
                token_id: None,
                status: None,
                reports_remaining: 0,
                expires_at: None,
                fraud_flags,
            },
        })
    }

    /// Asks the processor to cancel the user's paid subscription.
    ///
    /// Trials cannot be cancelled here; they lapse.
    pub async fn cancel(&self, user_id: &str, cancel_at_period_end: bool) -> Result<CancelAck> {
        let subscription = self
            .get_active_subscription(user_id)
            .await?
            .ok_or_else(|| GateError::NotFound(format!("no active subscription for {}", user_id)))?;
        if subscription.status == SubscriptionStatus::Trial {
            return Err(GateError::StateError(
                "a trial subscription cannot be cancelled, it lapses".to_string(),
            ));
        }

        self.processor
            .cancel_subscription(&subscription.external_ref, cancel_at_period_end)
            .await?;
        info!(
            user_id,
            external_ref = %subscription.external_ref,
            cancel_at_period_end,
            "cancellation requested"
        );
        Ok(CancelAck {
            accepted: true,
            subscription_id: subscription.subscription_id,
            cancel_at_period_end,
        })
    }

    /// History rows for every subscription the user holds, in arrival order.
    pub async fn history(&self, user_id: &str) -> Result<Vec<SubscriptionHistoryEvent>> {
        self.subscriptions.history_for_user(user_id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TrialConfig;
    use crate::domain::clock::{Clock, ManualClock};
    use crate::domain::fraud::{FraudFlagType, Severity};
    use crate::domain::ports::{FraudFlagStore, SubscriptionStore};
    use crate::domain::subscription::HistoryDisposition;
    use crate::infrastructure::in_memory::{
        InMemoryFingerprintStore, InMemoryFraudFlagStore, InMemorySubscriptionStore,
        InMemoryTrialTokenStore,
    };
    use crate::infrastructure::processor::RecordingProcessor;
    use chrono::Duration;

    struct Harness {
        service: SubscriptionQueryService,
        ledger: Arc<TrialLedger>,
        subscriptions: Arc<InMemorySubscriptionStore>,
        flags: Arc<InMemoryFraudFlagStore>,
        processor: Arc<RecordingProcessor>,
        clock: ManualClock,
    }

    fn harness() -> Harness {
        let clock = ManualClock::new(Utc::now());
        let ledger = Arc::new(TrialLedger::new(
            Arc::new(InMemoryTrialTokenStore::new()),
            Arc::new(InMemoryFingerprintStore::new()),
            Arc::new(clock.clone()),
            TrialConfig::default(),
            1,
        ));
        let subscriptions = Arc::new(InMemorySubscriptionStore::new());
        let flags = Arc::new(InMemoryFraudFlagStore::new());
        let processor = Arc::new(RecordingProcessor::new());
        let service = SubscriptionQueryService::new(
            subscriptions.clone(),
            ledger.clone(),
            flags.clone(),
            processor.clone(),
            Arc::new(clock.clone()),
        );
        Harness {
            service,
            ledger,
            subscriptions,
            flags,
            processor,
            clock,
        }
    }

    async fn seed(h: &Harness, user: &str, ext: &str, status: SubscriptionStatus) {
        let now = h.clock.now();
        let sub = Subscription::new(user, ext, "pro", status, now, now);
        let history = SubscriptionHistoryEvent::record(
            &sub,
            None,
            "seed",
            None,
            HistoryDisposition::Applied,
            serde_json::Value::Null,
            now,
        );
        h.subscriptions.insert(sub, history).await.unwrap();
    }

    #[tokio::test]
    async fn test_trial_status_applies_expiry_at_read_time() {
        let h = harness();
        h.ledger.issue("u1", 7, 3).await.unwrap();
        let view = h.service.get_trial_status("u1").await.unwrap();
        assert!(view.has_active_trial);
        assert_eq!(view.reports_remaining, 3);

        h.clock.advance(Duration::days(7) + Duration::seconds(1));
        let view = h.service.get_trial_status("u1").await.unwrap();
        assert!(!view.has_active_trial);
        assert_eq!(view.status, Some(TrialStatus::Expired));
    }

    #[tokio::test]
    async fn test_trial_status_includes_unresolved_flags() {
        let h = harness();
        let flag = FraudFlag::new(
            "u1",
            None,
            FraudFlagType::IpVelocity,
            Severity::Info,
            60,
            "burst",
            h.clock.now(),
        );
        h.flags.record(&[flag.clone()]).await.unwrap();

        let view = h.service.get_trial_status("u1").await.unwrap();
        assert!(!view.has_active_trial);
        assert_eq!(view.status, None);
        assert_eq!(view.fraud_flags, vec![flag.clone()]);

        h.flags.resolve(flag.flag_id).await.unwrap();
        assert!(h.service.get_trial_status("u1").await.unwrap().fraud_flags.is_empty());
    }

    #[tokio::test]
    async fn test_active_subscription_ignores_cancelled_rows() {
        let h = harness();
        seed(&h, "u1", "sub_old", SubscriptionStatus::Cancelled).await;
        assert!(h.service.get_active_subscription("u1").await.unwrap().is_none());

        seed(&h, "u1", "sub_new", SubscriptionStatus::PastDue).await;
        let live = h.service.get_active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(live.external_ref, "sub_new");
    }

    #[tokio::test]
    async fn test_cancel_delegates_to_processor() {
        let h = harness();
        seed(&h, "u1", "sub_1", SubscriptionStatus::Active).await;
        let ack = h.service.cancel("u1", true).await.unwrap();
        assert!(ack.accepted);
        assert!(ack.cancel_at_period_end);

        let requests = h.processor.requests().await;
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].external_ref, "sub_1");

        // Local state waits for the webhook.
        let sub = h.service.get_active_subscription("u1").await.unwrap().unwrap();
        assert_eq!(sub.status, SubscriptionStatus::Active);
    }

    #[tokio::test]
    async fn test_cancel_rejects_trial_and_missing() {
        let h = harness();
        assert!(matches!(
            h.service.cancel("u1", false).await,
            Err(GateError::NotFound(_))
        ));
        seed(&h, "u1", "sub_1", SubscriptionStatus::Trial).await;
        assert!(matches!(
            h.service.cancel("u1", false).await,
            Err(GateError::StateError(_))
        ));
        assert!(h.processor.requests().await.is_empty());
    }
}
