use super::activation::TrialActivationService;
use super::ingress::{PaymentEventIngress, WebhookVerifier};
use super::ledger::TrialLedger;
use super::lifecycle::SubscriptionStateMachine;
use super::query::SubscriptionQueryService;
use crate::config::EngineConfig;
use crate::domain::clock::SharedClock;
use crate::domain::ports::SharedPaymentProcessor;
use crate::infrastructure::Storage;
use std::sync::Arc;

/// The wired set of services behind every entry point.
///
/// `TrialEngine` owns no state of its own: everything durable lives behind
/// the `Storage` ports, so clones of it (or separate processes over the same
/// backend) can serve requests side by side.
#[derive(Clone)]
pub struct TrialEngine {
    pub activation: Arc<TrialActivationService>,
    pub ledger: Arc<TrialLedger>,
    pub ingress: Arc<PaymentEventIngress>,
    pub lifecycle: Arc<SubscriptionStateMachine>,
    pub query: Arc<SubscriptionQueryService>,
}

impl TrialEngine {
    /// Builds every service from `config` over the given storage backend.
    ///
    /// # Arguments
    ///
    /// * `storage` - The store ports, in-memory or persistent.
    /// * `processor` - The payment processor's API, used for cancellation.
    /// * `clock` - The time source shared by all services.
    pub fn new(
        config: &EngineConfig,
        storage: Storage,
        processor: SharedPaymentProcessor,
        clock: SharedClock,
    ) -> Self {
        let ledger = Arc::new(TrialLedger::new(
            storage.trials.clone(),
            storage.fingerprints.clone(),
            clock.clone(),
            config.trial.clone(),
            config.fraud.max_trials_per_device,
        ));
        let activation = Arc::new(TrialActivationService::new(
            ledger.clone(),
            storage.fingerprints.clone(),
            storage.flags.clone(),
            storage.attempts.clone(),
            clock.clone(),
            config.fraud.clone(),
        ));
        let lifecycle = Arc::new(SubscriptionStateMachine::new(
            storage.subscriptions.clone(),
            clock.clone(),
            config.billing.clone(),
        ));
        let ingress = Arc::new(PaymentEventIngress::new(
            WebhookVerifier::new(&config.webhook.secret, config.webhook.tolerance_secs),
            storage.events.clone(),
            lifecycle.clone(),
            clock.clone(),
            config.webhook.stale_claim_secs,
        ));
        let query = Arc::new(SubscriptionQueryService::new(
            storage.subscriptions,
            ledger.clone(),
            storage.flags,
            processor,
            clock,
        ));

        Self {
            activation,
            ledger,
            ingress,
            lifecycle,
            query,
        }
    }
}
