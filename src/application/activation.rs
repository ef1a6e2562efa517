//! The fraud gate in front of trial issuance.
//!
//! Storage trouble on the read side never blocks a legitimate signup: a
//! signal that cannot be read is treated as absent. Trouble on the write side
//! degrades to a pending grant that reconciliation promotes later.

use super::fraud_rules::{FraudRuleSet, RuleContext, Verdict};
use super::ledger::{DeviceRefusal, IssueOutcome, TrialLedger};
use crate::config::{FraudConfig, MAX_WINDOW_SECS};
use crate::domain::clock::SharedClock;
use crate::domain::fingerprint::DeviceFingerprint;
use crate::domain::fraud::{ActivationRequest, FraudFlag, FraudFlagType, Severity};
use crate::domain::ports::{
    SharedActivationAttemptStore, SharedFingerprintStore, SharedFraudFlagStore,
};
use crate::domain::trial::TrialToken;
use crate::error::{GateError, Result};
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

const MAX_ID_LEN: usize = 256;

#[derive(Debug, Clone, PartialEq)]
pub enum ActivationOutcome {
    /// A new token was issued. `flags` holds informational flags raised
    /// in the review band.
    Granted {
        token: TrialToken,
        flags: Vec<FraudFlag>,
    },
    AlreadyActive {
        token: TrialToken,
    },
    /// Storage failed mid-issue; the grant is recorded as pending.
    Pending {
        token: TrialToken,
    },
    /// Storage failed and not even a pending grant could be written. Nothing
    /// was issued; signup goes on and activation can be retried.
    Deferred,
    Denied {
        reason: FraudFlagType,
        score: u32,
        flags: Vec<FraudFlag>,
    },
}

pub struct TrialActivationService {
    ledger: Arc<TrialLedger>,
    fingerprints: SharedFingerprintStore,
    flags: SharedFraudFlagStore,
    attempts: SharedActivationAttemptStore,
    clock: SharedClock,
    rules: FraudRuleSet,
    policy: FraudConfig,
    ip_window: Duration,
}

impl TrialActivationService {
    pub fn new(
        ledger: Arc<TrialLedger>,
        fingerprints: SharedFingerprintStore,
        flags: SharedFraudFlagStore,
        attempts: SharedActivationAttemptStore,
        clock: SharedClock,
        policy: FraudConfig,
    ) -> Self {
        Self {
            ledger,
            fingerprints,
            flags,
            attempts,
            clock,
            rules: FraudRuleSet::from_config(&policy),
            ip_window: ip_window(policy.ip_window_secs),
            policy,
        }
    }

    pub async fn activate(&self, request: &ActivationRequest) -> Result<ActivationOutcome> {
        validate(request)?;
        let now = self.clock.now();
        let user_id = request.user_id.as_str();
        let hash = request.fingerprint_hash.as_str();

        let fingerprint = match self.fingerprints.observe(hash, now).await {
            Ok(fp) => Some(fp),
            Err(e) => {
                warn!(fingerprint = hash, error = %e, "fingerprint lookup failed, continuing without it");
                None
            }
        };

        // A blocked device is refused even for a user who already holds a trial.
        if let Some(fp) = fingerprint.as_ref().filter(|fp| fp.is_blocked) {
            return Ok(self.deny_blocked(request, fp).await);
        }

        if let Some(token) = self.usable_token(user_id).await {
            debug!(user_id, token_id = %token.token_id, "trial already active");
            return Ok(ActivationOutcome::AlreadyActive { token });
        }

        let ip_attempts = match request.ip_address.as_deref() {
            Some(ip) => match self.attempts.record_attempt(ip, now, self.ip_window).await {
                Ok(count) => Some(count),
                Err(e) => {
                    warn!(ip, error = %e, "attempt window unavailable, skipping velocity check");
                    None
                }
            },
            None => None,
        };

        let prior_user_trials = match self.ledger.tokens_for_user(user_id).await {
            Ok(tokens) => Some(tokens.iter().filter(|t| t.was_granted()).count()),
            Err(e) => {
                warn!(user_id, error = %e, "trial history unavailable, skipping reuse check");
                None
            }
        };

        let ctx = RuleContext {
            request,
            fingerprint: fingerprint.as_ref(),
            ip_attempts,
            prior_user_trials,
            policy: &self.policy,
        };
        let assessment = self.rules.assess(&ctx);

        match self.rules.verdict(&assessment) {
            Verdict::Deny { reason } => {
                // A concurrent request for the same user may have won the grant
                // between our first look and now; that is not abuse.
                if let Some(token) = self.usable_token(user_id).await {
                    return Ok(ActivationOutcome::AlreadyActive { token });
                }
                let flags = assessment.to_flags(user_id, hash, None, now);
                self.persist_flags(&flags).await;
                info!(
                    user_id,
                    fingerprint = hash,
                    score = assessment.score,
                    reason = %reason,
                    "trial activation denied"
                );
                Ok(ActivationOutcome::Denied {
                    reason,
                    score: assessment.score,
                    flags,
                })
            }
            Verdict::Review => {
                let flags = assessment.to_flags(user_id, hash, Some(Severity::Info), now);
                self.persist_flags(&flags).await;
                debug!(user_id, score = assessment.score, "activation accepted for review");
                self.issue(request, flags).await
            }
            Verdict::Clean => self.issue(request, Vec::new()).await,
        }
    }

    async fn issue(
        &self,
        request: &ActivationRequest,
        flags: Vec<FraudFlag>,
    ) -> Result<ActivationOutcome> {
        let defaults = self.ledger.defaults();
        let hash = Some(request.fingerprint_hash.as_str());
        match self
            .ledger
            .issue_for_device(&request.user_id, hash, defaults.ttl_days, defaults.reports)
            .await
        {
            Ok(IssueOutcome::Issued(token)) => Ok(ActivationOutcome::Granted { token, flags }),
            Ok(IssueOutcome::AlreadyActive(token)) => Ok(ActivationOutcome::AlreadyActive { token }),
            Ok(IssueOutcome::DeviceRefused(refusal)) => Ok(self.deny_refused(request, refusal).await),
            Err(e) if e.is_transient() => {
                warn!(user_id = %request.user_id, error = %e, "trial issue failed, recording pending grant");
                match self
                    .ledger
                    .issue_pending(&request.user_id, hash, defaults.ttl_days, defaults.reports)
                    .await
                {
                    Ok(token) => Ok(ActivationOutcome::Pending { token }),
                    Err(e) => {
                        warn!(user_id = %request.user_id, error = %e, "pending grant could not be stored, activation deferred");
                        Ok(ActivationOutcome::Deferred)
                    }
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn deny_blocked(
        &self,
        request: &ActivationRequest,
        fingerprint: &DeviceFingerprint,
    ) -> ActivationOutcome {
        let details = fingerprint
            .blocked_reason
            .clone()
            .unwrap_or_else(|| "device is blocked".to_string());
        self.deny_device(request, FraudFlagType::DeviceBlocked, details)
            .await
    }

    /// The device filled up or was blocked between scoring and issuance.
    async fn deny_refused(
        &self,
        request: &ActivationRequest,
        refusal: DeviceRefusal,
    ) -> ActivationOutcome {
        match refusal {
            DeviceRefusal::Blocked => {
                self.deny_device(request, FraudFlagType::DeviceBlocked, "device is blocked".to_string())
                    .await
            }
            DeviceRefusal::AtLimit { trial_count } => {
                let details = format!(
                    "device already used for {} trial(s), limit {}",
                    trial_count, self.policy.max_trials_per_device
                );
                self.deny_device(request, FraudFlagType::DeviceReuse, details)
                    .await
            }
        }
    }

    async fn deny_device(
        &self,
        request: &ActivationRequest,
        reason: FraudFlagType,
        details: String,
    ) -> ActivationOutcome {
        let weight = self.policy.deny_threshold;
        let flag = FraudFlag::new(
            &request.user_id,
            Some(request.fingerprint_hash.clone()),
            reason,
            Severity::High,
            weight,
            details,
            self.clock.now(),
        );
        let flags = vec![flag];
        self.persist_flags(&flags).await;
        info!(user_id = %request.user_id, fingerprint = %request.fingerprint_hash, reason = %reason, "activation refused for device");
        ActivationOutcome::Denied {
            reason,
            score: weight,
            flags,
        }
    }

    async fn usable_token(&self, user_id: &str) -> Option<TrialToken> {
        match self.ledger.active_for_user(user_id).await {
            Ok(token) => token,
            Err(e) => {
                warn!(user_id, error = %e, "active trial lookup failed");
                None
            }
        }
    }

    async fn persist_flags(&self, flags: &[FraudFlag]) {
        if flags.is_empty() {
            return;
        }
        if let Err(e) = self.flags.record(flags).await {
            warn!(count = flags.len(), error = %e, "could not persist fraud flags");
        }
    }

    pub async fn block_fingerprint(&self, hash: &str, reason: &str) -> Result<DeviceFingerprint> {
        if hash.trim().is_empty() || reason.trim().is_empty() {
            return Err(GateError::ValidationError(
                "fingerprint hash and reason are required".to_string(),
            ));
        }
        let fp = self.fingerprints.block(hash, reason, self.clock.now()).await?;
        info!(fingerprint = hash, reason, "fingerprint blocked");
        Ok(fp)
    }

    pub async fn unblock_fingerprint(&self, hash: &str) -> Result<DeviceFingerprint> {
        let fp = self
            .fingerprints
            .unblock(hash)
            .await?
            .ok_or_else(|| GateError::NotFound(format!("fingerprint {}", hash)))?;
        info!(fingerprint = hash, "fingerprint unblocked");
        Ok(fp)
    }

    pub async fn resolve_flag(&self, flag_id: Uuid) -> Result<FraudFlag> {
        self.flags
            .resolve(flag_id)
            .await?
            .ok_or_else(|| GateError::NotFound(format!("fraud flag {}", flag_id)))
    }

    pub async fn unresolved_flags(&self, user_id: &str) -> Result<Vec<FraudFlag>> {
        self.flags.unresolved_for_user(user_id).await
    }
}

fn ip_window(secs: u64) -> Duration {
    i64::try_from(secs.min(MAX_WINDOW_SECS))
        .ok()
        .and_then(Duration::try_seconds)
        .unwrap_or_else(|| Duration::hours(1))
}

fn validate(request: &ActivationRequest) -> Result<()> {
    for (name, value) in [
        ("userId", request.user_id.as_str()),
        ("fingerprintHash", request.fingerprint_hash.as_str()),
    ] {
        if value.trim().is_empty() {
            return Err(GateError::ValidationError(format!("{} is required", name)));
        }
        if value.len() > MAX_ID_LEN {
            return Err(GateError::ValidationError(format!("{} is too long", name)));
        }
    }
    Ok(())
}
