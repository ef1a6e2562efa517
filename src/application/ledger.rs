use crate::config::{MAX_TTL_DAYS, TrialConfig};
use crate::domain::clock::SharedClock;
use crate::domain::fingerprint::TrialReservation;
use crate::domain::ports::{InsertOutcome, SharedFingerprintStore, SharedTrialTokenStore};
use crate::domain::trial::{REVOKED_DEVICE_BLOCKED, REVOKED_DEVICE_LIMIT, TrialToken};
use crate::error::{GateError, Result};
use chrono::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// What one reconciliation pass did with the pending tokens it found.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileReport {
    pub promoted: usize,
    /// Discarded because the user already held an active token.
    pub superseded: usize,
    /// Withdrawn because the device was blocked or out of trials by then.
    pub refused: usize,
    /// Left pending after a storage error; retried next pass.
    pub failed: usize,
}

/// Why a device could not carry another trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRefusal {
    Blocked,
    AtLimit { trial_count: u32 },
}

impl DeviceRefusal {
    pub fn revoked_reason(&self) -> &'static str {
        match self {
            DeviceRefusal::Blocked => REVOKED_DEVICE_BLOCKED,
            DeviceRefusal::AtLimit { .. } => REVOKED_DEVICE_LIMIT,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IssueOutcome {
    Issued(TrialToken),
    /// The user already holds an active token; carries it.
    AlreadyActive(TrialToken),
    /// The token was written, then withdrawn because its device lost the
    /// reservation.
    DeviceRefused(DeviceRefusal),
}

/// Issues, meters and retires trial tokens.
pub struct TrialLedger {
    trials: SharedTrialTokenStore,
    fingerprints: SharedFingerprintStore,
    clock: SharedClock,
    defaults: TrialConfig,
    max_trials_per_device: u32,
}

impl TrialLedger {
    pub fn new(
        trials: SharedTrialTokenStore,
        fingerprints: SharedFingerprintStore,
        clock: SharedClock,
        defaults: TrialConfig,
        max_trials_per_device: u32,
    ) -> Self {
        Self {
            trials,
            fingerprints,
            clock,
            defaults,
            max_trials_per_device,
        }
    }

    pub fn defaults(&self) -> &TrialConfig {
        &self.defaults
    }

    /// Issues an active token unless the user already holds one.
    pub async fn issue(
        &self,
        user_id: &str,
        ttl_days: u32,
        report_count: u32,
    ) -> Result<IssueOutcome> {
        self.issue_for_device(user_id, None, ttl_days, report_count)
            .await
    }

    /// Like [`issue`](Self::issue), charging the grant to a device fingerprint.
    ///
    /// The per-user constraint is checked by the insert, the per-device limit
    /// by a conditional reservation right after it. A token whose device loses
    /// the reservation is revoked before it is handed out.
    pub async fn issue_for_device(
        &self,
        user_id: &str,
        fingerprint_hash: Option<&str>,
        ttl_days: u32,
        report_count: u32,
    ) -> Result<IssueOutcome> {
        let ttl = validate_grant(user_id, ttl_days, report_count)?;
        let now = self.clock.now();
        let token = TrialToken::active(
            user_id,
            fingerprint_hash.map(str::to_string),
            now,
            ttl,
            report_count,
        );
        let token = match self.trials.insert_active(token).await? {
            InsertOutcome::Created(token) => token,
            InsertOutcome::AlreadyActive(existing) => {
                return Ok(IssueOutcome::AlreadyActive(existing));
            }
        };
        if let Some(refusal) = self.charge_device(&token).await {
            self.withdraw(&token, refusal).await;
            return Ok(IssueOutcome::DeviceRefused(refusal));
        }
        info!(user_id, token_id = %token.token_id, expires_at = %token.expires_at, "trial token issued");
        Ok(IssueOutcome::Issued(token))
    }

    /// Records a grant that could not be issued normally. The token only
    /// becomes usable once [`reconcile_pending`](Self::reconcile_pending) promotes it.
    pub async fn issue_pending(
        &self,
        user_id: &str,
        fingerprint_hash: Option<&str>,
        ttl_days: u32,
        report_count: u32,
    ) -> Result<TrialToken> {
        let ttl = validate_grant(user_id, ttl_days, report_count)?;
        let token = TrialToken::pending(
            user_id,
            fingerprint_hash.map(str::to_string),
            self.clock.now(),
            ttl,
            report_count,
        );
        self.trials.insert_pending(token.clone()).await?;
        Ok(token)
    }

    /// Spends one report. Fails with `NoCreditsRemaining` at zero; never goes negative.
    pub async fn consume(&self, token_id: Uuid) -> Result<TrialToken> {
        let token = self.trials.consume(token_id, self.clock.now()).await?;
        debug!(token_id = %token_id, remaining = token.reports_remaining, "trial report consumed");
        Ok(token)
    }

    /// Moves every token past its expiry to expired. Returns how many moved.
    pub async fn expire_sweep(&self) -> Result<usize> {
        let expired = self.trials.expire_due(self.clock.now()).await?;
        if !expired.is_empty() {
            info!(count = expired.len(), "expired trial tokens");
        }
        Ok(expired.len())
    }

    pub async fn revoke(&self, token_id: Uuid, reason: &str) -> Result<TrialToken> {
        if reason.trim().is_empty() {
            return Err(GateError::ValidationError(
                "revocation reason is required".to_string(),
            ));
        }
        let token = self.trials.revoke(token_id, reason).await?;
        info!(token_id = %token_id, user_id = %token.user_id, reason, "trial token revoked");
        Ok(token)
    }

    /// Promotes tokens issued while storage was degraded, under the same
    /// one-active-per-user rule and device limit as a normal grant.
    pub async fn reconcile_pending(&self) -> Result<ReconcileReport> {
        let now = self.clock.now();
        let mut report = ReconcileReport::default();
        for token in self.trials.pending().await? {
            if token.is_past_expiry(now) {
                // The expiry sweep retires these.
                continue;
            }
            match self.trials.promote_pending(token.token_id, now).await {
                Ok(InsertOutcome::Created(promoted)) => {
                    if let Some(refusal) = self.charge_device(&promoted).await {
                        self.withdraw(&promoted, refusal).await;
                        report.refused += 1;
                        continue;
                    }
                    info!(user_id = %promoted.user_id, token_id = %promoted.token_id, "pending trial promoted");
                    report.promoted += 1;
                }
                Ok(InsertOutcome::AlreadyActive(existing)) => {
                    debug!(
                        user_id = %existing.user_id,
                        pending = %token.token_id,
                        "pending trial superseded by active token"
                    );
                    report.superseded += 1;
                }
                Err(e) => {
                    warn!(token_id = %token.token_id, error = %e, "could not promote pending trial");
                    report.failed += 1;
                }
            }
        }
        Ok(report)
    }

    pub async fn active_for_user(&self, user_id: &str) -> Result<Option<TrialToken>> {
        let now = self.clock.now();
        Ok(self
            .trials
            .active_for_user(user_id)
            .await?
            .filter(|t| t.is_usable(now)))
    }

    pub async fn tokens_for_user(&self, user_id: &str) -> Result<Vec<TrialToken>> {
        self.trials.for_user(user_id).await
    }

    pub async fn get(&self, token_id: Uuid) -> Result<Option<TrialToken>> {
        self.trials.get(token_id).await
    }

    /// Reserves one trial on the token's device. Returns the refusal when the
    /// device is blocked or full. A reservation that cannot be attempted lets
    /// the grant stand.
    async fn charge_device(&self, token: &TrialToken) -> Option<DeviceRefusal> {
        let hash = token.fingerprint_hash.as_deref()?;
        match self
            .fingerprints
            .try_reserve_trial(hash, self.max_trials_per_device, self.clock.now())
            .await
        {
            Ok(TrialReservation::Reserved(count)) => {
                debug!(fingerprint = hash, trial_count = count, "device charged");
                None
            }
            Ok(TrialReservation::Blocked) => Some(DeviceRefusal::Blocked),
            Ok(TrialReservation::Exhausted(trial_count)) => {
                Some(DeviceRefusal::AtLimit { trial_count })
            }
            Err(e) => {
                warn!(fingerprint = hash, error = %e, "could not record trial against device");
                None
            }
        }
    }

    async fn withdraw(&self, token: &TrialToken, refusal: DeviceRefusal) {
        let reason = refusal.revoked_reason();
        match self.trials.revoke(token.token_id, reason).await {
            Ok(_) => info!(
                user_id = %token.user_id,
                token_id = %token.token_id,
                reason,
                "trial withdrawn, device refused the reservation"
            ),
            Err(e) => error!(
                token_id = %token.token_id,
                reason,
                error = %e,
                "could not withdraw trial after device refusal"
            ),
        }
    }
}

fn validate_grant(user_id: &str, ttl_days: u32, report_count: u32) -> Result<Duration> {
    if user_id.trim().is_empty() {
        return Err(GateError::ValidationError("userId is required".to_string()));
    }
    if ttl_days == 0 || ttl_days > MAX_TTL_DAYS {
        return Err(GateError::ValidationError(format!(
            "ttlDays must be between 1 and {}",
            MAX_TTL_DAYS
        )));
    }
    if report_count == 0 {
        return Err(GateError::ValidationError(
            "reportCount must be positive".to_string(),
        ));
    }
    Ok(Duration::days(i64::from(ttl_days)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::clock::ManualClock;
    use crate::domain::ports::FingerprintStore;
    use crate::domain::trial::TrialStatus;
    use crate::infrastructure::in_memory::{InMemoryFingerprintStore, InMemoryTrialTokenStore};
    use chrono::Utc;
    use std::sync::Arc;

    fn ledger() -> (TrialLedger, ManualClock, Arc<InMemoryFingerprintStore>) {
        let clock = ManualClock::new(Utc::now());
        let fingerprints = Arc::new(InMemoryFingerprintStore::new());
        let ledger = TrialLedger::new(
            Arc::new(InMemoryTrialTokenStore::new()),
            fingerprints.clone(),
            Arc::new(clock.clone()),
            TrialConfig::default(),
            1,
        );
        (ledger, clock, fingerprints)
    }

    #[tokio::test]
    async fn test_issue_then_consume_to_zero() {
        let (ledger, _clock, _) = ledger();
        let IssueOutcome::Issued(token) = ledger.issue("u1", 7, 3).await.unwrap() else {
            panic!("expected a new token");
        };
        for expected in [2, 1, 0] {
            let after = ledger.consume(token.token_id).await.unwrap();
            assert_eq!(after.reports_remaining, expected);
        }
        assert!(matches!(
            ledger.consume(token.token_id).await,
            Err(GateError::NoCreditsRemaining(_))
        ));
        let stored = ledger.get(token.token_id).await.unwrap().unwrap();
        assert_eq!(stored.reports_remaining, 0);
        assert_eq!(stored.status, TrialStatus::Expired);
    }

    #[tokio::test]
    async fn test_issue_rejects_bad_grants() {
        let (ledger, _, _) = ledger();
        assert!(matches!(
            ledger.issue("u1", 0, 3).await,
            Err(GateError::ValidationError(_))
        ));
        assert!(matches!(
            ledger.issue("u1", MAX_TTL_DAYS + 1, 3).await,
            Err(GateError::ValidationError(_))
        ));
        assert!(matches!(
            ledger.issue("u1", 7, 0).await,
            Err(GateError::ValidationError(_))
        ));
        assert!(matches!(
            ledger.issue("  ", 7, 3).await,
            Err(GateError::ValidationError(_))
        ));
    }

    #[tokio::test]
    async fn test_issue_twice_returns_existing() {
        let (ledger, _, _) = ledger();
        let IssueOutcome::Issued(first) = ledger.issue("u1", 7, 3).await.unwrap() else {
            panic!("expected a new token");
        };
        match ledger.issue("u1", 7, 3).await.unwrap() {
            IssueOutcome::AlreadyActive(existing) => assert_eq!(existing.token_id, first.token_id),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_expire_sweep_after_ttl() {
        let (ledger, clock, _) = ledger();
        ledger.issue("u1", 7, 3).await.unwrap();
        ledger.issue("u2", 30, 3).await.unwrap();

        clock.advance(Duration::days(6));
        assert_eq!(ledger.expire_sweep().await.unwrap(), 0);

        clock.advance(Duration::days(1));
        assert_eq!(ledger.expire_sweep().await.unwrap(), 1);
        assert!(ledger.active_for_user("u1").await.unwrap().is_none());
        assert!(ledger.active_for_user("u2").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_consume_after_expiry_is_state_error() {
        let (ledger, clock, _) = ledger();
        let IssueOutcome::Issued(token) = ledger.issue("u1", 1, 3).await.unwrap() else {
            panic!("expected a new token");
        };
        clock.advance(Duration::days(2));
        assert!(matches!(
            ledger.consume(token.token_id).await,
            Err(GateError::StateError(_))
        ));
    }

    #[tokio::test]
    async fn test_device_charged_on_issue() {
        let (ledger, _, fingerprints) = ledger();
        ledger.issue_for_device("u1", Some("fp"), 7, 3).await.unwrap();
        assert_eq!(fingerprints.get("fp").await.unwrap().unwrap().trial_count, 1);

        // A second grant for the same user is refused and costs the device nothing.
        ledger.issue_for_device("u1", Some("fp"), 7, 3).await.unwrap();
        assert_eq!(fingerprints.get("fp").await.unwrap().unwrap().trial_count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_promotes_and_supersedes() {
        let (ledger, _, fingerprints) = ledger();
        let lone = ledger.issue_pending("u1", Some("fp1"), 7, 3).await.unwrap();
        ledger.issue_pending("u2", Some("fp2"), 7, 3).await.unwrap();
        ledger.issue("u2", 7, 3).await.unwrap();

        let report = ledger.reconcile_pending().await.unwrap();
        assert_eq!(
            report,
            ReconcileReport {
                promoted: 1,
                superseded: 1,
                refused: 0,
                failed: 0
            }
        );
        let promoted = ledger.get(lone.token_id).await.unwrap().unwrap();
        assert_eq!(promoted.status, TrialStatus::Active);
        assert_eq!(fingerprints.get("fp1").await.unwrap().unwrap().trial_count, 1);
        assert!(fingerprints.get("fp2").await.unwrap().is_none());

        assert_eq!(ledger.reconcile_pending().await.unwrap(), ReconcileReport::default());
    }

    #[tokio::test]
    async fn test_revoke_requires_reason() {
        let (ledger, _, _) = ledger();
        let IssueOutcome::Issued(token) = ledger.issue("u1", 7, 3).await.unwrap() else {
            panic!("expected a new token");
        };
        assert!(matches!(
            ledger.revoke(token.token_id, "").await,
            Err(GateError::ValidationError(_))
        ));
        let revoked = ledger.revoke(token.token_id, "chargeback").await.unwrap();
        assert_eq!(revoked.status, TrialStatus::Revoked);
        assert!(matches!(
            ledger.consume(token.token_id).await,
            Err(GateError::StateError(_))
        ));
        assert!(matches!(
            ledger.revoke(Uuid::new_v4(), "x").await,
            Err(GateError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_second_user_on_full_device_is_withdrawn() {
        let (ledger, _, fingerprints) = ledger();
        assert!(matches!(
            ledger.issue_for_device("u1", Some("fp"), 7, 3).await.unwrap(),
            IssueOutcome::Issued(_)
        ));
        assert_eq!(
            ledger.issue_for_device("u2", Some("fp"), 7, 3).await.unwrap(),
            IssueOutcome::DeviceRefused(DeviceRefusal::AtLimit { trial_count: 1 })
        );
        assert!(ledger.active_for_user("u2").await.unwrap().is_none());
        let withdrawn = ledger.tokens_for_user("u2").await.unwrap();
        assert_eq!(withdrawn.len(), 1);
        assert_eq!(withdrawn[0].status, TrialStatus::Revoked);
        assert!(!withdrawn[0].was_granted());
        assert_eq!(fingerprints.get("fp").await.unwrap().unwrap().trial_count, 1);
    }

    #[tokio::test]
    async fn test_reconcile_refuses_device_blocked_meanwhile() {
        let (ledger, _, fingerprints) = ledger();
        let stranded = ledger.issue_pending("u1", Some("fp1"), 7, 3).await.unwrap();
        fingerprints
            .block("fp1", "chargeback", Utc::now())
            .await
            .unwrap();

        let report = ledger.reconcile_pending().await.unwrap();
        assert_eq!(report.refused, 1);
        assert_eq!(report.promoted, 0);
        let token = ledger.get(stranded.token_id).await.unwrap().unwrap();
        assert_eq!(token.status, TrialStatus::Revoked);
        assert_eq!(token.revoked_reason.as_deref(), Some(REVOKED_DEVICE_BLOCKED));
        assert!(ledger.active_for_user("u1").await.unwrap().is_none());
        assert_eq!(fingerprints.get("fp1").await.unwrap().unwrap().trial_count, 0);
    }

    #[tokio::test]
    async fn test_reconcile_refuses_device_used_up_meanwhile() {
        let (ledger, _, fingerprints) = ledger();
        let stranded = ledger.issue_pending("u1", Some("fp1"), 7, 3).await.unwrap();
        ledger.issue_for_device("u2", Some("fp1"), 7, 3).await.unwrap();

        let report = ledger.reconcile_pending().await.unwrap();
        assert_eq!(report.refused, 1);
        let token = ledger.get(stranded.token_id).await.unwrap().unwrap();
        assert_eq!(token.revoked_reason.as_deref(), Some(REVOKED_DEVICE_LIMIT));
        assert_eq!(fingerprints.get("fp1").await.unwrap().unwrap().trial_count, 1);
    }
}
