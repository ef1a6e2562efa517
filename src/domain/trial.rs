use crate::error::GateError;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum TrialStatus {
    /// Issued while storage was degraded; waiting for reconciliation.
    Pending,
    Active,
    Expired,
    Revoked,
}

impl TrialStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialStatus::Pending => "pending",
            TrialStatus::Active => "active",
            TrialStatus::Expired => "expired",
            TrialStatus::Revoked => "revoked",
        }
    }
}

/// Revocation reasons for grants that were withdrawn before the user could
/// use them. Such tokens never count as a trial the user held.
pub const REVOKED_SUPERSEDED: &str = "superseded by an active trial";
pub const REVOKED_DEVICE_BLOCKED: &str = "device_blocked";
pub const REVOKED_DEVICE_LIMIT: &str = "device_reuse";

const WITHDRAWN_REASONS: [&str; 3] = [
    REVOKED_SUPERSEDED,
    REVOKED_DEVICE_BLOCKED,
    REVOKED_DEVICE_LIMIT,
];

/// A time- and count-bounded usage grant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrialToken {
    pub token_id: Uuid,
    pub user_id: String,
    pub fingerprint_hash: Option<String>,
    pub status: TrialStatus,
    pub created_at: DateTime<Utc>,
    pub activated_at: Option<DateTime<Utc>>,
    pub expires_at: DateTime<Utc>,
    pub reports_remaining: u32,
    pub revoked_reason: Option<String>,
}

impl TrialToken {
    pub fn active(
        user_id: impl Into<String>,
        fingerprint_hash: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        reports: u32,
    ) -> Self {
        Self {
            token_id: Uuid::new_v4(),
            user_id: user_id.into(),
            fingerprint_hash,
            status: TrialStatus::Active,
            created_at: now,
            activated_at: Some(now),
            expires_at: now + ttl,
            reports_remaining: reports,
            revoked_reason: None,
        }
    }

    pub fn pending(
        user_id: impl Into<String>,
        fingerprint_hash: Option<String>,
        now: DateTime<Utc>,
        ttl: Duration,
        reports: u32,
    ) -> Self {
        Self {
            status: TrialStatus::Pending,
            activated_at: None,
            ..Self::active(user_id, fingerprint_hash, now, ttl, reports)
        }
    }

    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    /// Status as a reader should see it at `now`.
    ///
    /// An active token past its expiry, or with no reports left, reads as
    /// expired even if the sweep has not rewritten it yet.
    pub fn effective_status(&self, now: DateTime<Utc>) -> TrialStatus {
        match self.status {
            TrialStatus::Active if self.is_past_expiry(now) || self.reports_remaining == 0 => {
                TrialStatus::Expired
            }
            status => status,
        }
    }

    pub fn is_usable(&self, now: DateTime<Utc>) -> bool {
        self.effective_status(now) == TrialStatus::Active
    }

    /// Conditional decrement. Fails without touching the token when nothing is left.
    pub fn take_report(&mut self) -> Option<u32> {
        let remaining = self.reports_remaining.checked_sub(1)?;
        self.reports_remaining = remaining;
        if remaining == 0 {
            self.status = TrialStatus::Expired;
        }
        Some(remaining)
    }

    /// The consume rule shared by every store: one report per call, never below zero.
    pub fn try_consume(&mut self, now: DateTime<Utc>) -> Result<u32, GateError> {
        if self.reports_remaining == 0 {
            return Err(GateError::NoCreditsRemaining(self.token_id.to_string()));
        }
        if self.status != TrialStatus::Active || self.is_past_expiry(now) {
            return Err(GateError::StateError(format!(
                "trial token {} is {}",
                self.token_id,
                self.effective_status(now).as_str()
            )));
        }
        self.take_report()
            .ok_or_else(|| GateError::NoCreditsRemaining(self.token_id.to_string()))
    }

    /// Whether the user ever actually held this grant.
    pub fn was_granted(&self) -> bool {
        match self.status {
            TrialStatus::Pending => false,
            TrialStatus::Revoked => !self
                .revoked_reason
                .as_deref()
                .is_some_and(|reason| WITHDRAWN_REASONS.contains(&reason)),
            TrialStatus::Active | TrialStatus::Expired => true,
        }
    }

    pub fn promote(&mut self, now: DateTime<Utc>) {
        self.status = TrialStatus::Active;
        self.activated_at = Some(now);
    }

    pub fn revoke(&mut self, reason: impl Into<String>) {
        self.status = TrialStatus::Revoked;
        self.revoked_reason = Some(reason.into());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_active_token_expiry_window() {
        let now = Utc::now();
        let token = TrialToken::active("u1", None, now, Duration::days(7), 3);
        assert_eq!(token.status, TrialStatus::Active);
        assert_eq!(token.expires_at, now + Duration::days(7));
        assert!(token.is_usable(now));
        assert!(!token.is_usable(now + Duration::days(7)));
        assert_eq!(
            token.effective_status(now + Duration::days(8)),
            TrialStatus::Expired
        );
    }

    #[test]
    fn test_take_report_stops_at_zero() {
        let now = Utc::now();
        let mut token = TrialToken::active("u1", None, now, Duration::days(7), 2);
        assert_eq!(token.take_report(), Some(1));
        assert_eq!(token.take_report(), Some(0));
        assert_eq!(token.status, TrialStatus::Expired);
        assert_eq!(token.take_report(), None);
        assert_eq!(token.reports_remaining, 0);
    }

    #[test]
    fn test_try_consume_rules() {
        let now = Utc::now();
        let mut token = TrialToken::active("u1", None, now, Duration::days(1), 1);
        assert_eq!(token.try_consume(now).unwrap(), 0);
        assert!(matches!(
            token.try_consume(now),
            Err(GateError::NoCreditsRemaining(_))
        ));

        let mut late = TrialToken::active("u1", None, now, Duration::days(1), 3);
        assert!(matches!(
            late.try_consume(now + Duration::days(2)),
            Err(GateError::StateError(_))
        ));
        assert_eq!(late.reports_remaining, 3);
    }

    #[test]
    fn test_pending_token_is_not_usable() {
        let now = Utc::now();
        let mut token = TrialToken::pending("u1", Some("fp".into()), now, Duration::days(7), 3);
        assert_eq!(token.status, TrialStatus::Pending);
        assert!(token.activated_at.is_none());
        assert!(!token.is_usable(now));

        token.promote(now);
        assert!(token.is_usable(now));
    }

    #[test]
    fn test_revoke_is_terminal_status() {
        let now = Utc::now();
        let mut token = TrialToken::active("u1", None, now, Duration::days(7), 3);
        token.revoke("abuse");
        assert_eq!(token.effective_status(now), TrialStatus::Revoked);
        assert_eq!(token.revoked_reason.as_deref(), Some("abuse"));
    }

    #[test]
    fn test_withdrawn_grants_do_not_count() {
        let now = Utc::now();
        let mut token = TrialToken::pending("u1", None, now, Duration::days(7), 3);
        assert!(!token.was_granted());

        token.revoke(REVOKED_SUPERSEDED);
        assert!(!token.was_granted());

        let mut abused = TrialToken::active("u1", None, now, Duration::days(7), 3);
        assert!(abused.was_granted());
        abused.revoke("abuse report");
        assert!(abused.was_granted());
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&TrialStatus::Pending).unwrap();
        assert_eq!(json, "\"pending\"");
    }
}
