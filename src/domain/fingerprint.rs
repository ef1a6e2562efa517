use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Result of trying to charge one more trial to a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrialReservation {
    /// Charged; carries the new `trial_count`.
    Reserved(u32),
    Blocked,
    /// The device already carries `max_trials_per_device` trials.
    Exhausted(u32),
}

/// Trial usage and block state for one device fingerprint hash.
///
/// Created the first time a hash is seen. `trial_count` only grows, and only
/// when a trial is actually issued against the device. Blocking is sticky:
/// nothing but an explicit admin override clears it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceFingerprint {
    pub hash: String,
    pub trial_count: u32,
    pub is_blocked: bool,
    pub blocked_reason: Option<String>,
    pub last_seen: DateTime<Utc>,
}

impl DeviceFingerprint {
    pub fn new(hash: impl Into<String>, seen_at: DateTime<Utc>) -> Self {
        Self {
            hash: hash.into(),
            trial_count: 0,
            is_blocked: false,
            blocked_reason: None,
            last_seen: seen_at,
        }
    }

    pub fn touch(&mut self, seen_at: DateTime<Utc>) {
        if seen_at > self.last_seen {
            self.last_seen = seen_at;
        }
    }

    /// Blocks the device. A device that is already blocked keeps its first reason.
    pub fn block(&mut self, reason: impl Into<String>) {
        if !self.is_blocked {
            self.is_blocked = true;
            self.blocked_reason = Some(reason.into());
        }
    }

    /// Admin override.
    pub fn unblock(&mut self) {
        self.is_blocked = false;
        self.blocked_reason = None;
    }

    /// `trial_count = trial_count + 1 WHERE trial_count < max AND NOT is_blocked`.
    pub fn try_reserve_trial(&mut self, max_trials: u32) -> TrialReservation {
        if self.is_blocked {
            return TrialReservation::Blocked;
        }
        if self.trial_count >= max_trials {
            return TrialReservation::Exhausted(self.trial_count);
        }
        self.trial_count += 1;
        TrialReservation::Reserved(self.trial_count)
    }
}
