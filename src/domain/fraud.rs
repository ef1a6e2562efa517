use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// The signals the fraud gate knows how to raise.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Hash)]
#[serde(rename_all = "snake_case")]
pub enum FraudFlagType {
    DeviceBlocked,
    DeviceReuse,
    UserReuse,
    IpVelocity,
    DeviceSpoofSuspect,
}

impl FraudFlagType {
    pub fn as_str(&self) -> &'static str {
        match self {
            FraudFlagType::DeviceBlocked => "device_blocked",
            FraudFlagType::DeviceReuse => "device_reuse",
            FraudFlagType::UserReuse => "user_reuse",
            FraudFlagType::IpVelocity => "ip_velocity",
            FraudFlagType::DeviceSpoofSuspect => "device_spoof_suspect",
        }
    }
}

impl std::fmt::Display for FraudFlagType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Raised on an accepted activation; kept for review only.
    Info,
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FraudFlag {
    pub flag_id: Uuid,
    pub user_id: String,
    pub fingerprint_hash: Option<String>,
    #[serde(rename = "type")]
    pub flag_type: FraudFlagType,
    pub severity: Severity,
    pub score: u32,
    pub details: String,
    pub resolved: bool,
    pub created_at: DateTime<Utc>,
}

impl FraudFlag {
    pub fn new(
        user_id: impl Into<String>,
        fingerprint_hash: Option<String>,
        flag_type: FraudFlagType,
        severity: Severity,
        score: u32,
        details: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            flag_id: Uuid::new_v4(),
            user_id: user_id.into(),
            fingerprint_hash,
            flag_type,
            severity,
            score,
            details: details.into(),
            resolved: false,
            created_at,
        }
    }
}

/// Client-reported device traits. Every field is optional; absent fields
/// simply cannot contradict anything.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DeviceData {
    pub platform: Option<String>,
    pub user_agent: Option<String>,
    pub screen_width: Option<u32>,
    pub screen_height: Option<u32>,
    pub max_touch_points: Option<u32>,
    pub hardware_concurrency: Option<u32>,
    pub timezone: Option<String>,
    pub language: Option<String>,
    pub webdriver: Option<bool>,
}

/// One trial-activation attempt as it reaches the gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivationRequest {
    pub user_id: String,
    pub fingerprint_hash: String,
    #[serde(default)]
    pub device_data: DeviceData,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
}
