//! Engine configuration, loaded from TOML with environment overrides.

use crate::error::{GateError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const ENV_WEBHOOK_SECRET: &str = "TRIALGATE_WEBHOOK_SECRET";
pub const ENV_BIND: &str = "TRIALGATE_BIND";

/// Longest trial a grant may carry.
pub const MAX_TTL_DAYS: u32 = 3650;
/// Upper bound for every configured window, interval and tolerance (30 days).
pub const MAX_WINDOW_SECS: u64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub trial: TrialConfig,
    #[serde(default)]
    pub fraud: FraudConfig,
    #[serde(default)]
    pub webhook: WebhookConfig,
    #[serde(default)]
    pub billing: BillingConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageConfig {
    /// RocksDB directory. Unset = in-memory.
    #[serde(default)]
    pub db_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrialConfig {
    #[serde(default = "default_ttl_days")]
    pub ttl_days: u32,
    #[serde(default = "default_reports")]
    pub reports: u32,
    /// How often expiry and pending reconciliation run.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// Fraud policy. Thresholds and weights are tunable; a weight of 0 disables a rule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudConfig {
    #[serde(default = "default_max_trials_per_device")]
    pub max_trials_per_device: u32,
    #[serde(default = "default_ip_window")]
    pub ip_window_secs: u64,
    #[serde(default = "default_ip_max_attempts")]
    pub ip_max_attempts: u32,
    #[serde(default = "default_review_threshold")]
    pub review_threshold: u32,
    #[serde(default = "default_deny_threshold")]
    pub deny_threshold: u32,
    #[serde(default)]
    pub weights: FraudWeights,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FraudWeights {
    #[serde(default = "default_reuse_weight")]
    pub device_reuse: u32,
    #[serde(default = "default_reuse_weight")]
    pub user_reuse: u32,
    #[serde(default = "default_ip_velocity_weight")]
    pub ip_velocity: u32,
    #[serde(default = "default_spoof_weight")]
    pub device_spoof_suspect: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookConfig {
    /// Shared HMAC secret. Empty rejects every delivery.
    #[serde(default)]
    pub secret: String,
    /// Maximum age of the signed timestamp.
    #[serde(default = "default_tolerance")]
    pub tolerance_secs: i64,
    /// Age after which a processing claim may be taken over.
    #[serde(default = "default_stale_claim")]
    pub stale_claim_secs: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BillingConfig {
    /// Price ids that identify the free-trial SKU at checkout.
    #[serde(default)]
    pub trial_price_ids: Vec<String>,
    /// Plan type recorded for trial checkouts, also matched against `metadata.plan_type`.
    #[serde(default = "default_trial_plan_type")]
    pub trial_plan_type: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// "trace" | "debug" | "info" | "warn" | "error". `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_ttl_days() -> u32 {
    7
}

fn default_reports() -> u32 {
    3
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_max_trials_per_device() -> u32 {
    1
}

fn default_ip_window() -> u64 {
    3600
}

fn default_ip_max_attempts() -> u32 {
    5
}

fn default_review_threshold() -> u32 {
    40
}

fn default_deny_threshold() -> u32 {
    100
}

fn default_reuse_weight() -> u32 {
    100
}

fn default_ip_velocity_weight() -> u32 {
    60
}

fn default_spoof_weight() -> u32 {
    45
}

fn default_tolerance() -> i64 {
    300
}

fn default_stale_claim() -> i64 {
    1800
}

fn default_trial_plan_type() -> String {
    "trial".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

impl Default for TrialConfig {
    fn default() -> Self {
        Self {
            ttl_days: default_ttl_days(),
            reports: default_reports(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for FraudConfig {
    fn default() -> Self {
        Self {
            max_trials_per_device: default_max_trials_per_device(),
            ip_window_secs: default_ip_window(),
            ip_max_attempts: default_ip_max_attempts(),
            review_threshold: default_review_threshold(),
            deny_threshold: default_deny_threshold(),
            weights: FraudWeights::default(),
        }
    }
}

impl Default for FraudWeights {
    fn default() -> Self {
        Self {
            device_reuse: default_reuse_weight(),
            user_reuse: default_reuse_weight(),
            ip_velocity: default_ip_velocity_weight(),
            device_spoof_suspect: default_spoof_weight(),
        }
    }
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            secret: String::new(),
            tolerance_secs: default_tolerance(),
            stale_claim_secs: default_stale_claim(),
        }
    }
}

impl Default for BillingConfig {
    fn default() -> Self {
        Self {
            trial_price_ids: Vec::new(),
            trial_plan_type: default_trial_plan_type(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl EngineConfig {
    /// Loads `path` if given (it must exist), defaults otherwise, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)?;
                Self::from_toml(&content)?
            }
            None => Self::default(),
        };
        let config = config.with_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Rejects values the engine cannot run with: zero-length grants,
    /// windows that do not fit a timestamp, thresholds in the wrong order.
    pub fn validate(&self) -> Result<()> {
        let max_window = MAX_WINDOW_SECS as i64;
        let checks: [(bool, String); 10] = [
            (
                (1..=MAX_TTL_DAYS).contains(&self.trial.ttl_days),
                format!("trial.ttl_days must be between 1 and {}", MAX_TTL_DAYS),
            ),
            (
                self.trial.reports >= 1,
                "trial.reports must be at least 1".to_string(),
            ),
            (
                (1..=MAX_WINDOW_SECS).contains(&self.trial.sweep_interval_secs),
                format!("trial.sweep_interval_secs must be between 1 and {}", MAX_WINDOW_SECS),
            ),
            (
                self.fraud.max_trials_per_device >= 1,
                "fraud.max_trials_per_device must be at least 1".to_string(),
            ),
            (
                (1..=MAX_WINDOW_SECS).contains(&self.fraud.ip_window_secs),
                format!("fraud.ip_window_secs must be between 1 and {}", MAX_WINDOW_SECS),
            ),
            (
                self.fraud.ip_max_attempts >= 1,
                "fraud.ip_max_attempts must be at least 1".to_string(),
            ),
            (
                self.fraud.deny_threshold >= 1,
                "fraud.deny_threshold must be at least 1".to_string(),
            ),
            (
                self.fraud.review_threshold <= self.fraud.deny_threshold,
                "fraud.review_threshold must not exceed fraud.deny_threshold".to_string(),
            ),
            (
                (1..=max_window).contains(&self.webhook.tolerance_secs),
                format!("webhook.tolerance_secs must be between 1 and {}", MAX_WINDOW_SECS),
            ),
            (
                (1..=max_window).contains(&self.webhook.stale_claim_secs),
                format!("webhook.stale_claim_secs must be between 1 and {}", MAX_WINDOW_SECS),
            ),
        ];
        match checks.into_iter().find(|(ok, _)| !ok) {
            Some((_, message)) => Err(GateError::InvalidConfig(message)),
            None => Ok(()),
        }
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    fn with_env_overrides(mut self) -> Self {
        if let Ok(secret) = std::env::var(ENV_WEBHOOK_SECRET)
            && !secret.is_empty()
        {
            self.webhook.secret = secret;
        }
        if let Ok(bind) = std::env::var(ENV_BIND)
            && !bind.is_empty()
        {
            self.server.bind = bind;
        }
        self
    }
}
