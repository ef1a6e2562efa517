//! Declarative fraud rules.
//!
//! Each rule is a `(predicate, weight, flag)` triple. Scoring folds every rule
//! that fires into one number and compares it with the review and deny
//! thresholds. Rules see a [`RuleContext`] and nothing else, so each one can be
//! tested on its own.

use crate::config::FraudConfig;
use crate::domain::fingerprint::DeviceFingerprint;
use crate::domain::fraud::{ActivationRequest, DeviceData, FraudFlag, FraudFlagType, Severity};
use chrono::{DateTime, Utc};

/// Signals gathered for one activation attempt.
///
/// Signals that could not be read are `None` and never fire a rule.
pub struct RuleContext<'a> {
    pub request: &'a ActivationRequest,
    pub fingerprint: Option<&'a DeviceFingerprint>,
    /// Attempts from the request's IP inside the window, this one included.
    pub ip_attempts: Option<u32>,
    /// Earlier non-pending trials held by the same user.
    pub prior_user_trials: Option<usize>,
    pub policy: &'a FraudConfig,
}

type Predicate = fn(&RuleContext<'_>) -> Option<String>;

pub struct FraudRule {
    pub flag: FraudFlagType,
    pub weight: u32,
    pub severity: Severity,
    predicate: Predicate,
}

impl FraudRule {
    pub fn new(flag: FraudFlagType, weight: u32, severity: Severity, predicate: Predicate) -> Self {
        Self {
            flag,
            weight,
            severity,
            predicate,
        }
    }

    pub fn evaluate(&self, ctx: &RuleContext<'_>) -> Option<RuleHit> {
        if self.weight == 0 {
            return None;
        }
        (self.predicate)(ctx).map(|details| RuleHit {
            flag: self.flag,
            weight: self.weight,
            severity: self.severity,
            details,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleHit {
    pub flag: FraudFlagType,
    pub weight: u32,
    pub severity: Severity,
    pub details: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct Assessment {
    pub score: u32,
    pub hits: Vec<RuleHit>,
}

impl Assessment {
    /// The heaviest hit; earlier rules win ties.
    pub fn primary(&self) -> Option<&RuleHit> {
        self.hits
            .iter()
            .reduce(|best, hit| if hit.weight > best.weight { hit } else { best })
    }

    /// Materializes the hits as flags. `severity_override` replaces each
    /// rule's own severity (used for informational flags on accepted attempts).
    pub fn to_flags(
        &self,
        user_id: &str,
        fingerprint_hash: &str,
        severity_override: Option<Severity>,
        now: DateTime<Utc>,
    ) -> Vec<FraudFlag> {
        self.hits
            .iter()
            .map(|hit| {
                FraudFlag::new(
                    user_id,
                    Some(fingerprint_hash.to_string()),
                    hit.flag,
                    severity_override.unwrap_or(hit.severity),
                    hit.weight,
                    hit.details.clone(),
                    now,
                )
            })
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Clean,
    /// Accept, but keep the flags for review.
    Review,
    Deny { reason: FraudFlagType },
}

pub struct FraudRuleSet {
    rules: Vec<FraudRule>,
    review_threshold: u32,
    deny_threshold: u32,
}

impl FraudRuleSet {
    pub fn new(rules: Vec<FraudRule>, review_threshold: u32, deny_threshold: u32) -> Self {
        Self {
            rules,
            review_threshold,
            deny_threshold,
        }
    }

    /// The standard rule list, weighted from configuration.
    pub fn from_config(policy: &FraudConfig) -> Self {
        let weights = &policy.weights;
        let rules = vec![
            FraudRule::new(
                FraudFlagType::DeviceReuse,
                weights.device_reuse,
                Severity::High,
                device_reuse,
            ),
            FraudRule::new(
                FraudFlagType::UserReuse,
                weights.user_reuse,
                Severity::High,
                user_reuse,
            ),
            FraudRule::new(
                FraudFlagType::IpVelocity,
                weights.ip_velocity,
                Severity::Medium,
                ip_velocity,
            ),
            FraudRule::new(
                FraudFlagType::DeviceSpoofSuspect,
                weights.device_spoof_suspect,
                Severity::Medium,
                device_spoof_suspect,
            ),
        ];
        Self::new(rules, policy.review_threshold, policy.deny_threshold)
    }

    pub fn rules(&self) -> &[FraudRule] {
        &self.rules
    }

    pub fn assess(&self, ctx: &RuleContext<'_>) -> Assessment {
        let hits: Vec<RuleHit> = self.rules.iter().filter_map(|r| r.evaluate(ctx)).collect();
        let score = hits.iter().fold(0u32, |acc, h| acc.saturating_add(h.weight));
        Assessment { score, hits }
    }

    pub fn verdict(&self, assessment: &Assessment) -> Verdict {
        if assessment.score >= self.deny_threshold
            && let Some(primary) = assessment.primary()
        {
            return Verdict::Deny {
                reason: primary.flag,
            };
        }
        if assessment.score >= self.review_threshold && !assessment.hits.is_empty() {
            Verdict::Review
        } else {
            Verdict::Clean
        }
    }
}

fn device_reuse(ctx: &RuleContext<'_>) -> Option<String> {
    let fp = ctx.fingerprint?;
    (fp.trial_count >= ctx.policy.max_trials_per_device).then(|| {
        format!(
            "device already used for {} trial(s), limit {}",
            fp.trial_count, ctx.policy.max_trials_per_device
        )
    })
}

fn user_reuse(ctx: &RuleContext<'_>) -> Option<String> {
    let prior = ctx.prior_user_trials?;
    (prior > 0).then(|| format!("user already received {} trial(s)", prior))
}

fn ip_velocity(ctx: &RuleContext<'_>) -> Option<String> {
    let attempts = ctx.ip_attempts?;
    (attempts > ctx.policy.ip_max_attempts).then(|| {
        format!(
            "{} activation attempts from {} within {}s, limit {}",
            attempts,
            ctx.request.ip_address.as_deref().unwrap_or("unknown"),
            ctx.policy.ip_window_secs,
            ctx.policy.ip_max_attempts
        )
    })
}

fn device_spoof_suspect(ctx: &RuleContext<'_>) -> Option<String> {
    let signals = spoof_signals(&ctx.request.device_data, ctx.request.user_agent.as_deref());
    (!signals.is_empty()).then(|| signals.join("; "))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OsFamily {
    Windows,
    Mac,
    Linux,
    Ios,
    Android,
}

fn ua_family(user_agent: &str) -> Option<OsFamily> {
    // iOS and Android agents also mention Mac OS X / Linux, so test them first.
    if user_agent.contains("iPhone") || user_agent.contains("iPad") {
        Some(OsFamily::Ios)
    } else if user_agent.contains("Android") {
        Some(OsFamily::Android)
    } else if user_agent.contains("Windows") {
        Some(OsFamily::Windows)
    } else if user_agent.contains("Macintosh") || user_agent.contains("Mac OS X") {
        Some(OsFamily::Mac)
    } else if user_agent.contains("Linux") || user_agent.contains("X11") {
        Some(OsFamily::Linux)
    } else {
        None
    }
}

fn platform_family(platform: &str) -> Option<OsFamily> {
    let p = platform.to_ascii_lowercase();
    if p.starts_with("win") {
        Some(OsFamily::Windows)
    } else if p.starts_with("mac") {
        Some(OsFamily::Mac)
    } else if p.starts_with("iphone") || p.starts_with("ipad") || p.starts_with("ipod") {
        Some(OsFamily::Ios)
    } else if p.contains("android") {
        Some(OsFamily::Android)
    } else if p.starts_with("linux") {
        Some(OsFamily::Linux)
    } else {
        None
    }
}

fn families_compatible(ua: OsFamily, platform: OsFamily) -> bool {
    // Android browsers report a "Linux armv8l"-style platform.
    ua == platform || (ua == OsFamily::Android && platform == OsFamily::Linux)
}

/// Internal contradictions in what the client claims about itself.
pub fn spoof_signals(device: &DeviceData, header_user_agent: Option<&str>) -> Vec<String> {
    let mut signals = Vec::new();

    if device.webdriver == Some(true) {
        signals.push("automation flag (webdriver) is set".to_string());
    }

    if let (Some(claimed), Some(header)) = (device.user_agent.as_deref(), header_user_agent)
        && claimed.trim() != header.trim()
    {
        signals.push("device user agent differs from request header".to_string());
    }

    let user_agent = device.user_agent.as_deref().or(header_user_agent);
    if let (Some(ua), Some(platform)) = (user_agent, device.platform.as_deref())
        && let (Some(ua_os), Some(platform_os)) = (ua_family(ua), platform_family(platform))
        && !families_compatible(ua_os, platform_os)
    {
        signals.push(format!(
            "user agent claims {:?} but platform is {}",
            ua_os, platform
        ));
    }

    let mobile = device
        .platform
        .as_deref()
        .and_then(platform_family)
        .is_some_and(|os| matches!(os, OsFamily::Ios | OsFamily::Android))
        || user_agent
            .and_then(ua_family)
            .is_some_and(|os| matches!(os, OsFamily::Ios | OsFamily::Android));
    if mobile && device.max_touch_points == Some(0) {
        signals.push("mobile device reports no touch support".to_string());
    }

    if device.screen_width == Some(0) || device.screen_height == Some(0) {
        signals.push("zero-sized screen".to_string());
    }

    if let Some(cores) = device.hardware_concurrency
        && (cores == 0 || cores > 256)
    {
        signals.push(format!("implausible hardware concurrency {}", cores));
    }

    signals
}
