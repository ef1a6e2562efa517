//! Inbound payment-processor webhooks: verify, deduplicate, dispatch.

use super::lifecycle::SubscriptionStateMachine;
use crate::domain::clock::SharedClock;
use crate::domain::payment_event::{ClaimOutcome, EventOutcome, WebhookEnvelope};
use crate::domain::ports::SharedPaymentEventLedger;
use crate::error::{GateError, Result};
use chrono::{DateTime, Duration, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type HmacSha256 = Hmac<Sha256>;

/// Out-of-range values saturate instead of panicking; `EngineConfig::validate`
/// keeps loaded configs well inside the range.
fn seconds_or_max(secs: i64) -> Duration {
    Duration::try_seconds(secs).unwrap_or(Duration::MAX)
}

/// Checks `t=<unix>,v1=<hex>` signatures over `"{t}." + raw body`.
#[derive(Clone)]
pub struct WebhookVerifier {
    secret: Vec<u8>,
    tolerance: Duration,
}

impl WebhookVerifier {
    pub fn new(secret: impl AsRef<[u8]>, tolerance_secs: i64) -> Self {
        Self {
            secret: secret.as_ref().to_vec(),
            tolerance: seconds_or_max(tolerance_secs),
        }
    }

    /// Verifies `header` against the raw `payload` and returns the signed timestamp.
    pub fn verify(
        &self,
        header: &str,
        payload: &[u8],
        now: DateTime<Utc>,
    ) -> Result<DateTime<Utc>> {
        if self.secret.is_empty() {
            return Err(GateError::AuthenticityError(
                "webhook secret is not configured".to_string(),
            ));
        }

        let mut timestamp: Option<i64> = None;
        let mut candidates: Vec<&str> = Vec::new();
        for part in header.split(',') {
            match part.trim().split_once('=') {
                Some(("t", value)) => timestamp = value.parse().ok(),
                Some(("v1", value)) => candidates.push(value),
                _ => {}
            }
        }

        let timestamp = timestamp
            .ok_or_else(|| GateError::AuthenticityError("missing signature timestamp".to_string()))?;
        if candidates.is_empty() {
            return Err(GateError::AuthenticityError(
                "missing v1 signature".to_string(),
            ));
        }
        let signed_at = Utc
            .timestamp_opt(timestamp, 0)
            .single()
            .ok_or_else(|| GateError::AuthenticityError("invalid signature timestamp".to_string()))?;
        if (now.timestamp() - timestamp).abs() > self.tolerance.num_seconds() {
            return Err(GateError::AuthenticityError(format!(
                "signature timestamp {} outside tolerance",
                timestamp
            )));
        }

        let base = self.mac_for(timestamp, payload)?;
        let matched = candidates.iter().any(|candidate| {
            hex::decode(candidate)
                .map(|expected| base.clone().verify_slice(&expected).is_ok())
                .unwrap_or(false)
        });
        if matched {
            Ok(signed_at)
        } else {
            Err(GateError::AuthenticityError(
                "signature mismatch".to_string(),
            ))
        }
    }

    /// Produces a header value the verifier accepts. Used by senders and tests.
    pub fn sign(&self, timestamp: i64, payload: &[u8]) -> Result<String> {
        let mac = self.mac_for(timestamp, payload)?;
        Ok(format!(
            "t={},v1={}",
            timestamp,
            hex::encode(mac.finalize().into_bytes())
        ))
    }

    fn mac_for(&self, timestamp: i64, payload: &[u8]) -> Result<HmacSha256> {
        let mut mac = HmacSha256::new_from_slice(&self.secret)
            .map_err(|_| GateError::AuthenticityError("invalid webhook secret".to_string()))?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        Ok(mac)
    }
}

/// What the ingress did with one delivery.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressReceipt {
    pub event_id: String,
    pub outcome: EventOutcome,
    /// The event id was already processed; `outcome` is the stored one.
    pub replayed: bool,
}

pub struct PaymentEventIngress {
    verifier: WebhookVerifier,
    ledger: SharedPaymentEventLedger,
    lifecycle: Arc<SubscriptionStateMachine>,
    clock: SharedClock,
    stale_after: Duration,
}

impl PaymentEventIngress {
    pub fn new(
        verifier: WebhookVerifier,
        ledger: SharedPaymentEventLedger,
        lifecycle: Arc<SubscriptionStateMachine>,
        clock: SharedClock,
        stale_claim_secs: i64,
    ) -> Self {
        Self {
            verifier,
            ledger,
            lifecycle,
            clock,
            stale_after: seconds_or_max(stale_claim_secs),
        }
    }

    /// Handles one delivery. Returns `Ok` only once the outcome is durable;
    /// every `Err` leaves the event free for redelivery.
    pub async fn receive(&self, signature: Option<&str>, payload: &[u8]) -> Result<IngressReceipt> {
        let now = self.clock.now();
        let signature = signature.ok_or_else(|| {
            warn!(security_event = true, "webhook without signature header");
            GateError::AuthenticityError("missing signature header".to_string())
        })?;
        let signed_at = self.verifier.verify(signature, payload, now).inspect_err(|e| {
            warn!(security_event = true, error = %e, "webhook signature rejected");
        })?;

        let envelope: WebhookEnvelope = serde_json::from_slice(payload)
            .map_err(|e| GateError::ValidationError(format!("malformed event body: {}", e)))?;
        if envelope.id.trim().is_empty() {
            return Err(GateError::ValidationError("event id is required".to_string()));
        }

        match self
            .ledger
            .claim(&envelope.id, &envelope.event_type, now, self.stale_after)
            .await?
        {
            ClaimOutcome::Completed(row) => {
                debug!(event_id = %envelope.id, "duplicate delivery acknowledged");
                return Ok(IngressReceipt {
                    event_id: envelope.id,
                    outcome: row.outcome.unwrap_or(EventOutcome::Applied),
                    replayed: true,
                });
            }
            ClaimOutcome::InFlight => return Err(GateError::InFlight(envelope.id)),
            ClaimOutcome::Claimed => {}
        }

        let outcome = match self.lifecycle.apply(&envelope, signed_at).await {
            Ok(outcome) => outcome,
            Err(e) => {
                warn!(event_id = %envelope.id, event_type = %envelope.event_type, error = %e, "event handling failed, releasing claim");
                if let Err(release) = self.ledger.release(&envelope.id).await {
                    error!(event_id = %envelope.id, error = %release, "could not release event claim");
                }
                return Err(e);
            }
        };

        if let Err(e) = self
            .ledger
            .complete(&envelope.id, outcome, self.clock.now())
            .await
        {
            // The state change is committed; the claim expires and a
            // redelivery re-applies idempotently.
            error!(event_id = %envelope.id, error = %e, "could not mark event completed");
        }
        info!(event_id = %envelope.id, event_type = %envelope.event_type, outcome = outcome.as_str(), "payment event processed");
        Ok(IngressReceipt {
            event_id: envelope.id,
            outcome,
            replayed: false,
        })
    }
}
