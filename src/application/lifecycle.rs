//! Applies verified payment events to subscription rows.
//!
//! Each event becomes a [`Trigger`] against one row. The row and its history
//! row are written together under a version check; a lost race reloads the
//! row and evaluates the event again.

use crate::config::BillingConfig;
use crate::domain::clock::SharedClock;
use crate::domain::money::Amount;
use crate::domain::payment_event::{EventOutcome, PaymentEventKind, WebhookEnvelope};
use crate::domain::ports::{CommitOutcome, SharedSubscriptionStore};
use crate::domain::subscription::{
    HistoryDisposition, Subscription, SubscriptionHistoryEvent, SubscriptionStatus, Transition,
    Trigger, transition,
};
use crate::error::{GateError, Result};
use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Value, json};
use tracing::{debug, info, warn};

const MAX_COMMIT_ATTEMPTS: usize = 5;
const DEFAULT_PLAN_TYPE: &str = "standard";

/// Everything the state machine needs from one event, already extracted.
#[derive(Debug, Clone, PartialEq)]
pub struct EventContext {
    pub event_id: String,
    pub event_type: String,
    pub external_ref: String,
    /// Needed only when the row does not exist yet.
    pub user_id: Option<String>,
    pub plan_type: Option<String>,
    pub trigger: Trigger,
    pub reported_at: DateTime<Utc>,
    pub details: SubscriptionDetails,
    /// Raw processor status, kept in history for `UNKNOWN` mappings.
    pub reported_status: Option<String>,
}

/// Optional fields an event may refresh on the row.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubscriptionDetails {
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: Option<bool>,
    pub amount: Option<Amount>,
    pub currency: Option<String>,
}

impl SubscriptionDetails {
    /// Writes the present fields into `subscription`; returns whether anything changed.
    fn merge_into(&self, subscription: &mut Subscription) -> bool {
        let before = (
            subscription.current_period_end,
            subscription.cancel_at_period_end,
            subscription.amount,
            subscription.currency.clone(),
        );
        if let Some(end) = self.current_period_end {
            subscription.current_period_end = Some(end);
        }
        if let Some(flag) = self.cancel_at_period_end {
            subscription.cancel_at_period_end = flag;
        }
        if let Some(amount) = self.amount {
            subscription.amount = Some(amount);
        }
        if let Some(currency) = &self.currency {
            subscription.currency = Some(currency.clone());
        }
        before
            != (
                subscription.current_period_end,
                subscription.cancel_at_period_end,
                subscription.amount,
                subscription.currency.clone(),
            )
    }
}

pub struct SubscriptionStateMachine {
    store: SharedSubscriptionStore,
    clock: SharedClock,
    billing: BillingConfig,
}

impl SubscriptionStateMachine {
    pub fn new(store: SharedSubscriptionStore, clock: SharedClock, billing: BillingConfig) -> Self {
        Self {
            store,
            clock,
            billing,
        }
    }

    /// Applies one verified event. `fallback_reported_at` stands in for the
    /// envelope's `created` when the processor omits it.
    ///
    /// Returns `Ok(Rejected)` for payloads that can never apply and
    /// `Err(DeferredError)` for events that reference a row we have not seen.
    pub async fn apply(
        &self,
        envelope: &WebhookEnvelope,
        fallback_reported_at: DateTime<Utc>,
    ) -> Result<EventOutcome> {
        let reported_at = envelope
            .created
            .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
            .unwrap_or(fallback_reported_at);
        match self.extract(envelope, reported_at) {
            Ok(Some(ctx)) => self.apply_context(&ctx).await,
            Ok(None) => {
                debug!(event_id = %envelope.id, event_type = %envelope.event_type, "event ignored");
                Ok(EventOutcome::Ignored)
            }
            Err(reason) => {
                warn!(event_id = %envelope.id, event_type = %envelope.event_type, reason, "event payload rejected");
                Ok(EventOutcome::Rejected)
            }
        }
    }

    /// Turns a processor payload into an [`EventContext`]. `Ok(None)` means
    /// the event is valid but irrelevant; `Err` names the missing field.
    fn extract(
        &self,
        envelope: &WebhookEnvelope,
        reported_at: DateTime<Utc>,
    ) -> std::result::Result<Option<EventContext>, String> {
        let object = &envelope.data.object;
        let kind = envelope.kind();
        let (external_ref, trigger, reported_status) = match kind {
            PaymentEventKind::Other => return Ok(None),
            PaymentEventKind::CheckoutCompleted => {
                // Checkouts without a subscription are one-off payments.
                let Some(ext) = reference(object.get("subscription")) else {
                    return Ok(None);
                };
                let trial = self.is_trial_checkout(object);
                (ext, Trigger::CheckoutCompleted { trial }, None)
            }
            PaymentEventKind::SubscriptionCreated | PaymentEventKind::SubscriptionUpdated => {
                let ext = reference(object.get("id")).ok_or("subscription id")?;
                let raw = object
                    .get("status")
                    .and_then(Value::as_str)
                    .ok_or("subscription status")?;
                let status = SubscriptionStatus::from_processor(raw);
                (ext, Trigger::StatusReported(status), Some(raw.to_string()))
            }
            PaymentEventKind::SubscriptionDeleted => {
                let ext = reference(object.get("id")).ok_or("subscription id")?;
                (ext, Trigger::Deleted, None)
            }
            PaymentEventKind::InvoicePaymentSucceeded | PaymentEventKind::InvoicePaymentFailed => {
                let Some(ext) = invoice_subscription(object) else {
                    return Ok(None);
                };
                let trigger = if kind == PaymentEventKind::InvoicePaymentSucceeded {
                    Trigger::PaymentSucceeded
                } else {
                    Trigger::PaymentFailed
                };
                (ext, trigger, None)
            }
        };

        let user_id = object
            .get("client_reference_id")
            .and_then(Value::as_str)
            .or_else(|| metadata_str(object, "user_id"))
            .filter(|s| !s.is_empty())
            .map(str::to_string);

        let plan_type = metadata_str(object, "plan_type")
            .map(str::to_string)
            .or_else(|| match trigger.target() {
                SubscriptionStatus::Trial => Some(self.billing.trial_plan_type.clone()),
                _ => None,
            });

        let amount = match object.get("amount_total").and_then(Value::as_i64) {
            Some(minor) => Some(Amount::from_minor_units(minor).map_err(|_| "amount_total")?),
            None => None,
        };

        let details = SubscriptionDetails {
            current_period_end: period_end(object),
            cancel_at_period_end: object.get("cancel_at_period_end").and_then(Value::as_bool),
            amount,
            currency: object
                .get("currency")
                .and_then(Value::as_str)
                .map(str::to_ascii_lowercase),
        };

        Ok(Some(EventContext {
            event_id: envelope.id.clone(),
            event_type: envelope.event_type.clone(),
            external_ref,
            user_id,
            plan_type,
            trigger,
            reported_at,
            details,
            reported_status,
        }))
    }

    fn is_trial_checkout(&self, session: &Value) -> bool {
        if metadata_str(session, "plan_type") == Some(self.billing.trial_plan_type.as_str()) {
            return true;
        }
        let prices = self.billing.trial_price_ids.as_slice();
        if prices.is_empty() {
            return false;
        }
        let mut candidates: Vec<&str> = metadata_str(session, "price_id").into_iter().collect();
        if let Some(items) = session
            .pointer("/line_items/data")
            .and_then(Value::as_array)
        {
            candidates.extend(
                items
                    .iter()
                    .filter_map(|item| item.pointer("/price/id").and_then(Value::as_str)),
            );
        }
        candidates
            .iter()
            .any(|price| prices.iter().any(|p| p == price))
    }

    /// Runs one event against its row until the commit lands.
    pub async fn apply_context(&self, ctx: &EventContext) -> Result<EventOutcome> {
        for attempt in 1..=MAX_COMMIT_ATTEMPTS {
            let current = self.store.get_by_external_ref(&ctx.external_ref).await?;
            let step = match current {
                None => self.create(ctx).await?,
                Some(existing) => self.advance(ctx, existing).await?,
            };
            match step {
                Some(outcome) => return Ok(outcome),
                None => debug!(
                    event_id = %ctx.event_id,
                    external_ref = %ctx.external_ref,
                    attempt,
                    "subscription changed underneath us, retrying"
                ),
            }
        }
        Err(GateError::TransientStorageError(format!(
            "subscription {} kept changing during commit",
            ctx.external_ref
        )))
    }

    /// `Ok(None)` means the commit lost a race.
    async fn create(&self, ctx: &EventContext) -> Result<Option<EventOutcome>> {
        let status = match transition(None, ctx.trigger) {
            Transition::To(status) => status,
            _ => {
                return Err(GateError::DeferredError(format!(
                    "{} for unknown subscription {}",
                    ctx.event_type, ctx.external_ref
                )));
            }
        };
        let Some(user_id) = ctx.user_id.as_deref() else {
            return Err(GateError::DeferredError(format!(
                "subscription {} has no user attribution yet",
                ctx.external_ref
            )));
        };

        let now = self.clock.now();
        let plan = ctx.plan_type.as_deref().unwrap_or(DEFAULT_PLAN_TYPE);
        let mut subscription =
            Subscription::new(user_id, &ctx.external_ref, plan, status, ctx.reported_at, now);
        ctx.details.merge_into(&mut subscription);
        let history = SubscriptionHistoryEvent::record(
            &subscription,
            Some(&ctx.event_id),
            &ctx.event_type,
            None,
            HistoryDisposition::Applied,
            history_metadata(ctx),
            now,
        );
        match self.store.insert(subscription, history).await? {
            CommitOutcome::Committed(row) => {
                info!(
                    event_id = %ctx.event_id,
                    user_id,
                    external_ref = %row.external_ref,
                    status = %row.status,
                    "subscription created"
                );
                Ok(Some(outcome_for(row.status)))
            }
            CommitOutcome::Conflict => Ok(None),
        }
    }

    async fn advance(
        &self,
        ctx: &EventContext,
        current: Subscription,
    ) -> Result<Option<EventOutcome>> {
        let now = self.clock.now();
        let stale = ctx.reported_at < current.status_reported_at;
        let expected = current.version;
        let mut next = current.clone();

        let (disposition, outcome) = match transition(Some(current.status), ctx.trigger) {
            Transition::Unchanged => {
                if stale || !ctx.details.merge_into(&mut next) {
                    return Ok(Some(EventOutcome::Unchanged));
                }
                next.updated_at = now;
                return match self.store.compare_and_commit(expected, next, None).await? {
                    CommitOutcome::Committed(_) => Ok(Some(EventOutcome::Unchanged)),
                    CommitOutcome::Conflict => Ok(None),
                };
            }
            _ if stale => (HistoryDisposition::Superseded, EventOutcome::Superseded),
            Transition::To(status) => {
                next.status = status;
                next.status_reported_at = ctx.reported_at;
                next.needs_review = status == SubscriptionStatus::Unknown;
                if let Some(plan) = &ctx.plan_type {
                    next.plan_type = plan.clone();
                }
                ctx.details.merge_into(&mut next);
                (HistoryDisposition::Applied, outcome_for(status))
            }
            Transition::Disallowed => {
                next.needs_review = true;
                (HistoryDisposition::Rejected, EventOutcome::Flagged)
            }
        };

        next.updated_at = now;
        let history = SubscriptionHistoryEvent::record(
            &next,
            Some(&ctx.event_id),
            &ctx.event_type,
            Some(current.status),
            disposition,
            history_metadata(ctx),
            now,
        );
        match self
            .store
            .compare_and_commit(expected, next, Some(history))
            .await?
        {
            CommitOutcome::Committed(row) => {
                match disposition {
                    HistoryDisposition::Applied => info!(
                        event_id = %ctx.event_id,
                        external_ref = %row.external_ref,
                        from = %current.status,
                        to = %row.status,
                        "subscription transitioned"
                    ),
                    HistoryDisposition::Superseded => info!(
                        event_id = %ctx.event_id,
                        external_ref = %row.external_ref,
                        reported_at = %ctx.reported_at,
                        newer = %current.status_reported_at,
                        "stale event recorded without state change"
                    ),
                    HistoryDisposition::Rejected => warn!(
                        event_id = %ctx.event_id,
                        external_ref = %row.external_ref,
                        status = %current.status,
                        trigger = ?ctx.trigger,
                        "disallowed transition, subscription flagged for review"
                    ),
                }
                Ok(Some(outcome))
            }
            CommitOutcome::Conflict => Ok(None),
        }
    }
}

fn outcome_for(status: SubscriptionStatus) -> EventOutcome {
    if status == SubscriptionStatus::Unknown {
        EventOutcome::Flagged
    } else {
        EventOutcome::Applied
    }
}

fn history_metadata(ctx: &EventContext) -> Value {
    let mut meta = json!({
        "reportedAt": ctx.reported_at,
        "target": ctx.trigger.target(),
    });
    if let Some(raw) = &ctx.reported_status {
        meta["reportedStatus"] = json!(raw);
    }
    meta
}

/// A processor reference is either a bare id or an expanded object with an `id`.
fn reference(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) if !id.is_empty() => Some(id.clone()),
        Value::Object(obj) => obj
            .get("id")
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())
            .map(str::to_string),
        _ => None,
    }
}

fn invoice_subscription(invoice: &Value) -> Option<String> {
    reference(invoice.get("subscription")).or_else(|| {
        reference(invoice.pointer("/parent/subscription_details/subscription"))
    })
}

fn metadata_str<'a>(object: &'a Value, key: &str) -> Option<&'a str> {
    object
        .get("metadata")
        .and_then(|m| m.get(key))
        .and_then(Value::as_str)
}

fn period_end(object: &Value) -> Option<DateTime<Utc>> {
    object
        .get("current_period_end")
        .or_else(|| object.pointer("/items/data/0/current_period_end"))
        .and_then(Value::as_i64)
        .and_then(|secs| Utc.timestamp_opt(secs, 0).single())
}
