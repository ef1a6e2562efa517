use crate::application::activation::ActivationOutcome;
use crate::application::engine::TrialEngine;
use crate::application::query::{CancelAck, TrialStatusView};
use crate::domain::fingerprint::DeviceFingerprint;
use crate::domain::fraud::{ActivationRequest, FraudFlag, FraudFlagType};
use crate::domain::payment_event::EventOutcome;
use crate::domain::subscription::{Subscription, SubscriptionHistoryEvent, SubscriptionStatus};
use crate::domain::trial::{TrialStatus, TrialToken};
use crate::error::{GateError, Result};
use axum::Json;
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

pub const SIGNATURE_HEADER: &str = "signature";
pub const STRIPE_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserQuery {
    pub user_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantBody {
    pub token_id: Uuid,
    pub status: TrialStatus,
    pub reports_remaining: u32,
    pub expires_at: DateTime<Utc>,
    pub already_active: bool,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub fraud_flags: Vec<FraudFlag>,
}

impl GrantBody {
    fn new(token: TrialToken, already_active: bool, fraud_flags: Vec<FraudFlag>) -> Self {
        Self {
            token_id: token.token_id,
            status: token.status,
            reports_remaining: token.reports_remaining,
            expires_at: token.expires_at,
            already_active,
            fraud_flags,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DenialBody {
    pub denial_reason: FraudFlagType,
    pub score: u32,
    pub fraud_flags: Vec<FraudFlag>,
}

pub async fn activate_trial(
    State(engine): State<TrialEngine>,
    headers: HeaderMap,
    Json(mut request): Json<ActivationRequest>,
) -> Result<Response> {
    if request.ip_address.as_deref().is_none_or(str::is_empty) {
        request.ip_address = client_ip(&headers);
    }
    if request.user_agent.is_none() {
        request.user_agent = header_str(&headers, header::USER_AGENT.as_str());
    }

    let response = match engine.activation.activate(&request).await? {
        ActivationOutcome::Granted { token, flags } => {
            (StatusCode::OK, Json(GrantBody::new(token, false, flags))).into_response()
        }
        ActivationOutcome::AlreadyActive { token } => {
            (StatusCode::OK, Json(GrantBody::new(token, true, Vec::new()))).into_response()
        }
        ActivationOutcome::Pending { token } => (
            StatusCode::ACCEPTED,
            Json(json!({ "tokenId": token.token_id, "status": TrialStatus::Pending })),
        )
            .into_response(),
        ActivationOutcome::Deferred => (
            StatusCode::ACCEPTED,
            Json(json!({ "status": "deferred", "retryable": true })),
        )
            .into_response(),
        ActivationOutcome::Denied {
            reason,
            score,
            flags,
        } => (
            StatusCode::FORBIDDEN,
            Json(DenialBody {
                denial_reason: reason,
                score,
                fraud_flags: flags,
            }),
        )
            .into_response(),
    };
    Ok(response)
}

pub async fn trial_status(
    State(engine): State<TrialEngine>,
    Query(query): Query<UserQuery>,
) -> Result<Json<TrialStatusView>> {
    Ok(Json(engine.query.get_trial_status(&query.user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsumeBody {
    pub token_id: Uuid,
}

pub async fn consume_report(
    State(engine): State<TrialEngine>,
    Json(body): Json<ConsumeBody>,
) -> Result<Json<serde_json::Value>> {
    let token = engine.ledger.consume(body.token_id).await?;
    Ok(Json(json!({
        "tokenId": token.token_id,
        "reportsRemaining": token.reports_remaining,
    })))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionView {
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub plan_type: String,
    pub current_period_end: Option<DateTime<Utc>>,
    pub cancel_at_period_end: bool,
}

impl From<Subscription> for SubscriptionView {
    fn from(sub: Subscription) -> Self {
        Self {
            subscription_id: sub.subscription_id,
            status: sub.status,
            plan_type: sub.plan_type,
            current_period_end: sub.current_period_end,
            cancel_at_period_end: sub.cancel_at_period_end,
        }
    }
}

pub async fn active_subscription(
    State(engine): State<TrialEngine>,
    Query(query): Query<UserQuery>,
) -> Result<Json<SubscriptionView>> {
    engine
        .query
        .get_active_subscription(&query.user_id)
        .await?
        .map(|sub| Json(sub.into()))
        .ok_or_else(|| GateError::NotFound(format!("no active subscription for {}", query.user_id)))
}

pub async fn subscription_history(
    State(engine): State<TrialEngine>,
    Query(query): Query<UserQuery>,
) -> Result<Json<Vec<SubscriptionHistoryEvent>>> {
    Ok(Json(engine.query.history(&query.user_id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CancelBody {
    pub user_id: String,
    #[serde(default)]
    pub cancel_at_period_end: bool,
}

pub async fn cancel_subscription(
    State(engine): State<TrialEngine>,
    Json(body): Json<CancelBody>,
) -> Result<Json<CancelAck>> {
    Ok(Json(
        engine
            .query
            .cancel(&body.user_id, body.cancel_at_period_end)
            .await?,
    ))
}

/// Webhook ingress. Anything other than a 2xx makes the processor redeliver,
/// so only durable outcomes answer 200. A payload that can never apply
/// answers 400 once it is recorded, which stops the retries.
pub async fn payment_webhook(
    State(engine): State<TrialEngine>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response> {
    let signature = header_str(&headers, SIGNATURE_HEADER)
        .or_else(|| header_str(&headers, STRIPE_SIGNATURE_HEADER));
    let receipt = engine.ingress.receive(signature.as_deref(), &body).await?;

    let status = if receipt.outcome == EventOutcome::Rejected {
        StatusCode::BAD_REQUEST
    } else {
        StatusCode::OK
    };
    let body = json!({
        "received": true,
        "eventId": receipt.event_id,
        "outcome": receipt.outcome,
        "replayed": receipt.replayed,
    });
    Ok((status, Json(body)).into_response())
}

#[derive(Debug, Default, Deserialize)]
pub struct ReasonBody {
    #[serde(default)]
    pub reason: String,
}

pub async fn block_fingerprint(
    State(engine): State<TrialEngine>,
    Path(hash): Path<String>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<DeviceFingerprint>> {
    Ok(Json(
        engine.activation.block_fingerprint(&hash, &body.reason).await?,
    ))
}

pub async fn unblock_fingerprint(
    State(engine): State<TrialEngine>,
    Path(hash): Path<String>,
) -> Result<Json<DeviceFingerprint>> {
    Ok(Json(engine.activation.unblock_fingerprint(&hash).await?))
}

pub async fn revoke_trial(
    State(engine): State<TrialEngine>,
    Path(token_id): Path<Uuid>,
    Json(body): Json<ReasonBody>,
) -> Result<Json<TrialToken>> {
    Ok(Json(engine.ledger.revoke(token_id, &body.reason).await?))
}

pub async fn resolve_flag(
    State(engine): State<TrialEngine>,
    Path(flag_id): Path<Uuid>,
) -> Result<Json<FraudFlag>> {
    Ok(Json(engine.activation.resolve_flag(flag_id).await?))
}

pub async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

fn header_str(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// First hop of `X-Forwarded-For`, else `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_str(headers, "x-forwarded-for")
        .and_then(|chain| {
            chain
                .split(',')
                .next()
                .map(str::trim)
                .filter(|hop| !hop.is_empty())
                .map(str::to_string)
        })
        .or_else(|| header_str(headers, "x-real-ip"))
}
