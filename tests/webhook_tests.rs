mod common;

use common::{
    FlakySubscriptionStore, TestApp, checkout_completed, subscription_event, test_config,
};
use std::sync::Arc;
use trialgate::domain::payment_event::{EventOutcome, LedgerState};
use trialgate::domain::ports::{PaymentEventLedger, SubscriptionStore};
use trialgate::domain::subscription::{HistoryDisposition, SubscriptionStatus};
use trialgate::error::GateError;
use trialgate::infrastructure::Storage;

#[tokio::test]
async fn test_checkout_then_delete() {
    let app = TestApp::new();
    let t0 = app.now().timestamp();

    let receipt = app
        .deliver(&checkout_completed("evt_1", "sub_123", "u1", t0))
        .await
        .unwrap();
    assert_eq!(receipt.outcome, EventOutcome::Applied);
    let sub = app.engine.query.get_active_subscription("u1").await.unwrap().unwrap();
    assert_eq!(sub.status, SubscriptionStatus::Active);
    assert_eq!(sub.external_ref, "sub_123");

    let receipt = app
        .deliver(&subscription_event(
            "evt_2",
            "customer.subscription.deleted",
            "sub_123",
            "canceled",
            t0 + 60,
        ))
        .await
        .unwrap();
    assert_eq!(receipt.outcome, EventOutcome::Applied);

    let stored = app
        .storage
        .subscriptions
        .get_by_external_ref("sub_123")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SubscriptionStatus::Cancelled);

    let history = app.engine.query.history("u1").await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[1].old_status, Some(SubscriptionStatus::Active));
    assert_eq!(history[1].new_status, SubscriptionStatus::Cancelled);
    assert!(app.engine.query.get_active_subscription("u1").await.unwrap().is_none());
}

#[tokio::test]
async fn test_invalid_signature_writes_nothing() {
    let app = TestApp::new();
    let event = checkout_completed("evt_1", "sub_123", "u1", app.now().timestamp());
    let body = serde_json::to_vec(&event).unwrap();
    let forged = format!("t={},v1={}", app.now().timestamp(), "00".repeat(32));

    let err = app
        .engine
        .ingress
        .receive(Some(&forged), &body)
        .await
        .unwrap_err();
    assert!(matches!(err, GateError::AuthenticityError(_)));

    let err = app.engine.ingress.receive(None, &body).await.unwrap_err();
    assert!(matches!(err, GateError::AuthenticityError(_)));

    assert!(app.storage.events.get("evt_1").await.unwrap().is_none());
    assert!(
        app.storage
            .subscriptions
            .get_by_external_ref("sub_123")
            .await
            .unwrap()
            .is_none()
    );
}

#[tokio::test]
async fn test_redelivery_is_idempotent() {
    let app = TestApp::new();
    let event = checkout_completed("evt_1", "sub_123", "u1", app.now().timestamp());

    let first = app.deliver(&event).await.unwrap();
    let second = app.deliver(&event).await.unwrap();
    assert!(!first.replayed);
    assert!(second.replayed);
    assert_eq!(second.outcome, first.outcome);

    assert_eq!(app.engine.query.history("u1").await.unwrap().len(), 1);
    let row = app.storage.events.get("evt_1").await.unwrap().unwrap();
    assert_eq!(row.state, LedgerState::Completed);
}

#[tokio::test]
async fn test_handler_failure_releases_claim_for_redelivery() {
    let subscriptions = FlakySubscriptionStore::default();
    let mut storage = Storage::in_memory();
    storage.subscriptions = Arc::new(subscriptions.clone());
    let app = TestApp::with(test_config(), storage);
    let event = checkout_completed("evt_1", "sub_123", "u1", app.now().timestamp());

    subscriptions.set_failing(true);
    let err = app.deliver(&event).await.unwrap_err();
    assert!(err.is_transient(), "{}", err);
    assert!(app.storage.events.get("evt_1").await.unwrap().is_none());

    subscriptions.set_failing(false);
    let receipt = app.deliver(&event).await.unwrap();
    assert_eq!(receipt.outcome, EventOutcome::Applied);
    assert!(!receipt.replayed);
    assert_eq!(app.engine.query.history("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_event_is_superseded() {
    let app = TestApp::new();
    let t0 = app.now().timestamp();
    app.deliver(&checkout_completed("evt_1", "sub_9", "u1", t0))
        .await
        .unwrap();

    // The newer report lands first.
    let newer = subscription_event("evt_3", "customer.subscription.updated", "sub_9", "past_due", t0 + 200);
    let older = subscription_event("evt_2", "customer.subscription.updated", "sub_9", "active", t0 + 100);
    assert_eq!(app.deliver(&newer).await.unwrap().outcome, EventOutcome::Applied);
    assert_eq!(app.deliver(&older).await.unwrap().outcome, EventOutcome::Superseded);

    let stored = app
        .storage
        .subscriptions
        .get_by_external_ref("sub_9")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.status, SubscriptionStatus::PastDue);

    let history = app.engine.query.history("u1").await.unwrap();
    let superseded: Vec<_> = history
        .iter()
        .filter(|h| h.disposition == HistoryDisposition::Superseded)
        .collect();
    assert_eq!(superseded.len(), 1);
    assert_eq!(superseded[0].event_id.as_deref(), Some("evt_2"));
}

#[tokio::test]
async fn test_event_for_unseen_subscription_is_deferred() {
    let app = TestApp::new();
    let invoice = serde_json::json!({
        "id": "evt_inv",
        "type": "invoice.payment_failed",
        "created": app.now().timestamp(),
        "data": {"object": {"id": "in_1", "subscription": "sub_unseen"}}
    });

    let err = app.deliver(&invoice).await.unwrap_err();
    assert!(matches!(err, GateError::DeferredError(_)));
    // Left unclaimed so the processor's retry can apply it later.
    assert!(app.storage.events.get("evt_inv").await.unwrap().is_none());
}

#[tokio::test]
async fn test_cancel_waits_for_webhook() {
    let app = TestApp::new();
    let t0 = app.now().timestamp();
    app.deliver(&checkout_completed("evt_1", "sub_1", "u1", t0))
        .await
        .unwrap();

    let ack = app.engine.query.cancel("u1", true).await.unwrap();
    assert!(ack.accepted);
    assert_eq!(app.processor.requests().await.len(), 1);
    let live = app.engine.query.get_active_subscription("u1").await.unwrap().unwrap();
    assert_eq!(live.status, SubscriptionStatus::Active);

    app.deliver(&subscription_event(
        "evt_2",
        "customer.subscription.deleted",
        "sub_1",
        "canceled",
        t0 + 30,
    ))
    .await
    .unwrap();
    assert!(app.engine.query.get_active_subscription("u1").await.unwrap().is_none());
}
