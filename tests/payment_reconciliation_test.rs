//! Dual-path payment confirmation tests: client callback, signed webhooks,
//! idempotent convergence, and the failure path.

mod common;

use assert_matches::assert_matches;
use common::TestApp;
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

use orderflow_api::{
    entities::payment_attempt::AttemptOutcome,
    errors::ServiceError,
    models::{OrderStatus, PaymentMethod, PaymentStatus},
};

#[tokio::test]
async fn valid_client_confirmation_confirms_the_order() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("PAY-SKU", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 1)], PaymentMethod::Gateway)
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();
    let signature = app.gateway.client_signature(&intent.intent_id, "pay_1");

    let confirmed = app
        .services
        .confirm_client_payment(outcome.order.id, &intent.intent_id, "pay_1", &signature)
        .await
        .unwrap();

    assert_eq!(confirmed.status, OrderStatus::Confirmed);
    assert_eq!(confirmed.payment_status, PaymentStatus::Paid);
    assert_eq!(confirmed.payment_id.as_deref(), Some("pay_1"));

    // Exactly one new history entry.
    let details = app.services.orders.order_details(confirmed.id).await.unwrap();
    assert_eq!(details.history.len(), 2);
    assert_eq!(details.history[1].status, OrderStatus::Confirmed);

    assert_eq!(app.notifier.count("payment_confirmed"), 1);

    let attempts = app.services.orders.payment_attempts(confirmed.id).await.unwrap();
    assert_eq!(attempts.len(), 1);
    assert_eq!(attempts[0].outcome, AttemptOutcome::Applied.as_str());
    assert!(attempts[0].signature_valid);
}

#[tokio::test]
async fn repeated_client_confirmation_is_a_silent_noop() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("PAY-TWICE", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 1)], PaymentMethod::Gateway)
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();
    let signature = app.gateway.client_signature(&intent.intent_id, "pay_1");

    for _ in 0..2 {
        let order = app
            .services
            .confirm_client_payment(outcome.order.id, &intent.intent_id, "pay_1", &signature)
            .await
            .unwrap();
        assert_eq!(order.status, OrderStatus::Confirmed);
    }

    let details = app.services.orders.order_details(outcome.order.id).await.unwrap();
    assert_eq!(details.history.len(), 2);
    assert_eq!(app.notifier.count("payment_confirmed"), 1);

    let attempts = app
        .services
        .orders
        .payment_attempts(outcome.order.id)
        .await
        .unwrap();
    assert_eq!(attempts.len(), 2);
    assert_eq!(attempts[1].outcome, AttemptOutcome::NoOp.as_str());
}

#[tokio::test]
async fn invalid_signature_fails_the_payment_and_releases_stock() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("BAD-SIG", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 2)], PaymentMethod::Gateway)
        .await
        .unwrap();
    assert_eq!(app.catalog.stock_of(v), 8);
    let intent = outcome.payment_intent.unwrap();

    let err = app
        .services
        .confirm_client_payment(outcome.order.id, &intent.intent_id, "pay_1", "forged")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidSignature(_));

    let order = app.services.orders.get_order(outcome.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PaymentFailed);
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert!(!order.stock_reserved);
    assert_eq!(app.catalog.stock_of(v), 10);
    assert_eq!(app.catalog.sales_of(p), 0);

    let attempts = app.services.orders.payment_attempts(order.id).await.unwrap();
    assert_eq!(attempts[0].outcome, AttemptOutcome::Rejected.as_str());
    assert!(!attempts[0].signature_valid);
}

#[tokio::test]
async fn intent_mismatch_is_treated_as_a_forgery() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("WRONG-INTENT", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 1)], PaymentMethod::Gateway)
        .await
        .unwrap();
    let signature = app.gateway.client_signature("pi_other", "pay_1");

    let err = app
        .services
        .confirm_client_payment(outcome.order.id, "pi_other", "pay_1", &signature)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidSignature(_));

    let order = app.services.orders.get_order(outcome.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PaymentFailed);
}

#[tokio::test]
async fn webhook_captured_confirms_the_order() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("HOOK-SKU", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 1)], PaymentMethod::Gateway)
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();

    let payload = json!({
        "type": "payment.captured",
        "intent_id": intent.intent_id,
        "payment_id": "pay_hook",
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let ack = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(ack.outcome, AttemptOutcome::Applied);

    let order = app.services.orders.get_order(outcome.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Confirmed);
    assert_eq!(order.payment_status, PaymentStatus::Paid);
    assert_eq!(order.payment_id.as_deref(), Some("pay_hook"));
    assert_eq!(app.notifier.count("payment_confirmed"), 1);
}

#[tokio::test]
async fn webhook_after_client_confirmation_is_a_noop() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("RACE-SKU", dec!(300.00), 10);

    let confirmed = app.checkout_and_pay(customer, &[(p, v, 1)]).await;
    let history_before = app
        .services
        .orders
        .order_details(confirmed.id)
        .await
        .unwrap()
        .history;

    let payload = json!({
        "type": "payment.captured",
        "intent_id": confirmed.payment_intent_id,
        "payment_id": confirmed.payment_id,
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let ack = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(ack.outcome, AttemptOutcome::NoOp);

    // History unchanged, no duplicate notification, same end state.
    let details = app.services.orders.order_details(confirmed.id).await.unwrap();
    assert_eq!(details.history.len(), history_before.len());
    assert_eq!(details.order.status, OrderStatus::Confirmed);
    assert_eq!(app.notifier.count("payment_confirmed"), 1);
}

#[tokio::test]
async fn duplicate_webhook_delivery_converges() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("DUP-HOOK", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 1)], PaymentMethod::Gateway)
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();

    let payload = json!({
        "type": "payment.captured",
        "intent_id": intent.intent_id,
        "payment_id": "pay_dup",
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let first = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    let second = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();

    assert_matches!(first.outcome, AttemptOutcome::Applied);
    assert_matches!(second.outcome, AttemptOutcome::NoOp);

    let details = app.services.orders.order_details(outcome.order.id).await.unwrap();
    assert_eq!(details.order.status, OrderStatus::Confirmed);
    assert_eq!(details.history.len(), 2);
    assert_eq!(app.notifier.count("payment_confirmed"), 1);
}

#[tokio::test]
async fn webhook_with_bad_signature_is_rejected_before_parsing() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("SIG-HOOK", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 1)], PaymentMethod::Gateway)
        .await
        .unwrap();
    let intent = outcome.payment_intent.unwrap();

    let payload = json!({
        "type": "payment.captured",
        "intent_id": intent.intent_id,
        "payment_id": "pay_x",
    })
    .to_string();

    let err = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), "forged-signature")
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::InvalidSignature(_));

    let order = app.services.orders.get_order(outcome.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Placed);
}

#[tokio::test]
async fn webhook_failed_event_releases_stock_idempotently() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("FAIL-HOOK", dec!(300.00), 10);

    let outcome = app
        .checkout(customer, &[(p, v, 3)], PaymentMethod::Gateway)
        .await
        .unwrap();
    assert_eq!(app.catalog.stock_of(v), 7);
    let intent = outcome.payment_intent.unwrap();

    let payload = json!({
        "type": "payment.failed",
        "intent_id": intent.intent_id,
        "reason": "card_declined",
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let first = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(first.outcome, AttemptOutcome::Applied);

    let order = app.services.orders.get_order(outcome.order.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::PaymentFailed);
    assert_eq!(order.payment_status, PaymentStatus::Failed);
    assert_eq!(app.catalog.stock_of(v), 10);

    // Gateway-side retry redelivers; nothing changes the second time.
    let second = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(second.outcome, AttemptOutcome::NoOp);
    assert_eq!(app.catalog.stock_of(v), 10);
}

#[tokio::test]
async fn webhook_for_unknown_intent_acks_without_erroring() {
    let app = TestApp::new().await;

    let payload = json!({
        "type": "payment.captured",
        "intent_id": "pi_foreign",
        "payment_id": "pay_foreign",
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let ack = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(ack.outcome, AttemptOutcome::NoOp);
}

#[tokio::test]
async fn refund_processed_webhook_finalizes_the_refund() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("REFUND-HOOK", dec!(300.00), 10);

    let confirmed = app.checkout_and_pay(customer, &[(p, v, 1)]).await;
    let cancelled = app
        .services
        .cancel_order(confirmed.id, "support-agent", "customer request")
        .await
        .unwrap();
    assert_eq!(cancelled.status, OrderStatus::RefundInitiated);
    let refund_id = cancelled.refund_id.clone().unwrap();

    let payload = json!({
        "type": "refund.processed",
        "payment_id": cancelled.payment_id,
        "refund_id": refund_id,
        "amount": "350.00",
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let ack = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(ack.outcome, AttemptOutcome::Applied);

    let order = app.services.orders.get_order(confirmed.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::Refunded);
    assert_eq!(order.payment_status, PaymentStatus::Refunded);
    assert!(order.refunded_at.is_some());

    // Redelivery after completion is a no-op.
    let again = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap();
    assert_matches!(again.outcome, AttemptOutcome::NoOp);
}

#[tokio::test]
async fn refund_webhook_with_foreign_refund_id_conflicts() {
    let app = TestApp::new().await;
    let customer = Uuid::new_v4();
    let (p, v) = app.catalog.seed("REFUND-MISMATCH", dec!(300.00), 10);

    let confirmed = app.checkout_and_pay(customer, &[(p, v, 1)]).await;
    let cancelled = app
        .services
        .cancel_order(confirmed.id, "support-agent", "customer request")
        .await
        .unwrap();

    let payload = json!({
        "type": "refund.processed",
        "payment_id": cancelled.payment_id,
        "refund_id": "re_someone_elses",
        "amount": "350.00",
    })
    .to_string();
    let signature = app.gateway.sign_webhook(payload.as_bytes());

    let err = app
        .services
        .handle_gateway_webhook(payload.as_bytes(), &signature)
        .await
        .unwrap_err();
    assert_matches!(err, ServiceError::Conflict(_));

    let order = app.services.orders.get_order(confirmed.id).await.unwrap();
    assert_eq!(order.status, OrderStatus::RefundInitiated);
}
