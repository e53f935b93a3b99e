use assert_matches::assert_matches;
use serde_json::json;
use storefront_api::services::{
    notifications::{NotificationError, Notifier, RefundNotice, RelayNotifier},
    payments::{
        CheckoutLineItem, CheckoutSessionRequest, PaymentProvider, PaymentProviderError,
        RefundRequest, StripeClient,
    },
};
use uuid::Uuid;
use wiremock::{
    matchers::{body_partial_json, body_string_contains, header, method, path},
    Mock, MockServer, ResponseTemplate,
};

fn refund_request(amount_cents: i64) -> RefundRequest {
    RefundRequest {
        order_id: Uuid::new_v4(),
        payment_intent_id: "pi_wire".into(),
        amount_cents,
        idempotency_key: format!("refund_test_pi_wire_{}", amount_cents),
        reason: Some("damaged".into()),
    }
}

#[tokio::test]
async fn refund_is_posted_with_the_idempotency_key() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .and(header("authorization", "Bearer sk_test_123"))
        .and(header("idempotency-key", "refund_test_pi_wire_400"))
        .and(body_string_contains("payment_intent=pi_wire"))
        .and(body_string_contains("amount=400"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "re_wire",
            "object": "refund",
            "amount": 400,
            "status": "succeeded"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = StripeClient::new(server.uri(), "sk_test_123").unwrap();
    let refund = client.create_refund(refund_request(400)).await.unwrap();
    assert_eq!(refund.id, "re_wire");
    assert_eq!(refund.amount_cents, 400);
    assert_eq!(refund.status.as_deref(), Some("succeeded"));
}

#[tokio::test]
async fn provider_rejection_carries_its_message() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/refunds"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": { "type": "invalid_request_error", "message": "Charge has already been refunded." }
        })))
        .mount(&server)
        .await;

    let client = StripeClient::new(server.uri(), "sk_test_123").unwrap();
    let err = client.create_refund(refund_request(100)).await.unwrap_err();
    assert_matches!(
        err,
        PaymentProviderError::Rejected { status: 400, ref message } if message == "Charge has already been refunded."
    );
}

#[tokio::test]
async fn checkout_session_form_carries_cart_and_line_items() {
    let server = MockServer::start().await;
    let cart_id = Uuid::new_v4();
    Mock::given(method("POST"))
        .and(path("/v1/checkout/sessions"))
        .and(body_string_contains(format!(
            "metadata%5Bcart_id%5D={}",
            cart_id
        )))
        .and(body_string_contains("line_items%5B0%5D%5Bquantity%5D=2"))
        .and(body_string_contains(
            "line_items%5B0%5D%5Bprice_data%5D%5Bunit_amount%5D=1240",
        ))
        .and(body_string_contains("line_items%5B0%5D%5Bprice_data%5D%5Bcurrency%5D=eur"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "cs_wire",
            "url": "https://checkout.stripe.test/c/cs_wire"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = StripeClient::new(format!("{}/", server.uri()), "sk_test_123").unwrap();
    let session = client
        .create_checkout_session(CheckoutSessionRequest {
            cart_id,
            currency: "EUR".into(),
            customer_email: Some("shopper@example.com".into()),
            lines: vec![CheckoutLineItem {
                name: "Mug".into(),
                unit_amount_cents: 1240,
                quantity: 2,
            }],
            success_url: "https://shop.test/checkout/success?session_id={CHECKOUT_SESSION_ID}"
                .into(),
            cancel_url: "https://shop.test/cart".into(),
        })
        .await
        .unwrap();
    assert_eq!(session.id, "cs_wire");
    assert_eq!(session.url, "https://checkout.stripe.test/c/cs_wire");
}

#[tokio::test]
async fn relay_notifier_posts_json_messages() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/send"))
        .and(body_partial_json(json!({
            "event": "refund_notice",
            "from": "orders@shop.test",
            "to": "shopper@example.com",
            "data": { "amount_cents": 400, "remaining_cents": 600 }
        })))
        .respond_with(ResponseTemplate::new(202))
        .expect(1)
        .mount(&server)
        .await;

    let notifier = RelayNotifier::new(
        format!("{}/send", server.uri()),
        "orders@shop.test",
        None,
    )
    .unwrap();
    notifier
        .send_refund_notice(&RefundNotice {
            order_id: Uuid::new_v4(),
            email: "shopper@example.com".into(),
            currency: "EUR".into(),
            amount_cents: 400,
            remaining_cents: 600,
        })
        .await
        .unwrap();

    // alerts without a configured recipient are dropped
    notifier
        .send_operator_alert("Refund failed", "detail")
        .await
        .unwrap();
}

#[tokio::test]
async fn relay_rejection_is_reported() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let notifier = RelayNotifier::new(
        server.uri(),
        "orders@shop.test",
        Some("ops@shop.test".into()),
    )
    .unwrap();
    let err = notifier
        .send_operator_alert("Refund failed", "provider timeout")
        .await
        .unwrap_err();
    assert_matches!(err, NotificationError::Rejected(503));
}
