mod common;

use axum::http::{Method, StatusCode};
use rust_decimal_macros::dec;
use serde_json::json;
use storefront_api::entities::FulfillmentStatus;
use uuid::Uuid;

use common::{checkout_completed, response_json, TestApp};

#[tokio::test]
async fn admin_routes_require_the_internal_key() {
    let app = TestApp::new().await;
    let order = app.seed_paid_order(1000, Some("pi_adm")).await;
    let uri = format!("/api/v1/orders/{}", order.id);

    let anonymous = app.request(Method::GET, &uri, None, &[]).await;
    assert_eq!(anonymous.status(), StatusCode::UNAUTHORIZED);

    let response = app.internal(Method::GET, &uri, None).await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["order"]["id"], order.id.to_string());
    assert_eq!(body["refunded_total_cents"], 0);
    assert_eq!(body["remaining_refundable_cents"], 1000);

    let missing = app
        .internal(Method::GET, &format!("/api/v1/orders/{}", Uuid::new_v4()), None)
        .await;
    assert_eq!(missing.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn order_details_include_lines_and_refunds() {
    let app = TestApp::new().await;
    let mug = app.seed_variant("Mug", None, 1000, dec!(24), Some(3)).await;
    let cart_id = app.seed_cart(&[(&mug, 1)]).await;
    app.deliver(&checkout_completed("evt_d", "cs_d", cart_id, Some("pi_d")))
        .await;
    let order = app.orders_for_session("cs_d").await.remove(0);

    let refund = app
        .internal(
            Method::POST,
            &format!("/api/v1/orders/{}/refund", order.id),
            Some(json!({ "amountCents": 240 })),
        )
        .await;
    assert_eq!(refund.status(), StatusCode::OK);

    let body = response_json(
        app.internal(Method::GET, &format!("/api/v1/orders/{}", order.id), None)
            .await,
    )
    .await;
    assert_eq!(body["lines"].as_array().unwrap().len(), 1);
    assert_eq!(body["refunds"].as_array().unwrap().len(), 1);
    assert_eq!(body["refunded_total_cents"], 240);
    assert_eq!(body["remaining_refundable_cents"], 1000);
    assert_eq!(body["order"]["payment_status"], "PARTIALLY_REFUNDED");
}

#[tokio::test]
async fn fulfillment_moves_forward_only() {
    let app = TestApp::new().await;
    let order = app.seed_paid_order(1000, Some("pi_ful")).await;
    let uri = format!("/api/v1/orders/{}/fulfillment", order.id);

    let packing = app
        .internal(Method::PUT, &uri, Some(json!({ "status": "PACKING" })))
        .await;
    assert_eq!(packing.status(), StatusCode::OK);
    assert_eq!(response_json(packing).await["fulfillment_status"], "PACKING");

    let backwards = app
        .internal(Method::PUT, &uri, Some(json!({ "status": "PENDING" })))
        .await;
    assert_eq!(backwards.status(), StatusCode::CONFLICT);
    assert_eq!(response_json(backwards).await["code"], "invalid_transition");

    assert_eq!(
        app.order(order.id).await.fulfillment_status,
        FulfillmentStatus::Packing
    );
    let audits = app.audit_events().await;
    assert_eq!(
        audits.iter().filter(|e| *e == "ORDER_STATUS_CHANGED").count(),
        1
    );
}

#[tokio::test]
async fn tracking_ships_the_order_and_notifies_the_customer() {
    let app = TestApp::new().await;
    let order = app.seed_paid_order(1000, Some("pi_trk")).await;
    let uri = format!("/api/v1/orders/{}/tracking", order.id);

    let invalid = app
        .internal(
            Method::PUT,
            &uri,
            Some(json!({ "carrier": "", "tracking_number": "JJFI123" })),
        )
        .await;
    assert_eq!(invalid.status(), StatusCode::BAD_REQUEST);

    let response = app
        .internal(
            Method::PUT,
            &uri,
            Some(json!({
                "carrier": "Posti",
                "tracking_number": " JJFI123 ",
                "tracking_url": "https://track.example.com/JJFI123"
            })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let body = response_json(response).await;
    assert_eq!(body["fulfillment_status"], "SHIPPED");
    assert_eq!(body["tracking_number"], "JJFI123");

    let notices = app.notifier.shipped_notices.lock().unwrap().clone();
    assert_eq!(notices.len(), 1);
    assert_eq!(notices[0].carrier.as_deref(), Some("Posti"));
    assert!(app
        .audit_events()
        .await
        .contains(&"TRACKING_UPDATED".to_string()));
}

#[tokio::test]
async fn resend_confirmation_ignores_the_sent_flag() {
    let app = TestApp::new().await;
    let order = app.seed_paid_order(1000, Some("pi_rs")).await;
    assert!(order.confirmation_email_sent);

    let response = app
        .internal(
            Method::POST,
            &format!("/api/v1/orders/{}/resend-confirmation", order.id),
            None,
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["outcome"], "sent");
    assert_eq!(app.notifier.confirmation_count(), 1);
}

#[tokio::test]
async fn guest_orders_are_linked_by_email_once() {
    let app = TestApp::new().await;
    app.seed_paid_order(1000, Some("pi_g1")).await;
    app.seed_paid_order(2000, Some("pi_g2")).await;
    let customer_id = Uuid::new_v4();
    let uri = format!("/api/v1/customers/{}/link-guest-orders", customer_id);

    let response = app
        .internal(
            Method::POST,
            &uri,
            Some(json!({ "email": " Shopper@Example.com " })),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response_json(response).await["linked"], 2);

    let again = app
        .internal(Method::POST, &uri, Some(json!({ "email": "shopper@example.com" })))
        .await;
    assert_eq!(response_json(again).await["linked"], 0);

    let audits = app.audit_events().await;
    assert_eq!(
        audits.iter().filter(|e| *e == "GUEST_ORDERS_LINKED").count(),
        1
    );
}

#[tokio::test]
async fn health_and_openapi_are_public() {
    let app = TestApp::new().await;

    let health = app.request(Method::GET, "/health", None, &[]).await;
    assert_eq!(health.status(), StatusCode::OK);
    assert!(health.headers().contains_key("x-request-id"));
    assert_eq!(response_json(health).await["database"], "up");

    let docs = app
        .request(Method::GET, "/api-docs/openapi.json", None, &[])
        .await;
    assert_eq!(docs.status(), StatusCode::OK);
    let spec = response_json(docs).await;
    assert!(spec["paths"]["/api/v1/webhooks/payments"].is_object());
}
