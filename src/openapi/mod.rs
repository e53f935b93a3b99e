use axum::{routing::get, Json, Router};
use utoipa::OpenApi;

use crate::AppState;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Storefront API",
        version = "0.1.0",
        description = r#"
# Storefront order and refund reconciliation

Turns payment-provider webhooks into durable orders and refunds, issues
refunds against the provider, and opens hosted checkout sessions.

## Authentication

Internal endpoints require the `x-internal-key` header. Requests that carry a
browser `Origin` header are rejected.

## Rate Limiting

Refund responses carry `x-ratelimit-limit`, `x-ratelimit-remaining` and
`x-ratelimit-reset`. Rejected requests get `429`.
"#
    ),
    paths(
        crate::handlers::webhooks::payment_webhook,
        crate::handlers::refunds::issue_refund,
        crate::handlers::checkout::create_checkout_session,
        crate::handlers::orders::get_order,
        crate::handlers::orders::update_fulfillment,
        crate::handlers::orders::set_tracking,
        crate::handlers::orders::resend_confirmation,
        crate::handlers::orders::link_guest_orders,
        crate::handlers::health::health,
    ),
    components(schemas(
        crate::errors::ErrorResponse,
        crate::entities::PaymentStatus,
        crate::entities::FulfillmentStatus,
        crate::handlers::webhooks::WebhookAck,
        crate::handlers::refunds::RefundRequestBody,
        crate::services::refunds::RefundReceipt,
        crate::services::reconciler::OrderDetails,
        crate::services::reconciler::TrackingUpdate,
        crate::handlers::orders::FulfillmentUpdate,
        crate::handlers::orders::ResendResponse,
        crate::handlers::orders::LinkGuestOrdersRequest,
        crate::handlers::orders::LinkGuestOrdersResponse,
        crate::handlers::health::HealthResponse,
    )),
    tags(
        (name = "Webhooks", description = "Payment provider event ingestion"),
        (name = "Refunds", description = "Refund issuance"),
        (name = "Checkout", description = "Hosted checkout sessions"),
        (name = "Orders", description = "Internal order administration"),
        (name = "Customers", description = "Customer account linking"),
        (name = "Health", description = "Liveness"),
    )
)]
pub struct ApiDoc;

/// Serves the generated document at `/api-docs/openapi.json`.
pub fn openapi_routes() -> Router<AppState> {
    Router::new().route("/api-docs/openapi.json", get(|| async { Json(ApiDoc::openapi()) }))
}
