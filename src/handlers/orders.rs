use axum::{
    extract::{ConnectInfo, Path, State},
    http::HeaderMap,
    Json,
};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::entities::{order, FulfillmentStatus};
use crate::errors::ServiceError;
use crate::handlers::common::admin_actor;
use crate::services::notifications::ConfirmationOutcome;
use crate::services::reconciler::{OrderDetails, TrackingUpdate};
use crate::AppState;

#[derive(Debug, Deserialize, ToSchema)]
pub struct FulfillmentUpdate {
    pub status: FulfillmentStatus,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ResendResponse {
    pub outcome: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LinkGuestOrdersRequest {
    pub email: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LinkGuestOrdersResponse {
    pub linked: u64,
}

// GET /api/v1/orders/{id}
#[utoipa::path(
    get,
    path = "/api/v1/orders/{id}",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Order with lines and refunds", body = OrderDetails),
        (status = 401, description = "Missing or invalid internal key", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn get_order(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<OrderDetails>, ServiceError> {
    Ok(Json(state.services.reconciler.order_details(order_id).await?))
}

// PUT /api/v1/orders/{id}/fulfillment
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/fulfillment",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = FulfillmentUpdate,
    responses(
        (status = 200, description = "Fulfillment status changed"),
        (status = 409, description = "Transition not allowed", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn update_fulfillment(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<FulfillmentUpdate>,
) -> Result<Json<order::Model>, ServiceError> {
    let actor = admin_actor(&headers, connect.as_ref());
    let order = state
        .services
        .reconciler
        .update_fulfillment(order_id, body.status, &actor)
        .await?;
    Ok(Json(order))
}

// PUT /api/v1/orders/{id}/tracking
#[utoipa::path(
    put,
    path = "/api/v1/orders/{id}/tracking",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = TrackingUpdate,
    responses(
        (status = 200, description = "Tracking stored, order marked shipped"),
        (status = 400, description = "Invalid tracking data", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order can no longer ship", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn set_tracking(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<TrackingUpdate>,
) -> Result<Json<order::Model>, ServiceError> {
    let actor = admin_actor(&headers, connect.as_ref());
    let order = state
        .services
        .reconciler
        .set_tracking(order_id, body, &actor)
        .await?;
    Ok(Json(order))
}

// POST /api/v1/orders/{id}/resend-confirmation
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/resend-confirmation",
    params(("id" = Uuid, Path, description = "Order id")),
    responses(
        (status = 200, description = "Confirmation re-sent or failure recorded", body = ResendResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse)
    ),
    tag = "Orders"
)]
pub async fn resend_confirmation(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
) -> Result<Json<ResendResponse>, ServiceError> {
    let outcome = state
        .services
        .notifications
        .resend_confirmation(order_id)
        .await?;
    let outcome = match outcome {
        ConfirmationOutcome::Sent => "sent",
        ConfirmationOutcome::AlreadySent => "already_sent",
        ConfirmationOutcome::Deferred => "deferred",
        ConfirmationOutcome::Failed => "failed",
    };
    Ok(Json(ResendResponse {
        outcome: outcome.to_string(),
    }))
}

// POST /api/v1/customers/{id}/link-guest-orders
#[utoipa::path(
    post,
    path = "/api/v1/customers/{id}/link-guest-orders",
    params(("id" = Uuid, Path, description = "Customer id")),
    request_body = LinkGuestOrdersRequest,
    responses(
        (status = 200, description = "Guest orders linked", body = LinkGuestOrdersResponse)
    ),
    tag = "Customers"
)]
pub async fn link_guest_orders(
    State(state): State<AppState>,
    Path(customer_id): Path<Uuid>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    Json(body): Json<LinkGuestOrdersRequest>,
) -> Result<Json<LinkGuestOrdersResponse>, ServiceError> {
    let actor = admin_actor(&headers, connect.as_ref());
    let linked = state
        .services
        .reconciler
        .link_guest_orders(&body.email, customer_id, &actor)
        .await?;
    Ok(Json(LinkGuestOrdersResponse { linked }))
}
