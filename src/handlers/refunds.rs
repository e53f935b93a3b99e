use axum::{
    body::Bytes,
    extract::{ConnectInfo, MatchedPath, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use metrics::counter;
use serde::Deserialize;
use std::net::SocketAddr;
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::handlers::common::{caller_ip, user_agent};
use crate::rate_limiter::{composite_key, ip_key, path_key};
use crate::services::audit::Actor;
use crate::services::refunds::{RefundCommand, RefundReceipt};
use crate::AppState;

/// Refund request body; both fields are optional.
#[derive(Debug, Default, Deserialize, ToSchema)]
pub struct RefundRequestBody {
    /// Minor units; omitted means everything still refundable
    #[serde(default, alias = "amountCents")]
    pub amount_cents: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// Trims the free-text reason and caps it at `max_len` characters.
pub fn normalize_reason(reason: Option<String>, max_len: usize) -> Option<String> {
    reason
        .map(|r| r.trim().chars().take(max_len).collect::<String>())
        .filter(|r| !r.is_empty())
}

fn parse_body(body: &[u8]) -> Result<RefundRequestBody, ServiceError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(RefundRequestBody::default());
    }
    serde_json::from_slice(body)
        .map_err(|err| ServiceError::ValidationError(format!("invalid refund body: {}", err)))
}

// POST /api/v1/orders/{id}/refund
#[utoipa::path(
    post,
    path = "/api/v1/orders/{id}/refund",
    params(("id" = Uuid, Path, description = "Order id")),
    request_body = RefundRequestBody,
    responses(
        (status = 200, description = "Refund issued", body = RefundReceipt),
        (status = 401, description = "Missing or invalid internal key", body = crate::errors::ErrorResponse),
        (status = 403, description = "Browser origin rejected", body = crate::errors::ErrorResponse),
        (status = 404, description = "Order not found", body = crate::errors::ErrorResponse),
        (status = 409, description = "Order not refundable", body = crate::errors::ErrorResponse),
        (status = 422, description = "Nothing to refund or amount exceeds remainder", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limited", body = crate::errors::ErrorResponse),
        (status = 502, description = "Payment provider failure", body = crate::errors::ErrorResponse)
    ),
    tag = "Refunds"
)]
pub async fn issue_refund(
    State(state): State<AppState>,
    Path(order_id): Path<Uuid>,
    matched: MatchedPath,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = caller_ip(&headers, connect.as_ref());
    let key = composite_key(&[path_key(matched.as_str()), ip_key(ip.as_deref())]);
    let admission = state.refund_admission.try_acquire(&key).await;
    if !admission.allowed {
        counter!("storefront_admission_denied_total", 1, "route" => "refund");
        return admission.rejection();
    }

    let result = async {
        state.credentials.authorize(&headers)?;
        let request = parse_body(&body)?;

        state
            .services
            .refunds
            .issue_refund(RefundCommand {
                order_id,
                amount_cents: request.amount_cents,
                reason: normalize_reason(request.reason, state.config.refund_reason_max_len),
                actor: Actor::admin_api(ip.clone(), user_agent(&headers)),
            })
            .await
    }
    .await;

    let mut response = match result {
        Ok(receipt) => {
            info!(%order_id, refund_id = %receipt.refund_id, "refund endpoint succeeded");
            (StatusCode::OK, Json(receipt)).into_response()
        }
        Err(err) => err.into_response(),
    };
    response.headers_mut().extend(admission.headers());
    response
}
