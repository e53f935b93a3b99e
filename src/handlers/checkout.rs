use axum::{
    body::Bytes,
    extract::State,
    response::{IntoResponse, Redirect, Response},
};
use tracing::warn;
use url::form_urlencoded;
use uuid::Uuid;

use crate::errors::ServiceError;
use crate::AppState;

/// Cart token posted by the storefront, either as a form field or a header.
fn cart_reference(headers: &axum::http::HeaderMap, body: &[u8]) -> Result<Uuid, ServiceError> {
    let raw = form_urlencoded::parse(body)
        .find(|(k, _)| k == "cart_id")
        .map(|(_, v)| v.into_owned())
        .or_else(|| {
            headers
                .get("x-cart-id")
                .and_then(|v| v.to_str().ok())
                .map(str::to_string)
        })
        .ok_or_else(|| ServiceError::ValidationError("Your cart is empty".into()))?;

    Uuid::parse_str(raw.trim())
        .map_err(|_| ServiceError::ValidationError("Unknown cart".into()))
}

/// `{app_url}/cart?error=<reason>`
pub fn cart_error_url(app_url: &str, reason: &str) -> String {
    let encoded: String = form_urlencoded::byte_serialize(reason.as_bytes()).collect();
    format!("{}/cart?error={}", app_url, encoded)
}

fn shopper_message(err: &ServiceError) -> String {
    match err {
        ServiceError::EmptyCart(_) | ServiceError::CartNotFound(_) => "Your cart is empty".into(),
        ServiceError::InsufficientStock { .. } | ServiceError::ValidationError(_) => {
            err.response_message()
        }
        _ => "Checkout is temporarily unavailable, please try again".into(),
    }
}

// POST /api/v1/checkout/session
#[utoipa::path(
    post,
    path = "/api/v1/checkout/session",
    request_body(content = String, content_type = "application/x-www-form-urlencoded", description = "cart_id=<uuid>"),
    responses(
        (status = 303, description = "Redirect to the hosted payment page, or back to the cart with an error")
    ),
    tag = "Checkout"
)]
pub async fn create_checkout_session(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
    body: Bytes,
) -> Response {
    let checkout = &state.services.checkout;
    let result = match cart_reference(&headers, &body) {
        Ok(cart_id) => checkout.create_session(cart_id).await,
        Err(err) => Err(err),
    };

    match result {
        Ok(session) => Redirect::to(&session.url).into_response(),
        Err(err) => {
            warn!(error = %err, "checkout session creation failed");
            Redirect::to(&cart_error_url(checkout.app_url(), &shopper_message(&err))).into_response()
        }
    }
}
