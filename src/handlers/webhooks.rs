use axum::{
    body::Bytes,
    extract::{ConnectInfo, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use metrics::counter;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use tracing::{error, info, warn};
use utoipa::ToSchema;

use crate::errors::ServiceError;
use crate::handlers::common::caller_ip;
use crate::rate_limiter::{composite_key, ip_key, path_key};
use crate::services::audit::{self, Actor, AuditEvent};
use crate::webhooks::{verify_signature, ProviderEvent};
use crate::AppState;

pub const WEBHOOK_PATH: &str = "/api/v1/webhooks/payments";

/// Acknowledgement returned to the payment provider.
#[derive(Debug, Serialize, ToSchema)]
pub struct WebhookAck {
    pub received: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub duplicate: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<&'static str>,
}

impl WebhookAck {
    fn handled(outcome: &'static str) -> Self {
        Self {
            received: true,
            duplicate: false,
            outcome: Some(outcome),
            error: None,
        }
    }
}

fn outcome_counter(outcome: &'static str) {
    counter!("storefront_webhook_events_total", 1, "outcome" => outcome);
}

// POST /api/v1/webhooks/payments
#[utoipa::path(
    post,
    path = "/api/v1/webhooks/payments",
    request_body = String,
    responses(
        (status = 200, description = "Event handled, duplicate, or rejected by a business rule", body = WebhookAck),
        (status = 400, description = "Invalid signature or payload", body = crate::errors::ErrorResponse),
        (status = 429, description = "Rate limited", body = crate::errors::ErrorResponse),
        (status = 500, description = "Processing failed; the provider should redeliver", body = crate::errors::ErrorResponse)
    ),
    tag = "Webhooks"
)]
pub async fn payment_webhook(
    State(state): State<AppState>,
    connect: Option<ConnectInfo<SocketAddr>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let ip = caller_ip(&headers, connect.as_ref());
    let key = composite_key(&[path_key(WEBHOOK_PATH), ip_key(ip.as_deref())]);
    let admission = state.webhook_admission.try_acquire(&key).await;
    if !admission.allowed {
        counter!("storefront_admission_denied_total", 1, "route" => "webhook");
        return admission.rejection();
    }

    match handle_delivery(&state, &headers, &body).await {
        Ok(ack) => (StatusCode::OK, Json(ack)).into_response(),
        Err(err) => err.into_response(),
    }
}

async fn handle_delivery(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<WebhookAck, ServiceError> {
    let secret = state.config.payment_webhook_secret.as_str();
    if secret.trim().is_empty() {
        error!("webhook secret is not configured");
        return Err(ServiceError::InternalError(
            "webhook secret not configured".into(),
        ));
    }

    verify_signature(
        headers,
        body,
        secret,
        state.config.payment_webhook_tolerance_secs,
        Utc::now().timestamp(),
    )
    .map_err(|err| {
        warn!(error = %err, "webhook signature verification failed");
        outcome_counter("invalid_signature");
        ServiceError::InvalidSignature(err.to_string())
    })?;

    let event: ProviderEvent = serde_json::from_slice(body)
        .map_err(|err| ServiceError::MalformedPayload(err.to_string()))?;
    let kind = event
        .kind()
        .map_err(|err| ServiceError::MalformedPayload(format!("{}: {}", event.event_type, err)))?;

    let claim = state
        .services
        .idempotency
        .try_claim(&event.id, &event.event_type)
        .await?;
    if !claim.claimed {
        info!(event_id = %event.id, event_type = %event.event_type, "duplicate webhook delivery");
        return Ok(WebhookAck {
            received: true,
            duplicate: true,
            outcome: None,
            error: None,
        });
    }

    match state.services.reconciler.apply(&event.id, kind).await {
        Ok(outcome) => {
            outcome_counter("processed");
            info!(
                event_id = %event.id,
                event_type = %event.event_type,
                outcome = outcome.label(),
                "webhook processed"
            );

            if let Some(order_id) = outcome.confirmable_order() {
                if let Err(err) = state
                    .services
                    .notifications
                    .confirm_when_ready(order_id)
                    .await
                {
                    warn!(%order_id, error = %err, "order confirmation step failed");
                }
            }

            Ok(WebhookAck::handled(outcome.label()))
        }
        Err(err) => {
            outcome_counter("failed");
            error!(
                event_id = %event.id,
                event_type = %event.event_type,
                error = %err,
                "webhook processing failed"
            );
            record_failure(state, &event, &err).await;

            if err.is_transient() {
                Err(err)
            } else {
                Ok(WebhookAck {
                    received: true,
                    duplicate: false,
                    outcome: None,
                    error: Some(err.code()),
                })
            }
        }
    }
}

/// The event stays claimed, so a failure is only recoverable by hand.
async fn record_failure(state: &AppState, event: &ProviderEvent, err: &ServiceError) {
    let cart_id = event
        .data
        .object
        .pointer("/metadata/cart_id")
        .or_else(|| event.data.object.pointer("/metadata/cartId"))
        .cloned();
    let object_id = event.data.object.get("id").cloned();

    if let Err(audit_err) = audit::record(
        &*state.db,
        AuditEvent::WebhookProcessingFailed,
        None,
        &Actor::webhook(),
        json!({
            "eventId": event.id,
            "eventType": event.event_type,
            "objectId": object_id,
            "cartId": cart_id,
            "code": err.code(),
            "error": err.to_string(),
        }),
    )
    .await
    {
        warn!(error = %audit_err, "could not audit webhook failure");
    }

    state
        .services
        .notifications
        .alert_operator(
            "Payment webhook processing failed",
            &format!(
                "event {} ({}) failed: {}",
                event.id, event.event_type, err
            ),
        )
        .await;
}
