use chrono::Utc;
use sea_orm::{ActiveModelTrait, ConnectionTrait, DbErr, Set};
use serde::Serialize;
use serde_json::{json, Value};
use uuid::Uuid;

use crate::entities::audit_entry;

/// Audit event tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuditEvent {
    RefundRequested,
    RefundRecorded,
    RefundRejected,
    PaymentFailed,
    WebhookProcessingFailed,
    ConfirmationSent,
    ConfirmationDeferred,
    ConfirmationFailed,
    FulfillmentStatusChanged,
    TrackingUpdated,
    GuestOrdersLinked,
}

impl AuditEvent {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RefundRequested => "REFUND_REQUEST",
            Self::RefundRecorded => "REFUND_RECORDED",
            Self::RefundRejected => "REFUND_REJECTED",
            Self::PaymentFailed => "PAYMENT_FAILED",
            Self::WebhookProcessingFailed => "WEBHOOK_PROCESSING_FAILED",
            Self::ConfirmationSent => "CONFIRMATION_SENT",
            Self::ConfirmationDeferred => "CONFIRMATION_DEFERRED",
            Self::ConfirmationFailed => "CONFIRMATION_FAILED",
            Self::FulfillmentStatusChanged => "ORDER_STATUS_CHANGED",
            Self::TrackingUpdated => "TRACKING_UPDATED",
            Self::GuestOrdersLinked => "GUEST_ORDERS_LINKED",
        }
    }
}

/// Who triggered an action and from where.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Actor {
    pub actor_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_agent: Option<String>,
}

impl Actor {
    pub fn admin_api(ip: Option<String>, user_agent: Option<String>) -> Self {
        Self {
            actor_type: "ADMIN_API".to_string(),
            ip,
            user_agent,
        }
    }

    pub fn webhook() -> Self {
        Self {
            actor_type: "PAYMENT_WEBHOOK".to_string(),
            ..Default::default()
        }
    }

    pub fn system() -> Self {
        Self {
            actor_type: "SYSTEM".to_string(),
            ..Default::default()
        }
    }
}

/// Appends an audit entry. The current request id is attached when present.
pub async fn record<C>(
    conn: &C,
    event: AuditEvent,
    order_id: Option<Uuid>,
    actor: &Actor,
    meta: Value,
) -> Result<audit_entry::Model, DbErr>
where
    C: ConnectionTrait,
{
    let request_id = crate::tracing::current_request_id().map(|rid| rid.0);
    let metadata = json!({
        "actor": actor,
        "requestId": request_id,
        "meta": meta,
    });

    audit_entry::ActiveModel {
        id: Set(Uuid::new_v4()),
        event_type: Set(event.as_str().to_string()),
        order_id: Set(order_id),
        metadata: Set(metadata),
        created_at: Set(Utc::now()),
    }
    .insert(conn)
    .await
}
