//! Payment-provider webhook envelope and signature verification.

use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use sha2::Sha256;
use std::collections::HashMap;
use thiserror::Error;

use crate::auth::constant_time_eq;

type HmacSha256 = Hmac<Sha256>;

pub const PROVIDER_SIGNATURE_HEADER: &str = "stripe-signature";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    Missing,
    #[error("signature header malformed")]
    Malformed,
    #[error("signature timestamp outside tolerance")]
    Expired,
    #[error("signature mismatch")]
    Mismatch,
}

/// Hex HMAC-SHA256 over `"{timestamp}.{body}"`.
pub fn sign_payload(secret: &str, timestamp: &str, body: &[u8]) -> String {
    // HMAC accepts keys of any length
    let mut mac = match HmacSha256::new_from_slice(secret.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(timestamp.as_bytes());
    mac.update(b".");
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

/// Verifies a webhook delivery.
///
/// Accepts the provider's `Stripe-Signature: t=<ts>,v1=<hex>[,v1=<hex>]`
/// header, or a generic `x-timestamp` / `x-signature` pair.
pub fn verify_signature(
    headers: &HeaderMap,
    payload: &[u8],
    secret: &str,
    tolerance_secs: i64,
    now_epoch: i64,
) -> Result<(), SignatureError> {
    let (timestamp, signatures) = if let Some(raw) = headers
        .get(PROVIDER_SIGNATURE_HEADER)
        .and_then(|h| h.to_str().ok())
    {
        parse_provider_header(raw)?
    } else {
        match (
            headers.get("x-timestamp").and_then(|v| v.to_str().ok()),
            headers.get("x-signature").and_then(|v| v.to_str().ok()),
        ) {
            (Some(ts), Some(sig)) => (ts.to_string(), vec![sig.to_string()]),
            _ => return Err(SignatureError::Missing),
        }
    };

    let ts: i64 = timestamp.parse().map_err(|_| SignatureError::Malformed)?;
    if now_epoch.abs_diff(ts) > tolerance_secs.max(0) as u64 {
        return Err(SignatureError::Expired);
    }

    let expected = sign_payload(secret, &timestamp, payload);
    if signatures
        .iter()
        .any(|candidate| constant_time_eq(&expected, candidate))
    {
        Ok(())
    } else {
        Err(SignatureError::Mismatch)
    }
}

fn parse_provider_header(raw: &str) -> Result<(String, Vec<String>), SignatureError> {
    let mut timestamp = None;
    let mut signatures = Vec::new();
    for part in raw.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = Some(value.to_string()),
            Some(("v1", value)) => signatures.push(value.to_string()),
            _ => {}
        }
    }

    match timestamp {
        Some(ts) if !signatures.is_empty() => Ok((ts, signatures)),
        _ => Err(SignatureError::Malformed),
    }
}

/// Event envelope as delivered by the provider.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EventData {
    pub object: Value,
}

/// Typed view of the events the reconciler acts on.
#[derive(Debug, Clone)]
pub enum EventKind {
    CheckoutCompleted(CheckoutSessionObject),
    CheckoutAsyncSucceeded(CheckoutSessionObject),
    CheckoutAsyncFailed(CheckoutSessionObject),
    PaymentSucceeded(PaymentIntentObject),
    PaymentFailed(PaymentIntentObject),
    ChargeFailed(ChargeObject),
    RefundUpdated(RefundObject),
    ChargeRefunded(ChargeObject),
    Ignored,
}

impl ProviderEvent {
    pub fn kind(&self) -> Result<EventKind, serde_json::Error> {
        let object = || self.data.object.clone();
        Ok(match self.event_type.as_str() {
            "checkout.session.completed" => {
                EventKind::CheckoutCompleted(serde_json::from_value(object())?)
            }
            "checkout.session.async_payment_succeeded" => {
                EventKind::CheckoutAsyncSucceeded(serde_json::from_value(object())?)
            }
            "checkout.session.async_payment_failed" => {
                EventKind::CheckoutAsyncFailed(serde_json::from_value(object())?)
            }
            "payment_intent.succeeded" => {
                EventKind::PaymentSucceeded(serde_json::from_value(object())?)
            }
            "payment_intent.payment_failed" => {
                EventKind::PaymentFailed(serde_json::from_value(object())?)
            }
            "charge.failed" => EventKind::ChargeFailed(serde_json::from_value(object())?),
            "refund.created" | "refund.updated" | "refund.succeeded" | "charge.refund.updated" => {
                EventKind::RefundUpdated(serde_json::from_value(object())?)
            }
            "charge.refunded" => EventKind::ChargeRefunded(serde_json::from_value(object())?),
            _ => EventKind::Ignored,
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CheckoutSessionObject {
    pub id: String,
    #[serde(default, deserialize_with = "id_or_object")]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub customer_email: Option<String>,
    #[serde(default)]
    pub customer_details: Option<CustomerDetails>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl CheckoutSessionObject {
    pub fn cart_id(&self) -> Option<&str> {
        self.metadata
            .get("cart_id")
            .or_else(|| self.metadata.get("cartId"))
            .map(String::as_str)
    }

    /// Contact email: details collected on the hosted page, then metadata.
    pub fn email(&self) -> Option<String> {
        self.customer_details
            .as_ref()
            .and_then(|d| d.email.clone())
            .or_else(|| self.customer_email.clone())
            .or_else(|| self.metadata.get("email").cloned())
            .filter(|e| !e.trim().is_empty())
    }

    pub fn customer_id(&self) -> Option<&str> {
        self.metadata
            .get("customer_id")
            .or_else(|| self.metadata.get("userId"))
            .map(String::as_str)
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CustomerDetails {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub address: Option<PostalAddress>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PostalAddress {
    #[serde(default)]
    pub line1: Option<String>,
    #[serde(default)]
    pub line2: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub postal_code: Option<String>,
    #[serde(default)]
    pub country: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentIntentObject {
    pub id: String,
    #[serde(default)]
    pub last_payment_error: Option<PaymentErrorDetail>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PaymentErrorDetail {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub code: Option<String>,
}

impl PaymentIntentObject {
    pub fn failure_reason(&self) -> String {
        let detail = self.last_payment_error.as_ref();
        failure_reason(
            detail.and_then(|d| d.message.as_deref()),
            detail.and_then(|d| d.code.as_deref()),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ChargeObject {
    pub id: String,
    #[serde(default, deserialize_with = "id_or_object")]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub failure_message: Option<String>,
    #[serde(default)]
    pub failure_code: Option<String>,
    #[serde(default)]
    pub refunds: Option<RefundList>,
}

impl ChargeObject {
    pub fn failure_reason(&self) -> String {
        failure_reason(self.failure_message.as_deref(), self.failure_code.as_deref())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundList {
    #[serde(default)]
    pub data: Vec<RefundObject>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RefundObject {
    pub id: String,
    #[serde(default)]
    pub amount: i64,
    #[serde(default, deserialize_with = "id_or_object")]
    pub payment_intent: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub reason: Option<String>,
}

impl RefundObject {
    /// Pending, failed and canceled refunds are not money returned yet.
    pub fn is_settled(&self) -> bool {
        matches!(self.status.as_deref(), None | Some("succeeded"))
    }
}

fn failure_reason(message: Option<&str>, code: Option<&str>) -> String {
    message
        .filter(|m| !m.trim().is_empty())
        .or(code.filter(|c| !c.trim().is_empty()))
        .unwrap_or("Payment failed")
        .to_string()
}

/// Expandable references arrive either as a bare id or as the full object.
fn id_or_object<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<Value>::deserialize(deserializer)?;
    Ok(match value {
        Some(Value::String(id)) => Some(id),
        Some(Value::Object(map)) => map.get("id").and_then(Value::as_str).map(str::to_string),
        _ => None,
    })
}
