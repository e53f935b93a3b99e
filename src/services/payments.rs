//! Payment provider port and its Stripe REST implementation.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum PaymentProviderError {
    #[error("payment provider is not configured")]
    NotConfigured,
    #[error("transport error: {0}")]
    Transport(String),
    #[error("provider rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    #[error("unexpected provider response: {0}")]
    Decode(String),
}

impl From<reqwest::Error> for PaymentProviderError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            PaymentProviderError::Decode(err.to_string())
        } else {
            PaymentProviderError::Transport(err.to_string())
        }
    }
}

/// Refund call parameters. `idempotency_key` is forwarded to the provider so a
/// retried call with identical parameters cannot refund twice.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RefundRequest {
    pub order_id: Uuid,
    pub payment_intent_id: String,
    pub amount_cents: i64,
    pub idempotency_key: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderRefund {
    pub id: String,
    #[serde(rename = "amount")]
    pub amount_cents: i64,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutLineItem {
    pub name: String,
    pub unit_amount_cents: i64,
    pub quantity: i32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckoutSessionRequest {
    pub cart_id: Uuid,
    pub currency: String,
    pub customer_email: Option<String>,
    pub lines: Vec<CheckoutLineItem>,
    pub success_url: String,
    pub cancel_url: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ProviderCheckoutSession {
    pub id: String,
    pub url: String,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    async fn create_refund(
        &self,
        request: RefundRequest,
    ) -> Result<ProviderRefund, PaymentProviderError>;

    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<ProviderCheckoutSession, PaymentProviderError>;
}

/// Deterministic provider idempotency key for a refund.
pub fn refund_idempotency_key(order_id: Uuid, payment_intent_id: &str, amount_cents: i64) -> String {
    format!("refund_{}_{}_{}", order_id, payment_intent_id, amount_cents)
}

#[derive(Debug, Deserialize)]
struct ProviderErrorBody {
    error: ProviderErrorDetail,
}

#[derive(Debug, Deserialize)]
struct ProviderErrorDetail {
    #[serde(default)]
    message: Option<String>,
}

/// Form-encoded client for the Stripe REST API.
#[derive(Clone)]
pub struct StripeClient {
    http: reqwest::Client,
    base_url: String,
    secret_key: String,
}

impl StripeClient {
    pub fn new(
        base_url: impl Into<String>,
        secret_key: impl Into<String>,
    ) -> Result<Self, PaymentProviderError> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            secret_key: secret_key.into(),
        })
    }

    fn ensure_configured(&self) -> Result<(), PaymentProviderError> {
        if self.secret_key.trim().is_empty() {
            Err(PaymentProviderError::NotConfigured)
        } else {
            Ok(())
        }
    }

    async fn decode<T: for<'de> Deserialize<'de>>(
        response: reqwest::Response,
    ) -> Result<T, PaymentProviderError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json::<T>().await?);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ProviderErrorBody>(&body)
            .ok()
            .and_then(|b| b.error.message)
            .unwrap_or_else(|| body.chars().take(200).collect());
        warn!(status = status.as_u16(), %message, "payment provider rejected request");
        Err(PaymentProviderError::Rejected {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl PaymentProvider for StripeClient {
    #[instrument(skip(self, request), fields(order_id = %request.order_id, amount = request.amount_cents))]
    async fn create_refund(
        &self,
        request: RefundRequest,
    ) -> Result<ProviderRefund, PaymentProviderError> {
        self.ensure_configured()?;

        let mut form = vec![
            ("payment_intent", request.payment_intent_id.clone()),
            ("amount", request.amount_cents.to_string()),
            ("metadata[order_id]", request.order_id.to_string()),
        ];
        if let Some(reason) = &request.reason {
            form.push(("metadata[reason]", reason.clone()));
        }

        debug!("creating provider refund");
        let response = self
            .http
            .post(format!("{}/v1/refunds", self.base_url))
            .bearer_auth(&self.secret_key)
            .header("Idempotency-Key", &request.idempotency_key)
            .form(&form)
            .send()
            .await?;

        Self::decode(response).await
    }

    #[instrument(skip(self, request), fields(cart_id = %request.cart_id))]
    async fn create_checkout_session(
        &self,
        request: CheckoutSessionRequest,
    ) -> Result<ProviderCheckoutSession, PaymentProviderError> {
        self.ensure_configured()?;

        let cart_id = request.cart_id.to_string();
        let currency = request.currency.to_lowercase();
        let mut form: Vec<(String, String)> = vec![
            ("mode".into(), "payment".into()),
            ("success_url".into(), request.success_url.clone()),
            ("cancel_url".into(), request.cancel_url.clone()),
            ("metadata[cart_id]".into(), cart_id.clone()),
            ("payment_intent_data[metadata][cart_id]".into(), cart_id),
        ];
        if let Some(email) = &request.customer_email {
            form.push(("customer_email".into(), email.clone()));
        }
        for (i, line) in request.lines.iter().enumerate() {
            let prefix = format!("line_items[{}]", i);
            form.push((format!("{prefix}[quantity]"), line.quantity.to_string()));
            form.push((format!("{prefix}[price_data][currency]"), currency.clone()));
            form.push((
                format!("{prefix}[price_data][unit_amount]"),
                line.unit_amount_cents.to_string(),
            ));
            form.push((
                format!("{prefix}[price_data][product_data][name]"),
                line.name.clone(),
            ));
        }

        let response = self
            .http
            .post(format!("{}/v1/checkout/sessions", self.base_url))
            .bearer_auth(&self.secret_key)
            .form(&form)
            .send()
            .await?;

        Self::decode(response).await
    }
}
