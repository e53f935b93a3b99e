use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use sea_orm::error::DbErr;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::services::payments::PaymentProviderError;

fn current_request_id() -> Option<String> {
    crate::tracing::current_request_id().map(|rid| rid.as_str().to_string())
}

/// Error body returned by every endpoint
#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Not Found", "Conflict")
    pub error: String,
    /// Machine-readable error code
    pub code: String,
    /// Human-readable error description
    pub message: String,
    /// Unique request identifier for support and debugging
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// RFC 3339 timestamp when the error occurred
    pub timestamp: String,
}

/// Failures of refund issuance.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RefundError {
    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Order {0} has no payment reference")]
    MissingPaymentReference(Uuid),

    #[error("Nothing left to refund")]
    NothingToRefund,

    #[error("Requested {requested} exceeds refundable remainder {remaining}")]
    ExceedsRefundable { requested: i64, remaining: i64 },

    #[error("Order is not refundable in payment status {0}")]
    NotRefundable(String),
}

impl RefundError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::OrderNotFound(_) => "not_found",
            Self::MissingPaymentReference(_) => "missing_payment_reference",
            Self::NothingToRefund => "nothing_to_refund",
            Self::ExceedsRefundable { .. } => "exceeds_refundable",
            Self::NotRefundable(_) => "not_refundable",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::OrderNotFound(_) => StatusCode::NOT_FOUND,
            Self::MissingPaymentReference(_) | Self::NotRefundable(_) => StatusCode::CONFLICT,
            Self::NothingToRefund | Self::ExceedsRefundable { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] DbErr),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Malformed payload: {0}")]
    MalformedPayload(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Cart {0} not found")]
    CartNotFound(Uuid),

    #[error("Cart {0} is empty")]
    EmptyCart(Uuid),

    #[error("Insufficient stock for {name}")]
    InsufficientStock { variant_id: Uuid, name: String },

    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    #[error(transparent)]
    Refund(#[from] RefundError),

    #[error("Payment provider error: {0}")]
    PaymentProvider(#[from] PaymentProviderError),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    InternalError(String),
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::NotFound(_) | Self::CartNotFound(_) => StatusCode::NOT_FOUND,
            Self::ValidationError(_) | Self::InvalidSignature(_) | Self::MalformedPayload(_) => {
                StatusCode::BAD_REQUEST
            }
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::EmptyCart(_) | Self::InsufficientStock { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            Self::InvalidTransition(_) => StatusCode::CONFLICT,
            Self::Refund(err) => err.status_code(),
            Self::PaymentProvider(_) => StatusCode::BAD_GATEWAY,
        }
    }

    /// Machine-readable code carried in the error body.
    pub fn code(&self) -> &'static str {
        match self {
            Self::DatabaseError(_) | Self::SerializationError(_) | Self::InternalError(_) => {
                "internal_error"
            }
            Self::NotFound(_) | Self::CartNotFound(_) => "not_found",
            Self::ValidationError(_) => "validation_error",
            Self::InvalidSignature(_) => "invalid_signature",
            Self::MalformedPayload(_) => "malformed_payload",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::EmptyCart(_) => "empty_cart",
            Self::InsufficientStock { .. } => "insufficient_stock",
            Self::InvalidTransition(_) => "invalid_transition",
            Self::Refund(err) => err.code(),
            Self::PaymentProvider(_) => "payment_provider_error",
        }
    }

    /// Infrastructure failures a later redelivery might get past.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::DatabaseError(_) | Self::PaymentProvider(_) | Self::InternalError(_)
        )
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking implementation details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) => "Database error".to_string(),
            Self::SerializationError(_) | Self::InternalError(_) => {
                "Internal server error".to_string()
            }
            Self::PaymentProvider(_) => "Payment provider request failed".to_string(),
            _ => self.to_string(),
        }
    }

    /// Returns true when the database rejected a write on a unique constraint.
    pub fn is_unique_violation(&self) -> bool {
        matches!(self, Self::DatabaseError(err) if is_unique_violation(err))
    }
}

/// Classifies a database error as a unique-constraint violation.
pub fn is_unique_violation(err: &DbErr) -> bool {
    matches!(
        err.sql_err(),
        Some(sea_orm::SqlErr::UniqueConstraintViolation(_))
    )
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            code: self.code().to_string(),
            message: self.response_message(),
            request_id: current_request_id(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}
