use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::gateway::{decline, GatewayError};

/// Standard error payload returned to the external API layer.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// HTTP status category (e.g., "Conflict", "Payment Required")
    pub error: String,
    /// Human-readable error description
    pub message: String,
    /// Additional structured details, when the variant carries them
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    /// ISO 8601 timestamp when the error occurred
    pub timestamp: String,
}

/// Error type for the order-modification saga and its collaborators.
///
/// Every precondition, gateway, and consistency failure is a distinct
/// variant carrying the structured fields callers and tests rely on.
#[derive(Debug, thiserror::Error)]
pub enum ServiceError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] sea_orm::error::DbErr),

    // -------- precondition errors (never retried automatically) --------
    #[error("Modification token has expired")]
    TokenExpired,

    #[error("Modification token is invalid")]
    TokenInvalid,

    #[error("Modification token is not valid for order {requested_order_id}")]
    TokenMismatch { requested_order_id: Uuid },

    #[error("Order {0} not found")]
    OrderNotFound(Uuid),

    #[error("Order {order_id} cannot be modified in status '{status}'")]
    InvalidOrderState { order_id: Uuid, status: String },

    #[error("Line item {item_id} not found on order {order_id}")]
    LineItemNotFound { order_id: Uuid, item_id: Uuid },

    #[error("Variant {0} not found")]
    VariantNotFound(Uuid),

    #[error("Order {0} carries no payment authorization")]
    PaymentIntentMissing(Uuid),

    #[error("Authorization {authorization_id} is in state '{status}' and cannot be adjusted")]
    InvalidPaymentState {
        authorization_id: String,
        status: String,
    },

    #[error("Order {0} is locked for capture")]
    OrderLocked(Uuid),

    #[error("Insufficient stock for variant {variant_id}: {available} available, {requested} requested")]
    InsufficientStock {
        variant_id: Uuid,
        available: i64,
        requested: i64,
    },

    // -------- gateway terminal errors --------
    #[error("{message}")]
    CardDeclined {
        code: String,
        message: String,
        retryable: bool,
    },

    // -------- consistency errors (critical, operator attention) --------
    #[error("Authorization {authorization_id} was adjusted to {attempted_amount} but order {order_id} failed to commit")]
    AuthMismatch {
        order_id: Uuid,
        authorization_id: String,
        attempted_amount: i64,
    },

    #[error("Could not confirm removal of capture job '{job_id}': {reason}")]
    QueueRemoval { job_id: String, reason: String },

    // -------- cancel terminal states --------
    #[error("Order {order_id} has a partial capture of {amount_received}; manual refund required")]
    PartialCapture {
        order_id: Uuid,
        amount_received: i64,
    },

    #[error("Order {0} was already captured and can no longer be canceled")]
    LateCancel(Uuid),

    // -------- infrastructure --------
    #[error("Capture queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Payment gateway error: {0}")]
    Gateway(String),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Event error: {0}")]
    EventError(String),

    #[error("Internal error: {0}")]
    InternalError(String),

    #[error("Other error: {0}")]
    Other(#[from] anyhow::Error),
}

/// Classify a raw gateway failure into its domain form.
///
/// Card declines are translated through the static decline-code table into
/// a user-facing message plus the workflow-level `retryable` flag. Nothing
/// here retries; the retrier has already run inside the gateway client.
impl From<GatewayError> for ServiceError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::CardDeclined { code, decline_code } => {
                let effective = decline_code.unwrap_or(code);
                let info = decline::decline_info(&effective);
                ServiceError::CardDeclined {
                    code: effective,
                    message: info.message.to_string(),
                    retryable: info.retryable,
                }
            }
            other => ServiceError::Gateway(other.to_string()),
        }
    }
}

impl From<validator::ValidationErrors> for ServiceError {
    fn from(err: validator::ValidationErrors) -> Self {
        ServiceError::ValidationError(err.to_string())
    }
}

impl ServiceError {
    /// Returns the HTTP status code for this error.
    /// This is the single source of truth for error-to-status mapping.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::TokenExpired | Self::TokenInvalid => StatusCode::UNAUTHORIZED,
            Self::TokenMismatch { .. } => StatusCode::FORBIDDEN,
            Self::OrderNotFound(_) | Self::LineItemNotFound { .. } | Self::VariantNotFound(_) => {
                StatusCode::NOT_FOUND
            }
            Self::InvalidOrderState { .. }
            | Self::PaymentIntentMissing(_)
            | Self::InvalidPaymentState { .. }
            | Self::LateCancel(_) => StatusCode::UNPROCESSABLE_ENTITY,
            Self::OrderLocked(_) | Self::InsufficientStock { .. } | Self::PartialCapture { .. } => {
                StatusCode::CONFLICT
            }
            Self::CardDeclined { .. } => StatusCode::PAYMENT_REQUIRED,
            Self::ValidationError(_) => StatusCode::BAD_REQUEST,
            Self::QueueUnavailable(_) | Self::QueueRemoval { .. } => {
                StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Gateway(_) => StatusCode::BAD_GATEWAY,
            Self::DatabaseError(_)
            | Self::AuthMismatch { .. }
            | Self::EventError(_)
            | Self::InternalError(_)
            | Self::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Returns the error message suitable for HTTP responses.
    /// Internal errors return generic messages to avoid leaking details.
    pub fn response_message(&self) -> String {
        match self {
            Self::DatabaseError(_) | Self::EventError(_) | Self::InternalError(_)
            | Self::Other(_) => "Internal server error".to_string(),
            Self::AuthMismatch { .. } => {
                "Payment state could not be reconciled; support has been notified".to_string()
            }
            Self::Gateway(_) => "Payment gateway error".to_string(),
            _ => self.to_string(),
        }
    }

    /// Structured fields exposed alongside the message, where they exist.
    fn response_details(&self) -> Option<serde_json::Value> {
        match self {
            Self::InsufficientStock {
                variant_id,
                available,
                requested,
            } => Some(serde_json::json!({
                "variant_id": variant_id,
                "available": available,
                "requested": requested,
            })),
            Self::CardDeclined {
                code, retryable, ..
            } => Some(serde_json::json!({
                "decline_code": code,
                "retryable": retryable,
            })),
            Self::InvalidOrderState { status, .. } => {
                Some(serde_json::json!({ "status": status }))
            }
            _ => None,
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let err = ErrorResponse {
            error: status.canonical_reason().unwrap_or("Error").to_string(),
            message: self.response_message(),
            details: self.response_details(),
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(err)).into_response()
    }
}
