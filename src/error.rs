use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use sqlx::migrate::MigrateError;
use thiserror::Error;

/// Top-level error type for the entire application
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Stripe error: {0}")]
    Processor(#[from] ProcessorError),

    #[error("Mirakl error: {0}")]
    Marketplace(#[from] MarketplaceError),

    #[error("Webhook rejected: {0}")]
    Signature(#[from] SignatureError),

    #[error("KYC error: {0}")]
    Kyc(#[from] KycError),

    #[error("Invalid status transition: {0}")]
    Transition(#[from] TransitionError),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("External service error: {0}")]
    External(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Bad request: {0}")]
    BadRequest(String),
}

/// Errors returned by the payment processor API
#[derive(Error, Debug, Clone)]
pub enum ProcessorError {
    #[error("Stripe API error ({status}): {message}")]
    Api {
        status: u16,
        code: Option<String>,
        param: Option<String>,
        message: String,
    },

    #[error("Stripe request failed: {0}")]
    Transport(String),

    #[error("Unexpected Stripe response: {0}")]
    Decode(String),

    #[error("Unrecognized payment id: {0}")]
    UnknownPaymentId(String),
}

/// Structured codes Stripe returns when an amount is below the allowed minimum.
const AMOUNT_PRECONDITION_CODES: &[&str] = &["amount_too_small"];

/// Free-text fallback for the same precondition. Stripe does not guarantee this wording.
const AMOUNT_PRECONDITION_MESSAGE: &str = "must be greater than";

impl ProcessorError {
    pub fn code(&self) -> Option<&str> {
        match self {
            ProcessorError::Api { code, .. } => code.as_deref(),
            _ => None,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            ProcessorError::Api { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// Human readable reason stored on the failed entity
    pub fn reason(&self) -> String {
        match self {
            ProcessorError::Api { message, .. } => message.clone(),
            other => other.to_string(),
        }
    }

    /// True when the processor rejected the call because the amount is not positive.
    ///
    /// The structured code is checked first; the message match only applies to
    /// `parameter_invalid_integer` errors on the `amount` parameter or to errors
    /// carrying no code at all.
    pub fn is_amount_precondition(&self) -> bool {
        let ProcessorError::Api {
            code,
            param,
            message,
            ..
        } = self
        else {
            return false;
        };

        match code.as_deref() {
            Some(code) if AMOUNT_PRECONDITION_CODES.contains(&code) => true,
            Some("parameter_invalid_integer") => {
                param.as_deref() == Some("amount") && message.contains(AMOUNT_PRECONDITION_MESSAGE)
            }
            Some(_) => false,
            None => message.contains(AMOUNT_PRECONDITION_MESSAGE),
        }
    }
}

impl From<reqwest::Error> for ProcessorError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            ProcessorError::Decode(error.to_string())
        } else {
            ProcessorError::Transport(error.to_string())
        }
    }
}

/// Errors returned by the marketplace API
#[derive(Error, Debug, Clone)]
pub enum MarketplaceError {
    #[error("Mirakl API error ({status}): {body}")]
    Api { status: u16, body: String },

    #[error("Mirakl request failed: {0}")]
    Transport(String),

    #[error("Unexpected Mirakl response: {0}")]
    Decode(String),
}

impl MarketplaceError {
    /// Raw response body when the API answered, the error text otherwise
    pub fn body(&self) -> String {
        match self {
            MarketplaceError::Api { body, .. } => body.clone(),
            other => other.to_string(),
        }
    }
}

impl From<reqwest::Error> for MarketplaceError {
    fn from(error: reqwest::Error) -> Self {
        if error.is_decode() {
            MarketplaceError::Decode(error.to_string())
        } else {
            MarketplaceError::Transport(error.to_string())
        }
    }
}

/// Webhook authentication errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Invalid webhook signature")]
    SignatureInvalid,

    #[error("Invalid webhook payload: {0}")]
    PayloadInvalid(String),
}

/// KYC derivation errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum KycError {
    #[error("Ambiguous KYC state for account {account_id}")]
    AmbiguousState { account_id: String },
}

/// Raised when a state machine is asked to leave a terminal status
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{entity} {id} cannot move from {from} to {to}")]
pub struct TransitionError {
    pub entity: &'static str,
    pub id: String,
    pub from: String,
    pub to: String,
}

/// API error response structure
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_code, message) = match &self {
            AppError::Signature(SignatureError::SignatureInvalid) => (
                StatusCode::BAD_REQUEST,
                "SIGNATURE_INVALID",
                self.to_string(),
            ),
            AppError::Signature(SignatureError::PayloadInvalid(_)) => (
                StatusCode::BAD_REQUEST,
                "PAYLOAD_INVALID",
                self.to_string(),
            ),
            AppError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", self.to_string()),
            AppError::NotFound(_) => (StatusCode::NOT_FOUND, "NOT_FOUND", self.to_string()),
            AppError::Kyc(_) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                "AMBIGUOUS_KYC_STATE",
                self.to_string(),
            ),
            AppError::Database(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "DATABASE_ERROR",
                "A database error occurred".to_string(),
            ),
            _ => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                "An internal error occurred".to_string(),
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            error_code: error_code.to_string(),
        });

        (status, body).into_response()
    }
}

impl From<MigrateError> for AppError {
    fn from(error: MigrateError) -> Self {
        AppError::Internal(format!("Migration error: {:?}", error))
    }
}

impl From<serde_json::Error> for AppError {
    fn from(error: serde_json::Error) -> Self {
        AppError::Internal(format!("JSON error: {:?}", error))
    }
}

/// Result type alias for the application
pub type AppResult<T> = Result<T, AppError>;
