use std::{
    fmt::{Display, Formatter},
    str::FromStr,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::models::{
    notification::Channel,
    vendor::{FailureDiagnostic, Vendor, VendorDiagnostic},
};

/// Stable, wire-visible error codes. Every [`DispatchError`] maps onto exactly
/// one code and every code parses back from its string form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidPayload,
    InvalidChannel,
    VendorUnavailable,
    VendorRateLimited,
    VendorAuthError,
    VendorInvalidRequest,
    CircuitOpen,
    FailoverExhausted,
    TemplateNotFound,
    TemplateInvalid,
    DeliveryFailed,
    MaxRetriesExceeded,
    InvalidArgument,
    NotFound,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Validation,
    Vendor,
    Lifecycle,
    Queue,
    Internal,
}

impl ErrorCode {
    pub const ALL: [ErrorCode; 15] = [
        ErrorCode::InvalidPayload,
        ErrorCode::InvalidChannel,
        ErrorCode::VendorUnavailable,
        ErrorCode::VendorRateLimited,
        ErrorCode::VendorAuthError,
        ErrorCode::VendorInvalidRequest,
        ErrorCode::CircuitOpen,
        ErrorCode::FailoverExhausted,
        ErrorCode::TemplateNotFound,
        ErrorCode::TemplateInvalid,
        ErrorCode::DeliveryFailed,
        ErrorCode::MaxRetriesExceeded,
        ErrorCode::InvalidArgument,
        ErrorCode::NotFound,
        ErrorCode::Internal,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::InvalidPayload => "INVALID_PAYLOAD",
            ErrorCode::InvalidChannel => "INVALID_CHANNEL",
            ErrorCode::VendorUnavailable => "VENDOR_UNAVAILABLE",
            ErrorCode::VendorRateLimited => "VENDOR_RATE_LIMITED",
            ErrorCode::VendorAuthError => "VENDOR_AUTH_ERROR",
            ErrorCode::VendorInvalidRequest => "VENDOR_INVALID_REQUEST",
            ErrorCode::CircuitOpen => "CIRCUIT_OPEN",
            ErrorCode::FailoverExhausted => "FAILOVER_EXHAUSTED",
            ErrorCode::TemplateNotFound => "TEMPLATE_NOT_FOUND",
            ErrorCode::TemplateInvalid => "TEMPLATE_INVALID",
            ErrorCode::DeliveryFailed => "DELIVERY_FAILED",
            ErrorCode::MaxRetriesExceeded => "MAX_RETRIES_EXCEEDED",
            ErrorCode::InvalidArgument => "INVALID_ARGUMENT",
            ErrorCode::NotFound => "NOT_FOUND",
            ErrorCode::Internal => "INTERNAL",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ErrorCode::InvalidPayload | ErrorCode::InvalidChannel | ErrorCode::InvalidArgument => {
                ErrorCategory::Validation
            }
            ErrorCode::VendorUnavailable
            | ErrorCode::VendorRateLimited
            | ErrorCode::VendorAuthError
            | ErrorCode::VendorInvalidRequest
            | ErrorCode::FailoverExhausted => ErrorCategory::Vendor,
            ErrorCode::CircuitOpen => ErrorCategory::Queue,
            ErrorCode::TemplateNotFound
            | ErrorCode::TemplateInvalid
            | ErrorCode::DeliveryFailed
            | ErrorCode::MaxRetriesExceeded
            | ErrorCode::NotFound => ErrorCategory::Lifecycle,
            ErrorCode::Internal => ErrorCategory::Internal,
        }
    }

    /// Whether a delivery round that ended with this code may be attempted again.
    pub fn is_retryable(&self) -> bool {
        match self {
            ErrorCode::VendorUnavailable
            | ErrorCode::VendorRateLimited
            | ErrorCode::VendorAuthError
            | ErrorCode::CircuitOpen
            | ErrorCode::FailoverExhausted
            | ErrorCode::Internal => true,
            ErrorCode::InvalidPayload
            | ErrorCode::InvalidChannel
            | ErrorCode::VendorInvalidRequest
            | ErrorCode::TemplateNotFound
            | ErrorCode::TemplateInvalid
            | ErrorCode::DeliveryFailed
            | ErrorCode::MaxRetriesExceeded
            | ErrorCode::InvalidArgument
            | ErrorCode::NotFound => false,
        }
    }
}

impl Display for ErrorCode {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown error code '{0}'")]
pub struct UnknownErrorCode(pub String);

impl FromStr for ErrorCode {
    type Err = UnknownErrorCode;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ErrorCode::ALL
            .into_iter()
            .find(|code| code.as_str() == s)
            .ok_or_else(|| UnknownErrorCode(s.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VendorErrorKind {
    Unavailable,
    RateLimited,
    Auth,
    InvalidRequest,
}

impl VendorErrorKind {
    pub fn code(&self) -> ErrorCode {
        match self {
            VendorErrorKind::Unavailable => ErrorCode::VendorUnavailable,
            VendorErrorKind::RateLimited => ErrorCode::VendorRateLimited,
            VendorErrorKind::Auth => ErrorCode::VendorAuthError,
            VendorErrorKind::InvalidRequest => ErrorCode::VendorInvalidRequest,
        }
    }
}

/// A vendor call failure, classified into exactly one kind and tagged with
/// where in the failover sequence it happened.
#[derive(Debug, Clone, Error, PartialEq, Serialize, Deserialize)]
#[error("{} from {vendor} on {channel} (failover attempt {failover_attempt}): {message}", .kind.code())]
pub struct VendorError {
    pub kind: VendorErrorKind,
    pub vendor: Vendor,
    pub channel: Channel,
    pub failover_attempt: u32,
    pub message: String,
}

impl VendorError {
    pub fn new(
        kind: VendorErrorKind,
        vendor: Vendor,
        channel: Channel,
        failover_attempt: u32,
        message: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            vendor,
            channel,
            failover_attempt,
            message: message.into(),
        }
    }

    pub fn unavailable(
        vendor: Vendor,
        channel: Channel,
        failover_attempt: u32,
        message: impl Into<String>,
    ) -> Self {
        Self::new(
            VendorErrorKind::Unavailable,
            vendor,
            channel,
            failover_attempt,
            message,
        )
    }

    pub fn code(&self) -> ErrorCode {
        self.kind.code()
    }
}

/// Outcome of a call guarded by a circuit breaker.
#[derive(Debug, Error)]
pub enum CircuitBreakerError<E> {
    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("Operation failed: {0}")]
    OperationFailed(E),

    #[error("Circuit breaker store error: {0}")]
    Store(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error("Invalid channel '{0}'")]
    InvalidChannel(String),

    #[error(transparent)]
    Vendor(#[from] VendorError),

    #[error("Circuit breaker is open for {component}")]
    CircuitOpen { component: String },

    #[error("No available vendor for {channel}: {}", summarize(.trail))]
    FailoverExhausted {
        channel: Channel,
        trail: Vec<VendorDiagnostic>,
    },

    #[error("Template '{template_id}' not found")]
    TemplateNotFound { template_id: String },

    #[error("Template '{template_id}' is invalid: {reason}")]
    TemplateInvalid { template_id: String, reason: String },

    #[error("Delivery of {notification_id} failed: {}", .diagnostic.message)]
    DeliveryFailed {
        notification_id: String,
        diagnostic: FailureDiagnostic,
    },

    #[error("Notification {notification_id} exhausted {attempts} of {max_retries} attempts")]
    MaxRetriesExceeded {
        notification_id: String,
        attempts: u32,
        max_retries: u32,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Notification {notification_id} not found")]
    NotFound { notification_id: String },

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

fn summarize(trail: &[VendorDiagnostic]) -> String {
    trail
        .iter()
        .map(|d| format!("{}={}({})", d.vendor, d.breaker.state.as_str(), d.reason.as_str()))
        .collect::<Vec<_>>()
        .join(", ")
}

impl DispatchError {
    pub fn code(&self) -> ErrorCode {
        match self {
            DispatchError::InvalidPayload(_) => ErrorCode::InvalidPayload,
            DispatchError::InvalidChannel(_) => ErrorCode::InvalidChannel,
            DispatchError::Vendor(e) => e.code(),
            DispatchError::CircuitOpen { .. } => ErrorCode::CircuitOpen,
            DispatchError::FailoverExhausted { .. } => ErrorCode::FailoverExhausted,
            DispatchError::TemplateNotFound { .. } => ErrorCode::TemplateNotFound,
            DispatchError::TemplateInvalid { .. } => ErrorCode::TemplateInvalid,
            DispatchError::DeliveryFailed { .. } => ErrorCode::DeliveryFailed,
            DispatchError::MaxRetriesExceeded { .. } => ErrorCode::MaxRetriesExceeded,
            DispatchError::InvalidArgument(_) => ErrorCode::InvalidArgument,
            DispatchError::NotFound { .. } => ErrorCode::NotFound,
            DispatchError::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Structured form persisted on the notification and surfaced by status queries.
    pub fn diagnostic(&self) -> FailureDiagnostic {
        let vendors = match self {
            DispatchError::FailoverExhausted { trail, .. } => trail.clone(),
            DispatchError::DeliveryFailed { diagnostic, .. } => diagnostic.vendors.clone(),
            _ => Vec::new(),
        };

        FailureDiagnostic {
            code: self.code(),
            message: self.to_string(),
            vendors,
        }
    }
}

impl<E: Into<DispatchError>> From<CircuitBreakerError<E>> for DispatchError {
    fn from(err: CircuitBreakerError<E>) -> Self {
        match err {
            CircuitBreakerError::CircuitOpen { component } => DispatchError::CircuitOpen { component },
            CircuitBreakerError::OperationFailed(e) => e.into(),
            CircuitBreakerError::Store(e) => DispatchError::Internal(e),
        }
    }
}

pub type DispatchResult<T> = Result<T, DispatchError>;
