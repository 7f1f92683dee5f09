//! Error types for Tidepool
//!
//! All remote-call failures are converted to `AppError` at the
//! coordinator/service boundary, so the rendering layer never sees
//! an unclassified fault. `AppError::to_notice` produces the
//! non-blocking, user-visible form of an error.

use thiserror::Error;

use crate::gateway::GatewayError;

/// Application-wide error type
///
/// This enum represents the full error taxonomy of the sync core.
/// Each variant maps to a distinct user-visible behaviour:
/// validation errors never reach the network, conflicts and network
/// errors roll back optimistic state, permission errors ask the
/// user to sign in.
#[derive(Debug, Error)]
pub enum AppError {
    /// Client-detectable validation failure; no remote call is made
    #[error("Validation error: {0}")]
    Validation(String),

    /// Unique-constraint violation reported by the backend
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Mutation or subscription attempted without a session
    #[error("Authentication required")]
    Unauthorized,

    /// Entity no longer exists remotely (deleted concurrently)
    #[error("Resource not found")]
    NotFound,

    /// Timeout or unreachable backend; the action stays re-triggerable
    #[error("Network error: {0}")]
    Network(String),

    /// Backend responded in a way the binding could not interpret
    #[error("Gateway error: {0}")]
    Gateway(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::Config(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(anyhow::Error::new(err))
    }
}

impl From<GatewayError> for AppError {
    fn from(err: GatewayError) -> Self {
        match err {
            GatewayError::NotFound => AppError::NotFound,
            GatewayError::Conflict(msg) => AppError::Conflict(msg),
            GatewayError::PermissionDenied => AppError::Unauthorized,
            GatewayError::Unreachable(msg) => AppError::Network(msg),
            GatewayError::Malformed(msg) => AppError::Gateway(msg),
        }
    }
}

impl AppError {
    /// Stable kind label used for metrics and logging
    pub fn kind(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "validation",
            AppError::Conflict(_) => "conflict",
            AppError::Unauthorized => "unauthorized",
            AppError::NotFound => "not_found",
            AppError::Network(_) => "network",
            AppError::Gateway(_) => "gateway",
            AppError::Config(_) => "config",
            AppError::Internal(_) => "internal",
        }
    }

    /// Convert error to a user-visible notice
    ///
    /// Maps each error variant to the message a view would show as
    /// a transient toast. Conflicts keep their specific, actionable
    /// message; everything unexpected collapses to a generic one.
    pub fn to_notice(&self) -> Notice {
        use crate::metrics::ERRORS_TOTAL;
        ERRORS_TOTAL.with_label_values(&[self.kind()]).inc();

        let message = match self {
            AppError::Validation(msg) => msg.clone(),
            AppError::Conflict(msg) => msg.clone(),
            AppError::Unauthorized => "Please sign in to continue.".to_string(),
            AppError::NotFound => "That content is no longer available.".to_string(),
            AppError::Network(_) => {
                "Something went wrong. Check your connection and try again.".to_string()
            }
            AppError::Gateway(_) | AppError::Config(_) | AppError::Internal(_) => {
                "Something went wrong. Please try again.".to_string()
            }
        };

        Notice {
            severity: Severity::Error,
            message,
        }
    }
}

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Severity of a user-visible notice
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Info,
    Error,
}

/// Non-blocking, user-visible notification
///
/// Broadcast on the client's notice channel; a view layer would
/// render these as transient toasts. Errors surface exactly once
/// per failed mutation.
#[derive(Debug, Clone)]
pub struct Notice {
    pub severity: Severity,
    pub message: String,
}

impl Notice {
    pub fn info(message: impl Into<String>) -> Self {
        Notice {
            severity: Severity::Info,
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gateway_errors_map_onto_taxonomy() {
        assert!(matches!(
            AppError::from(GatewayError::NotFound),
            AppError::NotFound
        ));
        assert!(matches!(
            AppError::from(GatewayError::Conflict("dup".to_string())),
            AppError::Conflict(_)
        ));
        assert!(matches!(
            AppError::from(GatewayError::PermissionDenied),
            AppError::Unauthorized
        ));
        assert!(matches!(
            AppError::from(GatewayError::Unreachable("offline".to_string())),
            AppError::Network(_)
        ));
    }

    #[test]
    fn notices_keep_actionable_conflict_messages() {
        let notice = AppError::Conflict("Username is already taken.".to_string()).to_notice();
        assert_eq!(notice.severity, Severity::Error);
        assert_eq!(notice.message, "Username is already taken.");

        let generic = AppError::Network("connect timeout".to_string()).to_notice();
        assert!(!generic.message.contains("timeout"));
    }
}
