//! Error types for permgate

use thiserror::Error;

/// Result type alias using permgate's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for permgate
#[derive(Error, Debug)]
pub enum Error {
    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // Storage Errors
    #[error("Storage error: {0}")]
    Storage(String),

    // Authorization Errors
    #[error("Permission denied for {operation} on {object}: {reason}")]
    PermissionDenied {
        object: String,
        operation: String,
        reason: String,
        rule: Option<String>,
    },

    // Filter translation
    #[error("Translation error: {0}")]
    Translation(#[from] TranslationError),

    // Formula parsing
    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A condition that cannot be expressed as a query filter.
///
/// Kept apart from "no restriction" so callers can fall back to in-memory
/// evaluation instead of admitting every row.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TranslationError {
    #[error("unsupported formula '{formula}': {reason}")]
    UnsupportedFormula { formula: String, reason: String },

    #[error("unsupported operator '{0}'")]
    UnsupportedOperator(String),
}

impl Error {
    /// Build a denial error from a decision's reason and rule
    pub fn denied(
        object: impl Into<String>,
        operation: impl Into<String>,
        reason: impl Into<String>,
        rule: Option<String>,
    ) -> Self {
        Self::PermissionDenied {
            object: object.into(),
            operation: operation.into(),
            reason: reason.into(),
            rule,
        }
    }

    /// HTTP status code for each error type
    #[must_use]
    pub fn status_code(&self) -> u16 {
        match self {
            Self::PermissionDenied { .. } => 403,
            Self::Translation(_) | Self::Expression(_) | Self::Json(_) => 400,
            Self::Unsupported(_) => 501,
            Self::Config(_) | Self::Storage(_) | Self::Io(_) => 500,
        }
    }

    /// Stable error code for API responses
    #[must_use]
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Config(_) => "config_error",
            Self::Storage(_) => "storage_error",
            Self::PermissionDenied { .. } => "permission_denied",
            Self::Translation(_) => "translation_error",
            Self::Expression(_) => "expression_error",
            Self::Unsupported(_) => "unsupported",
            Self::Json(_) => "json_error",
            Self::Io(_) => "io_error",
        }
    }

    /// Whether this error is a permission denial
    #[must_use]
    pub fn is_denied(&self) -> bool {
        matches!(self, Self::PermissionDenied { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(Error::Config("x".into()).status_code(), 500);
        assert_eq!(Error::denied("users", "read", "nope", None).status_code(), 403);
        assert_eq!(Error::Expression("bad".into()).status_code(), 400);
    }

    #[test]
    fn test_denied_message_carries_reason_and_rule() {
        let err = Error::denied("users", "update", "no record rules matched", Some("own".into()));
        assert!(err.is_denied());
        assert_eq!(err.error_code(), "permission_denied");
        assert!(err.to_string().contains("no record rules matched"));
        match err {
            Error::PermissionDenied { rule, .. } => assert_eq!(rule.as_deref(), Some("own")),
            _ => unreachable!(),
        }
    }

    #[test]
    fn test_translation_error_converts() {
        let err: Error = TranslationError::UnsupportedOperator("like".into()).into();
        assert_eq!(err.error_code(), "translation_error");
    }
}
