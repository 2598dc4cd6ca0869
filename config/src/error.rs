//! Unified error handling for the configuration layer.

use crate::reconcile::PushResult;

/// Errors from the configuration layer.
///
/// Core storage failures pass through as [`ConfigError::Relib`]; the
/// variants here cover resolution, reconciliation and tenant lookups.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Relib(#[from] relib::Error),

    /// No default store could be resolved, or a named domain entity was
    /// not found where one was required.
    #[error("config not found: {0}")]
    ConfigNotFound(String),

    /// The requested tenant is absent from the store.
    #[error("tenant not configured: {0}")]
    TenantNotConfigured(String),

    /// A push or pull failed during a transaction. Carries the push
    /// reconciliation result when one was produced, so the caller can
    /// diff, rebase and retry.
    #[error("transaction failed: {message}")]
    Transaction {
        message: String,
        push: Option<PushResult>,
    },

    /// No backend is registered for the URL scheme.
    #[error("no backend registered to handle '{0}'")]
    UnknownScheme(String),

    /// The backend URL does not parse.
    #[error("invalid backend url '{url}': {message}")]
    InvalidUrl { url: String, message: String },
}

/// Result type alias for the configuration layer.
pub type Result<T> = std::result::Result<T, ConfigError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = ConfigError::ConfigNotFound("no config in ~/.drift/config".into());
        assert_eq!(
            err.to_string(),
            "config not found: no config in ~/.drift/config"
        );

        let err = ConfigError::UnknownScheme("gopher://x".into());
        assert_eq!(err.to_string(), "no backend registered to handle 'gopher://x'");

        let relib_err = relib::Error::BackendFileNotFound("#tsmeta.json".into());
        let err: ConfigError = relib_err.into();
        assert!(matches!(err, ConfigError::Relib(_)));
    }
}
