//! Error types for the relib core.

use thiserror::Error;

/// All possible errors from the relational core.
///
/// Messages carry the table name and offending fields inline so that a
/// failed integrity check can be traced to a single row without replaying
/// the operation.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    /// Programmer misuse: bad table name, missing key fields in a lookup,
    /// declaring a primary key twice, and so on. Never caught internally.
    #[error("table error: {0}")]
    Table(String),

    /// A row violates a primary key, unique or foreign key constraint.
    #[error("constraint violation: {0}")]
    Constraint(String),

    /// A row fails its table's schema.
    #[error("schema check failed: {0}")]
    Schema(String),

    /// The backend has no data under the requested relative path.
    #[error("backend file not found: {0}")]
    BackendFileNotFound(String),

    /// Transport or I/O failure inside a backend.
    #[error("backend error: {0}")]
    Backend(String),
}

/// Result type for relib operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::Table("no table named 'tiers'".into());
        assert_eq!(err.to_string(), "table error: no table named 'tiers'");

        let err = Error::Constraint("Primary key violation in table 'tiers': LIVENORTH".into());
        assert_eq!(
            err.to_string(),
            "constraint violation: Primary key violation in table 'tiers': LIVENORTH"
        );

        let err = Error::BackendFileNotFound("#tsmeta.json".into());
        assert_eq!(err.to_string(), "backend file not found: #tsmeta.json");
    }
}
