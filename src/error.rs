//! Error types for the commander.

use thiserror::Error;

use crate::notify::ChangeKind;
use crate::value::DbType;

/// Main error type for commander operations.
///
/// Everything except [`CommanderError::Provider`] and
/// [`CommanderError::ConcurrencyViolation`] is a programmer error detected
/// before any statement reaches the provider.
#[derive(Error, Debug)]
pub enum CommanderError {
    /// Parallel name/value arrays of unequal length.
    #[error("Arity mismatch in {what}: expected {expected} values, got {actual}")]
    ArityMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },

    /// Table has no column that can be used for default ordering.
    #[error("Table [{0}] has no sortable field")]
    NoSortableField(String),

    /// Table does not have exactly one primary key column.
    #[error("Table [{table}] has not a single primary field ({found} key columns)")]
    NotSinglePrimaryKey { table: String, found: usize },

    /// Table has no primary key (required to apply modified/deleted rows)
    #[error("Table [{0}] has no primary key - synchronization requires primary keys")]
    NoPrimaryKey(String),

    /// Column name not present in a table.
    #[error("Table [{table}] has no column [{column}]")]
    UnknownColumn { table: String, column: String },

    /// Row index past the end of an in-memory table.
    #[error("Table [{table}] has no row {row}")]
    RowOutOfRange { table: String, row: usize },

    /// No canonical type mapping or coercion path.
    #[error("Unsupported type: cannot convert {value} to {target:?}")]
    UnsupportedType { value: String, target: DbType },

    /// Identifier that cannot be quoted safely.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A synchronized row update or delete matched nothing in the database.
    #[error("Concurrency violation: {kind:?} of a row in [{table}] affected no rows")]
    ConcurrencyViolation { table: String, kind: ChangeKind },

    /// Required configuration value is absent.
    #[error("Missing configuration: {0}")]
    MissingConfiguration(&'static str),

    /// Failure surfaced by the backend, passed through untouched.
    #[error(transparent)]
    Provider(anyhow::Error),
}

impl CommanderError {
    /// Create an ArityMismatch error
    pub fn arity(what: &'static str, expected: usize, actual: usize) -> Self {
        CommanderError::ArityMismatch {
            what,
            expected,
            actual,
        }
    }

    /// Create an UnsupportedType error for a value that has no path to `target`
    pub fn unsupported(value: impl std::fmt::Debug, target: DbType) -> Self {
        CommanderError::UnsupportedType {
            value: format!("{:?}", value),
            target,
        }
    }

    /// Wrap a backend error without adding context.
    pub fn provider<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        CommanderError::Provider(anyhow::Error::new(err))
    }

    /// The backend error, if this is a provider failure.
    pub fn as_provider(&self) -> Option<&anyhow::Error> {
        match self {
            CommanderError::Provider(err) => Some(err),
            _ => None,
        }
    }

    /// True for errors raised before the provider was involved.
    pub fn is_programmer_error(&self) -> bool {
        !matches!(
            self,
            CommanderError::Provider(_) | CommanderError::ConcurrencyViolation { .. }
        )
    }
}

/// Result type alias for commander operations.
pub type Result<T> = std::result::Result<T, CommanderError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_error_is_transparent() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk on fire");
        let err = CommanderError::provider(io);
        assert_eq!(err.to_string(), "disk on fire");
        assert!(!err.is_programmer_error());
        let inner = err.as_provider().unwrap();
        assert!(inner.downcast_ref::<std::io::Error>().is_some());
    }

    #[test]
    fn test_concurrency_violation_is_not_a_programmer_error() {
        let err = CommanderError::ConcurrencyViolation {
            table: "T".to_string(),
            kind: ChangeKind::Delete,
        };
        assert!(!err.is_programmer_error());
        assert_eq!(
            err.to_string(),
            "Concurrency violation: Delete of a row in [T] affected no rows"
        );
    }

    #[test]
    fn test_arity_message() {
        let err = CommanderError::arity("condition values", 2, 1);
        assert!(err.is_programmer_error());
        assert_eq!(
            err.to_string(),
            "Arity mismatch in condition values: expected 2 values, got 1"
        );
    }
}
