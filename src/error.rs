//! Error types for pgbridge.
//!
//! Recoverable failures (SQL errors reported by the server, connection
//! failures) are kept apart from contract violations so callers can match on
//! the former without having to reason about the latter.

use thiserror::Error;

/// An error reported by the server while preparing or executing a statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SqlError {
    /// Five character SQLSTATE code (e.g. `23505`).
    pub sqlstate: String,
    /// Extended driver status (server severity, e.g. `ERROR`, `FATAL`).
    pub severity: String,
    /// Primary diagnostic message.
    pub message: String,
    pub detail: Option<String>,
    pub hint: Option<String>,
}

impl SqlError {
    pub fn new(sqlstate: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            sqlstate: sqlstate.into(),
            severity: "ERROR".to_string(),
            message: message.into(),
            detail: None,
            hint: None,
        }
    }

    pub fn sqlstate(&self) -> &str {
        &self.sqlstate
    }

    pub fn is_unique_violation(&self) -> bool {
        self.sqlstate == "23505"
    }

    pub fn is_foreign_key_violation(&self) -> bool {
        self.sqlstate == "23503"
    }

    pub fn is_serialization_failure(&self) -> bool {
        self.sqlstate == "40001"
    }

    /// `25P02`: the current transaction is aborted.
    pub fn is_in_failed_transaction(&self) -> bool {
        self.sqlstate == "25P02"
    }
}

impl std::fmt::Display for SqlError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.sqlstate)?;
        if let Some(d) = &self.detail {
            write!(f, "\nDetail: {}", d)?;
        }
        if let Some(h) = &self.hint {
            write!(f, "\nHint: {}", h)?;
        }
        Ok(())
    }
}

impl std::error::Error for SqlError {}

/// Caller misuse. These are never the result of server behaviour.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ContractViolation {
    #[error("Filter chain overrun: next() called past the last filter")]
    ChainOverrun,

    #[error("A transaction is already open on this connection")]
    AlreadyInTransaction,

    #[error("Not in a transaction")]
    NotInTransaction,

    #[error("Cannot {operation} while the connection is {state}")]
    InvalidTransactionState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Entity '{0}' has an empty primary key, it cannot be identity mapped")]
    EmptyPrimaryKey(String),

    #[error("Entity kind mismatch: map handles '{expected}', got '{actual}'")]
    EntityKindMismatch { expected: String, actual: String },

    #[error("Unknown field '{field}' on '{kind}'")]
    UnknownField { kind: String, field: String },

    #[error("Query expects {expected} parameters, {actual} given")]
    ParameterCountMismatch { expected: usize, actual: usize },
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database connection error: {0}")]
    Connection(String),

    #[error("SQL error: {0}")]
    Sql(SqlError),

    #[error("Cannot convert {value:?} as '{type_name}': {reason}")]
    Conversion {
        type_name: String,
        value: String,
        reason: String,
    },

    #[error("No converter registered for '{0}'")]
    ConverterNotFound(String),

    #[error("Contract violation: {0}")]
    Contract(#[from] ContractViolation),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub(crate) fn conversion(
        type_name: impl Into<String>,
        value: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Conversion {
            type_name: type_name.into(),
            value: value.into(),
            reason: reason.into(),
        }
    }

    /// The server error, if this is one.
    pub fn as_sql(&self) -> Option<&SqlError> {
        match self {
            Error::Sql(e) => Some(e),
            _ => None,
        }
    }

    pub fn sqlstate(&self) -> Option<&str> {
        self.as_sql().map(SqlError::sqlstate)
    }

    pub fn is_recoverable(&self) -> bool {
        matches!(self, Error::Sql(_) | Error::Connection(_))
    }
}

impl From<SqlError> for Error {
    fn from(err: SqlError) -> Self {
        Error::Sql(err)
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sqlstate_is_independent_of_message() {
        let err: Error = SqlError::new("23505", "duplicate key value violates unique constraint").into();
        assert_eq!(err.sqlstate(), Some("23505"));
        assert!(err.as_sql().unwrap().is_unique_violation());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_contract_violations_are_not_recoverable() {
        let err: Error = ContractViolation::ChainOverrun.into();
        assert!(!err.is_recoverable());
        assert_eq!(err.sqlstate(), None);
        assert!(err.to_string().contains("overrun"));
    }

    #[test]
    fn test_sql_error_display() {
        let mut err = SqlError::new("42P01", "relation \"foo\" does not exist");
        err.hint = Some("create it first".to_string());
        let text = err.to_string();
        assert!(text.starts_with("ERROR: relation"));
        assert!(text.contains("(42P01)"));
        assert!(text.contains("Hint: create it first"));
    }
}
