//! Wire-level errors.

use std::io;

use thiserror::Error;

use super::scram::ScramError;
use crate::error::{Error, SqlError};

pub type PgResult<T> = Result<T, PgError>;

#[derive(Error, Debug)]
pub enum PgError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Malformed or unexpected traffic.
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Authentication failed: {0}")]
    Scram(#[from] ScramError),

    /// ErrorResponse from the server.
    #[error(transparent)]
    Server(SqlError),

    #[error("Connection is closed")]
    ConnectionClosed,
}

/// Server errors stay SQL errors; anything else leaves the link unusable.
impl From<PgError> for Error {
    fn from(e: PgError) -> Self {
        match e {
            PgError::Server(sql) => Error::Sql(sql),
            other => Error::Connection(other.to_string()),
        }
    }
}
