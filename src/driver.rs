//! Boundary between connections and the database driver.
//!
//! A [`Connector`] opens [`Driver`] handles; a driver speaks text in and text
//! out and knows nothing about converters. The bundled implementation is
//! [`crate::pg::PgConnector`].

use std::sync::Arc;

use crate::config::DatabaseConfig;
use crate::error::Result;
use crate::pg::types::Oid;

/// Transaction status reported by the server after every round trip.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    /// Not in a transaction block.
    Idle,
    /// In a transaction block.
    InTransaction,
    /// In a failed transaction block; only rollback is accepted.
    Failed,
}

impl TransactionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            TransactionStatus::Idle => "idle",
            TransactionStatus::InTransaction => "in transaction",
            TransactionStatus::Failed => "in a failed transaction",
        }
    }
}

/// A bound parameter: its wire text plus the type hint used when preparing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireParam {
    pub value: Option<String>,
    pub type_hint: Oid,
}

impl WireParam {
    pub fn new(value: Option<String>, type_hint: Oid) -> Self {
        Self { value, type_hint }
    }

    pub fn untyped(value: Option<String>) -> Self {
        Self::new(value, Oid::UNSPECIFIED)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawColumn {
    pub name: String,
    /// Canonical type name (`int4`, `text[]`, `public.book`).
    pub type_name: String,
}

impl RawColumn {
    pub fn new(name: impl Into<String>, type_name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            type_name: type_name.into(),
        }
    }
}

pub type SharedColumns = Arc<Vec<RawColumn>>;

/// Unconverted result of one statement.
#[derive(Debug, Clone, PartialEq)]
pub struct RawResult {
    pub columns: SharedColumns,
    pub rows: Vec<Vec<Option<String>>>,
    /// Command tag, e.g. `SELECT 5` or `INSERT 0 1`.
    pub command_tag: String,
}

impl RawResult {
    pub fn new(columns: SharedColumns) -> Self {
        Self {
            columns,
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }

    pub fn empty() -> Self {
        Self::new(Arc::new(Vec::new()))
    }

    /// Rows affected according to the command tag; the trailing number of
    /// `INSERT 0 n`, `UPDATE n`, `DELETE n`, `SELECT n`.
    pub fn rows_affected(&self) -> u64 {
        self.command_tag
            .rsplit(' ')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Asynchronous notification received through `LISTEN`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub process_id: i32,
    pub channel: String,
    pub payload: String,
}

/// A live, exclusively owned database handle.
pub trait Driver: Send {
    /// Prepare `sql` under the server-side name `name`.
    fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()>;

    /// Execute the prepared statement `name`.
    fn execute(&mut self, name: &str, params: &[WireParam]) -> Result<RawResult>;

    /// Run one or more `;` separated statements without parameters.
    fn simple_query(&mut self, sql: &str) -> Result<Vec<RawResult>>;

    /// Release the prepared statement `name`.
    fn deallocate(&mut self, name: &str) -> Result<()>;

    fn transaction_status(&self) -> TransactionStatus;

    /// Drain notifications received so far.
    fn take_notifications(&mut self) -> Vec<Notification>;

    fn close(&mut self) -> Result<()>;
}

/// Opens driver handles.
pub trait Connector: Send + Sync {
    fn connect(&self, config: &DatabaseConfig) -> Result<Box<dyn Driver>>;
}
