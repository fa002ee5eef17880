//! Query filter chain.
//!
//! Every query goes through an ordered list of [`Filter`]s. A filter gets the
//! shared [`QueryContext`] and a [`Next`] handle for the rest of the chain;
//! it either passes control on with [`Next::run`] or answers by itself.
//! [`ExecuteFilter`] sits at the end of every connection's chain and does
//! the actual prepare, bind and execute.
//!
//! `Next` is consumed when run, so a filter cannot run the tail twice, and
//! the position in the chain lives in the handle rather than in the chain.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::converter::ConverterRegistry;
use crate::driver::{Driver, WireParam};
use crate::error::{ContractViolation, Error, Result};
use crate::pg::types::Oid;
use crate::row::ResultSet;
use crate::statement::StatementPool;
use crate::value::Value;

// ============================================================================
// Parameters and context
// ============================================================================

/// A query parameter: a native value plus the type it is converted as.
///
/// Without an explicit type the value's natural type is used (`int8` for
/// integers, `text[]` for an array of strings, ...).
#[derive(Debug, Clone, PartialEq)]
pub struct Param {
    pub value: Value,
    pub type_name: Option<String>,
}

impl Param {
    pub fn new(value: impl Into<Value>) -> Self {
        Self {
            value: value.into(),
            type_name: None,
        }
    }

    pub fn typed(value: impl Into<Value>, type_name: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            type_name: Some(type_name.into()),
        }
    }

    /// Wire text and bind hint. Integers and booleans carry an explicit type
    /// so the server does not have to guess from the text.
    pub fn to_wire(&self, registry: &ConverterRegistry) -> Result<WireParam> {
        let hint = match self.value {
            Value::Int(_) => Oid::INT8,
            Value::Bool(_) => Oid::BOOL,
            _ => Oid::UNSPECIFIED,
        };
        if self.value.is_null() {
            return Ok(WireParam::new(None, hint));
        }

        let type_name = self
            .type_name
            .clone()
            .or_else(|| self.value.natural_type())
            .ok_or_else(|| {
                Error::conversion(
                    self.value.kind(),
                    format!("{:?}", self.value),
                    "no type given and none can be inferred",
                )
            })?;
        Ok(WireParam::new(registry.to_wire(&type_name, &self.value)?, hint))
    }
}

impl From<Value> for Param {
    fn from(value: Value) -> Self {
        Self::new(value)
    }
}

/// State shared by the filters of one query.
pub struct QueryContext<'a> {
    /// SQL text; `$*` markers are numbered when the statement is prepared.
    pub sql: String,
    pub params: Vec<Param>,
    driver: &'a mut dyn Driver,
    statements: &'a mut StatementPool,
    registry: &'a ConverterRegistry,
}

impl<'a> QueryContext<'a> {
    pub fn new(
        sql: impl Into<String>,
        params: Vec<Param>,
        driver: &'a mut dyn Driver,
        statements: &'a mut StatementPool,
        registry: &'a ConverterRegistry,
    ) -> Self {
        Self {
            sql: sql.into(),
            params,
            driver,
            statements,
            registry,
        }
    }

    pub fn registry(&self) -> &ConverterRegistry {
        self.registry
    }

    pub fn statements(&self) -> &StatementPool {
        &*self.statements
    }
}

impl fmt::Debug for QueryContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueryContext")
            .field("sql", &self.sql)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Chain
// ============================================================================

pub trait Filter: Send {
    fn execute(&mut self, ctx: &mut QueryContext<'_>, next: Next<'_>) -> Result<ResultSet>;

    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// The filters left to run.
pub struct Next<'c> {
    filters: &'c mut [Box<dyn Filter>],
}

impl Next<'_> {
    /// Run the next filter. Fails with [`ContractViolation::ChainOverrun`]
    /// when the chain is exhausted.
    pub fn run(self, ctx: &mut QueryContext<'_>) -> Result<ResultSet> {
        match self.filters.split_first_mut() {
            Some((filter, rest)) => filter.execute(ctx, Next { filters: rest }),
            None => Err(ContractViolation::ChainOverrun.into()),
        }
    }

    pub fn remaining(&self) -> usize {
        self.filters.len()
    }
}

/// Filters in execution order. The most recently registered one runs first.
#[derive(Default)]
pub struct FilterChain {
    filters: Vec<Box<dyn Filter>>,
}

impl FilterChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_filter<F: Filter + 'static>(&mut self, filter: F) {
        self.register_boxed(Box::new(filter));
    }

    pub fn register_boxed(&mut self, filter: Box<dyn Filter>) {
        debug!(filter = filter.name(), "registered filter");
        self.filters.insert(0, filter);
    }

    pub fn execute(&mut self, ctx: &mut QueryContext<'_>) -> Result<ResultSet> {
        Next {
            filters: &mut self.filters,
        }
        .run(ctx)
    }

    pub fn len(&self) -> usize {
        self.filters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.filters.is_empty()
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.filters.iter().map(|f| f.name()).collect()
    }
}

impl fmt::Debug for FilterChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

// ============================================================================
// Built-in filters
// ============================================================================

/// Terminal filter: convert the parameters, fetch or prepare the statement,
/// execute it and convert the rows. Never calls the rest of the chain.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExecuteFilter;

impl Filter for ExecuteFilter {
    fn execute(&mut self, ctx: &mut QueryContext<'_>, _next: Next<'_>) -> Result<ResultSet> {
        let registry = ctx.registry;
        let params = ctx
            .params
            .iter()
            .map(|p| p.to_wire(registry))
            .collect::<Result<Vec<_>>>()?;

        let statement = ctx
            .statements
            .get_or_prepare(&mut *ctx.driver, &ctx.sql, &params)?;
        let raw = statement.execute(&mut *ctx.driver, &params)?;
        ResultSet::from_raw(raw, registry)
    }

    fn name(&self) -> &'static str {
        "execute"
    }
}

/// One executed query as seen by [`LoggerFilter`].
#[derive(Debug, Clone, PartialEq)]
pub struct QueryLogEntry {
    pub sql: String,
    pub params: Vec<Value>,
    pub rows: usize,
    pub elapsed: Duration,
    /// SQLSTATE of a failed query.
    pub sqlstate: Option<String>,
    pub error: Option<String>,
}

impl QueryLogEntry {
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }
}

/// Bounded, shared query log. Clones see the same entries.
#[derive(Debug, Clone)]
pub struct QueryLog {
    entries: Arc<Mutex<VecDeque<QueryLogEntry>>>,
    capacity: usize,
}

impl QueryLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            entries: Arc::new(Mutex::new(VecDeque::with_capacity(capacity.min(64)))),
            capacity: capacity.max(1),
        }
    }

    fn push(&self, entry: QueryLogEntry) {
        let mut entries = self.entries.lock();
        if entries.len() == self.capacity {
            entries.pop_front();
        }
        entries.push_back(entry);
    }

    /// Entries, oldest first.
    pub fn entries(&self) -> Vec<QueryLogEntry> {
        self.entries.lock().iter().cloned().collect()
    }

    pub fn last(&self) -> Option<QueryLogEntry> {
        self.entries.lock().back().cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn total_time(&self) -> Duration {
        self.entries.lock().iter().map(|e| e.elapsed).sum()
    }

    pub fn clear(&self) {
        self.entries.lock().clear();
    }
}

/// Times the rest of the chain and records every query.
#[derive(Debug, Clone)]
pub struct LoggerFilter {
    log: QueryLog,
}

impl LoggerFilter {
    pub fn new(capacity: usize) -> Self {
        Self {
            log: QueryLog::new(capacity),
        }
    }

    /// Handle on the log, usable after the filter moved into a chain.
    pub fn log(&self) -> QueryLog {
        self.log.clone()
    }
}

impl Default for LoggerFilter {
    fn default() -> Self {
        Self::new(256)
    }
}

impl Filter for LoggerFilter {
    fn execute(&mut self, ctx: &mut QueryContext<'_>, next: Next<'_>) -> Result<ResultSet> {
        let sql = ctx.sql.clone();
        let params: Vec<Value> = ctx.params.iter().map(|p| p.value.clone()).collect();
        let start = Instant::now();

        let result = next.run(ctx);

        let elapsed = start.elapsed();
        let elapsed_ms = elapsed.as_secs_f64() * 1000.0;
        let entry = match &result {
            Ok(rows) => {
                debug!(sql = %sql, params = params.len(), rows = rows.len(), elapsed_ms, "query");
                QueryLogEntry {
                    sql,
                    params,
                    rows: rows.len(),
                    elapsed,
                    sqlstate: None,
                    error: None,
                }
            }
            Err(e) => {
                let sqlstate = e.sqlstate().map(str::to_string);
                warn!(
                    sql = %sql,
                    sqlstate = sqlstate.as_deref().unwrap_or(""),
                    error = %e,
                    elapsed_ms,
                    "query failed"
                );
                QueryLogEntry {
                    sql,
                    params,
                    rows: 0,
                    elapsed,
                    sqlstate,
                    error: Some(e.to_string()),
                }
            }
        };
        self.log.push(entry);
        result
    }

    fn name(&self) -> &'static str {
        "logger"
    }
}
