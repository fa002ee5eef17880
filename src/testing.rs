//! In-memory driver for unit tests.
//!
//! [`MockConnector`] hands out [`MockDriver`]s sharing one call journal, so a
//! test can count prepares and executes after the fact. Transaction control
//! statements are interpreted the way the server would treat them; everything
//! else goes to a scriptable responder.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::DatabaseConfig;
use crate::driver::{
    Connector, Driver, Notification, RawColumn, RawResult, TransactionStatus, WireParam,
};
use crate::error::{Error, Result, SqlError};
use crate::pg::types::Oid;

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Connect,
    Prepare {
        name: String,
        sql: String,
        types: Vec<Oid>,
    },
    Execute {
        name: String,
        params: Vec<Option<String>>,
    },
    SimpleQuery(String),
    Deallocate(String),
    Close,
}

/// Answers executed statements: `(sql, params) -> result`.
pub type Responder = Arc<dyn Fn(&str, &[Option<String>]) -> Result<RawResult> + Send + Sync>;

struct MockState {
    calls: Vec<Call>,
    status: TransactionStatus,
    listening: BTreeSet<String>,
    notifications: Vec<Notification>,
}

#[derive(Clone)]
pub struct MockConnector {
    state: Arc<Mutex<MockState>>,
    responder: Responder,
    refuse: bool,
}

impl MockConnector {
    pub fn new() -> Self {
        Self::with_responder(|_, _| Ok(tagged("SELECT 0")))
    }

    pub fn with_responder<F>(responder: F) -> Self
    where
        F: Fn(&str, &[Option<String>]) -> Result<RawResult> + Send + Sync + 'static,
    {
        Self {
            state: Arc::new(Mutex::new(MockState {
                calls: Vec::new(),
                status: TransactionStatus::Idle,
                listening: BTreeSet::new(),
                notifications: Vec::new(),
            })),
            responder: Arc::new(responder),
            refuse: false,
        }
    }

    /// A connector whose server is unreachable.
    pub fn refusing() -> Self {
        Self {
            refuse: true,
            ..Self::new()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.state.lock().calls.iter().filter(|c| matches(c)).count()
    }

    pub fn prepares(&self) -> usize {
        self.count(|c| matches!(c, Call::Prepare { .. }))
    }

    pub fn executes(&self) -> usize {
        self.count(|c| matches!(c, Call::Execute { .. }))
    }

    pub fn connects(&self) -> usize {
        self.count(|c| matches!(c, Call::Connect))
    }

    pub fn deallocated(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::Deallocate(name) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }

    /// Statements sent through the simple query protocol, in order.
    pub fn simple_queries(&self) -> Vec<String> {
        self.state
            .lock()
            .calls
            .iter()
            .filter_map(|c| match c {
                Call::SimpleQuery(sql) => Some(sql.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn status(&self) -> TransactionStatus {
        self.state.lock().status
    }
}

impl Connector for MockConnector {
    fn connect(&self, _config: &DatabaseConfig) -> Result<Box<dyn Driver>> {
        self.state.lock().calls.push(Call::Connect);
        if self.refuse {
            return Err(Error::Connection(
                "could not connect to server: Connection refused".to_string(),
            ));
        }
        Ok(Box::new(MockDriver {
            state: Arc::clone(&self.state),
            responder: Arc::clone(&self.responder),
            statements: HashMap::new(),
        }))
    }
}

pub struct MockDriver {
    state: Arc<Mutex<MockState>>,
    responder: Responder,
    statements: HashMap<String, String>,
}

impl MockDriver {
    fn aborted() -> Error {
        sql_error(
            "25P02",
            "current transaction is aborted, commands ignored until end of transaction block",
        )
    }

    /// Run `f` and move an open transaction to the failed state if it errors.
    fn guarded(&self, f: impl FnOnce() -> Result<RawResult>) -> Result<RawResult> {
        if self.state.lock().status == TransactionStatus::Failed {
            return Err(Self::aborted());
        }
        let result = f();
        if result.is_err() {
            let mut state = self.state.lock();
            if state.status == TransactionStatus::InTransaction {
                state.status = TransactionStatus::Failed;
            }
        }
        result
    }

    /// Transaction control and LISTEN/NOTIFY, interpreted like the server.
    fn control(&self, sql: &str) -> Option<Result<RawResult>> {
        let upper = sql.trim().to_uppercase();
        let mut state = self.state.lock();
        let status = state.status;
        let failed = status == TransactionStatus::Failed;
        let no_block = |what: &str| {
            sql_error("25P01", &format!("{} can only be used in transaction blocks", what))
        };

        let outcome = if upper.starts_with("BEGIN") {
            if failed {
                Err(Self::aborted())
            } else {
                state.status = TransactionStatus::InTransaction;
                Ok(tagged("BEGIN"))
            }
        } else if upper == "COMMIT" {
            state.status = TransactionStatus::Idle;
            Ok(tagged(if failed { "ROLLBACK" } else { "COMMIT" }))
        } else if upper.starts_with("ROLLBACK TO SAVEPOINT") {
            if status == TransactionStatus::Idle {
                Err(no_block("ROLLBACK TO SAVEPOINT"))
            } else {
                state.status = TransactionStatus::InTransaction;
                Ok(tagged("ROLLBACK"))
            }
        } else if upper == "ROLLBACK" {
            state.status = TransactionStatus::Idle;
            Ok(tagged("ROLLBACK"))
        } else if upper.starts_with("SAVEPOINT") || upper.starts_with("RELEASE SAVEPOINT") {
            match status {
                TransactionStatus::Failed => Err(Self::aborted()),
                TransactionStatus::Idle => Err(no_block("SAVEPOINT")),
                TransactionStatus::InTransaction => Ok(tagged(
                    if upper.starts_with("SAVEPOINT") { "SAVEPOINT" } else { "RELEASE" },
                )),
            }
        } else if upper.starts_with("SET CONSTRAINTS") {
            if failed {
                Err(Self::aborted())
            } else {
                Ok(tagged("SET CONSTRAINTS"))
            }
        } else if let Some(channel) = upper.strip_prefix("UNLISTEN ") {
            if channel.trim() == "*" {
                state.listening.clear();
            } else {
                state.listening.remove(&unquote(&sql.trim()["UNLISTEN ".len()..]));
            }
            Ok(tagged("UNLISTEN"))
        } else if upper.starts_with("LISTEN ") {
            state.listening.insert(unquote(&sql.trim()["LISTEN ".len()..]));
            Ok(tagged("LISTEN"))
        } else if upper.starts_with("NOTIFY ") {
            let rest = &sql.trim()["NOTIFY ".len()..];
            let (channel, payload) = match rest.split_once(',') {
                Some((c, p)) => (unquote(c), unquote_literal(p)),
                None => (unquote(rest), String::new()),
            };
            if state.listening.contains(&channel) {
                state.notifications.push(Notification {
                    process_id: 1,
                    channel,
                    payload,
                });
            }
            Ok(tagged("NOTIFY"))
        } else {
            return None;
        };

        if outcome.is_err() && state.status == TransactionStatus::InTransaction {
            state.status = TransactionStatus::Failed;
        }
        Some(outcome)
    }
}

impl Driver for MockDriver {
    fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        self.state.lock().calls.push(Call::Prepare {
            name: name.to_string(),
            sql: sql.to_string(),
            types: param_types.to_vec(),
        });
        self.guarded(|| Ok(RawResult::empty()))?;
        self.statements.insert(name.to_string(), sql.to_string());
        Ok(())
    }

    fn execute(&mut self, name: &str, params: &[WireParam]) -> Result<RawResult> {
        let values: Vec<Option<String>> = params.iter().map(|p| p.value.clone()).collect();
        self.state.lock().calls.push(Call::Execute {
            name: name.to_string(),
            params: values.clone(),
        });
        let sql = self.statements.get(name).cloned().ok_or_else(|| {
            sql_error("26000", &format!("prepared statement \"{}\" does not exist", name))
        })?;
        let responder = Arc::clone(&self.responder);
        self.guarded(|| responder(&sql, &values))
    }

    fn simple_query(&mut self, sql: &str) -> Result<Vec<RawResult>> {
        self.state
            .lock()
            .calls
            .push(Call::SimpleQuery(sql.to_string()));
        if let Some(outcome) = self.control(sql) {
            return outcome.map(|r| vec![r]);
        }
        let responder = Arc::clone(&self.responder);
        self.guarded(|| responder(sql, &[])).map(|r| vec![r])
    }

    fn deallocate(&mut self, name: &str) -> Result<()> {
        self.state
            .lock()
            .calls
            .push(Call::Deallocate(name.to_string()));
        self.statements.remove(name);
        Ok(())
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.state.lock().status
    }

    fn take_notifications(&mut self) -> Vec<Notification> {
        std::mem::take(&mut self.state.lock().notifications)
    }

    fn close(&mut self) -> Result<()> {
        self.state.lock().calls.push(Call::Close);
        Ok(())
    }
}

pub fn sql_error(sqlstate: &str, message: &str) -> Error {
    Error::Sql(SqlError::new(sqlstate, message))
}

/// A result without rows.
pub fn tagged(tag: &str) -> RawResult {
    let mut result = RawResult::empty();
    result.command_tag = tag.to_string();
    result
}

/// A `SELECT` result with `(name, type)` columns and text cells.
pub fn rows(columns: &[(&str, &str)], rows: Vec<Vec<Option<&str>>>) -> RawResult {
    let columns = columns
        .iter()
        .map(|(name, ty)| RawColumn::new(*name, *ty))
        .collect();
    let mut result = RawResult::new(Arc::new(columns));
    result.command_tag = format!("SELECT {}", rows.len());
    result.rows = rows
        .into_iter()
        .map(|row| row.into_iter().map(|c| c.map(str::to_string)).collect())
        .collect();
    result
}

fn unquote(ident: &str) -> String {
    ident.trim().trim_matches('"').replace("\"\"", "\"")
}

fn unquote_literal(literal: &str) -> String {
    literal.trim().trim_matches('\'').replace("''", "'")
}
