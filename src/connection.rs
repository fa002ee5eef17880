//! Connection: lazily opened driver handle, transaction state machine,
//! filter chain and identity map.
//!
//! The handle is opened on first use. Transaction state is read from the
//! server status reported after every round trip, so a statement failing
//! inside a transaction is reflected without the connection tracking it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::{DatabaseConfig, IsolationLevel};
use crate::converter::ConverterRegistry;
use crate::driver::{Connector, Driver, Notification, RawResult, TransactionStatus};
use crate::error::{ContractViolation, Error, Result};
use crate::filter::{ExecuteFilter, Filter, FilterChain, Param, QueryContext};
use crate::identity::IdentityMapper;
use crate::row::ResultSet;
use crate::statement::StatementPool;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handle opened yet.
    Disconnected,
    Idle,
    InTransaction,
    /// A statement failed inside the transaction; only a rollback (to a
    /// savepoint or of the whole transaction) is accepted.
    InFailedTransaction,
}

impl ConnectionState {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Idle => TransactionStatus::Idle.as_str(),
            ConnectionState::InTransaction => TransactionStatus::InTransaction.as_str(),
            ConnectionState::InFailedTransaction => TransactionStatus::Failed.as_str(),
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What `COMMIT` actually did. The server rolls back a failed transaction
/// instead of committing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionOutcome {
    Committed,
    RolledBack,
}

/// Constraint checking mode for [`Connection::set_constraints`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConstraintMode {
    Deferred,
    Immediate,
}

impl ConstraintMode {
    pub fn as_sql(self) -> &'static str {
        match self {
            ConstraintMode::Deferred => "DEFERRED",
            ConstraintMode::Immediate => "IMMEDIATE",
        }
    }
}

/// `"name"`, embedded quotes doubled.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// `'text'`, embedded quotes doubled.
pub fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Open handle plus the statements prepared on it.
struct Link {
    driver: Box<dyn Driver>,
    statements: StatementPool,
}

pub struct Connection {
    config: Arc<DatabaseConfig>,
    connector: Arc<dyn Connector>,
    registry: Arc<ConverterRegistry>,
    link: Option<Link>,
    chain: FilterChain,
    identity: IdentityMapper,
    listening: BTreeSet<String>,
    /// LISTEN (`true`) and UNLISTEN (`false`) issued inside the open
    /// transaction. The server applies them only on commit.
    pending_listens: Vec<(String, bool)>,
}

impl Connection {
    /// A connection that opens its handle on first use.
    pub fn new(
        config: Arc<DatabaseConfig>,
        connector: Arc<dyn Connector>,
        registry: Arc<ConverterRegistry>,
    ) -> Self {
        let mut chain = FilterChain::new();
        chain.register_filter(ExecuteFilter);
        let identity = IdentityMapper::new(config.identity_mapper);
        Self {
            config,
            connector,
            registry,
            link: None,
            chain,
            identity,
            listening: BTreeSet::new(),
            pending_listens: Vec::new(),
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<ConverterRegistry> {
        &self.registry
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.config.isolation_level
    }

    pub fn identity_mapper(&self) -> &IdentityMapper {
        &self.identity
    }

    pub fn identity_mapper_mut(&mut self) -> &mut IdentityMapper {
        &mut self.identity
    }

    pub fn is_connected(&self) -> bool {
        self.link.is_some()
    }

    pub fn state(&self) -> ConnectionState {
        match &self.link {
            None => ConnectionState::Disconnected,
            Some(link) => match link.driver.transaction_status() {
                TransactionStatus::Idle => ConnectionState::Idle,
                TransactionStatus::InTransaction => ConnectionState::InTransaction,
                TransactionStatus::Failed => ConnectionState::InFailedTransaction,
            },
        }
    }

    /// True in a transaction, failed or not.
    pub fn is_in_transaction(&self) -> bool {
        matches!(
            self.state(),
            ConnectionState::InTransaction | ConnectionState::InFailedTransaction
        )
    }

    /// Open the handle now rather than on first use.
    pub fn connect(&mut self) -> Result<()> {
        if self.link.is_none() {
            let driver = self.connector.connect(&self.config)?;
            info!(
                database = %self.config.database,
                host = %self.config.host_or_default(),
                port = self.config.port_or_default(),
                "connected"
            );
            self.link = Some(Link {
                driver,
                statements: StatementPool::new(self.config.statement_cache_capacity),
            });
        }
        Ok(())
    }

    fn link(&mut self) -> Result<&mut Link> {
        self.connect()?;
        self.link
            .as_mut()
            .ok_or_else(|| Error::Connection("connection is not open".to_string()))
    }

    // ========================================================================
    // Queries
    // ========================================================================

    /// Add a filter in front of the chain; it runs before every filter
    /// registered earlier.
    pub fn register_filter<F: Filter + 'static>(&mut self, filter: F) {
        self.chain.register_filter(filter);
    }

    pub fn filters(&self) -> &FilterChain {
        &self.chain
    }

    /// Run `sql` through the filter chain. `$*` markers are bound to
    /// `values` in order, each converted with its natural type.
    pub fn query(&mut self, sql: &str, values: &[Value]) -> Result<ResultSet> {
        self.query_with(sql, values.iter().cloned().map(Param::from).collect())
    }

    /// Like [`Connection::query`] with explicitly typed parameters.
    pub fn query_with(&mut self, sql: &str, params: Vec<Param>) -> Result<ResultSet> {
        self.connect()?;
        let Connection {
            link,
            chain,
            registry,
            ..
        } = self;
        let link = link
            .as_mut()
            .ok_or_else(|| Error::Connection("connection is not open".to_string()))?;

        let mut ctx = QueryContext::new(
            sql,
            params,
            &mut *link.driver,
            &mut link.statements,
            &**registry,
        );
        chain.execute(&mut ctx)
    }

    /// Run one or more `;` separated statements without parameters,
    /// bypassing the filter chain and the statement pool.
    pub fn execute(&mut self, sql: &str) -> Result<Vec<ResultSet>> {
        let raw = self.link()?.driver.simple_query(sql)?;
        raw.into_iter()
            .map(|r| ResultSet::from_raw(r, &self.registry))
            .collect()
    }

    /// Prepared statements currently held by the handle.
    pub fn statement_count(&self) -> usize {
        self.link.as_ref().map_or(0, |l| l.statements.len())
    }

    fn control(&mut self, sql: &str) -> Result<RawResult> {
        let results = self.link()?.driver.simple_query(sql)?;
        debug!(sql, "transaction control");
        Ok(results.into_iter().last().unwrap_or_else(RawResult::empty))
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    /// `BEGIN TRANSACTION ISOLATION LEVEL <level>`.
    pub fn begin(&mut self) -> Result<()> {
        if self.is_in_transaction() {
            return Err(ContractViolation::AlreadyInTransaction.into());
        }
        let sql = format!("BEGIN TRANSACTION ISOLATION LEVEL {}", self.config.isolation_level);
        self.control(&sql)?;
        Ok(())
    }

    pub fn commit(&mut self) -> Result<TransactionOutcome> {
        if !self.is_in_transaction() {
            return Err(ContractViolation::NotInTransaction.into());
        }
        let pending = std::mem::take(&mut self.pending_listens);
        let result = self.control("COMMIT")?;
        if result.command_tag == "ROLLBACK" {
            warn!("commit of a failed transaction was turned into a rollback");
            return Ok(TransactionOutcome::RolledBack);
        }
        for (channel, listen) in pending {
            self.track_listen(channel, listen);
        }
        Ok(TransactionOutcome::Committed)
    }

    /// Roll back the whole transaction, or only to `savepoint`. Rolling back
    /// to a savepoint also clears a failed state.
    pub fn rollback(&mut self, savepoint: Option<&str>) -> Result<()> {
        if !self.is_in_transaction() {
            return Err(ContractViolation::NotInTransaction.into());
        }
        match savepoint {
            Some(name) => {
                self.control(&format!("ROLLBACK TO SAVEPOINT {}", quote_identifier(name)))?
            }
            None => {
                self.pending_listens.clear();
                self.control("ROLLBACK")?
            }
        };
        Ok(())
    }

    pub fn set_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_healthy_transaction("set a savepoint")?;
        self.control(&format!("SAVEPOINT {}", quote_identifier(name)))?;
        Ok(())
    }

    pub fn release_savepoint(&mut self, name: &str) -> Result<()> {
        self.require_healthy_transaction("release a savepoint")?;
        self.control(&format!("RELEASE SAVEPOINT {}", quote_identifier(name)))?;
        Ok(())
    }

    /// `SET CONSTRAINTS`. An empty `names` list means `ALL`.
    pub fn set_constraints(
        &mut self,
        names: &[&str],
        schema: Option<&str>,
        mode: ConstraintMode,
    ) -> Result<()> {
        self.require_healthy_transaction("set constraints")?;
        let targets = if names.is_empty() {
            "ALL".to_string()
        } else {
            names
                .iter()
                .map(|name| match schema {
                    Some(schema) => {
                        format!("{}.{}", quote_identifier(schema), quote_identifier(name))
                    }
                    None => quote_identifier(name),
                })
                .collect::<Vec<_>>()
                .join(", ")
        };
        self.control(&format!("SET CONSTRAINTS {} {}", targets, mode.as_sql()))?;
        Ok(())
    }

    fn require_healthy_transaction(&self, operation: &'static str) -> Result<()> {
        match self.state() {
            ConnectionState::InTransaction => Ok(()),
            ConnectionState::InFailedTransaction => Err(ContractViolation::InvalidTransactionState {
                operation,
                state: ConnectionState::InFailedTransaction.as_str(),
            }
            .into()),
            ConnectionState::Idle | ConnectionState::Disconnected => {
                Err(ContractViolation::NotInTransaction.into())
            }
        }
    }

    /// Run `f` in a transaction: committed when it returns `Ok`, rolled back
    /// when it returns `Err`.
    pub fn transaction<T, F>(&mut self, f: F) -> Result<T>
    where
        F: FnOnce(&mut Connection) -> Result<T>,
    {
        self.begin()?;
        match f(self) {
            Ok(value) => {
                self.commit()?;
                Ok(value)
            }
            Err(e) => {
                if self.is_in_transaction() {
                    if let Err(rollback_error) = self.rollback(None) {
                        warn!(error = %rollback_error, "rollback after failure failed");
                    }
                }
                Err(e)
            }
        }
    }

    // ========================================================================
    // LISTEN / NOTIFY
    // ========================================================================

    /// Inside a transaction the subscription starts at commit and is
    /// dropped by a rollback.
    pub fn listen(&mut self, channel: &str) -> Result<()> {
        self.control(&format!("LISTEN {}", quote_identifier(channel)))?;
        self.defer_listen(channel, true);
        Ok(())
    }

    pub fn unlisten(&mut self, channel: &str) -> Result<()> {
        self.control(&format!("UNLISTEN {}", quote_identifier(channel)))?;
        self.defer_listen(channel, false);
        Ok(())
    }

    fn defer_listen(&mut self, channel: &str, listen: bool) {
        if self.is_in_transaction() {
            self.pending_listens.push((channel.to_string(), listen));
        } else {
            self.track_listen(channel.to_string(), listen);
        }
    }

    fn track_listen(&mut self, channel: String, listen: bool) {
        if listen {
            self.listening.insert(channel);
        } else {
            self.listening.remove(&channel);
        }
    }

    pub fn notify(&mut self, channel: &str, payload: Option<&str>) -> Result<()> {
        let sql = match payload {
            Some(payload) => format!(
                "NOTIFY {}, {}",
                quote_identifier(channel),
                quote_literal(payload)
            ),
            None => format!("NOTIFY {}", quote_identifier(channel)),
        };
        self.control(&sql)?;
        Ok(())
    }

    /// Notifications received on the listened channels since the last call.
    pub fn notifications(&mut self) -> Vec<Notification> {
        match self.link.as_mut() {
            Some(link) => link.driver.take_notifications(),
            None => Vec::new(),
        }
    }

    /// Channels subscribed outside a transaction or by a committed one.
    pub fn listening(&self) -> impl Iterator<Item = &str> {
        self.listening.iter().map(String::as_str)
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Release the handle. Cleanup failures are logged; only the failure to
    /// close the handle itself is returned.
    pub fn close(mut self) -> Result<()> {
        self.release()
    }

    fn release(&mut self) -> Result<()> {
        let Some(mut link) = self.link.take() else {
            return Ok(());
        };

        if link.driver.transaction_status() != TransactionStatus::Idle {
            warn!("closing a connection with an open transaction, it will be rolled back");
        }
        for channel in std::mem::take(&mut self.listening) {
            let sql = format!("UNLISTEN {}", quote_identifier(&channel));
            if let Err(e) = link.driver.simple_query(&sql) {
                warn!(channel = %channel, error = %e, "unlisten failed");
            }
        }
        link.statements.clear(&mut *link.driver);
        self.identity.flush();

        let result = link.driver.close();
        debug!(database = %self.config.database, "connection closed");
        result
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.release() {
            warn!(error = %e, "failed to close connection");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("config", &self.config)
            .field("state", &self.state())
            .field("filters", &self.chain)
            .field("identity_mapper", &self.identity.kind())
            .field("listening", &self.listening)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IdentityMapperKind;
    use crate::filter::{LoggerFilter, Next};
    use crate::testing::{rows, sql_error, Call, MockConnector};

    fn connection_with(connector: &MockConnector, config: DatabaseConfig) -> Connection {
        Connection::new(
            Arc::new(config),
            Arc::new(connector.clone()),
            Arc::new(ConverterRegistry::with_builtins()),
        )
    }

    fn connection(connector: &MockConnector) -> Connection {
        connection_with(connector, DatabaseConfig::new("pgsql", "test", "test"))
    }

    /// Fails every statement mentioning `boom`.
    fn failing_on_boom() -> MockConnector {
        MockConnector::with_responder(|sql, _| {
            if sql.contains("boom") {
                Err(sql_error("22012", "division by zero"))
            } else {
                Ok(rows(&[("n", "int4")], vec![vec![Some("1")]]))
            }
        })
    }

    fn contract(err: Error) -> ContractViolation {
        match err {
            Error::Contract(c) => c,
            other => panic!("expected a contract violation, got {:?}", other),
        }
    }

    #[test]
    fn test_handle_opens_lazily() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector);

        assert_eq!(conn.state(), ConnectionState::Disconnected);
        assert_eq!(connector.connects(), 0);

        conn.query("SELECT 1", &[]).unwrap();
        conn.query("SELECT 1", &[]).unwrap();

        assert_eq!(connector.connects(), 1);
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(conn.statement_count(), 1);
    }

    #[test]
    fn test_connection_failure_is_reported() {
        let connector = MockConnector::refusing();
        let mut conn = connection(&connector);

        let err = conn.query("SELECT 1", &[]).unwrap_err();
        assert!(matches!(err, Error::Connection(ref msg) if msg.contains("refused")));
        assert!(!conn.is_connected());
    }

    #[test]
    fn test_begin_uses_configured_isolation_level() {
        let connector = MockConnector::new();
        let config = DatabaseConfig::new("pgsql", "test", "test")
            .isolation_level(IsolationLevel::Serializable);
        let mut conn = connection_with(&connector, config);

        conn.begin().unwrap();

        assert_eq!(conn.state(), ConnectionState::InTransaction);
        assert_eq!(
            connector.simple_queries(),
            vec!["BEGIN TRANSACTION ISOLATION LEVEL SERIALIZABLE".to_string()]
        );
    }

    #[test]
    fn test_begin_twice_fails() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector);

        conn.begin().unwrap();
        let err = conn.begin().unwrap_err();

        assert_eq!(contract(err), ContractViolation::AlreadyInTransaction);
        assert_eq!(connector.simple_queries().len(), 1);
    }

    #[test]
    fn test_commit_and_rollback_require_a_transaction() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector);

        assert_eq!(contract(conn.commit().unwrap_err()), ContractViolation::NotInTransaction);
        assert_eq!(contract(conn.rollback(None).unwrap_err()), ContractViolation::NotInTransaction);
        assert_eq!(
            contract(conn.rollback(Some("sp")).unwrap_err()),
            ContractViolation::NotInTransaction
        );
        // Nothing was sent, not even a connection attempt.
        assert_eq!(connector.connects(), 0);
    }

    #[test]
    fn test_commit() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector);

        conn.begin().unwrap();
        assert_eq!(conn.commit().unwrap(), TransactionOutcome::Committed);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_failed_statement_moves_to_failed_transaction() {
        let connector = failing_on_boom();
        let mut conn = connection(&connector);

        conn.begin().unwrap();
        let err = conn.query("SELECT boom", &[]).unwrap_err();

        assert_eq!(err.sqlstate(), Some("22012"));
        assert_eq!(conn.state(), ConnectionState::InFailedTransaction);

        let err = conn.query("SELECT 1", &[]).unwrap_err();
        assert_eq!(err.sqlstate(), Some("25P02"));
    }

    #[test]
    fn test_commit_of_failed_transaction_rolls_back() {
        let connector = failing_on_boom();
        let mut conn = connection(&connector);

        conn.begin().unwrap();
        assert!(conn.query("SELECT boom", &[]).is_err());

        assert_eq!(conn.commit().unwrap(), TransactionOutcome::RolledBack);
        assert_eq!(conn.state(), ConnectionState::Idle);
    }

    #[test]
    fn test_rollback_to_savepoint_recovers_failed_transaction() {
        let connector = failing_on_boom();
        let mut conn = connection(&connector);

        conn.begin().unwrap();
        conn.set_savepoint("sp").unwrap();
        assert!(conn.query("SELECT boom", &[]).is_err());
        assert_eq!(conn.state(), ConnectionState::InFailedTransaction);

        conn.rollback(Some("sp")).unwrap();

        assert_eq!(conn.state(), ConnectionState::InTransaction);
        assert!(connector
            .simple_queries()
            .contains(&"ROLLBACK TO SAVEPOINT \"sp\"".to_string()));
        conn.query("SELECT 1", &[]).unwrap();
    }

    #[test]
    fn test_savepoints_need_a_healthy_transaction() {
        let connector = failing_on_boom();
        let mut conn = connection(&connector);

        assert_eq!(
            contract(conn.set_savepoint("sp").unwrap_err()),
            ContractViolation::NotInTransaction
        );

        conn.begin().unwrap();
        conn.set_savepoint("sp").unwrap();
        conn.release_savepoint("sp").unwrap();
        assert!(conn.query("SELECT boom", &[]).is_err());

        assert!(matches!(
            contract(conn.release_savepoint("sp").unwrap_err()),
            ContractViolation::InvalidTransactionState { .. }
        ));
    }

    #[test]
    fn test_set_constraints() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector);

        assert!(conn.set_constraints(&[], None, ConstraintMode::Deferred).is_err());

        conn.begin().unwrap();
        conn.set_constraints(&[], None, ConstraintMode::Deferred).unwrap();
        conn.set_constraints(&["book_author_fk", "book_isbn"], Some("library"), ConstraintMode::Immediate)
            .unwrap();

        let sent = connector.simple_queries();
        assert_eq!(sent[1], "SET CONSTRAINTS ALL DEFERRED");
        assert_eq!(
            sent[2],
            "SET CONSTRAINTS \"library\".\"book_author_fk\", \"library\".\"book_isbn\" IMMEDIATE"
        );
    }

    #[test]
    fn test_transaction_closure() {
        let connector = failing_on_boom();
        let mut conn = connection(&connector);

        let n = conn
            .transaction(|c| c.query("SELECT 1", &[]).map(|r| r.len()))
            .unwrap();
        assert_eq!(n, 1);

        assert!(conn.transaction(|c| c.query("SELECT boom", &[])).is_err());
        assert_eq!(conn.state(), ConnectionState::Idle);
        assert_eq!(
            connector.simple_queries(),
            vec![
                "BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
                "COMMIT".to_string(),
                "BEGIN TRANSACTION ISOLATION LEVEL READ COMMITTED".to_string(),
                "ROLLBACK".to_string(),
            ]
        );
    }

    #[test]
    fn test_listen_notify() {
        let connector = MockConnector::new();
        let mut conn = connection(&connector);

        assert!(conn.notifications().is_empty());
        conn.listen("book_events").unwrap();
        conn.notify("book_events", Some("it's new")).unwrap();
        conn.notify("elsewhere", None).unwrap();

        let received = conn.notifications();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].channel, "book_events");
        assert_eq!(received[0].payload, "it's new");
        assert!(conn.notifications().is_empty());

        conn.unlisten("book_events").unwrap();
        assert_eq!(conn.listening().count(), 0);
    }

    #[test]
    fn test_listen_follows_transaction_outcome() {
        let connector = MockConnector::new();
        {
            let mut conn = connection(&connector);
            conn.begin().unwrap();
            conn.listen("discarded").unwrap();
            assert_eq!(conn.listening().count(), 0);
            conn.rollback(None).unwrap();
            assert_eq!(conn.listening().count(), 0);

            conn.begin().unwrap();
            conn.listen("kept").unwrap();
            assert_eq!(conn.commit().unwrap(), TransactionOutcome::Committed);
            assert_eq!(conn.listening().collect::<Vec<_>>(), vec!["kept"]);

            conn.begin().unwrap();
            conn.unlisten("kept").unwrap();
            conn.rollback(None).unwrap();
            assert_eq!(conn.listening().collect::<Vec<_>>(), vec!["kept"]);
        }

        let unlistens: Vec<String> = connector
            .simple_queries()
            .into_iter()
            .filter(|sql| sql.starts_with("UNLISTEN"))
            .collect();
        assert_eq!(unlistens, vec!["UNLISTEN \"kept\"".to_string(), "UNLISTEN \"kept\"".to_string()]);
    }

    #[test]
    fn test_drop_releases_resources() {
        let connector = MockConnector::new();
        {
            let mut conn = connection(&connector);
            conn.listen("jobs").unwrap();
            conn.query("SELECT $*", &[Value::Int(1)]).unwrap();
        }

        let calls = connector.calls();
        assert!(calls.contains(&Call::SimpleQuery("UNLISTEN \"jobs\"".to_string())));
        assert_eq!(connector.deallocated().len(), 1);
        assert_eq!(calls.last(), Some(&Call::Close));
    }

    #[test]
    fn test_drop_tolerates_failed_transaction() {
        let connector = failing_on_boom();
        {
            let mut conn = connection(&connector);
            conn.listen("jobs").unwrap();
            conn.begin().unwrap();
            assert!(conn.query("SELECT boom", &[]).is_err());
        }
        assert_eq!(connector.calls().last(), Some(&Call::Close));
    }

    #[test]
    fn test_registered_filters_wrap_execution() {
        struct Rewrite;
        impl Filter for Rewrite {
            fn execute(&mut self, ctx: &mut QueryContext<'_>, next: Next<'_>) -> Result<ResultSet> {
                ctx.sql = ctx.sql.replace("books", "library.book");
                next.run(ctx)
            }
        }

        let connector = MockConnector::new();
        let mut conn = connection(&connector);
        let logger = LoggerFilter::default();
        let log = logger.log();
        conn.register_filter(Rewrite);
        conn.register_filter(logger);

        conn.query("SELECT * FROM books", &[]).unwrap();

        assert_eq!(conn.filters().len(), 3);
        assert_eq!(log.last().unwrap().sql, "SELECT * FROM books");
        assert!(connector.calls().iter().any(|c| matches!(
            c,
            Call::Prepare { sql, .. } if sql == "SELECT * FROM library.book"
        )));
    }

    #[test]
    fn test_identity_mapper_follows_config() {
        let connector = MockConnector::new();
        let config = DatabaseConfig::new("pgsql", "test", "test")
            .identity_mapper(IdentityMapperKind::Strict);
        let conn = connection_with(&connector, config);
        assert_eq!(conn.identity_mapper().kind(), IdentityMapperKind::Strict);
    }
}
