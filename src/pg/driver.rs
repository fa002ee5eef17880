//! Blocking driver over the asynchronous connection.
//!
//! Each [`PgDriver`] owns a current-thread tokio runtime and blocks on it for
//! every round trip. It must not be used from inside another runtime.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::runtime::{Builder, Runtime};
use tracing::{debug, warn};

use super::connection::{PgConfig, PgConnection, QueryResult};
use super::protocol::FieldDescription;
use super::types::{qualified_type_name, Oid, TYPE_LOOKUP_SQL};
use crate::config::DatabaseConfig;
use crate::driver::{
    Connector, Driver, Notification, RawColumn, RawResult, SharedColumns, TransactionStatus,
    WireParam,
};
use crate::error::{Error, Result};

pub struct PgDriver {
    runtime: Runtime,
    conn: PgConnection,
    /// Prepared statement name -> resolved result columns.
    columns: HashMap<String, SharedColumns>,
    /// Names of non built-in types seen on this connection.
    type_names: HashMap<i32, String>,
}

impl PgDriver {
    pub fn connect(config: &DatabaseConfig) -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::Connection(format!("cannot start I/O runtime: {}", e)))?;

        // Any failure here, server errors included, is a connection failure.
        let conn = runtime
            .block_on(PgConnection::connect(PgConfig::from(config)))
            .map_err(|e| Error::Connection(e.to_string()))?;

        Ok(Self {
            runtime,
            conn,
            columns: HashMap::new(),
            type_names: HashMap::new(),
        })
    }

    pub fn backend_pid(&self) -> i32 {
        self.conn.backend_pid()
    }

    pub fn server_parameter(&self, name: &str) -> Option<&str> {
        self.conn.parameter(name)
    }

    fn type_name(&self, oid: Oid) -> String {
        oid.builtin_name()
            .map(str::to_string)
            .or_else(|| self.type_names.get(&oid.as_i32()).cloned())
            .unwrap_or_else(|| format!("oid:{}", oid.as_i32()))
    }

    fn resolve_columns(&mut self, fields: &[FieldDescription]) -> Result<SharedColumns> {
        let unknown: HashSet<i32> = fields
            .iter()
            .map(|f| f.type_oid)
            .filter(|oid| oid.builtin_name().is_none() && !self.type_names.contains_key(&oid.as_i32()))
            .map(Oid::as_i32)
            .collect();
        if !unknown.is_empty() {
            self.lookup_types(&unknown)?;
        }

        Ok(Arc::new(
            fields
                .iter()
                .map(|f| RawColumn::new(f.name.clone(), self.type_name(f.type_oid)))
                .collect(),
        ))
    }

    fn lookup_types(&mut self, oids: &HashSet<i32>) -> Result<()> {
        let list = oids.iter().map(i32::to_string).collect::<Vec<_>>().join(",");
        let sql = TYPE_LOOKUP_SQL.replace("{}", &list);
        let results = self.runtime.block_on(self.conn.simple_query(&sql))?;

        for row in results.into_iter().flat_map(|r| r.rows) {
            let col = |i: usize| row.get(i).and_then(|v| v.as_deref());
            let (Some(oid), Some(schema), Some(name)) = (col(0), col(1), col(2)) else {
                continue;
            };
            let Ok(oid) = oid.parse::<i32>() else {
                continue;
            };
            let resolved = qualified_type_name(schema, name, col(3), col(4));
            debug!(oid, type_name = %resolved, "resolved column type");
            self.type_names.insert(oid, resolved);
        }
        Ok(())
    }

    fn into_raw(&mut self, result: QueryResult, columns: Option<SharedColumns>) -> Result<RawResult> {
        let columns = match columns {
            Some(c) => c,
            None => self.resolve_columns(&result.fields)?,
        };
        Ok(RawResult {
            columns,
            rows: result.rows,
            command_tag: result.command_tag,
        })
    }
}

impl Driver for PgDriver {
    fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> Result<()> {
        let fields = self
            .runtime
            .block_on(self.conn.prepare(name, sql, param_types))?;
        let columns = self.resolve_columns(&fields)?;
        self.columns.insert(name.to_string(), columns);
        Ok(())
    }

    fn execute(&mut self, name: &str, params: &[WireParam]) -> Result<RawResult> {
        let values: Vec<Option<String>> = params.iter().map(|p| p.value.clone()).collect();
        let result = self.runtime.block_on(self.conn.execute(name, &values))?;
        let columns = self.columns.get(name).cloned();
        self.into_raw(result, columns)
    }

    fn simple_query(&mut self, sql: &str) -> Result<Vec<RawResult>> {
        let results = self.runtime.block_on(self.conn.simple_query(sql))?;
        results
            .into_iter()
            .map(|r| self.into_raw(r, None))
            .collect()
    }

    fn deallocate(&mut self, name: &str) -> Result<()> {
        self.columns.remove(name);
        self.runtime.block_on(self.conn.close_statement(name))?;
        Ok(())
    }

    fn transaction_status(&self) -> TransactionStatus {
        self.conn.transaction_status()
    }

    /// Notifications only arrive with server traffic, so an empty query is
    /// sent first to collect anything pending.
    fn take_notifications(&mut self) -> Vec<Notification> {
        if !self.conn.is_closed() {
            if let Err(e) = self.runtime.block_on(self.conn.simple_query("")) {
                warn!(error = %e, "failed to poll for notifications");
            }
        }
        self.conn.take_notifications()
    }

    fn close(&mut self) -> Result<()> {
        self.runtime.block_on(self.conn.close())?;
        Ok(())
    }
}

/// Opens [`PgDriver`] handles for `pgsql://`, `postgres://` and
/// `postgresql://` configurations.
#[derive(Debug, Default, Clone, Copy)]
pub struct PgConnector;

impl Connector for PgConnector {
    fn connect(&self, config: &DatabaseConfig) -> Result<Box<dyn Driver>> {
        if !config.is_postgres() {
            return Err(Error::Config(format!(
                "Unsupported adapter '{}'",
                config.adapter
            )));
        }
        Ok(Box::new(PgDriver::connect(config)?))
    }
}
