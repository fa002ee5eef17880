//! Databases and the service registry handing out their connections.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use crate::config::DatabaseConfig;
use crate::connection::Connection;
use crate::converter::{Converter, ConverterRegistry};
use crate::driver::Connector;
use crate::error::{Error, Result};
use crate::pg::PgConnector;

/// One configured database: its settings, the converters used for every
/// connection to it and the connector opening the handles.
#[derive(Clone)]
pub struct Database {
    config: Arc<DatabaseConfig>,
    registry: Arc<ConverterRegistry>,
    connector: Arc<dyn Connector>,
}

impl Database {
    /// A PostgreSQL database. Other adapters are rejected here, before any
    /// connection attempt.
    pub fn new(config: DatabaseConfig) -> Result<Self> {
        if !config.is_postgres() {
            return Err(Error::Config(format!(
                "Unsupported adapter '{}', expected pgsql, postgres or postgresql",
                config.adapter
            )));
        }
        Ok(Self::with_connector(config, Arc::new(PgConnector)))
    }

    pub fn from_dsn(dsn: &str) -> Result<Self> {
        Self::new(DatabaseConfig::from_dsn(dsn)?)
    }

    /// A database whose handles come from `connector`.
    pub fn with_connector(config: DatabaseConfig, connector: Arc<dyn Connector>) -> Self {
        Self {
            config: Arc::new(config),
            registry: Arc::new(ConverterRegistry::with_builtins()),
            connector,
        }
    }

    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    pub fn registry(&self) -> &ConverterRegistry {
        &self.registry
    }

    /// Register a converter for this database. Connections created before
    /// see it too, they share the registry.
    pub fn register_converter<C: Converter + 'static>(&self, name: &str, converter: C, types: &[&str]) {
        self.registry.register(name, converter, types);
    }

    /// A new connection; its handle is opened on first use.
    pub fn create_connection(&self) -> Connection {
        debug!(database = %self.config.database, "creating connection");
        Connection::new(
            Arc::clone(&self.config),
            Arc::clone(&self.connector),
            Arc::clone(&self.registry),
        )
    }
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Database")
            .field("config", &self.config)
            .field("converters", &self.registry.names())
            .finish_non_exhaustive()
    }
}

/// Named databases. The first one added is the default.
#[derive(Debug, Clone, Default)]
pub struct Service {
    databases: Vec<(String, Database)>,
}

impl Service {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace the database named `name`.
    pub fn add_database(&mut self, name: impl Into<String>, database: Database) -> &mut Self {
        let name = name.into();
        match self.databases.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = database,
            None => self.databases.push((name, database)),
        }
        self
    }

    /// The database named `name`, or the default one when `name` is `None`.
    pub fn get_database(&self, name: Option<&str>) -> Result<&Database> {
        let found = match name {
            Some(name) => self.databases.iter().find(|(n, _)| n == name),
            None => self.databases.first(),
        };
        found.map(|(_, db)| db).ok_or_else(|| match name {
            Some(name) => Error::Config(format!("No database named '{}'", name)),
            None => Error::Config("No database registered".to_string()),
        })
    }

    pub fn create_connection(&self, name: Option<&str>) -> Result<Connection> {
        Ok(self.get_database(name)?.create_connection())
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.databases.iter().map(|(n, _)| n.as_str())
    }

    pub fn len(&self) -> usize {
        self.databases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.databases.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::converter::StringConverter;
    use crate::testing::{rows, MockConnector};
    use crate::value::Value;

    fn mock_database(name: &str, connector: &MockConnector) -> Database {
        Database::with_connector(
            DatabaseConfig::new("pgsql", "test", name),
            Arc::new(connector.clone()),
        )
    }

    #[test]
    fn test_new_rejects_other_adapters() {
        let err = Database::from_dsn("mysql://root@localhost/shop").unwrap_err();
        assert!(matches!(err, Error::Config(ref msg) if msg.contains("mysql")));
        assert!(Database::from_dsn("postgresql://greg@/library_test").is_ok());
        assert!(matches!(Database::from_dsn("pgsql://greg@localhost").unwrap_err(), Error::Config(_)));
    }

    #[test]
    fn test_connections_share_the_registry() {
        let connector = MockConnector::with_responder(|_, _| {
            Ok(rows(&[("mood", "public.mood")], vec![vec![Some("happy")]]))
        });
        let db = mock_database("app", &connector);
        let mut conn = db.create_connection();

        assert!(conn.query("SELECT mood FROM person", &[]).is_err());

        db.register_converter("Mood", StringConverter, &["mood"]);
        let result = conn.query("SELECT mood FROM person", &[]).unwrap();
        assert_eq!(result.first().unwrap().get("mood").unwrap(), &Value::from("happy"));
    }

    #[test]
    fn test_connections_are_independent() {
        let connector = MockConnector::new();
        let db = mock_database("app", &connector);

        let mut first = db.create_connection();
        let mut second = db.create_connection();
        first.query("SELECT 1", &[]).unwrap();
        second.query("SELECT 1", &[]).unwrap();

        assert_eq!(connector.connects(), 2);
        assert_eq!(connector.prepares(), 2);
    }

    #[test]
    fn test_service_lookup() {
        let connector = MockConnector::new();
        let mut service = Service::new();
        assert!(service.get_database(None).is_err());

        service
            .add_database("main", mock_database("main_db", &connector))
            .add_database("audit", mock_database("audit_db", &connector));

        assert_eq!(service.get_database(None).unwrap().config().database, "main_db");
        assert_eq!(service.get_database(Some("audit")).unwrap().config().database, "audit_db");
        assert!(matches!(service.get_database(Some("nope")).unwrap_err(), Error::Config(_)));
        assert_eq!(service.names().collect::<Vec<_>>(), vec!["main", "audit"]);

        service.add_database("main", mock_database("replaced", &connector));
        assert_eq!(service.len(), 2);
        let conn = service.create_connection(None).unwrap();
        assert_eq!(conn.config().database, "replaced");
    }
}
