//! Asynchronous PostgreSQL connection.
//!
//! Every request is a batch of frontend messages ending in Sync (or a simple
//! Query) followed by reading until ReadyForQuery. Notifications and notices
//! can arrive at any point of that read and are set aside.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use super::error::{PgError, PgResult};
use super::protocol::{Authentication, BackendMessage, FieldDescription, Frontend, Target};
use super::scram::ScramClient;
use super::types::Oid;
use crate::config::DatabaseConfig;
use crate::driver::{Notification, TransactionStatus};

const SCRAM_SHA_256: &str = "SCRAM-SHA-256";

/// Parameters needed to reach and authenticate against a server.
#[derive(Debug, Clone)]
pub struct PgConfig {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: Option<String>,
    pub application_name: Option<String>,
}

impl From<&DatabaseConfig> for PgConfig {
    fn from(config: &DatabaseConfig) -> Self {
        Self {
            host: config.host_or_default().to_string(),
            port: config.port_or_default(),
            database: config.database.clone(),
            user: config.user.clone(),
            password: config.password.clone(),
            application_name: Some(config.application_name.clone())
                .filter(|name| !name.is_empty()),
        }
    }
}

/// Column descriptions shared between a statement and its results.
pub type SharedFields = Arc<Vec<FieldDescription>>;

/// Text rows of one executed statement.
#[derive(Debug)]
pub struct QueryResult {
    pub fields: SharedFields,
    pub rows: Vec<Vec<Option<String>>>,
    /// e.g. `SELECT 5` or `INSERT 0 1`
    pub command_tag: String,
}

impl QueryResult {
    fn new(fields: SharedFields) -> Self {
        Self {
            fields,
            rows: Vec::new(),
            command_tag: String::new(),
        }
    }
}

pub struct PgConnection {
    stream: TcpStream,
    config: PgConfig,
    /// Prepared statement name -> result columns.
    statements: HashMap<String, SharedFields>,
    status: TransactionStatus,
    backend_pid: i32,
    parameters: HashMap<String, String>,
    notifications: VecDeque<Notification>,
    closed: bool,
    inbound: BytesMut,
    outbound: BytesMut,
}

impl PgConnection {
    /// Connect and authenticate.
    pub async fn connect(config: PgConfig) -> PgResult<Self> {
        let stream = TcpStream::connect((config.host.as_str(), config.port)).await?;
        stream.set_nodelay(true)?;

        let mut conn = Self {
            stream,
            config,
            statements: HashMap::new(),
            status: TransactionStatus::Idle,
            backend_pid: 0,
            parameters: HashMap::new(),
            notifications: VecDeque::new(),
            closed: false,
            inbound: BytesMut::with_capacity(16 * 1024),
            outbound: BytesMut::with_capacity(1024),
        };
        conn.startup().await?;
        debug!(
            host = %conn.config.host,
            database = %conn.config.database,
            backend_pid = conn.backend_pid,
            "connected"
        );
        Ok(conn)
    }

    fn password(&self) -> PgResult<String> {
        self.config
            .password
            .clone()
            .ok_or_else(|| PgError::Auth("Password required".to_string()))
    }

    async fn startup(&mut self) -> PgResult<()> {
        let user = self.config.user.clone();
        let database = self.config.database.clone();
        let application_name = self.config.application_name.clone();
        let options: Vec<(&str, &str)> = application_name
            .iter()
            .map(|name| ("application_name", name.as_str()))
            .collect();
        self.send(&[Frontend::Startup {
            user: &user,
            database: &database,
            options: &options,
        }])
        .await?;

        loop {
            match self.next_message().await? {
                BackendMessage::Authentication(auth) => self.authenticate(auth).await?,
                BackendMessage::ParameterStatus { name, value } => {
                    self.parameters.insert(name, value);
                }
                BackendMessage::BackendKeyData { process_id, .. } => {
                    self.backend_pid = process_id;
                }
                BackendMessage::ReadyForQuery(status) => {
                    self.status = status;
                    return Ok(());
                }
                BackendMessage::Error(err) => return Err(PgError::Server(err)),
                _ => {}
            }
        }
    }

    async fn authenticate(&mut self, request: Authentication) -> PgResult<()> {
        match request {
            Authentication::Ok => Ok(()),
            Authentication::Cleartext => {
                let password = self.password()?;
                self.send(&[Frontend::Password(&password)]).await
            }
            Authentication::Md5 { salt } => {
                let hash = md5_password(&self.config.user, &self.password()?, &salt);
                self.send(&[Frontend::Password(&hash)]).await
            }
            Authentication::Sasl { mechanisms } => {
                if !mechanisms.iter().any(|m| m == SCRAM_SHA_256) {
                    return Err(PgError::Auth(format!(
                        "Server requires unsupported SASL mechanisms: {:?}",
                        mechanisms
                    )));
                }
                self.scram().await
            }
            other => Err(PgError::Protocol(format!(
                "Unexpected authentication message: {:?}",
                other
            ))),
        }
    }

    async fn scram(&mut self) -> PgResult<()> {
        let mut client = ScramClient::new(&self.config.user, &self.password()?);
        let first = client.client_first_message();
        self.send(&[Frontend::SaslInitialResponse {
            mechanism: SCRAM_SHA_256,
            data: &first,
        }])
        .await?;

        loop {
            match self.next_message().await? {
                BackendMessage::Authentication(Authentication::SaslContinue(data)) => {
                    let reply = client.process_server_first(&data)?;
                    self.send(&[Frontend::SaslResponse(&reply)]).await?;
                }
                BackendMessage::Authentication(Authentication::SaslFinal(data)) => {
                    return Ok(client.verify_server_final(&data)?);
                }
                BackendMessage::Error(err) => return Err(PgError::Server(err)),
                _ => {}
            }
        }
    }

    /// Run a query with the simple protocol. Returns one result per statement.
    pub async fn simple_query(&mut self, sql: &str) -> PgResult<Vec<QueryResult>> {
        let replies = self.exchange(&[Frontend::Query(sql)]).await?;

        let mut results = Vec::new();
        let mut current = QueryResult::new(Arc::default());
        for reply in replies {
            match reply {
                BackendMessage::RowDescription(fields) => current.fields = Arc::new(fields),
                BackendMessage::DataRow(values) => current.rows.push(text_row(values)),
                BackendMessage::CommandComplete(tag) => {
                    current.command_tag = tag;
                    results.push(std::mem::replace(&mut current, QueryResult::new(Arc::default())));
                }
                BackendMessage::EmptyQueryResponse => results.push(QueryResult::new(Arc::default())),
                _ => {}
            }
        }
        Ok(results)
    }

    /// Parse and describe a named statement. Returns its result columns.
    pub async fn prepare(&mut self, name: &str, sql: &str, param_types: &[Oid]) -> PgResult<SharedFields> {
        let replies = self
            .exchange(&[
                Frontend::Parse {
                    name,
                    sql,
                    param_types,
                },
                Frontend::Describe(Target::Statement, name),
                Frontend::Sync,
            ])
            .await?;

        let fields = replies
            .into_iter()
            .find_map(|reply| match reply {
                BackendMessage::RowDescription(fields) => Some(fields),
                _ => None,
            })
            .unwrap_or_default();
        let fields = Arc::new(fields);
        self.statements.insert(name.to_string(), Arc::clone(&fields));
        Ok(fields)
    }

    /// Bind and run a statement prepared on this connection.
    pub async fn execute(&mut self, name: &str, params: &[Option<String>]) -> PgResult<QueryResult> {
        let fields = self
            .statements
            .get(name)
            .cloned()
            .ok_or_else(|| PgError::Protocol(format!("Unknown prepared statement: {}", name)))?;
        let replies = self
            .exchange(&[
                Frontend::Bind {
                    statement: name,
                    params,
                },
                Frontend::Execute,
                Frontend::Sync,
            ])
            .await?;

        let mut result = QueryResult::new(fields);
        for reply in replies {
            match reply {
                BackendMessage::DataRow(values) => result.rows.push(text_row(values)),
                BackendMessage::CommandComplete(tag) => result.command_tag = tag,
                _ => {}
            }
        }
        Ok(result)
    }

    /// Close a prepared statement on the server.
    pub async fn close_statement(&mut self, name: &str) -> PgResult<()> {
        self.statements.remove(name);
        self.exchange(&[Frontend::Close(Target::Statement, name), Frontend::Sync])
            .await
            .map(drop)
    }

    /// Send Terminate. Further calls fail with `ConnectionClosed`.
    pub async fn close(&mut self) -> PgResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.send(&[Frontend::Terminate]).await
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn transaction_status(&self) -> TransactionStatus {
        self.status
    }

    pub fn take_notifications(&mut self) -> Vec<Notification> {
        self.notifications.drain(..).collect()
    }

    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }

    /// A server parameter reported at startup, e.g. `server_version`.
    pub fn parameter(&self, name: &str) -> Option<&str> {
        self.parameters.get(name).map(String::as_str)
    }

    /// Send `messages` and collect the replies up to ReadyForQuery. An
    /// ErrorResponse fails the whole exchange, once the server is ready again.
    async fn exchange(&mut self, messages: &[Frontend<'_>]) -> PgResult<Vec<BackendMessage>> {
        if self.closed {
            return Err(PgError::ConnectionClosed);
        }
        self.send(messages).await?;

        let mut replies = Vec::new();
        let mut failure = None;
        loop {
            match self.next_message().await? {
                BackendMessage::ReadyForQuery(status) => {
                    self.status = status;
                    return match failure {
                        Some(err) => Err(PgError::Server(err)),
                        None => Ok(replies),
                    };
                }
                BackendMessage::Error(err) => {
                    failure.get_or_insert(err);
                }
                reply => replies.push(reply),
            }
        }
    }

    async fn send(&mut self, messages: &[Frontend<'_>]) -> PgResult<()> {
        self.outbound.clear();
        for message in messages {
            message.encode(&mut self.outbound)?;
        }
        self.stream.write_all(&self.outbound).await?;
        Ok(())
    }

    /// Next message that belongs to the running exchange.
    async fn next_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            match self.read_message().await? {
                BackendMessage::Notification {
                    process_id,
                    channel,
                    payload,
                } => self.notifications.push_back(Notification {
                    process_id,
                    channel,
                    payload,
                }),
                BackendMessage::Notice(notice) => {
                    debug!(severity = %notice.severity, message = %notice.message, "server notice");
                }
                other => return Ok(other),
            }
        }
    }

    async fn read_message(&mut self) -> PgResult<BackendMessage> {
        loop {
            if let Some(total) = BackendMessage::frame_len(&self.inbound)? {
                if self.inbound.len() >= total {
                    let mut frame = self.inbound.split_to(total).freeze();
                    return BackendMessage::decode(&mut frame);
                }
            }
            if self.stream.read_buf(&mut self.inbound).await? == 0 {
                self.closed = true;
                return Err(PgError::ConnectionClosed);
            }
        }
    }
}

fn text_row(values: Vec<Option<Bytes>>) -> Vec<Option<String>> {
    values
        .into_iter()
        .map(|v| v.map(|data| String::from_utf8_lossy(&data).into_owned()))
        .collect()
}

/// `md5` followed by hex(md5(hex(md5(password + user)) + salt)).
pub(crate) fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{}{}", password, user)));
    let mut outer = inner.into_bytes();
    outer.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(&outer))
}
