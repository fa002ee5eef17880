//! PostgreSQL v3 wire messages.
//!
//! Frontend messages borrow their data and are framed straight into the
//! connection's write buffer. Backend messages are decoded through a
//! bounds-checked reader so truncated input is a protocol error, not a panic.
//! Parameters and results always travel in text format.
//!
//! Reference: https://www.postgresql.org/docs/current/protocol-message-formats.html

use std::collections::HashMap;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use super::error::{PgError, PgResult};
use super::types::Oid;
use crate::error::SqlError;

pub use crate::driver::TransactionStatus;

/// Protocol 3.0, sent in the startup packet.
pub const PROTOCOL_VERSION: i32 = 3 << 16;

/// Format code for text parameters and results.
const TEXT_FORMAT: i16 = 0;

/// What a Describe or Close refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Target {
    Statement,
    Portal,
}

impl Target {
    fn code(self) -> u8 {
        match self {
            Target::Statement => b'S',
            Target::Portal => b'P',
        }
    }
}

// ============================================================================
// Frontend
// ============================================================================

/// Client to server message. Bind, Execute and the portal side of Describe
/// always use the unnamed portal.
#[derive(Debug, Clone, Copy)]
pub enum Frontend<'a> {
    Startup {
        user: &'a str,
        database: &'a str,
        options: &'a [(&'a str, &'a str)],
    },
    Password(&'a str),
    SaslInitialResponse {
        mechanism: &'a str,
        data: &'a [u8],
    },
    SaslResponse(&'a [u8]),
    Query(&'a str),
    Parse {
        name: &'a str,
        sql: &'a str,
        param_types: &'a [Oid],
    },
    Describe(Target, &'a str),
    Bind {
        statement: &'a str,
        params: &'a [Option<String>],
    },
    Execute,
    Close(Target, &'a str),
    Sync,
    Terminate,
}

impl Frontend<'_> {
    /// Message type byte; the startup packet has none.
    pub fn tag(&self) -> Option<u8> {
        Some(match self {
            Frontend::Startup { .. } => return None,
            Frontend::Password(_)
            | Frontend::SaslInitialResponse { .. }
            | Frontend::SaslResponse(_) => b'p',
            Frontend::Query(_) => b'Q',
            Frontend::Parse { .. } => b'P',
            Frontend::Describe(..) => b'D',
            Frontend::Bind { .. } => b'B',
            Frontend::Execute => b'E',
            Frontend::Close(..) => b'C',
            Frontend::Sync => b'S',
            Frontend::Terminate => b'X',
        })
    }

    /// Append the framed message to `buf`. Nothing is written when the
    /// message cannot be framed.
    pub fn encode(&self, buf: &mut BytesMut) -> PgResult<()> {
        let params = match *self {
            Frontend::Parse { param_types, .. } => param_types.len(),
            Frontend::Bind { params, .. } => params.len(),
            _ => 0,
        };
        wire_count(params)?;
        if let Some(tag) = self.tag() {
            buf.put_u8(tag);
        }
        let length_at = buf.len();
        buf.put_i32(0);
        self.encode_body(buf);
        let length = (buf.len() - length_at) as i32;
        buf[length_at..length_at + 4].copy_from_slice(&length.to_be_bytes());
        Ok(())
    }

    pub fn to_bytes(&self) -> PgResult<BytesMut> {
        let mut buf = BytesMut::new();
        self.encode(&mut buf)?;
        Ok(buf)
    }

    fn encode_body(&self, buf: &mut BytesMut) {
        match *self {
            Frontend::Startup {
                user,
                database,
                options,
            } => {
                buf.put_i32(PROTOCOL_VERSION);
                put_cstr(buf, "user");
                put_cstr(buf, user);
                put_cstr(buf, "database");
                put_cstr(buf, database);
                for (key, value) in options {
                    put_cstr(buf, key);
                    put_cstr(buf, value);
                }
                buf.put_u8(0);
            }
            Frontend::Password(password) => put_cstr(buf, password),
            Frontend::SaslInitialResponse { mechanism, data } => {
                put_cstr(buf, mechanism);
                buf.put_i32(data.len() as i32);
                buf.put_slice(data);
            }
            Frontend::SaslResponse(data) => buf.put_slice(data),
            Frontend::Query(sql) => put_cstr(buf, sql),
            Frontend::Parse {
                name,
                sql,
                param_types,
            } => {
                put_cstr(buf, name);
                put_cstr(buf, sql);
                buf.put_u16(param_types.len() as u16);
                for oid in param_types {
                    buf.put_i32(oid.as_i32());
                }
            }
            Frontend::Describe(target, name) | Frontend::Close(target, name) => {
                buf.put_u8(target.code());
                put_cstr(buf, name);
            }
            Frontend::Bind { statement, params } => {
                put_cstr(buf, "");
                put_cstr(buf, statement);
                // A single format code covers every parameter.
                buf.put_i16(1);
                buf.put_i16(TEXT_FORMAT);
                buf.put_u16(params.len() as u16);
                for param in params {
                    match param {
                        Some(text) => {
                            buf.put_i32(text.len() as i32);
                            buf.put_slice(text.as_bytes());
                        }
                        None => buf.put_i32(-1),
                    }
                }
                buf.put_i16(1);
                buf.put_i16(TEXT_FORMAT);
            }
            Frontend::Execute => {
                put_cstr(buf, "");
                // No row limit.
                buf.put_i32(0);
            }
            Frontend::Sync | Frontend::Terminate => {}
        }
    }
}

/// Parameter counts travel as an unsigned 16 bit integer.
fn wire_count(n: usize) -> PgResult<u16> {
    u16::try_from(n).map_err(|_| {
        PgError::Protocol(format!("{} parameters exceed the limit of {}", n, u16::MAX))
    })
}

fn put_cstr(buf: &mut BytesMut, s: &str) {
    buf.put_slice(s.as_bytes());
    buf.put_u8(0);
}

// ============================================================================
// Backend
// ============================================================================

/// One column of a RowDescription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDescription {
    pub name: String,
    pub type_oid: Oid,
    pub type_modifier: i32,
    /// True when the server sends this column in text format.
    pub text: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Authentication {
    Ok,
    Cleartext,
    Md5 { salt: [u8; 4] },
    Sasl { mechanisms: Vec<String> },
    SaslContinue(Bytes),
    SaslFinal(Bytes),
}

/// Server to client message.
#[derive(Debug, Clone, PartialEq)]
pub enum BackendMessage {
    Authentication(Authentication),
    ParameterStatus { name: String, value: String },
    BackendKeyData { process_id: i32, secret_key: i32 },
    ReadyForQuery(TransactionStatus),

    RowDescription(Vec<FieldDescription>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(String),
    EmptyQueryResponse,

    ParseComplete,
    BindComplete,
    CloseComplete,
    NoData,
    PortalSuspended,
    ParameterDescription(Vec<Oid>),

    Error(SqlError),
    Notice(SqlError),
    Notification {
        process_id: i32,
        channel: String,
        payload: String,
    },
}

impl BackendMessage {
    /// Length of the complete message at the start of `buf` (type byte
    /// included), or `None` while the header is incomplete.
    pub fn frame_len(buf: &[u8]) -> PgResult<Option<usize>> {
        if buf.len() < 5 {
            return Ok(None);
        }
        let length = i32::from_be_bytes([buf[1], buf[2], buf[3], buf[4]]);
        if length < 4 {
            return Err(PgError::Protocol(format!("Invalid message length: {}", length)));
        }
        Ok(Some(1 + length as usize))
    }

    /// Decode one message from the front of `buf`.
    pub fn decode(buf: &mut Bytes) -> PgResult<Self> {
        let total = Self::frame_len(buf)?
            .ok_or_else(|| PgError::Protocol("Incomplete message header".to_string()))?;
        if buf.len() < total {
            return Err(PgError::Protocol("Incomplete message body".to_string()));
        }

        let mut frame = buf.split_to(total);
        let tag = frame.get_u8();
        frame.advance(4);
        let mut body = Reader { buf: frame, tag };

        let message = match tag {
            b'R' => BackendMessage::Authentication(body.authentication()?),
            b'S' => BackendMessage::ParameterStatus {
                name: body.cstr()?,
                value: body.cstr()?,
            },
            b'K' => BackendMessage::BackendKeyData {
                process_id: body.i32()?,
                secret_key: body.i32()?,
            },
            b'Z' => BackendMessage::ReadyForQuery(transaction_status(body.u8()?)?),
            b'T' => {
                let count = body.count()?;
                let fields = (0..count)
                    .map(|_| body.field_description())
                    .collect::<PgResult<_>>()?;
                BackendMessage::RowDescription(fields)
            }
            b'D' => {
                let count = body.count()?;
                let values = (0..count).map(|_| body.value()).collect::<PgResult<_>>()?;
                BackendMessage::DataRow(values)
            }
            b'C' => BackendMessage::CommandComplete(body.cstr()?),
            b'I' => BackendMessage::EmptyQueryResponse,
            b'1' => BackendMessage::ParseComplete,
            b'2' => BackendMessage::BindComplete,
            b'3' => BackendMessage::CloseComplete,
            b'n' => BackendMessage::NoData,
            b's' => BackendMessage::PortalSuspended,
            b't' => {
                let count = body.count()?;
                let oids = (0..count)
                    .map(|_| body.i32().map(Oid::from_i32))
                    .collect::<PgResult<_>>()?;
                BackendMessage::ParameterDescription(oids)
            }
            b'E' => BackendMessage::Error(sql_error(&body.error_fields()?)),
            b'N' => BackendMessage::Notice(sql_error(&body.error_fields()?)),
            b'A' => BackendMessage::Notification {
                process_id: body.i32()?,
                channel: body.cstr()?,
                payload: body.cstr()?,
            },
            other => {
                return Err(PgError::Protocol(format!(
                    "Unknown message type: {:?}",
                    other as char
                )))
            }
        };
        Ok(message)
    }
}

fn transaction_status(byte: u8) -> PgResult<TransactionStatus> {
    match byte {
        b'I' => Ok(TransactionStatus::Idle),
        b'T' => Ok(TransactionStatus::InTransaction),
        b'E' => Ok(TransactionStatus::Failed),
        other => Err(PgError::Protocol(format!(
            "Unknown transaction status: {:?}",
            other as char
        ))),
    }
}

/// Build a [`SqlError`] from ErrorResponse/NoticeResponse fields. `V` is the
/// untranslated severity; older servers only send the localized `S`.
pub(crate) fn sql_error(fields: &HashMap<u8, String>) -> SqlError {
    let field = |code: u8| fields.get(&code).cloned();
    SqlError {
        sqlstate: field(b'C').unwrap_or_default(),
        severity: field(b'V').or_else(|| field(b'S')).unwrap_or_default(),
        message: field(b'M').unwrap_or_default(),
        detail: field(b'D'),
        hint: field(b'H'),
    }
}

/// Checked cursor over one message body.
struct Reader {
    buf: Bytes,
    tag: u8,
}

impl Reader {
    fn need(&self, n: usize) -> PgResult<()> {
        if self.buf.remaining() < n {
            return Err(PgError::Protocol(format!(
                "Truncated {:?} message",
                self.tag as char
            )));
        }
        Ok(())
    }

    fn u8(&mut self) -> PgResult<u8> {
        self.need(1)?;
        Ok(self.buf.get_u8())
    }

    fn i16(&mut self) -> PgResult<i16> {
        self.need(2)?;
        Ok(self.buf.get_i16())
    }

    fn i32(&mut self) -> PgResult<i32> {
        self.need(4)?;
        Ok(self.buf.get_i32())
    }

    /// An Int16 element count.
    fn count(&mut self) -> PgResult<usize> {
        Ok(self.i16()?.max(0) as usize)
    }

    fn bytes(&mut self, n: usize) -> PgResult<Bytes> {
        self.need(n)?;
        Ok(self.buf.split_to(n))
    }

    /// Null-terminated string. Invalid UTF-8 is replaced rather than
    /// rejected.
    fn cstr(&mut self) -> PgResult<String> {
        let end = self.buf.iter().position(|&b| b == 0).ok_or_else(|| {
            PgError::Protocol(format!(
                "Unterminated string in {:?} message",
                self.tag as char
            ))
        })?;
        let raw = self.buf.split_to(end);
        self.buf.advance(1);
        Ok(match std::str::from_utf8(&raw) {
            Ok(s) => s.to_owned(),
            Err(_) => String::from_utf8_lossy(&raw).into_owned(),
        })
    }

    /// Length-prefixed value; -1 is NULL.
    fn value(&mut self) -> PgResult<Option<Bytes>> {
        match self.i32()? {
            n if n < 0 => Ok(None),
            n => self.bytes(n as usize).map(Some),
        }
    }

    fn authentication(&mut self) -> PgResult<Authentication> {
        Ok(match self.i32()? {
            0 => Authentication::Ok,
            3 => Authentication::Cleartext,
            5 => {
                let mut salt = [0u8; 4];
                salt.copy_from_slice(&self.bytes(4)?);
                Authentication::Md5 { salt }
            }
            10 => {
                let mut mechanisms = Vec::new();
                while self.buf.has_remaining() {
                    let mechanism = self.cstr()?;
                    if mechanism.is_empty() {
                        break;
                    }
                    mechanisms.push(mechanism);
                }
                Authentication::Sasl { mechanisms }
            }
            11 => Authentication::SaslContinue(self.buf.split_off(0)),
            12 => Authentication::SaslFinal(self.buf.split_off(0)),
            other => {
                return Err(PgError::Auth(format!(
                    "Unsupported authentication method {}",
                    other
                )))
            }
        })
    }

    fn field_description(&mut self) -> PgResult<FieldDescription> {
        let name = self.cstr()?;
        // Table OID and column number.
        self.need(6)?;
        self.buf.advance(6);
        let type_oid = Oid::from_i32(self.i32()?);
        let _type_size = self.i16()?;
        let type_modifier = self.i32()?;
        let text = self.i16()? == TEXT_FORMAT;
        Ok(FieldDescription {
            name,
            type_oid,
            type_modifier,
            text,
        })
    }

    fn error_fields(&mut self) -> PgResult<HashMap<u8, String>> {
        let mut fields = HashMap::new();
        loop {
            match self.u8()? {
                0 => return Ok(fields),
                code => {
                    let value = self.cstr()?;
                    fields.insert(code, value);
                }
            }
        }
    }
}
