//! PostgreSQL frontend/backend protocol client.
//!
//! - `protocol`: message encoding and decoding
//! - `connection`: asynchronous connection and extended query flow
//! - `driver`: blocking [`crate::driver::Driver`] built on the connection
//! - `types`: OIDs and built-in type names
//! - `scram`: SCRAM-SHA-256 authentication

pub mod connection;
pub mod driver;
pub mod error;
pub mod protocol;
pub mod scram;
pub mod types;


pub use connection::{PgConfig, PgConnection};
pub use driver::{PgConnector, PgDriver};
pub use error::{PgError, PgResult};
pub use types::Oid;
