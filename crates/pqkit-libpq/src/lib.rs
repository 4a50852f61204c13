//! libpq backend for pqkit.
//!
// FFI bindings require unsafe code
#![allow(unsafe_code)]
//!
//! [`PqSession`] implements [`pqkit::Session`] on a libpq connection;
//! [`PgConnection`] is a [`pqkit::Connection`] over it. libpq itself is
//! built and linked by `pq-sys`.
//!
//! # Example
//!
//! ```rust,ignore
//! use pqkit_libpq::{Connect, PgConnection, PqConfig};
//!
//! let conn = PgConnection::connect(&PqConfig::new("localhost", "postgres", "test"))?;
//! let mut tx = conn.transaction("setup")?;
//! tx.exec("CREATE TEMP TABLE t (id int)")?;
//! tx.commit()?;
//! ```

pub mod config;
mod ffi;
pub mod session;

use pq_sys as _;

pub use config::{DSN_ENV, PqConfig, SslMode};
pub use session::{PqCanceller, PqSession};

use pqkit_core::Result;

/// A pqkit connection backed by libpq.
pub type PgConnection = pqkit::Connection<PqSession>;

/// Opening a [`PgConnection`].
pub trait Connect: Sized {
    /// Connect using a configuration.
    fn connect(config: &PqConfig) -> Result<Self>;

    /// Connect using a conninfo string or `postgres://` URI, as libpq accepts it.
    fn connect_str(conninfo: &str) -> Result<Self>;
}

impl Connect for PgConnection {
    fn connect(config: &PqConfig) -> Result<Self> {
        let session = PqSession::connect(&config.to_conninfo())?;
        let name = if config.dbname.is_empty() {
            config.user.clone()
        } else {
            config.dbname.clone()
        };
        Ok(pqkit::Connection::with_name(session, &name))
    }

    fn connect_str(conninfo: &str) -> Result<Self> {
        Ok(pqkit::Connection::new(PqSession::connect(conninfo)?))
    }
}
