//! Blocking PostgreSQL access with checked transaction and resource lifetimes.
//!
//! pqkit sits on top of a [`Session`] (in practice `pqkit-libpq`'s libpq
//! session) and adds the rules that keep a connection consistent:
//!
//! - one active [`Transaction`] per [`Connection`], nested transactions as a
//!   strict stack of savepoints, rollback on drop
//! - prepared statements declared once per connection and executed through
//!   single-use [`Invocation`]s with null-safe, binary-safe arguments
//! - one open [`LargeObjectAccess`] per large object, closed on drop
//! - notification receivers and a thread-safe [`CancelHandle`]
//!
//! Misuse is reported as [`Error::Usage`] before anything reaches the
//! server.
//!
//! # Example
//!
//! ```rust,ignore
//! use pqkit::{Connection, PreparedDeclaration, Treatment};
//!
//! let conn = Connection::new(session);
//! conn.prepare(
//!     PreparedDeclaration::new("add", "INSERT INTO pqxxbin VALUES ($1, $2)")
//!         .param("int", Treatment::Direct)
//!         .param("bytea", Treatment::Binary),
//! )?;
//!
//! let mut tx = conn.transaction("load")?;
//! tx.prepared("add")?.bind(6).bind(&b"Test\0data"[..]).exec()?;
//! {
//!     let mut inner = tx.nested("audit")?;
//!     inner.exec("INSERT INTO audit VALUES ('loaded')")?;
//!     inner.commit()?;
//! }
//! tx.commit()?;
//! ```

pub mod cancel;
pub mod connection;
pub mod largeobject;
pub mod prepared;
pub mod transaction;

pub use cancel::CancelHandle;
pub use connection::Connection;
pub use largeobject::{LargeObject, LargeObjectAccess};
pub use prepared::{Invocation, Parameter, PreparedDeclaration, Treatment};
pub use transaction::{IsolationLevel, Transaction, TransactionState};

pub use pqkit_core::{
    BoundParam, Capabilities, Capability, ColumnInfo, Error, Field, FromField, Identity, Named,
    Notification, Oid, OpenMode, QueryResult, Result, Row, SeekOrigin, Session, Value,
};
