//! Core types for pqkit.
//!
//! This crate holds everything that does not depend on how the server is
//! reached:
//!
//! - [`Error`] and its families (usage, runtime, internal, out of memory)
//! - [`Identity`] and the [`RegistrationSlot`] guard that enforces
//!   one-active-dependent rules
//! - [`Value`] for prepared-statement arguments
//! - [`QueryResult`], [`Row`] and [`Field`] for reading results
//! - the [`Session`] trait, the seam to the wrapped client library
//!
//! With the `testing` feature it also provides [`testing::MemorySession`],
//! an in-memory session used by the test suites.

pub mod error;
pub mod identity;
pub mod registration;
pub mod result;
pub mod session;
pub mod value;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use error::{
    ConfigError, ConnectionError, ConnectionErrorKind, Error, InternalError, LargeObjectError,
    QueryError, QueryErrorKind, Result, TransactionError, TransactionErrorKind, TypeError,
    UsageError,
};
pub use identity::{Identity, Named};
pub use registration::{RegistrationSlot, check_unique_registration, check_unique_unregistration};
pub use result::{ColumnInfo, Field, FromField, QueryResult, Row};
pub use session::{
    BoundParam, Canceller, Capabilities, Capability, INVALID_OID, Notification, Oid, OpenMode,
    ParamFormat, SeekOrigin, Session,
};
pub use value::Value;
