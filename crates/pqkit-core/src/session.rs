//! The seam between pqkit and the wrapped client protocol.
//!
//! A [`Session`] is one open link to a server. `pqkit-libpq` implements it
//! over libpq; the `testing` feature provides an in-memory implementation.
//! Everything above this trait (transactions, prepared statements, large
//! object streams) is protocol-independent.

use std::ops::BitOr;
use std::path::Path;
use std::sync::Arc;

use crate::error::Result;
use crate::result::QueryResult;

/// Server object identifier.
pub type Oid = u32;

/// The "no object" OID.
pub const INVALID_OID: Oid = 0;

/// Wire format of one bound parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParamFormat {
    Text,
    Binary,
}

/// A parameter value ready to send; `value == None` is SQL NULL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundParam {
    pub value: Option<Vec<u8>>,
    pub format: ParamFormat,
}

impl BoundParam {
    pub fn null() -> Self {
        Self {
            value: None,
            format: ParamFormat::Text,
        }
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self {
            value: Some(value.into().into_bytes()),
            format: ParamFormat::Text,
        }
    }

    pub fn binary(value: impl Into<Vec<u8>>) -> Self {
        Self {
            value: Some(value.into()),
            format: ParamFormat::Binary,
        }
    }

    pub fn is_null(&self) -> bool {
        self.value.is_none()
    }
}

/// Reference point for a large-object seek.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekOrigin {
    Start,
    Current,
    End,
}

/// Large-object open mode, combined with `|`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OpenMode(i32);

impl OpenMode {
    /// `INV_READ`
    pub const READ: OpenMode = OpenMode(0x0004_0000);
    /// `INV_WRITE`
    pub const WRITE: OpenMode = OpenMode(0x0002_0000);
    pub const READ_WRITE: OpenMode = OpenMode(0x0006_0000);

    pub const fn bits(self) -> i32 {
        self.0
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READ.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITE.0 != 0
    }
}

impl BitOr for OpenMode {
    type Output = OpenMode;

    fn bitor(self, rhs: OpenMode) -> OpenMode {
        OpenMode(self.0 | rhs.0)
    }
}

/// An asynchronous notification delivered by `NOTIFY`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub channel: String,
    pub payload: String,
    pub backend_pid: i32,
}

/// Sends a cancel request for whatever the session is running.
///
/// This is the one object that may be used from another thread while the
/// owning connection is blocked in a command.
pub trait Canceller: Send + Sync {
    fn cancel(&self) -> Result<()>;
}

/// Optional server and protocol features.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// Server-side `PREPARE` through the extended protocol
    PreparedStatements,
    /// Out-of-line parameters for plain commands
    ParameterizedStatements,
    /// `SAVEPOINT` and friends, needed for nested transactions
    Savepoints,
    /// `NOTIFY channel, 'payload'`
    NotifyPayload,
    /// `lo_lseek64` / `lo_tell64`
    LargeObject64,
}

impl Capability {
    const fn bit(self) -> u8 {
        match self {
            Capability::PreparedStatements => 1,
            Capability::ParameterizedStatements => 1 << 1,
            Capability::Savepoints => 1 << 2,
            Capability::NotifyPayload => 1 << 3,
            Capability::LargeObject64 => 1 << 4,
        }
    }
}

/// Set of [`Capability`] flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Capabilities(u8);

impl Capabilities {
    pub const fn none() -> Self {
        Capabilities(0)
    }

    pub const fn all() -> Self {
        Capabilities(0b1_1111)
    }

    /// Derive capabilities from the server version (`PQserverVersion`
    /// encoding, e.g. `90300` for 9.3) and the frontend/backend protocol
    /// version.
    pub fn detect(server_version: i32, protocol_version: i32) -> Self {
        let mut caps = Capabilities::none();
        if protocol_version >= 3 {
            caps = caps
                .with(Capability::PreparedStatements)
                .with(Capability::ParameterizedStatements);
        }
        if server_version >= 80000 {
            caps = caps.with(Capability::Savepoints);
        }
        if server_version >= 90000 {
            caps = caps.with(Capability::NotifyPayload);
        }
        if server_version >= 90300 {
            caps = caps.with(Capability::LargeObject64);
        }
        caps
    }

    pub const fn contains(self, cap: Capability) -> bool {
        self.0 & cap.bit() != 0
    }

    pub const fn with(self, cap: Capability) -> Self {
        Capabilities(self.0 | cap.bit())
    }

    pub const fn without(self, cap: Capability) -> Self {
        Capabilities(self.0 & !cap.bit())
    }
}

/// One blocking session with a server.
///
/// Implementations report server failures as [`crate::Error::Query`],
/// lost links as [`crate::Error::Connection`], and failed large-object calls
/// as [`crate::Error::LargeObject`] carrying [`Session::reason`].
pub trait Session {
    /// Execute one command string.
    fn exec(&mut self, sql: &str) -> Result<QueryResult>;

    /// Create a server-side prepared statement with one SQL type name per
    /// parameter. An empty type name leaves that parameter's type to the
    /// server.
    fn prepare(&mut self, name: &str, sql: &str, param_types: &[&str]) -> Result<()>;

    /// Execute a prepared statement with bound parameters.
    fn exec_prepared(&mut self, name: &str, params: &[BoundParam]) -> Result<QueryResult>;

    /// `180003` for server 18.3.
    fn server_version(&self) -> i32;

    fn protocol_version(&self) -> i32;

    fn backend_pid(&self) -> i32;

    fn is_open(&self) -> bool;

    /// Drop the link and reconnect with the original parameters.
    fn reset(&mut self) -> Result<()>;

    /// Close the link. Further calls fail with a connection error.
    fn close(&mut self);

    /// The most recent error text from the session.
    fn reason(&self) -> String;

    /// Drain notifications received so far without blocking.
    fn notifications(&mut self) -> Result<Vec<Notification>>;

    /// A thread-safe handle for cancelling the running command, if the
    /// session supports cancellation.
    fn canceller(&self) -> Option<Arc<dyn Canceller>>;

    /// Escape text for use inside a single-quoted literal (quotes not added).
    fn escape_string(&self, text: &str) -> Result<String> {
        Ok(text.replace('\'', "''"))
    }

    /// Hex-format `bytea` text for `bytes`, without quotes.
    fn escape_bytea(&self, bytes: &[u8]) -> Result<String> {
        use std::fmt::Write;
        let mut out = String::with_capacity(2 + bytes.len() * 2);
        out.push_str("\\x");
        for b in bytes {
            let _ = write!(out, "{:02x}", b);
        }
        Ok(out)
    }

    /// Double-quoted identifier.
    fn quote_identifier(&self, ident: &str) -> Result<String> {
        Ok(format!("\"{}\"", ident.replace('"', "\"\"")))
    }

    fn lo_create(&mut self) -> Result<Oid>;

    fn lo_import(&mut self, path: &Path) -> Result<Oid>;

    fn lo_export(&mut self, oid: Oid, path: &Path) -> Result<()>;

    fn lo_unlink(&mut self, oid: Oid) -> Result<()>;

    /// Open an object and return its descriptor.
    fn lo_open(&mut self, oid: Oid, mode: OpenMode) -> Result<i32>;

    fn lo_close(&mut self, fd: i32) -> Result<()>;

    /// Read up to `buf.len()` bytes; `0` at end of object.
    fn lo_read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize>;

    /// Write `buf`, returning the number of bytes the server accepted.
    fn lo_write(&mut self, fd: i32, buf: &[u8]) -> Result<usize>;

    /// Move the descriptor and return the new absolute position.
    fn lo_seek(&mut self, fd: i32, offset: i64, origin: SeekOrigin) -> Result<i64>;

    fn lo_tell(&mut self, fd: i32) -> Result<i64>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn capability_detection_thresholds() {
        let old = Capabilities::detect(70400, 2);
        assert_eq!(old, Capabilities::none());

        let v8 = Capabilities::detect(80400, 3);
        assert!(v8.contains(Capability::PreparedStatements));
        assert!(v8.contains(Capability::Savepoints));
        assert!(!v8.contains(Capability::NotifyPayload));

        let modern = Capabilities::detect(160_002, 3);
        assert_eq!(modern, Capabilities::all());
        assert!(!modern.without(Capability::Savepoints).contains(Capability::Savepoints));
    }

    #[test]
    fn open_mode_bits() {
        let rw = OpenMode::READ | OpenMode::WRITE;
        assert_eq!(rw, OpenMode::READ_WRITE);
        assert!(rw.is_readable() && rw.is_writable());
        assert!(!OpenMode::READ.is_writable());
        assert_eq!(OpenMode::WRITE.bits(), 0x20000);
    }

    #[test]
    fn bound_param_null_is_not_empty() {
        assert!(BoundParam::null().is_null());
        assert_eq!(BoundParam::text("").value, Some(Vec::new()));
        assert_eq!(BoundParam::binary(b"a\0b".to_vec()).format, ParamFormat::Binary);
    }
}
