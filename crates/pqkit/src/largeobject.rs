//! Server-side large objects.
//!
//! [`LargeObject`] is just an OID plus the whole-object operations (create,
//! import, export, remove). [`LargeObjectAccess`] is an open descriptor on
//! one object, bound to a transaction, with positioned reads and writes. It
//! also implements [`std::io::Read`], [`std::io::Write`] and
//! [`std::io::Seek`] so it can be handed to `std::io::copy` and friends.
//!
//! Descriptors only live as long as the server-side transaction, which the
//! borrow on [`Transaction`] enforces.

use std::fmt;
use std::io;
use std::path::Path;

use pqkit_core::{Error, Identity, Named, Oid, OpenMode, Result, SeekOrigin, Session};

use crate::transaction::Transaction;

/// Re-attribute a large-object failure from the session to `oid`, with
/// `context` in front of the session's reason. Other errors pass through.
fn failure(oid: Option<Oid>, context: String, err: Error) -> Error {
    match err {
        Error::LargeObject(e) => Error::large_object(
            oid.or(e.oid),
            format!("{}: {}", context, e.message),
        ),
        other => other,
    }
}

/// Identifies a large object on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LargeObject {
    oid: Oid,
}

impl LargeObject {
    /// Refer to an existing object.
    pub fn from_oid(oid: Oid) -> Self {
        Self { oid }
    }

    pub fn oid(&self) -> Oid {
        self.oid
    }

    /// Create a new, empty object.
    pub fn create<S: Session>(tx: &Transaction<'_, S>) -> Result<Self> {
        tx.check_executable()?;
        let oid = tx
            .connection()
            .session_mut()
            .lo_create()
            .map_err(|e| failure(None, "Could not create large object".to_string(), e))?;
        tracing::debug!(oid, "large object created");
        Ok(Self { oid })
    }

    /// Create an object holding the contents of a client-side file.
    pub fn import<S: Session>(tx: &Transaction<'_, S>, path: impl AsRef<Path>) -> Result<Self> {
        tx.check_executable()?;
        let path = path.as_ref();
        let oid = tx
            .connection()
            .session_mut()
            .lo_import(path)
            .map_err(|e| {
                failure(
                    None,
                    format!("Could not import file '{}' to large object", path.display()),
                    e,
                )
            })?;
        tracing::debug!(oid, path = %path.display(), "large object imported");
        Ok(Self { oid })
    }

    /// Write the object's contents to a client-side file.
    pub fn to_file<S: Session>(&self, tx: &Transaction<'_, S>, path: impl AsRef<Path>) -> Result<()> {
        tx.check_executable()?;
        let path = path.as_ref();
        tx.connection()
            .session_mut()
            .lo_export(self.oid, path)
            .map_err(|e| {
                failure(
                    Some(self.oid),
                    format!(
                        "Could not export large object {} to file '{}'",
                        self.oid,
                        path.display()
                    ),
                    e,
                )
            })
    }

    /// Delete the object.
    pub fn remove<S: Session>(self, tx: &Transaction<'_, S>) -> Result<()> {
        tx.check_executable()?;
        tx.connection()
            .session_mut()
            .lo_unlink(self.oid)
            .map_err(|e| {
                failure(
                    Some(self.oid),
                    format!("Could not delete large object {}", self.oid),
                    e,
                )
            })?;
        tracing::debug!(oid = self.oid, "large object removed");
        Ok(())
    }
}

/// An open stream on a large object.
///
/// At most one stream per object may be open on a connection. The stream is
/// closed by [`close`](LargeObjectAccess::close) or on drop.
pub struct LargeObjectAccess<'t, S: Session> {
    tx: &'t Transaction<'t, S>,
    object: LargeObject,
    identity: Identity,
    mode: OpenMode,
    fd: Option<i32>,
}

impl<'t, S: Session> LargeObjectAccess<'t, S> {
    /// Open an existing object.
    pub fn open(tx: &'t Transaction<'t, S>, object: LargeObject, mode: OpenMode) -> Result<Self> {
        tx.check_executable()?;
        let oid = object.oid();
        let identity = Identity::new("LargeObjectAccess", format!("#{}", oid));
        let conn = tx.connection();
        conn.register_large_object(oid, &identity)?;

        let opened = conn.session_mut().lo_open(oid, mode);
        match opened {
            Ok(fd) => {
                tracing::debug!(oid, fd, "large object opened");
                Ok(Self {
                    tx,
                    object,
                    identity,
                    mode,
                    fd: Some(fd),
                })
            }
            Err(e) => {
                if let Err(err) = conn.unregister_large_object(oid, &identity) {
                    tracing::error!(oid, error = %err, "unregistration failed");
                }
                Err(failure(
                    Some(oid),
                    format!("Could not open large object {}", oid),
                    e,
                ))
            }
        }
    }

    /// Create a new object and open it.
    pub fn create(tx: &'t Transaction<'t, S>, mode: OpenMode) -> Result<Self> {
        let object = LargeObject::create(tx)?;
        Self::open(tx, object, mode)
    }

    /// Import a client-side file into a new object and open it.
    pub fn import(tx: &'t Transaction<'t, S>, path: impl AsRef<Path>, mode: OpenMode) -> Result<Self> {
        let object = LargeObject::import(tx, path)?;
        Self::open(tx, object, mode)
    }

    pub fn object(&self) -> LargeObject {
        self.object
    }

    pub fn oid(&self) -> Oid {
        self.object.oid()
    }

    pub fn mode(&self) -> OpenMode {
        self.mode
    }

    pub fn is_open(&self) -> bool {
        self.fd.is_some()
    }

    fn fd(&self) -> Result<i32> {
        self.fd.ok_or_else(|| {
            Error::usage(format!(
                "Attempt to use closed {}",
                self.identity.description()
            ))
        })
    }

    /// Move the read/write position and return the new one.
    ///
    /// Like every stream operation, refused while a nested transaction of
    /// the owning transaction is open.
    pub fn seek(&mut self, offset: i64, origin: SeekOrigin) -> Result<i64> {
        let fd = self.fd()?;
        self.tx.check_executable()?;
        self.tx
            .connection()
            .session_mut()
            .lo_seek(fd, offset, origin)
            .map_err(|e| failure(Some(self.oid()), "Error seeking in large object".to_string(), e))
    }

    /// Current read/write position.
    pub fn tell(&mut self) -> Result<i64> {
        let fd = self.fd()?;
        self.tx.check_executable()?;
        self.tx
            .connection()
            .session_mut()
            .lo_tell(fd)
            .map_err(|e| {
                failure(
                    Some(self.oid()),
                    "Error getting position in large object".to_string(),
                    e,
                )
            })
    }

    /// Read up to `buf.len()` bytes. Returns `0` at the end of the object.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let fd = self.fd()?;
        self.tx.check_executable()?;
        if buf.is_empty() {
            return Ok(0);
        }
        let oid = self.oid();
        let n = self
            .tx
            .connection()
            .session_mut()
            .lo_read(fd, buf)
            .map_err(|e| failure(Some(oid), format!("Error reading from large object #{}", oid), e))?;
        if n > buf.len() {
            return Err(Error::internal(format!(
                "read of {} bytes from large object #{} returned {}",
                buf.len(),
                oid,
                n
            )));
        }
        Ok(n)
    }

    /// Write all of `buf`. Anything short of a complete write is an error.
    pub fn write(&mut self, buf: &[u8]) -> Result<()> {
        let fd = self.fd()?;
        self.tx.check_executable()?;
        if buf.is_empty() {
            return Ok(());
        }
        let oid = self.oid();
        let conn = self.tx.connection();
        let written = conn
            .session_mut()
            .lo_write(fd, buf)
            .map_err(|e| failure(Some(oid), format!("Error writing to large object #{}", oid), e))?;
        if written == 0 {
            let reason = conn.session_mut().reason();
            return Err(Error::large_object(
                Some(oid),
                format!("Could not write to large object #{}: {}", oid, reason),
            ));
        }
        if written < buf.len() {
            return Err(Error::large_object(
                Some(oid),
                format!(
                    "Wanted to write {} bytes to large object #{}; could only write {}",
                    buf.len(),
                    oid,
                    written
                ),
            ));
        }
        Ok(())
    }

    /// Close the descriptor. Closing twice is harmless.
    pub fn close(&mut self) -> Result<()> {
        let Some(fd) = self.fd.take() else {
            return Ok(());
        };
        let oid = self.oid();
        let conn = self.tx.connection();
        let closed = conn.session_mut().lo_close(fd);
        let unregistered = conn.unregister_large_object(oid, &self.identity);
        closed.map_err(|e| failure(Some(oid), format!("Could not close large object {}", oid), e))?;
        unregistered
    }
}

impl<S: Session> Named for LargeObjectAccess<'_, S> {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl<S: Session> fmt::Debug for LargeObjectAccess<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LargeObjectAccess")
            .field("oid", &self.object.oid())
            .field("mode", &self.mode)
            .field("fd", &self.fd)
            .finish_non_exhaustive()
    }
}

impl<S: Session> Drop for LargeObjectAccess<'_, S> {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            tracing::debug!(oid = self.object.oid(), error = %err, "close on drop failed; error discarded");
        }
    }
}

impl<S: Session> io::Read for LargeObjectAccess<'_, S> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        LargeObjectAccess::read(self, buf).map_err(io::Error::other)
    }
}

impl<S: Session> io::Write for LargeObjectAccess<'_, S> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        LargeObjectAccess::write(self, buf).map_err(io::Error::other)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<S: Session> io::Seek for LargeObjectAccess<'_, S> {
    fn seek(&mut self, pos: io::SeekFrom) -> io::Result<u64> {
        let (offset, origin) = match pos {
            io::SeekFrom::Start(n) => (
                i64::try_from(n).map_err(|_| {
                    io::Error::new(io::ErrorKind::InvalidInput, "seek offset out of range")
                })?,
                SeekOrigin::Start,
            ),
            io::SeekFrom::Current(n) => (n, SeekOrigin::Current),
            io::SeekFrom::End(n) => (n, SeekOrigin::End),
        };
        let new_pos = LargeObjectAccess::seek(self, offset, origin).map_err(io::Error::other)?;
        u64::try_from(new_pos)
            .map_err(|_| io::Error::other(format!("server returned negative position {}", new_pos)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connection;
    use pqkit_core::testing::MemorySession;
    use std::io::{Read, Seek, SeekFrom, Write};

    #[test]
    fn write_read_and_seek() {
        let conn = Connection::new(MemorySession::new());
        let tx = conn.transaction("lo").unwrap();
        let mut lo = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();
        lo.write(b"hello, world").unwrap();
        assert_eq!(lo.tell().unwrap(), 12);
        assert_eq!(lo.seek(7, SeekOrigin::Start).unwrap(), 7);
        let mut buf = [0_u8; 16];
        let n = lo.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"world");
        assert_eq!(lo.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn io_traits() {
        let conn = Connection::new(MemorySession::new());
        let tx = conn.transaction("lo").unwrap();
        let mut lo = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();
        std::io::copy(&mut &b"streamed bytes"[..], &mut lo).unwrap();
        lo.flush().unwrap();
        assert_eq!(Seek::seek(&mut lo, SeekFrom::End(-5)).unwrap(), 9);
        let mut tail = String::new();
        lo.read_to_string(&mut tail).unwrap();
        assert_eq!(tail, "bytes");
        assert!(Seek::seek(&mut lo, SeekFrom::Current(-100)).is_err());
    }

    #[test]
    fn second_open_of_same_object_is_usage_error() {
        let conn = Connection::new(MemorySession::new());
        let tx = conn.transaction("lo").unwrap();
        let first = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();
        let err = LargeObjectAccess::open(&tx, first.object(), OpenMode::READ).unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("still active"));
        drop(first);
        let reopened = LargeObjectAccess::open(&tx, LargeObject::from_oid(16_400), OpenMode::READ);
        assert!(reopened.is_ok());
    }

    #[test]
    fn closed_handle_is_usage_error() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let tx = conn.transaction("lo").unwrap();
        let mut lo = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();
        assert_eq!(probe.open_descriptors(), 1);
        lo.close().unwrap();
        lo.close().unwrap();
        assert_eq!(probe.open_descriptors(), 0);
        assert!(lo.write(b"x").unwrap_err().is_usage());
        assert!(lo.tell().unwrap_err().is_usage());
    }

    #[test]
    fn stream_waits_for_nested_transaction() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let outer = conn.transaction("outer").unwrap();
        let mut lo = LargeObjectAccess::create(&outer, OpenMode::READ_WRITE).unwrap();
        lo.write(b"abc").unwrap();

        let child = outer.nested("child").unwrap();
        let before = probe.log().len();
        let err = lo.write(b"x").unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("still open"));
        assert!(lo.seek(0, SeekOrigin::Start).unwrap_err().is_usage());
        assert!(lo.tell().unwrap_err().is_usage());
        let mut buf = [0_u8; 4];
        assert!(lo.read(&mut buf).unwrap_err().is_usage());
        assert!(lo.read(&mut [0_u8; 0]).unwrap_err().is_usage());
        assert_eq!(probe.log().len(), before);
        drop(child);

        lo.write(b"x").unwrap();
        assert_eq!(lo.tell().unwrap(), 4);
    }

    #[test]
    fn short_writes_are_errors() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let tx = conn.transaction("lo").unwrap();
        let mut lo = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();

        probe.limit_lo_writes(Some(3));
        let err = lo.write(b"abcdef").unwrap_err();
        assert!(
            err.to_string()
                .contains("Wanted to write 6 bytes to large object #16400; could only write 3")
        );

        probe.limit_lo_writes(Some(0));
        let err = lo.write(b"abc").unwrap_err();
        assert!(err.to_string().contains("Could not write to large object #16400"));
    }

    #[test]
    fn whole_object_operations() {
        let dir = std::env::temp_dir().join(format!("pqkit-lo-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let src = dir.join("in.bin");
        let dst = dir.join("out.bin");
        std::fs::write(&src, b"file\0contents").unwrap();

        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let mut tx = conn.transaction("files").unwrap();
        let object = LargeObject::import(&tx, &src).unwrap();
        object.to_file(&tx, &dst).unwrap();
        assert_eq!(std::fs::read(&dst).unwrap(), b"file\0contents");

        let err = LargeObject::import(&tx, dir.join("missing.bin")).unwrap_err();
        assert!(err.to_string().contains("Could not import file"));

        object.remove(&tx).unwrap();
        let err = object.remove(&tx).unwrap_err();
        assert!(err.is_runtime());
        assert!(err.to_string().contains(&format!("Could not delete large object {}", object.oid())));
        tx.commit().unwrap();
        assert!(probe.large_object(object.oid()).is_none());

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
