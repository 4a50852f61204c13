//! Cross-thread cancellation.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pqkit_core::{Canceller, Error, Result};

/// Cancels whatever command its connection is running.
///
/// Obtained from [`Connection::cancel_handle`](crate::Connection::cancel_handle).
/// Unlike the connection itself this handle is `Send + Sync`, so it can be
/// moved to a watchdog thread while the owning thread is blocked. The
/// cancelled command fails with `QueryErrorKind::Cancelled`; if nothing is
/// running the request has no effect.
///
/// A handle belongs to one backend process. Once the connection is reset or
/// closed the handle is stale and refuses to send.
#[derive(Clone)]
pub struct CancelHandle {
    canceller: Arc<dyn Canceller>,
    backend_pid: i32,
    backend_epoch: Arc<AtomicU64>,
    issued_epoch: u64,
}

impl CancelHandle {
    pub(crate) fn new(
        canceller: Arc<dyn Canceller>,
        backend_pid: i32,
        backend_epoch: Arc<AtomicU64>,
        issued_epoch: u64,
    ) -> Self {
        Self {
            canceller,
            backend_pid,
            backend_epoch,
            issued_epoch,
        }
    }

    /// Send the cancel request.
    pub fn cancel(&self) -> Result<()> {
        if self.is_stale() {
            tracing::warn!(backend_pid = self.backend_pid, "cancel through stale handle refused");
            return Err(Error::usage(format!(
                "Cancel handle for backend {} is stale: the connection was reset or closed \
                 since it was obtained",
                self.backend_pid
            )));
        }
        tracing::debug!(backend_pid = self.backend_pid, "sending cancel request");
        self.canceller.cancel()
    }

    /// Has the connection moved to another backend, or closed, since this
    /// handle was obtained?
    pub fn is_stale(&self) -> bool {
        self.backend_epoch.load(Ordering::Acquire) != self.issued_epoch
    }

    /// Server process the request is addressed to.
    pub fn backend_pid(&self) -> i32 {
        self.backend_pid
    }
}

impl fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelHandle")
            .field("backend_pid", &self.backend_pid)
            .field("stale", &self.is_stale())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use crate::Connection;
    use pqkit_core::testing::MemorySession;
    use pqkit_core::{Error, QueryErrorKind};

    #[test]
    fn cancel_from_another_thread() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let handle = conn.cancel_handle().unwrap();
        assert_eq!(handle.backend_pid(), 4242);

        let tx = conn.transaction("slow").unwrap();
        let remote = handle.clone();
        std::thread::spawn(move || remote.cancel().unwrap())
            .join()
            .unwrap();
        assert!(probe.cancel_pending());

        let err = tx.exec("SELECT pg_sleep(60)").unwrap_err();
        match err {
            Error::Query(q) => assert_eq!(q.kind, QueryErrorKind::Cancelled),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn handle_goes_stale_on_reset() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let old = conn.cancel_handle().unwrap();
        assert!(!old.is_stale());

        conn.reset().unwrap();
        assert!(old.is_stale());
        let err = old.cancel().unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("stale"));
        assert!(!probe.cancel_pending());

        let fresh = conn.cancel_handle().unwrap();
        assert!(!fresh.is_stale());
        fresh.cancel().unwrap();
        assert!(probe.cancel_pending());
    }

    #[test]
    fn handle_goes_stale_on_close() {
        let conn = Connection::new(MemorySession::new());
        let handle = conn.cancel_handle().unwrap();
        conn.close().unwrap();
        assert!(handle.is_stale());
        assert!(handle.cancel().unwrap_err().is_usage());
    }
}
