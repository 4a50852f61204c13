//! Connection to a database server.
//!
//! A [`Connection`] owns one [`Session`] and keeps the bookkeeping that lives
//! as long as the session does: which transaction is active, which prepared
//! statements are declared, which large objects have open streams, who is
//! listening for notifications.
//!
//! Connections are single-threaded. All state sits behind `RefCell`s so that
//! transactions can borrow the connection shared while still driving it; as a
//! consequence `Connection` is not `Sync`. The only cross-thread operation is
//! cancellation through a [`CancelHandle`].

use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use pqkit_core::registration::{check_unique_registration, check_unique_unregistration};
use pqkit_core::{
    BoundParam, Capabilities, Capability, Error, Identity, Named, Notification, Oid, QueryResult,
    RegistrationSlot, Result, Session,
};

use crate::cancel::CancelHandle;
use crate::prepared::PreparedDeclaration;
use crate::transaction::{IsolationLevel, Transaction};

type Receiver = Box<dyn FnMut(&Notification) + Send>;

#[derive(Debug)]
struct Declared {
    decl: Arc<PreparedDeclaration>,
    on_server: bool,
}

/// A connection to a PostgreSQL server through a [`Session`].
pub struct Connection<S: Session> {
    identity: Identity,
    session: RefCell<S>,
    capabilities: Cell<Capabilities>,
    transaction: RefCell<RegistrationSlot>,
    statements: RefCell<HashMap<String, Declared>>,
    large_objects: RefCell<HashMap<Oid, Identity>>,
    receivers: RefCell<HashMap<String, Vec<Receiver>>>,
    poisoned: RefCell<Option<String>>,
    /// Bumped whenever the backend is replaced; cancel handles compare it.
    backend_epoch: Arc<AtomicU64>,
}

impl<S: Session> Connection<S> {
    /// Wrap an open session.
    pub fn new(session: S) -> Self {
        Self::with_name(session, "")
    }

    /// Wrap an open session, naming the connection for diagnostics.
    pub fn with_name(session: S, name: &str) -> Self {
        let capabilities =
            Capabilities::detect(session.server_version(), session.protocol_version());
        let identity = Identity::new("Connection", name);
        tracing::debug!(
            connection = %identity,
            server_version = session.server_version(),
            protocol_version = session.protocol_version(),
            "connection established"
        );
        Self {
            identity,
            session: RefCell::new(session),
            capabilities: Cell::new(capabilities),
            transaction: RefCell::new(RegistrationSlot::new()),
            statements: RefCell::new(HashMap::new()),
            large_objects: RefCell::new(HashMap::new()),
            receivers: RefCell::new(HashMap::new()),
            poisoned: RefCell::new(None),
            backend_epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Does the server support `cap`? Detected once per session.
    pub fn supports(&self, cap: Capability) -> bool {
        self.capabilities.get().contains(cap)
    }

    pub fn capabilities(&self) -> Capabilities {
        self.capabilities.get()
    }

    pub fn server_version(&self) -> i32 {
        self.session.borrow().server_version()
    }

    pub fn protocol_version(&self) -> i32 {
        self.session.borrow().protocol_version()
    }

    pub fn backend_pid(&self) -> i32 {
        self.session.borrow().backend_pid()
    }

    pub fn is_open(&self) -> bool {
        self.session.borrow().is_open()
    }

    /// Escape `text` for use inside a single-quoted literal.
    pub fn escape_string(&self, text: &str) -> Result<String> {
        self.session.borrow().escape_string(text)
    }

    /// `text` as a complete single-quoted literal.
    pub fn quote(&self, text: &str) -> Result<String> {
        Ok(format!("'{}'", self.escape_string(text)?))
    }

    pub fn quote_identifier(&self, ident: &str) -> Result<String> {
        self.session.borrow().quote_identifier(ident)
    }

    /// `bytes` as a `bytea` literal.
    pub fn quote_bytes(&self, bytes: &[u8]) -> Result<String> {
        Ok(format!("'{}'::bytea", self.session.borrow().escape_bytea(bytes)?))
    }

    /// Start a transaction. See [`Transaction::begin`].
    pub fn transaction(&self, name: &str) -> Result<Transaction<'_, S>> {
        Transaction::begin(self, name)
    }

    /// Start a transaction at the given isolation level.
    pub fn transaction_with(
        &self,
        name: &str,
        isolation: IsolationLevel,
    ) -> Result<Transaction<'_, S>> {
        Transaction::begin_with(self, name, isolation)
    }

    /// Has a failed commit left this connection unusable until [`reset`]?
    ///
    /// [`reset`]: Connection::reset
    pub fn is_poisoned(&self) -> bool {
        self.poisoned.borrow().is_some()
    }

    /// Declare a prepared statement.
    ///
    /// Re-declaring an identical statement is a no-op; reusing a name for a
    /// different statement is a usage error. The statement is sent to the
    /// server on its first invocation.
    #[tracing::instrument(level = "debug", skip(self, decl), fields(statement = %decl.name()))]
    pub fn prepare(&self, decl: PreparedDeclaration) -> Result<()> {
        decl.validate()?;
        let mut statements = self.statements.borrow_mut();
        match statements.get(decl.name()) {
            Some(existing) if *existing.decl == decl => {
                tracing::trace!("identical re-declaration ignored");
                Ok(())
            }
            Some(_) => Err(Error::usage(format!(
                "Inconsistent redefinition of prepared statement '{}'",
                decl.name()
            ))),
            None => {
                tracing::debug!(sql = decl.sql(), params = decl.params().len(), "declared");
                statements.insert(
                    decl.name().to_string(),
                    Declared {
                        decl: Arc::new(decl),
                        on_server: false,
                    },
                );
                Ok(())
            }
        }
    }

    /// Forget a prepared statement, deallocating it on the server if it was
    /// ever sent there.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unprepare(&self, name: &str) -> Result<()> {
        let removed = self.statements.borrow_mut().remove(name);
        match removed {
            None => Err(Error::usage(format!(
                "Attempt to unprepare unknown statement '{}'",
                name
            ))),
            Some(declared) if declared.on_server => {
                let sql = format!("DEALLOCATE {}", self.quote_identifier(name)?);
                self.run(&sql).map(|_| ())
            }
            Some(_) => Ok(()),
        }
    }

    /// The declaration registered under `name`, if any.
    pub fn declaration(&self, name: &str) -> Option<Arc<PreparedDeclaration>> {
        self.statements
            .borrow()
            .get(name)
            .map(|d| Arc::clone(&d.decl))
    }

    /// Reconnect with the original parameters.
    ///
    /// Clears the poisoned state, marks every declaration as not yet prepared
    /// on the new session, re-detects capabilities and re-issues `LISTEN`
    /// for every channel with receivers.
    #[tracing::instrument(level = "debug", skip(self), fields(connection = %self.identity))]
    pub fn reset(&self) -> Result<()> {
        if let Some(tx) = self.transaction.borrow().current() {
            return Err(Error::usage(format!(
                "Attempt to reset {} while {} is still active",
                self.identity.description(),
                tx.description()
            )));
        }
        // The old backend is gone even if reconnecting fails.
        self.backend_epoch.fetch_add(1, Ordering::AcqRel);
        self.session.borrow_mut().reset()?;

        self.poisoned.borrow_mut().take();
        for declared in self.statements.borrow_mut().values_mut() {
            declared.on_server = false;
        }
        self.large_objects.borrow_mut().clear();
        let caps = {
            let session = self.session.borrow();
            Capabilities::detect(session.server_version(), session.protocol_version())
        };
        self.capabilities.set(caps);

        let channels: Vec<String> = self.receivers.borrow().keys().cloned().collect();
        for channel in &channels {
            let sql = format!("LISTEN {}", self.quote_identifier(channel)?);
            self.run(&sql)?;
        }
        tracing::debug!(relistened = channels.len(), "connection reset");
        Ok(())
    }

    /// Call `handler` for every notification on `channel`.
    ///
    /// The first receiver for a channel issues `LISTEN`. Not allowed while a
    /// transaction is active, since the server would only start listening
    /// once that transaction commits.
    #[tracing::instrument(level = "debug", skip(self, handler))]
    pub fn listen<F>(&self, channel: &str, handler: F) -> Result<()>
    where
        F: FnMut(&Notification) + Send + 'static,
    {
        self.require_idle("listen on", channel)?;
        let first = !self.receivers.borrow().contains_key(channel);
        if first {
            let sql = format!("LISTEN {}", self.quote_identifier(channel)?);
            self.run(&sql)?;
        }
        self.receivers
            .borrow_mut()
            .entry(channel.to_string())
            .or_default()
            .push(Box::new(handler));
        Ok(())
    }

    /// Drop all receivers for `channel` and stop listening on it.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn unlisten(&self, channel: &str) -> Result<()> {
        self.require_idle("unlisten from", channel)?;
        if self.receivers.borrow_mut().remove(channel).is_some() {
            let sql = format!("UNLISTEN {}", self.quote_identifier(channel)?);
            self.run(&sql)?;
        }
        Ok(())
    }

    /// Channels with at least one receiver.
    pub fn listening(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.receivers.borrow().keys().cloned().collect();
        channels.sort();
        channels
    }

    /// Poll for notifications and dispatch them to their receivers.
    ///
    /// Returns the number of notifications received.
    pub fn get_notifs(&self) -> Result<usize> {
        let notifications = self.session.borrow_mut().notifications()?;
        let mut receivers = self.receivers.borrow_mut();
        for notification in &notifications {
            match receivers.get_mut(&notification.channel) {
                Some(handlers) => {
                    for handler in handlers.iter_mut() {
                        handler(notification);
                    }
                }
                None => tracing::debug!(
                    channel = %notification.channel,
                    "notification without receiver dropped"
                ),
            }
        }
        Ok(notifications.len())
    }

    /// A handle that can cancel this connection's running command from
    /// another thread.
    ///
    /// The handle addresses the current backend. After [`reset`](Self::reset),
    /// or once the connection is closed, it is stale: [`CancelHandle::cancel`] then
    /// fails with a usage error instead of signalling a process that no
    /// longer serves this connection. Take a new handle after a reset.
    pub fn cancel_handle(&self) -> Result<CancelHandle> {
        let session = self.session.borrow();
        let epoch = Arc::clone(&self.backend_epoch);
        let issued = epoch.load(Ordering::Acquire);
        session
            .canceller()
            .map(|canceller| CancelHandle::new(canceller, session.backend_pid(), epoch, issued))
            .ok_or_else(|| Error::Unsupported("query cancellation".to_string()))
    }

    /// Close the session.
    ///
    /// A transaction can still be registered here only if its handle was
    /// leaked; that is reported as a usage error.
    pub fn close(self) -> Result<()> {
        let active = self
            .transaction
            .borrow()
            .current()
            .map(Identity::description);
        if let Some(tx) = active {
            return Err(Error::usage(format!(
                "Closing {} while {} is still active",
                self.identity.description(),
                tx
            )));
        }
        self.session.borrow_mut().close();
        tracing::debug!(connection = %self.identity, "connection closed");
        Ok(())
    }

    fn require_idle(&self, action: &str, channel: &str) -> Result<()> {
        match self.transaction.borrow().current() {
            Some(tx) => Err(Error::usage(format!(
                "Attempt to {} '{}' while {} is active",
                action,
                channel,
                tx.description()
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn run(&self, sql: &str) -> Result<QueryResult> {
        tracing::trace!(sql, "exec");
        self.session.borrow_mut().exec(sql)
    }

    /// Execute a declared statement with encoded arguments, preparing it on
    /// the server first if needed, or rendering it into plain SQL when the
    /// server lacks prepared statements.
    pub(crate) fn exec_declared(
        &self,
        decl: &Arc<PreparedDeclaration>,
        params: &[BoundParam],
    ) -> Result<QueryResult> {
        let on_server = match self.statements.borrow().get(decl.name()) {
            Some(current) if Arc::ptr_eq(&current.decl, decl) => current.on_server,
            Some(_) => {
                return Err(Error::usage(format!(
                    "Prepared statement '{}' was redefined after this invocation was created",
                    decl.name()
                )));
            }
            None => {
                return Err(Error::usage(format!(
                    "Prepared statement '{}' was unprepared",
                    decl.name()
                )));
            }
        };

        if !self.supports(Capability::PreparedStatements) {
            let sql = decl.render(params, &*self.session.borrow())?;
            return self.run(&sql);
        }

        if !on_server {
            tracing::debug!(statement = decl.name(), "preparing on server");
            let types: Vec<&str> = decl.params().iter().map(|p| p.sql_type.as_str()).collect();
            self.session
                .borrow_mut()
                .prepare(decl.name(), decl.sql(), &types)?;
            if let Some(declared) = self.statements.borrow_mut().get_mut(decl.name()) {
                declared.on_server = true;
            }
        }
        tracing::trace!(statement = decl.name(), params = params.len(), "exec prepared");
        self.session.borrow_mut().exec_prepared(decl.name(), params)
    }

    pub(crate) fn session_mut(&self) -> RefMut<'_, S> {
        self.session.borrow_mut()
    }

    pub(crate) fn poisoned_reason(&self) -> Option<String> {
        self.poisoned.borrow().clone()
    }

    pub(crate) fn poison(&self, reason: String) {
        tracing::warn!(connection = %self.identity, reason = %reason, "connection poisoned");
        *self.poisoned.borrow_mut() = Some(reason);
    }

    pub(crate) fn register_transaction(&self, tx: &Identity) -> Result<()> {
        self.transaction.borrow_mut().register(tx)
    }

    pub(crate) fn unregister_transaction(&self, tx: &Identity) -> Result<()> {
        self.transaction.borrow_mut().unregister(tx)
    }

    pub(crate) fn register_large_object(&self, oid: Oid, stream: &Identity) -> Result<()> {
        let mut open = self.large_objects.borrow_mut();
        check_unique_registration(Some(stream), open.get(&oid))?;
        open.insert(oid, stream.clone());
        Ok(())
    }

    pub(crate) fn unregister_large_object(&self, oid: Oid, stream: &Identity) -> Result<()> {
        let mut open = self.large_objects.borrow_mut();
        check_unique_unregistration(Some(stream), open.get(&oid))?;
        open.remove(&oid);
        Ok(())
    }
}

impl<S: Session> Named for Connection<S> {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl<S: Session> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("identity", &self.identity)
            .field("capabilities", &self.capabilities.get())
            .field("transaction", &self.transaction.borrow().current())
            .field("poisoned", &self.poisoned.borrow())
            .finish_non_exhaustive()
    }
}

impl<S: Session> Drop for Connection<S> {
    fn drop(&mut self) {
        if let Some(tx) = self.transaction.get_mut().current() {
            tracing::error!(
                connection = %self.identity,
                transaction = %tx,
                "connection dropped while a transaction is still registered"
            );
        }
        self.backend_epoch.fetch_add(1, Ordering::AcqRel);
        self.session.get_mut().close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prepared::Treatment;
    use pqkit_core::testing::MemorySession;
    use std::sync::Mutex;

    #[test]
    fn capabilities_follow_versions() {
        let conn = Connection::new(MemorySession::with_versions(70400, 2));
        assert!(!conn.supports(Capability::Savepoints));
        assert!(!conn.supports(Capability::PreparedStatements));

        let conn = Connection::new(MemorySession::new());
        assert!(conn.supports(Capability::LargeObject64));
        assert_eq!(conn.backend_pid(), 4242);
    }

    #[test]
    fn prepare_registry_rules() {
        let conn = Connection::new(MemorySession::new());
        let decl = PreparedDeclaration::new("ins", "INSERT INTO t VALUES ($1)")
            .param("text", Treatment::String);
        conn.prepare(decl.clone()).unwrap();
        conn.prepare(decl).unwrap();

        let other = PreparedDeclaration::new("ins", "INSERT INTO u VALUES ($1)")
            .param("text", Treatment::String);
        assert!(conn.prepare(other).unwrap_err().is_usage());

        assert!(conn.unprepare("nope").unwrap_err().is_usage());
        conn.unprepare("ins").unwrap();
        assert!(conn.declaration("ins").is_none());
    }

    #[test]
    fn notifications_dispatch_to_receivers() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        conn.listen("jobs", move |n| sink.lock().unwrap().push(n.payload.clone()))
            .unwrap();
        assert_eq!(probe.listening(), vec!["jobs".to_string()]);

        assert!(probe.notify("jobs", "42"));
        assert!(!probe.notify("other", "ignored"));
        assert_eq!(conn.get_notifs().unwrap(), 1);
        assert_eq!(*seen.lock().unwrap(), vec!["42".to_string()]);

        conn.unlisten("jobs").unwrap();
        assert!(probe.listening().is_empty());
        assert!(conn.listening().is_empty());
    }

    #[test]
    fn listen_refused_inside_transaction() {
        let conn = Connection::new(MemorySession::new());
        let tx = conn.transaction("t").unwrap();
        let err = conn.listen("jobs", |_| {}).unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("Transaction 't'"));
        drop(tx);
    }

    #[test]
    fn reset_relistens_and_forgets_server_statements() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.listen("jobs", |_| {}).unwrap();

        probe.drop_connection();
        assert!(!conn.is_open());
        conn.reset().unwrap();
        assert_eq!(probe.resets(), 1);
        assert_eq!(probe.listening(), vec!["jobs".to_string()]);
    }

    #[test]
    fn quoting_helpers() {
        let conn = Connection::new(MemorySession::new());
        assert_eq!(conn.quote("it's").unwrap(), "'it''s'");
        assert_eq!(conn.quote_identifier("my \"t\"").unwrap(), "\"my \"\"t\"\"\"");
        assert_eq!(conn.quote_bytes(b"\0\xff").unwrap(), "'\\x00ff'::bytea");
    }

    #[test]
    fn close_reports_leaked_transaction() {
        let conn = Connection::new(MemorySession::new());
        std::mem::forget(conn.transaction("leaked").unwrap());
        let err = conn.close().unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("Transaction 'leaked'"));
    }
}
