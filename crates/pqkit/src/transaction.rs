//! Transactions and nested (savepoint) transactions.
//!
//! A [`Transaction`] borrows its connection and registers itself in the
//! connection's single transaction slot, so at most one top-level transaction
//! is active per connection. A nested transaction registers in its parent's
//! slot instead and maps onto a `SAVEPOINT`; nested transactions therefore
//! form a strict stack rooted at the top-level transaction.
//!
//! Dropping a transaction that was neither committed nor aborted rolls it
//! back. Errors from that rollback are logged and discarded.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::sync::OnceLock;

use pqkit_core::{
    Capability, Error, Identity, Named, QueryResult, RegistrationSlot, Result, Session,
    TransactionErrorKind,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::prepared::Invocation;

/// Transaction isolation level.
///
/// Defines the degree to which one transaction must be isolated from
/// resource or data modifications made by other concurrent transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Read uncommitted. PostgreSQL treats this as read committed.
    ReadUncommitted,

    /// Read committed: only changes committed before each statement are
    /// visible. The server default.
    #[default]
    ReadCommitted,

    /// Repeatable read: one snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute one at a time. Expect
    /// serialization failures and retry them.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// Where a transaction is in its life.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Registered, start command not yet confirmed
    NotStarted,
    /// Started; commands may be executed
    Active,
    Committed,
    Aborted,
    /// Outcome unknown or server state inconsistent; only dropping is useful
    Broken,
}

/// A transaction on a [`Connection`], or a nested transaction inside another
/// transaction.
pub struct Transaction<'c, S: Session> {
    conn: &'c Connection<S>,
    parent: Option<&'c Transaction<'c, S>>,
    identity: Identity,
    state: Cell<TransactionState>,
    focus: RefCell<RegistrationSlot>,
    savepoint: Option<String>,
    registered: Cell<bool>,
}

impl<'c, S: Session> Transaction<'c, S> {
    /// Start a transaction on `conn`.
    ///
    /// Fails with a usage error if another transaction is active on the
    /// connection, and with [`TransactionErrorKind::Broken`] if an earlier
    /// commit failed and the connection has not been reset since.
    pub fn begin(conn: &'c Connection<S>, name: &str) -> Result<Self> {
        Self::start(conn, name, None)
    }

    /// Start a transaction at the given isolation level.
    pub fn begin_with(
        conn: &'c Connection<S>,
        name: &str,
        isolation: IsolationLevel,
    ) -> Result<Self> {
        Self::start(conn, name, Some(isolation))
    }

    fn start(
        conn: &'c Connection<S>,
        name: &str,
        isolation: Option<IsolationLevel>,
    ) -> Result<Self> {
        if let Some(reason) = conn.poisoned_reason() {
            return Err(Error::transaction(
                TransactionErrorKind::Broken,
                format!(
                    "{} is unusable after a failed commit ({}); reset it first",
                    conn.description(),
                    reason
                ),
            ));
        }

        let identity = Identity::new("Transaction", name);
        conn.register_transaction(&identity)?;
        let tx = Self {
            conn,
            parent: None,
            identity,
            state: Cell::new(TransactionState::NotStarted),
            focus: RefCell::new(RegistrationSlot::new()),
            savepoint: None,
            registered: Cell::new(true),
        };

        let sql = match isolation {
            None => "BEGIN".to_string(),
            Some(level) => format!("BEGIN ISOLATION LEVEL {}", level.as_sql()),
        };
        if let Err(err) = conn.run(&sql) {
            // Dropping `tx` in the Broken state releases the slot without a
            // rollback attempt.
            tx.state.set(TransactionState::Broken);
            return Err(err);
        }
        tx.state.set(TransactionState::Active);
        tracing::debug!(transaction = %tx.identity, ?isolation, "transaction started");
        Ok(tx)
    }

    pub fn state(&self) -> TransactionState {
        self.state.get()
    }

    pub fn is_active(&self) -> bool {
        self.state.get() == TransactionState::Active
    }

    /// Is this a nested transaction?
    pub fn is_nested(&self) -> bool {
        self.parent.is_some()
    }

    pub fn connection(&self) -> &'c Connection<S> {
        self.conn
    }

    /// Execute one command within this transaction.
    pub fn exec(&self, sql: &str) -> Result<QueryResult> {
        self.check_executable()?;
        self.guard_link(self.conn.run(sql))
    }

    /// Start a nested transaction, implemented with a savepoint.
    ///
    /// While the nested transaction is open this transaction refuses to
    /// execute, commit or abort.
    pub fn nested<'p>(&'p self, name: &str) -> Result<Transaction<'p, S>> {
        self.check_state("start a nested transaction in")?;
        if !self.conn.supports(Capability::Savepoints) {
            return Err(Error::Unsupported(format!(
                "nested transactions need savepoints, which server version {} lacks",
                self.conn.server_version()
            )));
        }

        let identity = Identity::new("Subtransaction", name);
        self.focus.borrow_mut().register(&identity)?;
        let savepoint = savepoint_name(name, identity.serial());
        let child = Transaction {
            conn: self.conn,
            parent: Some(self),
            identity,
            state: Cell::new(TransactionState::NotStarted),
            focus: RefCell::new(RegistrationSlot::new()),
            savepoint: Some(savepoint),
            registered: Cell::new(true),
        };

        if let Err(err) = self.conn.run(&format!("SAVEPOINT {}", child.savepoint_ident())) {
            child.state.set(TransactionState::Broken);
            return self.guard_link(Err(err));
        }
        child.state.set(TransactionState::Active);
        tracing::debug!(
            transaction = %child.identity,
            parent = %self.identity,
            "nested transaction started"
        );
        Ok(child)
    }

    /// Invoke a prepared statement declared on the connection.
    pub fn prepared(&self, name: &str) -> Result<Invocation<'_, S>> {
        let decl = self.conn.declaration(name).ok_or_else(|| {
            Error::usage(format!("Unknown prepared statement '{}'", name))
        })?;
        Ok(Invocation::new(self, decl))
    }

    /// Commit.
    ///
    /// A top-level commit that fails leaves the transaction `Broken` and
    /// poisons the connection until [`Connection::reset`]. If the connection
    /// is lost during the commit the error is
    /// [`TransactionErrorKind::InDoubt`]: the server may or may not have
    /// committed.
    pub fn commit(&mut self) -> Result<()> {
        match self.state.get() {
            TransactionState::Active => {}
            TransactionState::Committed => {
                return Err(Error::usage(format!(
                    "{} committed more than once",
                    self.identity.description()
                )));
            }
            TransactionState::Aborted => {
                return Err(Error::usage(format!(
                    "Attempt to commit previously aborted {}",
                    self.identity.description()
                )));
            }
            TransactionState::Broken | TransactionState::NotStarted => {
                return Err(Error::usage(format!(
                    "Attempt to commit broken {}",
                    self.identity.description()
                )));
            }
        }
        self.check_focus("commit")?;

        let outcome = match &self.savepoint {
            Some(_) => self.commit_nested(),
            None => self.commit_top(),
        };
        self.unregister();
        outcome
    }

    fn commit_top(&self) -> Result<()> {
        let desc = self.identity.description();
        match self.conn.run("COMMIT") {
            Ok(result) if result.command_status() == "ROLLBACK" => {
                self.state.set(TransactionState::Broken);
                let message = format!("{} was rolled back by the server instead of committed", desc);
                self.conn.poison(message.clone());
                Err(Error::transaction(TransactionErrorKind::Broken, message))
            }
            Ok(_) => {
                self.state.set(TransactionState::Committed);
                tracing::debug!(transaction = %self.identity, "committed");
                Ok(())
            }
            Err(err) if err.is_connection_error() => {
                self.state.set(TransactionState::Broken);
                let message = format!(
                    "connection lost while committing {}; the commit may or may not have taken effect: {}",
                    desc, err
                );
                self.conn.poison(message.clone());
                Err(Error::transaction(TransactionErrorKind::InDoubt, message))
            }
            Err(err) => {
                self.state.set(TransactionState::Broken);
                self.conn.poison(format!("commit of {} failed: {}", desc, err));
                Err(err)
            }
        }
    }

    fn commit_nested(&self) -> Result<()> {
        let sql = format!("RELEASE SAVEPOINT {}", self.savepoint_ident());
        match self.conn.run(&sql) {
            Ok(_) => {
                self.state.set(TransactionState::Committed);
                tracing::debug!(transaction = %self.identity, "nested transaction committed");
                Ok(())
            }
            Err(err) => {
                self.state.set(TransactionState::Broken);
                Err(err)
            }
        }
    }

    /// Roll back.
    ///
    /// Aborting an aborted or broken transaction does nothing; aborting a
    /// committed one is a usage error.
    pub fn abort(&mut self) -> Result<()> {
        match self.state.get() {
            TransactionState::Active => {}
            TransactionState::Aborted => return Ok(()),
            TransactionState::Broken | TransactionState::NotStarted => {
                self.unregister();
                return Ok(());
            }
            TransactionState::Committed => {
                return Err(Error::usage(format!(
                    "Attempt to abort previously committed {}",
                    self.identity.description()
                )));
            }
        }
        self.check_focus("abort")?;

        let outcome = self.rollback();
        self.unregister();
        outcome
    }

    fn rollback(&self) -> Result<()> {
        let outcome = match &self.savepoint {
            None => self.conn.run("ROLLBACK").map(|_| ()),
            Some(_) => {
                let ident = self.savepoint_ident();
                self.conn
                    .run(&format!("ROLLBACK TO SAVEPOINT {}", ident))
                    .and_then(|_| self.conn.run(&format!("RELEASE SAVEPOINT {}", ident)))
                    .map(|_| ())
            }
        };
        match outcome {
            Ok(()) => {
                self.state.set(TransactionState::Aborted);
                tracing::debug!(transaction = %self.identity, "rolled back");
                Ok(())
            }
            Err(err) => {
                self.state.set(TransactionState::Broken);
                Err(err)
            }
        }
    }

    /// Usage error unless this transaction can run a command right now.
    pub(crate) fn check_executable(&self) -> Result<()> {
        self.check_state("execute on")?;
        self.check_focus("execute on")
    }

    fn check_state(&self, action: &str) -> Result<()> {
        let desc = self.identity.description();
        match self.state.get() {
            TransactionState::Active => Ok(()),
            TransactionState::Committed => Err(Error::usage(format!(
                "Attempt to {} {} after it was committed",
                action, desc
            ))),
            TransactionState::Aborted => Err(Error::usage(format!(
                "Attempt to {} {} after it was aborted",
                action, desc
            ))),
            TransactionState::Broken | TransactionState::NotStarted => Err(Error::usage(
                format!("Attempt to {} broken {}", action, desc),
            )),
        }
    }

    fn check_focus(&self, action: &str) -> Result<()> {
        match self.focus.borrow().current() {
            None => Ok(()),
            Some(child) => Err(Error::usage(format!(
                "Attempt to {} {} while {} is still open",
                action,
                self.identity.description(),
                child.description()
            ))),
        }
    }

    /// A lost connection takes the transaction with it.
    fn guard_link<T>(&self, outcome: Result<T>) -> Result<T> {
        if let Err(err) = &outcome {
            if err.is_connection_error() {
                self.state.set(TransactionState::Broken);
            }
        }
        outcome
    }

    fn savepoint_ident(&self) -> &str {
        self.savepoint.as_deref().unwrap_or_default()
    }

    fn unregister(&self) {
        if !self.registered.replace(false) {
            return;
        }
        let outcome = match self.parent {
            Some(parent) => parent.focus.borrow_mut().unregister(&self.identity),
            None => self.conn.unregister_transaction(&self.identity),
        };
        if let Err(err) = outcome {
            tracing::error!(transaction = %self.identity, error = %err, "unregistration failed");
        }
    }
}

fn savepoint_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"[^a-z0-9_]+").expect("savepoint pattern is valid"))
}

/// A savepoint identifier derived from a user-chosen name: lowercase,
/// restricted to `[a-z0-9_]`, short enough for the 63-byte identifier limit,
/// and unique through the serial.
fn savepoint_name(name: &str, serial: u64) -> String {
    let lowered = name.to_lowercase();
    let cleaned = savepoint_pattern().replace_all(&lowered, "_");
    let cleaned: String = cleaned.trim_matches('_').chars().take(32).collect();
    if cleaned.is_empty() {
        format!("pqkit_sp_{}", serial)
    } else {
        format!("pqkit_{}_{}", cleaned, serial)
    }
}

impl<S: Session> Named for Transaction<'_, S> {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl<S: Session> fmt::Debug for Transaction<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("identity", &self.identity)
            .field("state", &self.state.get())
            .field("savepoint", &self.savepoint)
            .finish_non_exhaustive()
    }
}

impl<S: Session> Drop for Transaction<'_, S> {
    fn drop(&mut self) {
        if self.state.get() == TransactionState::Active {
            if let Some(child) = self.focus.get_mut().current() {
                tracing::error!(
                    transaction = %self.identity,
                    child = %child,
                    "transaction dropped while a nested transaction is still open"
                );
            }
            match self.rollback() {
                Ok(()) => tracing::debug!(transaction = %self.identity, "rolled back on drop"),
                Err(err) => tracing::warn!(
                    transaction = %self.identity,
                    error = %err,
                    "rollback on drop failed; error discarded"
                ),
            }
        }
        self.unregister();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pqkit_core::testing::MemorySession;

    #[test]
    fn isolation_level_sql_and_serde() {
        assert_eq!(IsolationLevel::Serializable.as_sql(), "SERIALIZABLE");
        let json = serde_json::to_string(&IsolationLevel::RepeatableRead).unwrap();
        assert_eq!(json, "\"repeatable_read\"");
    }

    #[test]
    fn begin_with_isolation() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let mut tx = conn
            .transaction_with("ser", IsolationLevel::Serializable)
            .unwrap();
        tx.commit().unwrap();
        assert_eq!(
            probe.log(),
            vec!["BEGIN ISOLATION LEVEL SERIALIZABLE".to_string(), "COMMIT".to_string()]
        );
    }

    #[test]
    fn savepoint_names_are_sanitized() {
        assert_eq!(savepoint_name("Load Batch #1", 7), "pqkit_load_batch_1_7");
        assert_eq!(savepoint_name("", 3), "pqkit_sp_3");
        assert_eq!(savepoint_name("Ωmega", 1), "pqkit_mega_1");
        assert!(savepoint_name(&"x".repeat(200), 99).len() < 63);
    }

    #[test]
    fn misuse_after_finish() {
        let conn = Connection::new(MemorySession::new());
        let mut tx = conn.transaction("t").unwrap();
        tx.commit().unwrap();
        assert!(tx.exec("SELECT 1").unwrap_err().is_usage());
        assert!(tx.commit().unwrap_err().is_usage());
        assert!(tx.abort().unwrap_err().is_usage());

        let mut tx = conn.transaction("u").unwrap();
        tx.abort().unwrap();
        tx.abort().unwrap();
        let err = tx.commit().unwrap_err();
        assert!(err.to_string().contains("previously aborted Transaction 'u'"));
    }

    #[test]
    fn slot_is_released_when_finished() {
        let conn = Connection::new(MemorySession::new());
        let mut first = conn.transaction("first").unwrap();
        first.commit().unwrap();
        let second = conn.transaction("second").unwrap();
        assert!(second.is_active());
        assert_eq!(first.state(), TransactionState::Committed);
    }

    #[test]
    fn failed_begin_releases_slot() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        probe.fail_on("BEGIN", "no more transactions today");
        assert!(conn.transaction("a").unwrap_err().is_runtime());
        probe.clear_faults();
        conn.transaction("b").unwrap();
    }

    #[test]
    fn parent_is_blocked_while_child_open() {
        let conn = Connection::new(MemorySession::new());
        let parent = conn.transaction("outer").unwrap();
        let child = parent.nested("inner").unwrap();
        let err = parent.exec("SELECT 1").unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("Subtransaction 'inner'"));

        let err = parent.nested("second").unwrap_err();
        assert!(
            err.to_string()
                .contains("Started Subtransaction 'second' while Subtransaction 'inner' still active")
        );
        drop(child);
        parent.exec("SELECT 1").unwrap();
    }

    #[test]
    fn nested_requires_savepoints() {
        let conn = Connection::new(MemorySession::with_versions(70400, 3));
        let tx = conn.transaction("old").unwrap();
        assert!(matches!(tx.nested("n").unwrap_err(), Error::Unsupported(_)));
    }

    #[test]
    fn lost_connection_during_exec_breaks_transaction() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        let mut tx = conn.transaction("t").unwrap();
        probe.disconnect_on("UPDATE");
        assert!(tx.exec("UPDATE t SET x = 1").unwrap_err().is_connection_error());
        assert_eq!(tx.state(), TransactionState::Broken);
        tx.abort().unwrap();
    }
}
