//! In-memory [`Session`] for tests.
//!
//! `MemorySession` understands just enough SQL to model transaction
//! control: `BEGIN`, `COMMIT`, `ROLLBACK`, `SAVEPOINT`, `RELEASE`,
//! `ROLLBACK TO`, `LISTEN`, `UNLISTEN` and `DEALLOCATE`. Every other command
//! is recorded as a write in the innermost open frame, and becomes visible in
//! [`MemoryProbe::committed`] once the outermost transaction commits. Large
//! objects live in a map that is snapshotted at `BEGIN` and at each
//! savepoint, so rollbacks undo them too.
//!
//! A [`MemoryProbe`] shares the session's state, so a test can inspect and
//! script the session after handing it to a connection.

use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::error::{ConnectionErrorKind, Error, QueryError, QueryErrorKind, Result};
use crate::result::QueryResult;
use crate::session::{
    BoundParam, Canceller, Notification, Oid, OpenMode, SeekOrigin, Session,
};

const BACKEND_PID: i32 = 4242;
const FIRST_OID: Oid = 16_400;

/// A write that reached the session: command text plus bound parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteRecord {
    pub sql: String,
    pub params: Vec<Option<Vec<u8>>>,
}

#[derive(Debug)]
struct Frame {
    savepoint: Option<String>,
    writes: Vec<WriteRecord>,
    objects: HashMap<Oid, Vec<u8>>,
}

#[derive(Debug, Clone)]
enum Fault {
    Query(String),
    Disconnect,
}

#[derive(Debug, Clone, Copy)]
struct Descriptor {
    oid: Oid,
    pos: i64,
    mode: OpenMode,
}

#[derive(Debug)]
struct MemoryState {
    server_version: i32,
    protocol_version: i32,
    open: bool,
    log: Vec<String>,
    committed: Vec<WriteRecord>,
    frames: Vec<Frame>,
    failed: bool,
    prepared: HashMap<String, (String, Vec<String>)>,
    faults: Vec<(String, Fault)>,
    responses: Vec<(String, QueryResult)>,
    listening: BTreeSet<String>,
    queued: Vec<Notification>,
    objects: HashMap<Oid, Vec<u8>>,
    next_oid: Oid,
    descriptors: HashMap<i32, Descriptor>,
    next_fd: i32,
    write_limit: Option<usize>,
    resets: usize,
    last_error: String,
    cancel: Arc<AtomicBool>,
}

/// In-memory session; see the module docs.
#[derive(Debug)]
pub struct MemorySession {
    state: Rc<RefCell<MemoryState>>,
}

/// Shared view into a [`MemorySession`].
#[derive(Debug, Clone)]
pub struct MemoryProbe {
    state: Rc<RefCell<MemoryState>>,
}

impl Default for MemorySession {
    fn default() -> Self {
        Self::new()
    }
}

impl MemorySession {
    /// A session that reports server 16.0 over protocol 3, so every
    /// capability is available.
    pub fn new() -> Self {
        Self::with_versions(160_000, 3)
    }

    /// A session reporting the given server and protocol versions.
    pub fn with_versions(server_version: i32, protocol_version: i32) -> Self {
        Self {
            state: Rc::new(RefCell::new(MemoryState {
                server_version,
                protocol_version,
                open: true,
                log: Vec::new(),
                committed: Vec::new(),
                frames: Vec::new(),
                failed: false,
                prepared: HashMap::new(),
                faults: Vec::new(),
                responses: Vec::new(),
                listening: BTreeSet::new(),
                queued: Vec::new(),
                objects: HashMap::new(),
                next_oid: FIRST_OID,
                descriptors: HashMap::new(),
                next_fd: 0,
                write_limit: None,
                resets: 0,
                last_error: String::new(),
                cancel: Arc::new(AtomicBool::new(false)),
            })),
        }
    }

    pub fn probe(&self) -> MemoryProbe {
        MemoryProbe {
            state: Rc::clone(&self.state),
        }
    }
}

impl MemoryProbe {
    /// Every command the session received, in order. Prepared statements
    /// appear as `PREPARE name: sql` (or `PREPARE name (type, ..): sql`
    /// when types were declared) and `EXECUTE name`.
    pub fn log(&self) -> Vec<String> {
        self.state.borrow().log.clone()
    }

    /// Writes made durable by a top-level commit or in autocommit mode.
    pub fn committed(&self) -> Vec<WriteRecord> {
        self.state.borrow().committed.clone()
    }

    /// Writes inside still-open transaction frames.
    pub fn pending(&self) -> Vec<WriteRecord> {
        self.state
            .borrow()
            .frames
            .iter()
            .flat_map(|f| f.writes.iter().cloned())
            .collect()
    }

    pub fn in_transaction(&self) -> bool {
        !self.state.borrow().frames.is_empty()
    }

    /// Open savepoint names, outermost first.
    pub fn savepoints(&self) -> Vec<String> {
        self.state
            .borrow()
            .frames
            .iter()
            .filter_map(|f| f.savepoint.clone())
            .collect()
    }

    /// Fail every command starting with `prefix` (case-insensitive) with a
    /// server error carrying `message`.
    pub fn fail_on(&self, prefix: &str, message: &str) {
        self.state
            .borrow_mut()
            .faults
            .push((prefix.to_string(), Fault::Query(message.to_string())));
    }

    /// Drop the connection when a command starting with `prefix` arrives.
    pub fn disconnect_on(&self, prefix: &str) {
        self.state
            .borrow_mut()
            .faults
            .push((prefix.to_string(), Fault::Disconnect));
    }

    pub fn clear_faults(&self) {
        self.state.borrow_mut().faults.clear();
    }

    /// Answer queries starting with `prefix` with `result`.
    pub fn respond(&self, prefix: &str, result: QueryResult) {
        self.state
            .borrow_mut()
            .responses
            .push((prefix.to_string(), result));
    }

    /// Deliver a notification if the session listens on `channel`.
    pub fn notify(&self, channel: &str, payload: &str) -> bool {
        let mut st = self.state.borrow_mut();
        if !st.listening.contains(channel) {
            return false;
        }
        st.queued.push(Notification {
            channel: channel.to_string(),
            payload: payload.to_string(),
            backend_pid: BACKEND_PID,
        });
        true
    }

    pub fn listening(&self) -> Vec<String> {
        self.state.borrow().listening.iter().cloned().collect()
    }

    pub fn prepared_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.borrow().prepared.keys().cloned().collect();
        names.sort();
        names
    }

    /// Parameter types a statement was prepared with.
    pub fn prepared_types(&self, name: &str) -> Option<Vec<String>> {
        self.state.borrow().prepared.get(name).map(|(_, types)| types.clone())
    }

    /// Current contents of a large object, including uncommitted changes.
    pub fn large_object(&self, oid: Oid) -> Option<Vec<u8>> {
        self.state.borrow().objects.get(&oid).cloned()
    }

    pub fn open_descriptors(&self) -> usize {
        self.state.borrow().descriptors.len()
    }

    /// Cap the bytes accepted by each large-object write.
    pub fn limit_lo_writes(&self, limit: Option<usize>) {
        self.state.borrow_mut().write_limit = limit;
    }

    pub fn resets(&self) -> usize {
        self.state.borrow().resets
    }

    /// Was a cancel request sent and not yet consumed by a command?
    pub fn cancel_pending(&self) -> bool {
        self.state.borrow().cancel.load(Ordering::SeqCst)
    }

    /// Simulate the server going away.
    pub fn drop_connection(&self) {
        let _ = self.state.borrow_mut().disconnect();
    }
}

struct MemoryCanceller {
    flag: Arc<AtomicBool>,
}

impl Canceller for MemoryCanceller {
    fn cancel(&self) -> Result<()> {
        self.flag.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn starts_with_ci(text: &str, prefix: &str) -> bool {
    text.len() >= prefix.len()
        && text.as_bytes()[..prefix.len()].eq_ignore_ascii_case(prefix.as_bytes())
}

/// Unquote an identifier the way the server folds it.
fn ident(word: &str) -> String {
    match word.strip_prefix('"').and_then(|w| w.strip_suffix('"')) {
        Some(quoted) => quoted.replace("\"\"", "\""),
        None => word.to_ascii_lowercase(),
    }
}

impl MemoryState {
    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::connection(
                ConnectionErrorKind::Disconnected,
                "connection is closed",
            ))
        }
    }

    fn server_error(
        &mut self,
        kind: QueryErrorKind,
        sqlstate: &str,
        sql: &str,
        message: impl Into<String>,
    ) -> Error {
        let message = message.into();
        self.last_error = format!("ERROR:  {}", message);
        if !self.frames.is_empty() {
            self.failed = true;
        }
        Error::Query(QueryError {
            kind,
            sql: Some(sql.to_string()),
            sqlstate: Some(sqlstate.to_string()),
            message,
            detail: None,
            hint: None,
            position: None,
        })
    }

    fn lo_error(&mut self, message: String) -> Error {
        self.last_error = format!("ERROR:  {}", message);
        Error::large_object(None, message)
    }

    fn disconnect(&mut self) -> Error {
        self.rollback_all();
        self.open = false;
        self.last_error = "server closed the connection unexpectedly".to_string();
        Error::connection(ConnectionErrorKind::Disconnected, self.last_error.clone())
    }

    fn rollback_all(&mut self) {
        let frames = std::mem::take(&mut self.frames);
        if let Some(outer) = frames.into_iter().next() {
            self.objects = outer.objects;
        }
        self.failed = false;
        self.descriptors.clear();
    }

    fn check_cancel(&mut self, sql: &str) -> Result<()> {
        if self.cancel.swap(false, Ordering::SeqCst) {
            return Err(self.server_error(
                QueryErrorKind::Cancelled,
                "57014",
                sql,
                "canceling statement due to user request",
            ));
        }
        Ok(())
    }

    fn check_faults(&mut self, texts: &[&str], sql: &str) -> Result<()> {
        let fault = self
            .faults
            .iter()
            .find(|(prefix, _)| texts.iter().any(|t| starts_with_ci(t.trim(), prefix)))
            .map(|(_, fault)| fault.clone());
        match fault {
            None => Ok(()),
            Some(Fault::Disconnect) => Err(self.disconnect()),
            Some(Fault::Query(message)) => {
                let err = self.server_error(QueryErrorKind::Database, "XX000", sql, message);
                if starts_with_ci(sql.trim(), "COMMIT") {
                    self.rollback_all();
                }
                Err(err)
            }
        }
    }

    fn snapshot(&self, savepoint: Option<String>) -> Frame {
        Frame {
            savepoint,
            writes: Vec::new(),
            objects: self.objects.clone(),
        }
    }

    fn find_savepoint(&mut self, sql: &str, name: &str) -> Result<usize> {
        match self
            .frames
            .iter()
            .rposition(|f| f.savepoint.as_deref() == Some(name))
        {
            Some(i) => Ok(i),
            None => Err(self.server_error(
                QueryErrorKind::Database,
                "3B001",
                sql,
                format!("savepoint \"{}\" does not exist", name),
            )),
        }
    }

    fn require_block(&mut self, sql: &str, command: &str) -> Result<()> {
        if self.frames.is_empty() {
            return Err(self.server_error(
                QueryErrorKind::Database,
                "25P01",
                sql,
                format!("{} can only be used in transaction blocks", command),
            ));
        }
        Ok(())
    }

    fn run(&mut self, sql: &str, params: Vec<Option<Vec<u8>>>) -> Result<QueryResult> {
        let body = sql.trim().trim_end_matches(';');
        let words: Vec<&str> = body.split_whitespace().collect();
        let first = words.first().map(|w| w.to_ascii_uppercase()).unwrap_or_default();
        let second = words.get(1).map(|w| w.to_ascii_uppercase()).unwrap_or_default();
        let last = words.last().copied().unwrap_or_default();

        if self.failed && !matches!(first.as_str(), "ROLLBACK" | "ABORT" | "COMMIT" | "END") {
            return Err(self.server_error(
                QueryErrorKind::Database,
                "25P02",
                sql,
                "current transaction is aborted, commands ignored until end of transaction block",
            ));
        }

        let result = match first.as_str() {
            "" => QueryResult::command("", None),
            "BEGIN" | "START" => {
                if self.frames.is_empty() {
                    let frame = self.snapshot(None);
                    self.frames.push(frame);
                }
                QueryResult::command("BEGIN", None)
            }
            "COMMIT" | "END" => {
                if self.failed {
                    self.rollback_all();
                    QueryResult::command("ROLLBACK", None)
                } else {
                    let frames = std::mem::take(&mut self.frames);
                    self.committed
                        .extend(frames.into_iter().flat_map(|f| f.writes));
                    self.descriptors.clear();
                    QueryResult::command("COMMIT", None)
                }
            }
            "ROLLBACK" | "ABORT" if second == "TO" => {
                self.require_block(sql, "ROLLBACK TO SAVEPOINT")?;
                let i = self.find_savepoint(sql, &ident(last))?;
                self.frames.truncate(i + 1);
                let frame = &mut self.frames[i];
                frame.writes.clear();
                self.objects = frame.objects.clone();
                self.failed = false;
                QueryResult::command("ROLLBACK", None)
            }
            "ROLLBACK" | "ABORT" => {
                self.rollback_all();
                QueryResult::command("ROLLBACK", None)
            }
            "SAVEPOINT" => {
                self.require_block(sql, "SAVEPOINT")?;
                let frame = self.snapshot(Some(ident(last)));
                self.frames.push(frame);
                QueryResult::command("SAVEPOINT", None)
            }
            "RELEASE" => {
                self.require_block(sql, "RELEASE SAVEPOINT")?;
                let i = self.find_savepoint(sql, &ident(last))?;
                let released = self.frames.split_off(i);
                if let Some(parent) = self.frames.last_mut() {
                    parent
                        .writes
                        .extend(released.into_iter().flat_map(|f| f.writes));
                }
                QueryResult::command("RELEASE", None)
            }
            "LISTEN" => {
                self.listening.insert(ident(last));
                QueryResult::command("LISTEN", None)
            }
            "UNLISTEN" => {
                if last == "*" {
                    self.listening.clear();
                } else {
                    self.listening.remove(&ident(last));
                }
                QueryResult::command("UNLISTEN", None)
            }
            "DEALLOCATE" => {
                let name = ident(last);
                if self.prepared.remove(&name).is_none() {
                    return Err(self.server_error(
                        QueryErrorKind::NotFound,
                        "26000",
                        sql,
                        format!("prepared statement \"{}\" does not exist", name),
                    ));
                }
                QueryResult::command("DEALLOCATE", None)
            }
            "SELECT" | "SHOW" | "VALUES" | "WITH" | "TABLE" => self
                .responses
                .iter()
                .find(|(prefix, _)| starts_with_ci(body, prefix))
                .map_or_else(|| QueryResult::command("SELECT 0", Some(0)), |(_, r)| r.clone()),
            _ => {
                let record = WriteRecord {
                    sql: sql.to_string(),
                    params,
                };
                match self.frames.last_mut() {
                    Some(frame) => frame.writes.push(record),
                    None => self.committed.push(record),
                }
                match first.as_str() {
                    "INSERT" => QueryResult::command("INSERT 0 1", Some(1)),
                    "UPDATE" | "DELETE" => QueryResult::command(format!("{} 1", first), Some(1)),
                    _ => QueryResult::command(first.clone(), None),
                }
            }
        };
        Ok(result.with_query(sql))
    }

    fn descriptor(&mut self, fd: i32) -> Result<Descriptor> {
        match self.descriptors.get(&fd) {
            Some(d) => Ok(*d),
            None => Err(self.lo_error(format!("invalid large-object descriptor: {}", fd))),
        }
    }

    fn object_missing(&mut self, oid: Oid) -> Error {
        self.lo_error(format!("large object {} does not exist", oid))
    }
}

impl Session for MemoryState {
    fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        self.ensure_open()?;
        self.log.push(sql.to_string());
        self.check_cancel(sql)?;
        self.check_faults(&[sql], sql)?;
        self.run(sql, Vec::new())
    }

    fn prepare(&mut self, name: &str, sql: &str, param_types: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let line = if param_types.iter().all(|t| t.is_empty()) {
            format!("PREPARE {}: {}", name, sql)
        } else {
            format!("PREPARE {} ({}): {}", name, param_types.join(", "), sql)
        };
        self.log.push(line.clone());
        self.check_faults(&[line.as_str()], &line)?;
        if self.prepared.contains_key(name) {
            return Err(self.server_error(
                QueryErrorKind::Database,
                "42P05",
                &line,
                format!("prepared statement \"{}\" already exists", name),
            ));
        }
        let types = param_types.iter().map(|t| (*t).to_string()).collect();
        self.prepared.insert(name.to_string(), (sql.to_string(), types));
        Ok(())
    }

    fn exec_prepared(&mut self, name: &str, params: &[BoundParam]) -> Result<QueryResult> {
        self.ensure_open()?;
        let line = format!("EXECUTE {}", name);
        self.log.push(line.clone());
        let Some((sql, types)) = self.prepared.get(name).cloned() else {
            return Err(self.server_error(
                QueryErrorKind::NotFound,
                "26000",
                &line,
                format!("prepared statement \"{}\" does not exist", name),
            ));
        };
        self.check_cancel(&sql)?;
        self.check_faults(&[line.as_str(), sql.as_str()], &sql)?;
        let expected = types.len();
        if params.len() != expected {
            return Err(self.server_error(
                QueryErrorKind::Database,
                "08P01",
                &sql,
                format!(
                    "bind message supplies {} parameters, but prepared statement \"{}\" requires {}",
                    params.len(),
                    name,
                    expected
                ),
            ));
        }
        self.run(&sql, params.iter().map(|p| p.value.clone()).collect())
    }

    fn server_version(&self) -> i32 {
        self.server_version
    }

    fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    fn backend_pid(&self) -> i32 {
        BACKEND_PID
    }

    fn is_open(&self) -> bool {
        self.open
    }

    fn reset(&mut self) -> Result<()> {
        self.rollback_all();
        self.open = true;
        self.resets += 1;
        self.prepared.clear();
        self.listening.clear();
        self.queued.clear();
        self.cancel.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) {
        self.rollback_all();
        self.open = false;
    }

    fn reason(&self) -> String {
        self.last_error.clone()
    }

    fn notifications(&mut self) -> Result<Vec<Notification>> {
        self.ensure_open()?;
        Ok(std::mem::take(&mut self.queued))
    }

    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        Some(Arc::new(MemoryCanceller {
            flag: Arc::clone(&self.cancel),
        }))
    }

    fn lo_create(&mut self) -> Result<Oid> {
        self.ensure_open()?;
        let oid = self.next_oid;
        self.next_oid += 1;
        self.objects.insert(oid, Vec::new());
        Ok(oid)
    }

    fn lo_import(&mut self, path: &Path) -> Result<Oid> {
        self.ensure_open()?;
        let data = std::fs::read(path).map_err(|e| {
            self.lo_error(format!("could not open file \"{}\": {}", path.display(), e))
        })?;
        let oid = self.lo_create()?;
        self.objects.insert(oid, data);
        Ok(oid)
    }

    fn lo_export(&mut self, oid: Oid, path: &Path) -> Result<()> {
        self.ensure_open()?;
        let Some(data) = self.objects.get(&oid).cloned() else {
            return Err(self.object_missing(oid));
        };
        std::fs::write(path, data).map_err(|e| {
            self.lo_error(format!("could not create file \"{}\": {}", path.display(), e))
        })
    }

    fn lo_unlink(&mut self, oid: Oid) -> Result<()> {
        self.ensure_open()?;
        if self.objects.remove(&oid).is_none() {
            return Err(self.object_missing(oid));
        }
        Ok(())
    }

    fn lo_open(&mut self, oid: Oid, mode: OpenMode) -> Result<i32> {
        self.ensure_open()?;
        if !self.objects.contains_key(&oid) {
            return Err(self.object_missing(oid));
        }
        let fd = self.next_fd;
        self.next_fd += 1;
        // Outside a transaction block the descriptor dies with the implicit
        // transaction, so it is handed out but never usable.
        if !self.frames.is_empty() {
            self.descriptors.insert(fd, Descriptor { oid, pos: 0, mode });
        }
        Ok(fd)
    }

    fn lo_close(&mut self, fd: i32) -> Result<()> {
        self.ensure_open()?;
        if self.descriptors.remove(&fd).is_none() {
            return Err(self.lo_error(format!("invalid large-object descriptor: {}", fd)));
        }
        Ok(())
    }

    fn lo_read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let desc = self.descriptor(fd)?;
        let Some(data) = self.objects.get(&desc.oid) else {
            return Err(self.object_missing(desc.oid));
        };
        let pos = usize::try_from(desc.pos).unwrap_or(usize::MAX);
        let n = data.len().saturating_sub(pos).min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&data[pos..pos + n]);
        }
        if let Some(d) = self.descriptors.get_mut(&fd) {
            d.pos += n as i64;
        }
        Ok(n)
    }

    fn lo_write(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
        self.ensure_open()?;
        let desc = self.descriptor(fd)?;
        if !desc.mode.is_writable() {
            return Err(self.lo_error(format!(
                "large object descriptor {} was not opened for writing",
                fd
            )));
        }
        let n = self.write_limit.map_or(buf.len(), |limit| limit.min(buf.len()));
        let Some(data) = self.objects.get_mut(&desc.oid) else {
            return Err(self.object_missing(desc.oid));
        };
        let pos = desc.pos as usize;
        if data.len() < pos + n {
            data.resize(pos + n, 0);
        }
        data[pos..pos + n].copy_from_slice(&buf[..n]);
        if let Some(d) = self.descriptors.get_mut(&fd) {
            d.pos += n as i64;
        }
        Ok(n)
    }

    fn lo_seek(&mut self, fd: i32, offset: i64, origin: SeekOrigin) -> Result<i64> {
        self.ensure_open()?;
        let desc = self.descriptor(fd)?;
        let base = match origin {
            SeekOrigin::Start => 0,
            SeekOrigin::Current => desc.pos,
            SeekOrigin::End => self.objects.get(&desc.oid).map_or(0, |d| d.len() as i64),
        };
        match base.checked_add(offset) {
            Some(pos) if pos >= 0 => {
                if let Some(d) = self.descriptors.get_mut(&fd) {
                    d.pos = pos;
                }
                Ok(pos)
            }
            _ => Err(self.lo_error(format!("invalid seek offset: {}", offset))),
        }
    }

    fn lo_tell(&mut self, fd: i32) -> Result<i64> {
        self.ensure_open()?;
        Ok(self.descriptor(fd)?.pos)
    }
}

impl Session for MemorySession {
    fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        self.state.borrow_mut().exec(sql)
    }

    fn prepare(&mut self, name: &str, sql: &str, param_types: &[&str]) -> Result<()> {
        self.state.borrow_mut().prepare(name, sql, param_types)
    }

    fn exec_prepared(&mut self, name: &str, params: &[BoundParam]) -> Result<QueryResult> {
        self.state.borrow_mut().exec_prepared(name, params)
    }

    fn server_version(&self) -> i32 {
        self.state.borrow().server_version()
    }

    fn protocol_version(&self) -> i32 {
        self.state.borrow().protocol_version()
    }

    fn backend_pid(&self) -> i32 {
        BACKEND_PID
    }

    fn is_open(&self) -> bool {
        self.state.borrow().is_open()
    }

    fn reset(&mut self) -> Result<()> {
        self.state.borrow_mut().reset()
    }

    fn close(&mut self) {
        self.state.borrow_mut().close();
    }

    fn reason(&self) -> String {
        self.state.borrow().reason()
    }

    fn notifications(&mut self) -> Result<Vec<Notification>> {
        self.state.borrow_mut().notifications()
    }

    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        self.state.borrow().canceller()
    }

    fn lo_create(&mut self) -> Result<Oid> {
        self.state.borrow_mut().lo_create()
    }

    fn lo_import(&mut self, path: &Path) -> Result<Oid> {
        self.state.borrow_mut().lo_import(path)
    }

    fn lo_export(&mut self, oid: Oid, path: &Path) -> Result<()> {
        self.state.borrow_mut().lo_export(oid, path)
    }

    fn lo_unlink(&mut self, oid: Oid) -> Result<()> {
        self.state.borrow_mut().lo_unlink(oid)
    }

    fn lo_open(&mut self, oid: Oid, mode: OpenMode) -> Result<i32> {
        self.state.borrow_mut().lo_open(oid, mode)
    }

    fn lo_close(&mut self, fd: i32) -> Result<()> {
        self.state.borrow_mut().lo_close(fd)
    }

    fn lo_read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        self.state.borrow_mut().lo_read(fd, buf)
    }

    fn lo_write(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
        self.state.borrow_mut().lo_write(fd, buf)
    }

    fn lo_seek(&mut self, fd: i32, offset: i64, origin: SeekOrigin) -> Result<i64> {
        self.state.borrow_mut().lo_seek(fd, offset, origin)
    }

    fn lo_tell(&mut self, fd: i32) -> Result<i64> {
        self.state.borrow_mut().lo_tell(fd)
    }
}
