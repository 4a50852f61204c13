//! [`Session`] over a live libpq connection.

use std::ffi::{CStr, CString, c_char, c_int};
use std::path::Path;
use std::ptr::{self, NonNull};
use std::sync::Arc;

use pqkit_core::{
    BoundParam, Canceller, Capabilities, Capability, ColumnInfo, ConnectionErrorKind, Error,
    Notification, Oid, OpenMode, ParamFormat, QueryError, QueryErrorKind, QueryResult, Result,
    SeekOrigin, Session,
};

use crate::ffi;

/// Copy a C string owned by libpq. Null reads as empty.
///
/// # Safety
///
/// `ptr` must be null or point to a NUL-terminated string that stays valid
/// for the duration of the call.
unsafe fn c_string(ptr: *const c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    // SAFETY: non-null and NUL-terminated per the caller's contract
    let text = unsafe { CStr::from_ptr(ptr) };
    text.to_string_lossy().into_owned()
}

fn c_arg(what: &str, text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| Error::usage(format!("{} contains a NUL byte", what)))
}

/// Owns a `PGresult` and clears it on drop.
struct PgResult(NonNull<ffi::PGresult>);

impl PgResult {
    fn status(&self) -> c_int {
        // SAFETY: the result is live until drop
        unsafe { ffi::PQresultStatus(self.0.as_ptr()) }
    }

    fn field(&self, code: c_int) -> Option<String> {
        // SAFETY: the result is live; the field pointer is owned by it
        let ptr = unsafe { ffi::PQresultErrorField(self.0.as_ptr(), code) };
        if ptr.is_null() {
            None
        } else {
            // SAFETY: non-null pointer into the live result
            Some(unsafe { c_string(ptr) })
        }
    }

    fn error_message(&self) -> String {
        // SAFETY: the result is live
        let message = unsafe { c_string(ffi::PQresultErrorMessage(self.0.as_ptr())) };
        message.trim_end().to_string()
    }

    fn to_query_result(&self, sql: &str) -> Result<QueryResult> {
        let res = self.0.as_ptr();
        // SAFETY: every accessor below reads from the live result with
        // indices bounded by PQnfields/PQntuples
        unsafe {
            let nfields = ffi::PQnfields(res);
            let ntuples = ffi::PQntuples(res);

            let columns = (0..nfields)
                .map(|col| (c_string(ffi::PQfname(res, col)), ffi::PQftype(res, col)))
                .collect();

            let mut rows = Vec::with_capacity(usize::try_from(ntuples).unwrap_or(0));
            for row in 0..ntuples {
                let mut fields = Vec::with_capacity(usize::try_from(nfields).unwrap_or(0));
                for col in 0..nfields {
                    if ffi::PQgetisnull(res, row, col) != 0 {
                        fields.push(None);
                        continue;
                    }
                    let len = usize::try_from(ffi::PQgetlength(res, row, col)).unwrap_or(0);
                    let data = ffi::PQgetvalue(res, row, col).cast::<u8>();
                    fields.push(Some(std::slice::from_raw_parts(data, len).to_vec()));
                }
                rows.push(fields);
            }

            let status = c_string(ffi::PQcmdStatus(res));
            let affected = c_string(ffi::PQcmdTuples(res)).parse::<u64>().ok();
            Ok(QueryResult::new(ColumnInfo::new(columns), rows)?
                .with_status(status, affected)
                .with_query(sql))
        }
    }
}

impl Drop for PgResult {
    fn drop(&mut self) {
        // SAFETY: we own the result and clear it exactly once
        unsafe { ffi::PQclear(self.0.as_ptr()) };
    }
}

/// Map a SQLSTATE to an error, in the same families the rest of pqkit uses.
fn error_from_state(
    sqlstate: Option<String>,
    message: String,
    sql: Option<&str>,
    detail: Option<String>,
    hint: Option<String>,
    position: Option<usize>,
) -> Error {
    let code = sqlstate.as_deref().unwrap_or("");
    let kind = match code.get(..2) {
        Some("08") => return Error::connection(ConnectionErrorKind::Disconnected, message),
        Some("28") => return Error::connection(ConnectionErrorKind::Authentication, message),
        Some("53") if code == "53200" => return Error::OutOfMemory(message),
        Some("0A") => return Error::Unsupported(message),
        Some("42") if code == "42501" => QueryErrorKind::Permission,
        Some("42") => QueryErrorKind::Syntax,
        Some("23") => QueryErrorKind::Constraint,
        Some("26") => QueryErrorKind::NotFound,
        Some("40") => {
            if code == "40001" {
                QueryErrorKind::Serialization
            } else {
                QueryErrorKind::Deadlock
            }
        }
        Some("57") => {
            if code == "57014" {
                QueryErrorKind::Cancelled
            } else {
                QueryErrorKind::Timeout
            }
        }
        _ => QueryErrorKind::Database,
    };

    Error::Query(QueryError {
        kind,
        sql: sql.map(str::to_string),
        sqlstate,
        message,
        detail,
        hint,
        position,
    })
}

/// A blocking connection to a PostgreSQL backend through libpq.
pub struct PqSession {
    conn: Option<NonNull<ffi::PGconn>>,
}

// SAFETY: a PGconn may move between threads as long as it is not used from
// two threads at once; `Session` methods take `&mut self` or are read-only
// status queries, and the type is not Sync.
unsafe impl Send for PqSession {}

impl PqSession {
    /// Open a connection from a libpq conninfo string or URI.
    #[tracing::instrument(level = "debug", skip(conninfo))]
    pub fn connect(conninfo: &str) -> Result<Self> {
        let c_info = CString::new(conninfo).map_err(|_| {
            Error::connection(
                ConnectionErrorKind::Connect,
                "Invalid connection string: contains NUL byte",
            )
        })?;

        // SAFETY: c_info is a valid C string
        let raw = unsafe { ffi::PQconnectdb(c_info.as_ptr()) };
        let Some(conn) = NonNull::new(raw) else {
            return Err(Error::OutOfMemory(
                "could not allocate a libpq connection".to_string(),
            ));
        };

        // SAFETY: conn is a live handle returned by PQconnectdb
        let status = unsafe { ffi::PQstatus(conn.as_ptr()) };
        if status != ffi::CONNECTION_OK {
            // SAFETY: the handle is live until PQfinish below
            let raw_message = unsafe { c_string(ffi::PQerrorMessage(conn.as_ptr())) };
            let message = raw_message.trim_end().to_string();
            // SAFETY: the handle is finished exactly once
            unsafe { ffi::PQfinish(conn.as_ptr()) };
            let kind = if message.contains("authentication failed") || message.contains("password") {
                ConnectionErrorKind::Authentication
            } else {
                ConnectionErrorKind::Connect
            };
            return Err(Error::connection(kind, message));
        }

        let session = Self { conn: Some(conn) };
        tracing::debug!(
            server_version = session.server_version(),
            backend_pid = session.backend_pid(),
            "connected"
        );
        Ok(session)
    }

    fn handle(&self) -> Result<*mut ffi::PGconn> {
        self.conn
            .map(NonNull::as_ptr)
            .ok_or_else(|| Error::connection(ConnectionErrorKind::Disconnected, "connection is closed"))
    }

    fn connection_lost(&self) -> bool {
        let Some(conn) = self.conn else {
            return true;
        };
        // SAFETY: handle is live
        let status = unsafe { ffi::PQstatus(conn.as_ptr()) };
        status != ffi::CONNECTION_OK
    }

    /// Turn a libpq result (or its absence) into a `QueryResult` or error.
    fn finish(&self, raw: *mut ffi::PGresult, sql: &str) -> Result<QueryResult> {
        let Some(res) = NonNull::new(raw).map(PgResult) else {
            let message = self.reason();
            return Err(if self.connection_lost() {
                Error::connection(ConnectionErrorKind::Disconnected, message)
            } else {
                Error::OutOfMemory(message)
            });
        };

        match res.status() {
            ffi::PGRES_COMMAND_OK | ffi::PGRES_TUPLES_OK | ffi::PGRES_EMPTY_QUERY => {
                res.to_query_result(sql)
            }
            _ => {
                let sqlstate = res.field(ffi::PG_DIAG_SQLSTATE);
                if sqlstate.is_none() && self.connection_lost() {
                    return Err(Error::connection(
                        ConnectionErrorKind::Disconnected,
                        res.error_message(),
                    ));
                }
                let message = res
                    .field(ffi::PG_DIAG_MESSAGE_PRIMARY)
                    .unwrap_or_else(|| res.error_message());
                Err(error_from_state(
                    sqlstate,
                    message,
                    Some(sql),
                    res.field(ffi::PG_DIAG_MESSAGE_DETAIL),
                    res.field(ffi::PG_DIAG_MESSAGE_HINT),
                    res.field(ffi::PG_DIAG_STATEMENT_POSITION)
                        .and_then(|p| p.parse().ok()),
                ))
            }
        }
    }

    fn lo_failure(&self, oid: Option<Oid>) -> Error {
        let message = self.reason();
        if self.connection_lost() {
            Error::connection(ConnectionErrorKind::Disconnected, message)
        } else {
            Error::large_object(oid, message)
        }
    }

    fn supports_64bit_objects(&self) -> bool {
        Capabilities::detect(self.server_version(), self.protocol_version())
            .contains(Capability::LargeObject64)
    }
}

/// SQL `PREPARE` for a statement with declared parameter types. An empty
/// type name is sent as `unknown` so the server infers it.
fn prepare_statement(quoted_name: &str, param_types: &[&str], sql: &str) -> String {
    let types: Vec<&str> = param_types
        .iter()
        .map(|t| if t.is_empty() { "unknown" } else { *t })
        .collect();
    format!("PREPARE {} ({}) AS {}", quoted_name, types.join(", "), sql)
}

impl Session for PqSession {
    fn exec(&mut self, sql: &str) -> Result<QueryResult> {
        let conn = self.handle()?;
        let c_sql = c_arg("query", sql)?;
        tracing::trace!(sql, "exec");
        // SAFETY: conn is live; c_sql outlives the call
        let raw = unsafe { ffi::PQexec(conn, c_sql.as_ptr()) };
        self.finish(raw, sql)
    }

    fn prepare(&mut self, name: &str, sql: &str, param_types: &[&str]) -> Result<()> {
        let conn = self.handle()?;
        if param_types.iter().any(|t| !t.is_empty()) {
            // Declared types are resolved by the server's own type parser.
            let statement = prepare_statement(&self.quote_identifier(name)?, param_types, sql);
            tracing::trace!(name, sql, types = ?param_types, "prepare");
            let c_sql = c_arg("query", &statement)?;
            // SAFETY: conn is live; c_sql outlives the call
            let raw = unsafe { ffi::PQexec(conn, c_sql.as_ptr()) };
            return self.finish(raw, sql).map(|_| ());
        }
        let c_name = c_arg("statement name", name)?;
        let c_sql = c_arg("query", sql)?;
        // Zero type oids leave every parameter's type to the server.
        let types = vec![0 as ffi::Oid; param_types.len()];
        let n = c_int::try_from(param_types.len())
            .map_err(|_| Error::usage(format!("too many parameters for '{}'", name)))?;
        tracing::trace!(name, sql, "prepare");
        // SAFETY: all pointers are valid for the call; types has n entries
        let raw = unsafe { ffi::PQprepare(conn, c_name.as_ptr(), c_sql.as_ptr(), n, types.as_ptr()) };
        self.finish(raw, sql).map(|_| ())
    }

    fn exec_prepared(&mut self, name: &str, params: &[BoundParam]) -> Result<QueryResult> {
        let conn = self.handle()?;
        let c_name = c_arg("statement name", name)?;
        let n = c_int::try_from(params.len())
            .map_err(|_| Error::usage(format!("too many parameters for '{}'", name)))?;

        // Text parameters are read up to a NUL terminator, binary ones by length.
        let buffers: Vec<Option<Vec<u8>>> = params
            .iter()
            .map(|p| {
                p.value.as_ref().map(|v| match p.format {
                    ParamFormat::Text => {
                        let mut owned = Vec::with_capacity(v.len() + 1);
                        owned.extend_from_slice(v);
                        owned.push(0);
                        owned
                    }
                    ParamFormat::Binary => v.clone(),
                })
            })
            .collect();
        let values: Vec<*const c_char> = buffers
            .iter()
            .map(|b| b.as_ref().map_or(ptr::null(), |v| v.as_ptr().cast()))
            .collect();
        let lengths = params
            .iter()
            .map(|p| {
                let len = p.value.as_ref().map_or(0, Vec::len);
                c_int::try_from(len)
                    .map_err(|_| Error::usage(format!("parameter of {} bytes is too large", len)))
            })
            .collect::<Result<Vec<c_int>>>()?;
        let formats: Vec<c_int> = params
            .iter()
            .map(|p| match p.format {
                ParamFormat::Text => 0,
                ParamFormat::Binary => 1,
            })
            .collect();

        tracing::trace!(name, params = params.len(), "exec_prepared");
        // SAFETY: the four arrays hold n entries each and the buffers they
        // point into outlive the call
        let raw = unsafe {
            ffi::PQexecPrepared(
                conn,
                c_name.as_ptr(),
                n,
                values.as_ptr(),
                lengths.as_ptr(),
                formats.as_ptr(),
                0,
            )
        };
        self.finish(raw, name)
    }

    fn server_version(&self) -> i32 {
        // SAFETY: handle is live
        self.conn
            .map_or(0, |c| unsafe { ffi::PQserverVersion(c.as_ptr()) })
    }

    fn protocol_version(&self) -> i32 {
        // SAFETY: handle is live
        self.conn
            .map_or(0, |c| unsafe { ffi::PQprotocolVersion(c.as_ptr()) })
    }

    fn backend_pid(&self) -> i32 {
        // SAFETY: handle is live
        self.conn.map_or(0, |c| unsafe { ffi::PQbackendPID(c.as_ptr()) })
    }

    fn is_open(&self) -> bool {
        !self.connection_lost()
    }

    fn reset(&mut self) -> Result<()> {
        let conn = self.handle()?;
        // SAFETY: handle is live
        unsafe { ffi::PQreset(conn) };
        if self.connection_lost() {
            return Err(Error::connection(ConnectionErrorKind::Reset, self.reason()));
        }
        tracing::debug!(backend_pid = self.backend_pid(), "connection reset");
        Ok(())
    }

    fn close(&mut self) {
        if let Some(conn) = self.conn.take() {
            // SAFETY: taken out of the Option, so finished exactly once
            unsafe { ffi::PQfinish(conn.as_ptr()) };
        }
    }

    fn reason(&self) -> String {
        let Some(conn) = self.conn else {
            return "connection is closed".to_string();
        };
        // SAFETY: handle is live
        let message = unsafe { c_string(ffi::PQerrorMessage(conn.as_ptr())) };
        message.trim_end().to_string()
    }

    fn notifications(&mut self) -> Result<Vec<Notification>> {
        let conn = self.handle()?;
        // SAFETY: handle is live
        if unsafe { ffi::PQconsumeInput(conn) } == 0 {
            return Err(Error::connection(ConnectionErrorKind::Disconnected, self.reason()));
        }
        let mut out = Vec::new();
        loop {
            // SAFETY: handle is live; each notify is freed after copying
            let notify = unsafe { ffi::PQnotifies(conn) };
            if notify.is_null() {
                break;
            }
            // SAFETY: notify is non-null and owned by us until PQfreemem
            unsafe {
                out.push(Notification {
                    channel: c_string((*notify).relname),
                    payload: c_string((*notify).extra),
                    backend_pid: (*notify).be_pid,
                });
                ffi::PQfreemem(notify.cast());
            }
        }
        Ok(out)
    }

    fn canceller(&self) -> Option<Arc<dyn Canceller>> {
        let conn = self.conn?;
        // SAFETY: handle is live
        let cancel = NonNull::new(unsafe { ffi::PQgetCancel(conn.as_ptr()) })?;
        Some(Arc::new(PqCanceller { cancel }))
    }

    fn escape_string(&self, text: &str) -> Result<String> {
        let conn = self.handle()?;
        let mut buf = vec![0_u8; text.len() * 2 + 1];
        let mut error: c_int = 0;
        // SAFETY: buf has room for the worst case of 2n+1 bytes
        let written = unsafe {
            ffi::PQescapeStringConn(
                conn,
                buf.as_mut_ptr().cast(),
                text.as_ptr().cast(),
                text.len(),
                &mut error,
            )
        };
        if error != 0 {
            return Err(Error::query(
                QueryErrorKind::Database,
                None,
                format!("Could not escape string: {}", self.reason()),
            ));
        }
        buf.truncate(written);
        String::from_utf8(buf).map_err(|e| Error::internal(format!("escaped string is not UTF-8: {}", e)))
    }

    fn escape_bytea(&self, bytes: &[u8]) -> Result<String> {
        let conn = self.handle()?;
        let mut len = 0_usize;
        // SAFETY: bytes is valid for its length; result is freed below
        let raw = unsafe { ffi::PQescapeByteaConn(conn, bytes.as_ptr(), bytes.len(), &mut len) };
        if raw.is_null() {
            return Err(Error::OutOfMemory(self.reason()));
        }
        // SAFETY: libpq returns len bytes including the trailing NUL
        let escaped = unsafe {
            let text = std::slice::from_raw_parts(raw, len.saturating_sub(1));
            let owned = String::from_utf8_lossy(text).into_owned();
            ffi::PQfreemem(raw.cast());
            owned
        };
        Ok(escaped)
    }

    fn quote_identifier(&self, ident: &str) -> Result<String> {
        let conn = self.handle()?;
        // SAFETY: ident is valid for its length; result is freed below
        let raw = unsafe { ffi::PQescapeIdentifier(conn, ident.as_ptr().cast(), ident.len()) };
        if raw.is_null() {
            return Err(Error::query(
                QueryErrorKind::Database,
                None,
                format!("Could not quote identifier: {}", self.reason()),
            ));
        }
        // SAFETY: non-null, NUL-terminated, owned by us until PQfreemem
        unsafe {
            let quoted = c_string(raw);
            ffi::PQfreemem(raw.cast());
            Ok(quoted)
        }
    }

    fn lo_create(&mut self) -> Result<Oid> {
        let conn = self.handle()?;
        // SAFETY: handle is live
        let oid = unsafe { ffi::lo_creat(conn, OpenMode::READ_WRITE.bits()) };
        if oid == ffi::INVALID_OID {
            return Err(self.lo_failure(None));
        }
        Ok(oid)
    }

    fn lo_import(&mut self, path: &Path) -> Result<Oid> {
        let conn = self.handle()?;
        let c_path = c_arg("file name", &path.to_string_lossy())?;
        // SAFETY: handle is live; c_path outlives the call
        let oid = unsafe { ffi::lo_import(conn, c_path.as_ptr()) };
        if oid == ffi::INVALID_OID {
            return Err(self.lo_failure(None));
        }
        Ok(oid)
    }

    fn lo_export(&mut self, oid: Oid, path: &Path) -> Result<()> {
        let conn = self.handle()?;
        let c_path = c_arg("file name", &path.to_string_lossy())?;
        // SAFETY: handle is live; c_path outlives the call
        if unsafe { ffi::lo_export(conn, oid, c_path.as_ptr()) } < 0 {
            return Err(self.lo_failure(Some(oid)));
        }
        Ok(())
    }

    fn lo_unlink(&mut self, oid: Oid) -> Result<()> {
        let conn = self.handle()?;
        // SAFETY: handle is live
        if unsafe { ffi::lo_unlink(conn, oid) } < 0 {
            return Err(self.lo_failure(Some(oid)));
        }
        Ok(())
    }

    fn lo_open(&mut self, oid: Oid, mode: OpenMode) -> Result<i32> {
        let conn = self.handle()?;
        // SAFETY: handle is live
        let fd = unsafe { ffi::lo_open(conn, oid, mode.bits()) };
        if fd < 0 {
            return Err(self.lo_failure(Some(oid)));
        }
        Ok(fd)
    }

    fn lo_close(&mut self, fd: i32) -> Result<()> {
        let conn = self.handle()?;
        // SAFETY: handle is live
        if unsafe { ffi::lo_close(conn, fd) } < 0 {
            return Err(self.lo_failure(None));
        }
        Ok(())
    }

    fn lo_read(&mut self, fd: i32, buf: &mut [u8]) -> Result<usize> {
        let conn = self.handle()?;
        let len = buf.len().min(i32::MAX as usize);
        // SAFETY: buf is writable for len bytes
        let n = unsafe { ffi::lo_read(conn, fd, buf.as_mut_ptr().cast(), len) };
        usize::try_from(n).map_err(|_| self.lo_failure(None))
    }

    fn lo_write(&mut self, fd: i32, buf: &[u8]) -> Result<usize> {
        let conn = self.handle()?;
        let len = buf.len().min(i32::MAX as usize);
        // SAFETY: buf is readable for len bytes
        let n = unsafe { ffi::lo_write(conn, fd, buf.as_ptr().cast(), len) };
        usize::try_from(n).map_err(|_| self.lo_failure(None))
    }

    fn lo_seek(&mut self, fd: i32, offset: i64, origin: SeekOrigin) -> Result<i64> {
        let conn = self.handle()?;
        let whence = match origin {
            SeekOrigin::Start => ffi::SEEK_SET,
            SeekOrigin::Current => ffi::SEEK_CUR,
            SeekOrigin::End => ffi::SEEK_END,
        };
        let pos = if self.supports_64bit_objects() {
            // SAFETY: handle is live
            unsafe { ffi::lo_lseek64(conn, fd, offset, whence) }
        } else {
            let small = c_int::try_from(offset).map_err(|_| {
                Error::large_object(
                    None,
                    format!(
                        "offset {} needs 64-bit large object support, which server version {} lacks",
                        offset,
                        self.server_version()
                    ),
                )
            })?;
            // SAFETY: handle is live
            i64::from(unsafe { ffi::lo_lseek(conn, fd, small, whence) })
        };
        if pos < 0 {
            return Err(self.lo_failure(None));
        }
        Ok(pos)
    }

    fn lo_tell(&mut self, fd: i32) -> Result<i64> {
        let conn = self.handle()?;
        let pos = if self.supports_64bit_objects() {
            // SAFETY: handle is live
            unsafe { ffi::lo_tell64(conn, fd) }
        } else {
            // SAFETY: handle is live
            i64::from(unsafe { ffi::lo_tell(conn, fd) })
        };
        if pos < 0 {
            return Err(self.lo_failure(None));
        }
        Ok(pos)
    }
}

impl Drop for PqSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl std::fmt::Debug for PqSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PqSession")
            .field("open", &self.is_open())
            .field("server_version", &self.server_version())
            .field("backend_pid", &self.backend_pid())
            .finish()
    }
}

/// Sends cancel requests for the backend a [`PqSession`] was talking to
/// when the canceller was made.
pub struct PqCanceller {
    cancel: NonNull<ffi::PGcancel>,
}

// SAFETY: libpq documents PQcancel as safe to call from any thread, even a
// signal handler, and the PGcancel object is never mutated after creation.
unsafe impl Send for PqCanceller {}
unsafe impl Sync for PqCanceller {}

impl Canceller for PqCanceller {
    fn cancel(&self) -> Result<()> {
        let mut errbuf = [0 as c_char; 256];
        // SAFETY: cancel is live until drop; errbuf is writable for its length
        let ok = unsafe {
            ffi::PQcancel(self.cancel.as_ptr(), errbuf.as_mut_ptr(), errbuf.len() as c_int)
        };
        if ok == 0 {
            // SAFETY: libpq NUL-terminates errbuf on failure
            let message = unsafe { c_string(errbuf.as_ptr()) };
            return Err(Error::connection(ConnectionErrorKind::Cancel, message));
        }
        Ok(())
    }
}

impl Drop for PqCanceller {
    fn drop(&mut self) {
        // SAFETY: owned, freed exactly once
        unsafe { ffi::PQfreeCancel(self.cancel.as_ptr()) };
    }
}
