//! Low-level declarations for the parts of libpq this crate calls.
//!
//! The library itself is built and linked by `pq-sys`; only the signatures
//! are written out here.

#![allow(non_camel_case_types)]
#![allow(non_snake_case)]

use std::ffi::{c_char, c_int, c_void};

pub type Oid = u32;

/// Opaque connection handle.
#[repr(C)]
pub struct PGconn {
    _private: [u8; 0],
}

/// Opaque command result.
#[repr(C)]
pub struct PGresult {
    _private: [u8; 0],
}

/// Opaque cancel request object.
#[repr(C)]
pub struct PGcancel {
    _private: [u8; 0],
}

#[repr(C)]
pub struct PGnotify {
    pub relname: *mut c_char,
    pub be_pid: c_int,
    pub extra: *mut c_char,
    #[allow(dead_code)]
    next: *mut PGnotify,
}

// ConnStatusType
pub const CONNECTION_OK: c_int = 0;

// ExecStatusType
pub const PGRES_EMPTY_QUERY: c_int = 0;
pub const PGRES_COMMAND_OK: c_int = 1;
pub const PGRES_TUPLES_OK: c_int = 2;

// PQresultErrorField codes
pub const PG_DIAG_SQLSTATE: c_int = b'C' as c_int;
pub const PG_DIAG_MESSAGE_PRIMARY: c_int = b'M' as c_int;
pub const PG_DIAG_MESSAGE_DETAIL: c_int = b'D' as c_int;
pub const PG_DIAG_MESSAGE_HINT: c_int = b'H' as c_int;
pub const PG_DIAG_STATEMENT_POSITION: c_int = b'P' as c_int;

// lo_lseek whence
pub const SEEK_SET: c_int = 0;
pub const SEEK_CUR: c_int = 1;
pub const SEEK_END: c_int = 2;

pub const INVALID_OID: Oid = 0;

unsafe extern "C" {
    // Connection lifecycle
    pub fn PQconnectdb(conninfo: *const c_char) -> *mut PGconn;
    pub fn PQfinish(conn: *mut PGconn);
    pub fn PQreset(conn: *mut PGconn);
    pub fn PQstatus(conn: *const PGconn) -> c_int;
    pub fn PQerrorMessage(conn: *const PGconn) -> *const c_char;
    pub fn PQserverVersion(conn: *const PGconn) -> c_int;
    pub fn PQprotocolVersion(conn: *const PGconn) -> c_int;
    pub fn PQbackendPID(conn: *const PGconn) -> c_int;

    // Command execution
    pub fn PQexec(conn: *mut PGconn, query: *const c_char) -> *mut PGresult;
    pub fn PQprepare(
        conn: *mut PGconn,
        stmtName: *const c_char,
        query: *const c_char,
        nParams: c_int,
        paramTypes: *const Oid,
    ) -> *mut PGresult;
    pub fn PQexecPrepared(
        conn: *mut PGconn,
        stmtName: *const c_char,
        nParams: c_int,
        paramValues: *const *const c_char,
        paramLengths: *const c_int,
        paramFormats: *const c_int,
        resultFormat: c_int,
    ) -> *mut PGresult;

    // Results
    pub fn PQresultStatus(res: *const PGresult) -> c_int;
    pub fn PQresultErrorMessage(res: *const PGresult) -> *const c_char;
    pub fn PQresultErrorField(res: *const PGresult, fieldcode: c_int) -> *const c_char;
    pub fn PQntuples(res: *const PGresult) -> c_int;
    pub fn PQnfields(res: *const PGresult) -> c_int;
    pub fn PQfname(res: *const PGresult, field_num: c_int) -> *const c_char;
    pub fn PQftype(res: *const PGresult, field_num: c_int) -> Oid;
    pub fn PQgetvalue(res: *const PGresult, tup_num: c_int, field_num: c_int) -> *const c_char;
    pub fn PQgetlength(res: *const PGresult, tup_num: c_int, field_num: c_int) -> c_int;
    pub fn PQgetisnull(res: *const PGresult, tup_num: c_int, field_num: c_int) -> c_int;
    pub fn PQcmdStatus(res: *mut PGresult) -> *const c_char;
    pub fn PQcmdTuples(res: *mut PGresult) -> *const c_char;
    pub fn PQclear(res: *mut PGresult);

    // Notifications
    pub fn PQconsumeInput(conn: *mut PGconn) -> c_int;
    pub fn PQnotifies(conn: *mut PGconn) -> *mut PGnotify;
    pub fn PQfreemem(ptr: *mut c_void);

    // Cancellation
    pub fn PQgetCancel(conn: *mut PGconn) -> *mut PGcancel;
    pub fn PQfreeCancel(cancel: *mut PGcancel);
    pub fn PQcancel(cancel: *mut PGcancel, errbuf: *mut c_char, errbufsize: c_int) -> c_int;

    // Escaping
    pub fn PQescapeStringConn(
        conn: *mut PGconn,
        to: *mut c_char,
        from: *const c_char,
        length: usize,
        error: *mut c_int,
    ) -> usize;
    pub fn PQescapeByteaConn(
        conn: *mut PGconn,
        from: *const u8,
        from_length: usize,
        to_length: *mut usize,
    ) -> *mut u8;
    pub fn PQescapeIdentifier(conn: *mut PGconn, str: *const c_char, len: usize) -> *mut c_char;

    // Large objects
    pub fn lo_creat(conn: *mut PGconn, mode: c_int) -> Oid;
    pub fn lo_import(conn: *mut PGconn, filename: *const c_char) -> Oid;
    pub fn lo_export(conn: *mut PGconn, lobjId: Oid, filename: *const c_char) -> c_int;
    pub fn lo_unlink(conn: *mut PGconn, lobjId: Oid) -> c_int;
    pub fn lo_open(conn: *mut PGconn, lobjId: Oid, mode: c_int) -> c_int;
    pub fn lo_close(conn: *mut PGconn, fd: c_int) -> c_int;
    pub fn lo_read(conn: *mut PGconn, fd: c_int, buf: *mut c_char, len: usize) -> c_int;
    pub fn lo_write(conn: *mut PGconn, fd: c_int, buf: *const c_char, len: usize) -> c_int;
    pub fn lo_lseek(conn: *mut PGconn, fd: c_int, offset: c_int, whence: c_int) -> c_int;
    pub fn lo_lseek64(conn: *mut PGconn, fd: c_int, offset: i64, whence: c_int) -> i64;
    pub fn lo_tell(conn: *mut PGconn, fd: c_int) -> c_int;
    pub fn lo_tell64(conn: *mut PGconn, fd: c_int) -> i64;
}
