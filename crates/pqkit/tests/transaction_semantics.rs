use pqkit::{
    Connection, Error, LargeObject, LargeObjectAccess, Named, OpenMode, PreparedDeclaration,
    SeekOrigin, Transaction, TransactionState, Treatment,
};
use pqkit_core::testing::{MemoryProbe, MemorySession};
use pqkit_core::{ColumnInfo, QueryResult, TransactionErrorKind};

fn connect() -> (Connection<MemorySession>, MemoryProbe) {
    let session = MemorySession::new();
    let probe = session.probe();
    (Connection::with_name(session, "test"), probe)
}

fn committed_sql(probe: &MemoryProbe) -> Vec<String> {
    probe.committed().into_iter().map(|w| w.sql).collect()
}

#[test]
fn second_transaction_is_refused_and_first_survives() {
    let (conn, probe) = connect();
    let mut first = conn.transaction("first").unwrap();

    let err = conn.transaction("second").unwrap_err();
    assert!(err.is_usage());
    assert_eq!(
        err.to_string(),
        "Usage error: Started Transaction 'second' while Transaction 'first' still active"
    );

    first.exec("INSERT INTO t VALUES (1)").unwrap();
    first.commit().unwrap();
    assert_eq!(committed_sql(&probe), vec!["INSERT INTO t VALUES (1)"]);
}

#[test]
fn dropping_without_commit_rolls_back() {
    let (conn, probe) = connect();
    {
        let tx = conn.transaction("dropped").unwrap();
        tx.exec("INSERT INTO t VALUES (1)").unwrap();
        tx.exec("UPDATE t SET v = 2").unwrap();
    }
    assert!(probe.committed().is_empty());
    assert!(!probe.in_transaction());
    assert_eq!(probe.log().last().map(String::as_str), Some("ROLLBACK"));

    // The slot is free again.
    conn.transaction("next").unwrap();
}

#[test]
fn panicking_inside_transaction_rolls_back() {
    let (conn, probe) = connect();
    let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
        let tx = conn.transaction("panics").unwrap();
        tx.exec("INSERT INTO t VALUES (1)").unwrap();
        panic!("boom");
    }));
    assert!(outcome.is_err());
    assert!(probe.committed().is_empty());
    assert!(!probe.in_transaction());
    conn.transaction("after").unwrap();
}

#[test]
fn binary_parameter_keeps_embedded_nul() {
    let (conn, probe) = connect();
    conn.prepare(
        PreparedDeclaration::new("ins_bin", "INSERT INTO pqxxbin VALUES ($1, $2)")
            .param("int", Treatment::Direct)
            .param("bytea", Treatment::Binary),
    )
    .unwrap();

    let data = b"Test\0data";
    let mut tx = conn.transaction("binary").unwrap();
    tx.prepared("ins_bin").unwrap().bind(6).bind(&data[..]).exec().unwrap();
    tx.commit().unwrap();

    let writes = probe.committed();
    assert_eq!(writes.len(), 1);
    let stored = writes[0].params[1].as_deref().unwrap();
    assert_eq!(stored.len(), 9);
    assert_eq!(stored, data);
}

#[test]
fn binary_field_decodes_to_original_bytes() {
    let (conn, probe) = connect();
    probe.respond(
        "SELECT data FROM pqxxbin",
        QueryResult::new(
            ColumnInfo::new(vec![("data".to_string(), 17)]),
            vec![vec![Some(b"\\x546573740064617461".to_vec())]],
        )
        .unwrap(),
    );
    let tx = conn.transaction("read").unwrap();
    let result = tx.exec("SELECT data FROM pqxxbin WHERE id = 6").unwrap();
    let field = result.row(0).unwrap().field_named("data").unwrap();
    let bytes = field.as_binary().unwrap();
    assert_eq!(bytes.len(), 9);
    assert_eq!(bytes, b"Test\0data");
}

#[test]
fn identical_redeclaration_is_noop_and_conflict_is_usage_error() {
    let (conn, _probe) = connect();
    let decl = PreparedDeclaration::new("q", "SELECT * FROM t WHERE id = $1")
        .param("int", Treatment::Direct);
    conn.prepare(decl.clone()).unwrap();
    conn.prepare(decl).unwrap();

    let changed = PreparedDeclaration::new("q", "SELECT * FROM t WHERE id > $1")
        .param("int", Treatment::Direct);
    let err = conn.prepare(changed).unwrap_err();
    assert!(err.is_usage());
    assert!(err.to_string().contains("'q'"));

    let retyped = PreparedDeclaration::new("q", "SELECT * FROM t WHERE id = $1")
        .param("text", Treatment::String);
    assert!(conn.prepare(retyped).unwrap_err().is_usage());
}

#[test]
fn nested_commit_then_outer_commit_keeps_both() {
    let (conn, probe) = connect();
    let mut outer = conn.transaction("A").unwrap();
    outer.exec("INSERT INTO t VALUES ('a')").unwrap();
    {
        let mut inner = outer.nested("B").unwrap();
        assert!(inner.is_nested());
        inner.exec("INSERT INTO t VALUES ('b')").unwrap();
        inner.commit().unwrap();
        assert_eq!(inner.state(), TransactionState::Committed);
    }
    outer.commit().unwrap();

    assert_eq!(
        committed_sql(&probe),
        vec!["INSERT INTO t VALUES ('a')", "INSERT INTO t VALUES ('b')"]
    );
}

#[test]
fn nested_abort_discards_only_inner_work() {
    let (conn, probe) = connect();
    let mut outer = conn.transaction("A").unwrap();
    outer.exec("INSERT INTO t VALUES ('a')").unwrap();
    {
        let mut inner = outer.nested("B").unwrap();
        inner.exec("INSERT INTO t VALUES ('b')").unwrap();
        inner.abort().unwrap();
    }
    {
        let inner = outer.nested("C").unwrap();
        inner.exec("INSERT INTO t VALUES ('c')").unwrap();
        // dropped: rolled back to its savepoint
    }
    assert!(probe.savepoints().is_empty());
    outer.exec("INSERT INTO t VALUES ('d')").unwrap();
    outer.commit().unwrap();

    assert_eq!(
        committed_sql(&probe),
        vec!["INSERT INTO t VALUES ('a')", "INSERT INTO t VALUES ('d')"]
    );
}

#[test]
fn nested_three_deep() {
    let (conn, probe) = connect();
    let mut a = conn.transaction("A").unwrap();
    {
        let mut b = a.nested("B").unwrap();
        {
            let mut c = b.nested("C").unwrap();
            c.exec("INSERT INTO t VALUES ('c')").unwrap();
            assert_eq!(probe.savepoints().len(), 2);
            c.commit().unwrap();
        }
        b.commit().unwrap();
    }
    a.commit().unwrap();
    assert_eq!(committed_sql(&probe), vec!["INSERT INTO t VALUES ('c')"]);
}

#[test]
fn read_only_large_object_rejects_writes() {
    let (conn, _probe) = connect();
    let tx = conn.transaction("lo").unwrap();
    let object = {
        let mut w = LargeObjectAccess::create(&tx, OpenMode::WRITE).unwrap();
        w.write(b"payload").unwrap();
        w.object()
    };

    let mut r = LargeObjectAccess::open(&tx, object, OpenMode::READ).unwrap();
    let err = r.write(b"more").unwrap_err();
    assert!(err.is_runtime());
    assert!(matches!(err, Error::LargeObject(ref e) if e.oid == Some(object.oid())));
    assert!(
        err.to_string()
            .contains(&format!("Error writing to large object #{}", object.oid()))
    );

    let mut buf = [0_u8; 7];
    assert_eq!(r.read(&mut buf).unwrap(), 7);
    assert_eq!(&buf, b"payload");
}

#[test]
fn seek_far_beyond_end_keeps_handle_usable() {
    let (conn, _probe) = connect();
    let tx = conn.transaction("lo").unwrap();
    let mut lo = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();
    lo.write(b"0123456789").unwrap();

    let far = 1_i64 << 40;
    assert_eq!(lo.seek(far, SeekOrigin::Start).unwrap(), far);
    assert_eq!(lo.tell().unwrap(), far);
    let mut buf = [0_u8; 8];
    assert_eq!(lo.read(&mut buf).unwrap(), 0);

    assert!(lo.seek(-1, SeekOrigin::Start).unwrap_err().is_runtime());
    assert_eq!(lo.seek(2, SeekOrigin::Start).unwrap(), 2);
    assert_eq!(lo.read(&mut buf[..3]).unwrap(), 3);
    assert_eq!(&buf[..3], b"234");
}

#[test]
fn large_objects_follow_transaction_outcome() {
    let (conn, probe) = connect();
    let oid = {
        let tx = conn.transaction("discarded").unwrap();
        let object = LargeObject::create(&tx).unwrap();
        assert!(probe.large_object(object.oid()).is_some());
        object.oid()
    };
    assert!(probe.large_object(oid).is_none());

    let mut tx = conn.transaction("kept").unwrap();
    let mut lo = LargeObjectAccess::create(&tx, OpenMode::READ_WRITE).unwrap();
    lo.write(b"durable").unwrap();
    let kept = lo.oid();
    drop(lo);
    tx.commit().unwrap();
    assert_eq!(probe.large_object(kept).as_deref(), Some(&b"durable"[..]));
}

#[test]
fn failed_commit_poisons_until_reset() {
    let (conn, probe) = connect();
    let mut tx = conn.transaction("doomed").unwrap();
    tx.exec("INSERT INTO t VALUES (1)").unwrap();
    probe.fail_on("COMMIT", "deferred constraint violated");
    let err = tx.commit().unwrap_err();
    assert!(err.is_runtime());
    assert_eq!(tx.state(), TransactionState::Broken);
    probe.clear_faults();

    let err = conn.transaction("next").unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref t) if t.kind == TransactionErrorKind::Broken
    ));
    drop(tx);

    conn.reset().unwrap();
    assert!(!conn.is_poisoned());
    conn.transaction("after reset").unwrap().commit().unwrap();
    assert!(probe.committed().is_empty());
}

#[test]
fn commit_after_statement_error_is_broken() {
    let (conn, probe) = connect();
    probe.fail_on("INSERT INTO missing", "relation \"missing\" does not exist");
    let mut tx = conn.transaction("t").unwrap();
    assert!(tx.exec("INSERT INTO missing VALUES (1)").is_err());
    let err = tx.commit().unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref t) if t.kind == TransactionErrorKind::Broken
    ));
    assert!(conn.is_poisoned());
}

#[test]
fn connection_lost_during_commit_is_in_doubt() {
    let (conn, probe) = connect();
    let mut tx = conn.transaction("t").unwrap();
    tx.exec("INSERT INTO t VALUES (1)").unwrap();
    probe.disconnect_on("COMMIT");
    let err = tx.commit().unwrap_err();
    assert!(matches!(
        err,
        Error::Transaction(ref t) if t.kind == TransactionErrorKind::InDoubt
    ));
    assert!(!err.is_retryable());
    assert_eq!(tx.state(), TransactionState::Broken);
}

#[test]
fn reset_refused_while_transaction_active() {
    let (conn, _probe) = connect();
    let tx = conn.transaction("busy").unwrap();
    let err = conn.reset().unwrap_err();
    assert!(err.is_usage());
    assert!(err.to_string().contains("Connection 'test'"));
    drop(tx);
    conn.reset().unwrap();
}

#[test]
fn prepared_statements_survive_reset() {
    let (conn, probe) = connect();
    conn.prepare(
        PreparedDeclaration::new("ins", "INSERT INTO t VALUES ($1)").param("text", Treatment::String),
    )
    .unwrap();
    {
        let mut tx = conn.transaction("before").unwrap();
        tx.prepared("ins").unwrap().bind("x").exec().unwrap();
        tx.commit().unwrap();
    }
    probe.drop_connection();
    conn.reset().unwrap();

    let mut tx = conn.transaction("after").unwrap();
    tx.prepared("ins").unwrap().bind("y").exec().unwrap();
    tx.commit().unwrap();

    let prepares = probe
        .log()
        .iter()
        .filter(|l| l.starts_with("PREPARE ins"))
        .count();
    assert_eq!(prepares, 2);
    assert_eq!(probe.committed().len(), 2);
}

#[test]
fn begin_through_transaction_type() {
    let (conn, _probe) = connect();
    let mut tx = Transaction::begin(&conn, "explicit").unwrap();
    assert_eq!(tx.description(), "Transaction 'explicit'");
    assert_eq!(tx.connection().description(), "Connection 'test'");
    tx.commit().unwrap();
}
