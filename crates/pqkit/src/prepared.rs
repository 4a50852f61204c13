//! Prepared statements.
//!
//! A [`PreparedDeclaration`] is registered once per connection with
//! [`Connection::prepare`](crate::Connection::prepare). Each execution goes
//! through an [`Invocation`] obtained from
//! [`Transaction::prepared`](crate::Transaction::prepared): arguments are
//! bound in declared order, checked against the declaration, then sent in one
//! round-trip.
//!
//! ```ignore
//! conn.prepare(
//!     PreparedDeclaration::new("add_blob", "INSERT INTO blobs VALUES ($1, $2)")
//!         .param("int", Treatment::Direct)
//!         .param("bytea", Treatment::Binary),
//! )?;
//! let tx = conn.transaction("load")?;
//! tx.prepared("add_blob")?.bind(6).bind(&b"Test\0data"[..]).exec()?;
//! ```

use std::fmt;
use std::sync::{Arc, OnceLock};

use pqkit_core::{BoundParam, Error, Identity, Named, QueryResult, Result, Session, Value};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::transaction::Transaction;

/// How an argument is passed to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Treatment {
    /// Text inserted into the statement as-is (numbers, keywords)
    Direct,
    /// A text value; quoted as a literal when rendered
    String,
    /// Opaque bytes sent in binary format; NUL bytes survive
    Binary,
}

/// One declared parameter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Parameter {
    /// SQL type name, e.g. `integer` or `bytea`
    pub sql_type: String,
    pub treatment: Treatment,
}

/// Name, SQL template and ordered parameter list of a prepared statement.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PreparedDeclaration {
    name: String,
    sql: String,
    params: Vec<Parameter>,
}

fn placeholder_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$([0-9]+)").expect("placeholder pattern is valid"))
}

/// Type names as written in SQL: optionally schema-qualified or quoted, with
/// a modifier list and array brackets.
fn type_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r#"^[A-Za-z_"][A-Za-z0-9_ ."]*(\([0-9 ,]*\))?(\[[0-9]*\])*$"#)
            .expect("type name pattern is valid")
    })
}

impl PreparedDeclaration {
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            params: Vec::new(),
        }
    }

    /// Append a parameter.
    pub fn param(mut self, sql_type: impl Into<String>, treatment: Treatment) -> Self {
        self.params.push(Parameter {
            sql_type: sql_type.into(),
            treatment,
        });
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Parameter] {
        &self.params
    }

    /// Reject declarations the server would refuse anyway.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::usage("Prepared statement needs a name"));
        }
        // Declared types are sent to the server as SQL text.
        for (i, param) in self.params.iter().enumerate() {
            if !param.sql_type.is_empty() && !type_name_pattern().is_match(&param.sql_type) {
                return Err(Error::usage(format!(
                    "Parameter {} of prepared statement '{}' has an invalid type name '{}'",
                    i + 1,
                    self.name,
                    param.sql_type
                )));
            }
        }
        for caps in placeholder_pattern().captures_iter(&self.sql) {
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            if index == 0 || index > self.params.len() {
                return Err(Error::usage(format!(
                    "Prepared statement '{}' refers to ${} but declares {} parameters",
                    self.name,
                    &caps[1],
                    self.params.len()
                )));
            }
        }
        Ok(())
    }

    /// Substitute encoded arguments into the template, for sessions that
    /// cannot prepare statements.
    pub(crate) fn render<S: Session + ?Sized>(
        &self,
        args: &[BoundParam],
        session: &S,
    ) -> Result<String> {
        let mut sql = String::with_capacity(self.sql.len());
        let mut last = 0;
        for caps in placeholder_pattern().captures_iter(&self.sql) {
            let Some(whole) = caps.get(0) else { continue };
            let index: usize = caps[1].parse().unwrap_or(usize::MAX);
            let (Some(arg), Some(param)) = (
                index.checked_sub(1).and_then(|i| args.get(i)),
                index.checked_sub(1).and_then(|i| self.params.get(i)),
            ) else {
                return Err(Error::internal(format!(
                    "placeholder ${} of '{}' has no argument",
                    index, self.name
                )));
            };
            sql.push_str(&self.sql[last..whole.start()]);
            sql.push_str(&render_arg(arg, param.treatment, session)?);
            last = whole.end();
        }
        sql.push_str(&self.sql[last..]);
        Ok(sql)
    }
}

fn render_arg<S: Session + ?Sized>(
    arg: &BoundParam,
    treatment: Treatment,
    session: &S,
) -> Result<String> {
    let Some(bytes) = &arg.value else {
        return Ok("NULL".to_string());
    };
    match treatment {
        Treatment::Binary => Ok(format!("'{}'::bytea", session.escape_bytea(bytes)?)),
        Treatment::Direct | Treatment::String => {
            let text = std::str::from_utf8(bytes)
                .map_err(|_| Error::internal("text argument was not UTF-8 after validation"))?;
            if treatment == Treatment::Direct {
                Ok(text.to_string())
            } else {
                Ok(format!("'{}'", session.escape_string(text)?))
            }
        }
    }
}

/// Encode one argument for its declared treatment.
fn encode(position: usize, value: &Value, param: &Parameter, owner: &str) -> Result<BoundParam> {
    if value.is_null() {
        return Ok(BoundParam::null());
    }
    match param.treatment {
        Treatment::Binary => match value {
            Value::Bytes(b) => Ok(BoundParam::binary(b.clone())),
            Value::Text(s) => Ok(BoundParam::binary(s.as_bytes().to_vec())),
            other => Err(Error::usage(format!(
                "Argument {} of {} is a binary parameter but got {}",
                position,
                owner,
                other.type_name()
            ))),
        },
        Treatment::Direct | Treatment::String => {
            let text = value
                .to_text()
                .map_err(|e| {
                    Error::usage(format!(
                        "Argument {} of {} cannot be passed as text ({}); declare it binary",
                        position, owner, e
                    ))
                })?
                .unwrap_or_default();
            if text.contains('\0') {
                return Err(Error::usage(format!(
                    "Argument {} of {} contains a NUL byte; declare it binary",
                    position, owner
                )));
            }
            Ok(BoundParam::text(text))
        }
    }
}

/// One pending execution of a prepared statement.
pub struct Invocation<'t, S: Session> {
    tx: &'t Transaction<'t, S>,
    decl: Arc<PreparedDeclaration>,
    identity: Identity,
    args: Vec<Value>,
    spent: bool,
}

impl<'t, S: Session> Invocation<'t, S> {
    pub(crate) fn new(tx: &'t Transaction<'t, S>, decl: Arc<PreparedDeclaration>) -> Self {
        let identity = Identity::new("Invocation", decl.name());
        Self {
            tx,
            decl,
            identity,
            args: Vec::new(),
            spent: false,
        }
    }

    /// Append an argument. `None` and [`Value::Null`] bind SQL NULL.
    pub fn bind(&mut self, value: impl Into<Value>) -> &mut Self {
        self.args.push(value.into());
        self
    }

    /// Append an SQL NULL.
    pub fn bind_null(&mut self) -> &mut Self {
        self.args.push(Value::Null);
        self
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn declaration(&self) -> &PreparedDeclaration {
        &self.decl
    }

    /// Execute. An invocation runs at most once; every check happens before
    /// anything is sent.
    pub fn exec(&mut self) -> Result<QueryResult> {
        let desc = self.identity.description();
        if self.spent {
            return Err(Error::usage(format!("{} executed more than once", desc)));
        }
        self.tx.check_executable()?;

        let declared = self.decl.params();
        if self.args.len() != declared.len() {
            return Err(Error::usage(format!(
                "{} expects {} arguments, got {}",
                desc,
                declared.len(),
                self.args.len()
            )));
        }
        let params = self
            .args
            .iter()
            .zip(declared)
            .enumerate()
            .map(|(i, (value, param))| encode(i + 1, value, param, &desc))
            .collect::<Result<Vec<_>>>()?;

        self.spent = true;
        self.tx.connection().exec_declared(&self.decl, &params)
    }
}

impl<S: Session> Named for Invocation<'_, S> {
    fn identity(&self) -> &Identity {
        &self.identity
    }
}

impl<S: Session> fmt::Debug for Invocation<'_, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("statement", &self.decl.name())
            .field("args", &self.args)
            .field("spent", &self.spent)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Connection;
    use pqkit_core::testing::MemorySession;

    fn insert_decl() -> PreparedDeclaration {
        PreparedDeclaration::new("ins", "INSERT INTO t VALUES ($1, $2, $3)")
            .param("int", Treatment::Direct)
            .param("text", Treatment::String)
            .param("bytea", Treatment::Binary)
    }

    #[test]
    fn validate_checks_placeholders() {
        assert!(insert_decl().validate().is_ok());
        let bad = PreparedDeclaration::new("q", "SELECT $2").param("int", Treatment::Direct);
        assert!(bad.validate().unwrap_err().is_usage());
        let zero = PreparedDeclaration::new("q", "SELECT $0");
        assert!(zero.validate().is_err());
    }

    #[test]
    fn validate_checks_type_names() {
        let ok = PreparedDeclaration::new("q", "SELECT $1, $2, $3, $4")
            .param("numeric(10, 2)", Treatment::Direct)
            .param("pg_catalog.int4", Treatment::Direct)
            .param("text[]", Treatment::String)
            .param("", Treatment::String);
        assert!(ok.validate().is_ok());

        let bad = PreparedDeclaration::new("q", "SELECT $1")
            .param("int); DROP TABLE t; --", Treatment::Direct);
        let err = bad.validate().unwrap_err();
        assert!(err.is_usage());
        assert!(err.to_string().contains("invalid type name"));
    }

    #[test]
    fn declared_types_reach_the_server() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.prepare(
            PreparedDeclaration::new("echo", "SELECT $1").param("bytea", Treatment::Binary),
        )
        .unwrap();
        conn.prepare(insert_decl()).unwrap();

        let tx = conn.transaction("t").unwrap();
        tx.prepared("echo").unwrap().bind(&b"Test\0data"[..]).exec().unwrap();
        tx.prepared("ins").unwrap().bind(1).bind("a").bind(b"x").exec().unwrap();

        assert_eq!(probe.prepared_types("echo"), Some(vec!["bytea".to_string()]));
        assert_eq!(
            probe.prepared_types("ins"),
            Some(vec!["int".to_string(), "text".to_string(), "bytea".to_string()])
        );
        assert!(probe.log().iter().any(|l| l == "PREPARE echo (bytea): SELECT $1"));
    }

    #[test]
    fn prepared_lazily_and_once() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.prepare(insert_decl()).unwrap();
        assert!(probe.prepared_names().is_empty());

        let tx = conn.transaction("t").unwrap();
        tx.prepared("ins").unwrap().bind(1).bind("a").bind(b"x").exec().unwrap();
        tx.prepared("ins").unwrap().bind(2).bind("b").bind(b"y").exec().unwrap();
        let prepares = probe
            .log()
            .iter()
            .filter(|l| l.starts_with("PREPARE ins"))
            .count();
        assert_eq!(prepares, 1);
    }

    #[test]
    fn exec_checks_happen_before_round_trip() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.prepare(insert_decl()).unwrap();
        let tx = conn.transaction("t").unwrap();
        let before = probe.log().len();

        let err = tx.prepared("ins").unwrap().bind(1).exec().unwrap_err();
        assert!(err.to_string().contains("expects 3 arguments, got 1"));

        let err = tx
            .prepared("ins")
            .unwrap()
            .bind(1)
            .bind(vec![0x66_u8, 0xff])
            .bind(b"x")
            .exec()
            .unwrap_err();
        assert!(err.is_usage());

        let err = tx
            .prepared("ins")
            .unwrap()
            .bind(1)
            .bind("a\0b")
            .bind(b"x")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("NUL byte"));

        let err = tx
            .prepared("ins")
            .unwrap()
            .bind(1)
            .bind("a")
            .bind(3.5)
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("binary parameter but got DOUBLE PRECISION"));

        assert!(tx.prepared("missing").unwrap_err().is_usage());
        assert_eq!(probe.log().len(), before);
    }

    #[test]
    fn invocation_is_spent_after_exec() {
        let conn = Connection::new(MemorySession::new());
        conn.prepare(insert_decl()).unwrap();
        let tx = conn.transaction("t").unwrap();
        let mut inv = tx.prepared("ins").unwrap();
        inv.bind(1).bind_null().bind(Option::<Vec<u8>>::None);
        inv.exec().unwrap();
        let err = inv.exec().unwrap_err();
        assert!(err.to_string().contains("Invocation 'ins' executed more than once"));
    }

    #[test]
    fn nulls_are_sent_as_null() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.prepare(insert_decl()).unwrap();
        let mut tx = conn.transaction("t").unwrap();
        tx.prepared("ins")
            .unwrap()
            .bind(1)
            .bind(Option::<&str>::None)
            .bind("")
            .exec()
            .unwrap();
        tx.commit().unwrap();
        let params = &probe.committed()[0].params;
        assert_eq!(params[1], None);
        assert_eq!(params[2], Some(Vec::new()));
    }

    #[test]
    fn fallback_renders_literals() {
        let session = MemorySession::with_versions(90600, 2);
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.prepare(insert_decl()).unwrap();
        let mut tx = conn.transaction("t").unwrap();
        tx.prepared("ins")
            .unwrap()
            .bind(6)
            .bind("it's")
            .bind(&b"Test\0data"[..])
            .exec()
            .unwrap();
        tx.prepared("ins")
            .unwrap()
            .bind(7)
            .bind_null()
            .bind_null()
            .exec()
            .unwrap();
        tx.commit().unwrap();

        let sqls: Vec<String> = probe.committed().into_iter().map(|w| w.sql).collect();
        assert_eq!(
            sqls,
            vec![
                "INSERT INTO t VALUES (6, 'it''s', '\\x546573740064617461'::bytea)".to_string(),
                "INSERT INTO t VALUES (7, NULL, NULL)".to_string(),
            ]
        );
        assert!(probe.prepared_names().is_empty());
    }

    #[test]
    fn unprepare_deallocates_on_server() {
        let session = MemorySession::new();
        let probe = session.probe();
        let conn = Connection::new(session);
        conn.prepare(insert_decl()).unwrap();
        {
            let mut tx = conn.transaction("t").unwrap();
            tx.prepared("ins").unwrap().bind(1).bind("a").bind(b"b").exec().unwrap();
            tx.commit().unwrap();
        }
        assert_eq!(probe.prepared_names(), vec!["ins".to_string()]);
        conn.unprepare("ins").unwrap();
        assert!(probe.prepared_names().is_empty());
        assert!(probe.log().contains(&"DEALLOCATE \"ins\"".to_string()));
    }
}
