//! Query results.
//!
//! A [`QueryResult`] is an immutable snapshot copied out of the wrapped
//! protocol's result object. It is cheap to clone (the data sits behind an
//! `Arc`) and may be handed to other threads; the last clone frees it.
//! Fields are kept in the server's text format and converted on access.

use crate::error::{Error, Result, TypeError};
use std::collections::HashMap;
use std::sync::Arc;

/// Column metadata shared across all rows in a result set.
#[derive(Debug, Clone, Default)]
pub struct ColumnInfo {
    names: Vec<String>,
    type_oids: Vec<u32>,
    name_to_index: HashMap<String, usize>,
}

impl ColumnInfo {
    /// Create column info from `(name, type oid)` pairs.
    pub fn new(columns: Vec<(String, u32)>) -> Self {
        let mut names = Vec::with_capacity(columns.len());
        let mut type_oids = Vec::with_capacity(columns.len());
        let mut name_to_index = HashMap::with_capacity(columns.len());
        for (i, (name, oid)) in columns.into_iter().enumerate() {
            // First column wins on duplicate names, like the server's own lookup.
            name_to_index.entry(name.clone()).or_insert(i);
            names.push(name);
            type_oids.push(oid);
        }
        Self {
            names,
            type_oids,
            name_to_index,
        }
    }

    /// Create column info for untyped columns.
    pub fn from_names<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::new(names.into_iter().map(|n| (n.into(), 0)).collect())
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    /// Get the index of a column by name.
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.name_to_index.get(name).copied()
    }

    /// Get the name of a column by index.
    pub fn name_at(&self, index: usize) -> Option<&str> {
        self.names.get(index).map(String::as_str)
    }

    /// Type OID of a column, `0` when unknown.
    pub fn type_at(&self, index: usize) -> Option<u32> {
        self.type_oids.get(index).copied()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }
}

#[derive(Debug, Default)]
struct ResultData {
    columns: ColumnInfo,
    rows: Vec<Vec<Option<Vec<u8>>>>,
    command_status: String,
    affected_rows: Option<u64>,
    query: Option<String>,
}

/// Immutable, shared result of one command.
#[derive(Debug, Clone, Default)]
pub struct QueryResult {
    data: Arc<ResultData>,
}

impl QueryResult {
    /// Build a result set. Every row must have one entry per column;
    /// `None` marks an SQL NULL.
    pub fn new(columns: ColumnInfo, rows: Vec<Vec<Option<Vec<u8>>>>) -> Result<Self> {
        if let Some((i, row)) = rows
            .iter()
            .enumerate()
            .find(|(_, r)| r.len() != columns.len())
        {
            return Err(Error::internal(format!(
                "row {} has {} fields, expected {}",
                i,
                row.len(),
                columns.len()
            )));
        }
        Ok(Self {
            data: Arc::new(ResultData {
                columns,
                rows,
                ..ResultData::default()
            }),
        })
    }

    /// Result of a command that returned no rows.
    pub fn command(status: impl Into<String>, affected_rows: Option<u64>) -> Self {
        Self {
            data: Arc::new(ResultData {
                command_status: status.into(),
                affected_rows,
                ..ResultData::default()
            }),
        }
    }

    /// Attach the command tag and affected-row count.
    pub fn with_status(self, status: impl Into<String>, affected_rows: Option<u64>) -> Self {
        self.map_data(|d| {
            d.command_status = status.into();
            d.affected_rows = affected_rows;
        })
    }

    /// Attach the text of the command that produced this result.
    pub fn with_query(self, query: impl Into<String>) -> Self {
        self.map_data(|d| d.query = Some(query.into()))
    }

    fn map_data(self, f: impl FnOnce(&mut ResultData)) -> Self {
        let mut data = Arc::try_unwrap(self.data).unwrap_or_else(|shared| ResultData {
            columns: shared.columns.clone(),
            rows: shared.rows.clone(),
            command_status: shared.command_status.clone(),
            affected_rows: shared.affected_rows,
            query: shared.query.clone(),
        });
        f(&mut data);
        Self {
            data: Arc::new(data),
        }
    }

    /// Number of rows.
    pub fn len(&self) -> usize {
        self.data.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.rows.is_empty()
    }

    pub fn columns(&self) -> &ColumnInfo {
        &self.data.columns
    }

    pub fn column_name(&self, index: usize) -> Result<&str> {
        self.data
            .columns
            .name_at(index)
            .ok_or_else(|| self.column_out_of_range(index))
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.data
            .columns
            .index_of(name)
            .ok_or_else(|| Error::usage(format!("Unknown column name: '{}'", name)))
    }

    /// Type OID of a column.
    pub fn column_type(&self, index: usize) -> Result<u32> {
        self.data
            .columns
            .type_at(index)
            .ok_or_else(|| self.column_out_of_range(index))
    }

    /// Rows inserted, updated or deleted, when the command reports a count.
    pub fn affected_rows(&self) -> Option<u64> {
        self.data.affected_rows
    }

    /// Command tag, e.g. `INSERT 0 1` or `ROLLBACK`.
    pub fn command_status(&self) -> &str {
        &self.data.command_status
    }

    pub fn query(&self) -> Option<&str> {
        self.data.query.as_deref()
    }

    pub fn row(&self, index: usize) -> Result<Row<'_>> {
        if index >= self.len() {
            return Err(Error::usage(format!(
                "Row number {} out of range (result has {} rows)",
                index,
                self.len()
            )));
        }
        Ok(Row {
            result: self,
            index,
        })
    }

    pub fn rows(&self) -> impl ExactSizeIterator<Item = Row<'_>> {
        (0..self.len()).map(move |index| Row {
            result: self,
            index,
        })
    }

    /// Typed value at `(row, column)`.
    pub fn get<T: FromField>(&self, row: usize, column: usize) -> Result<T> {
        self.row(row)?.get(column)
    }

    fn column_out_of_range(&self, index: usize) -> Error {
        Error::usage(format!(
            "Column number {} out of range (result has {} columns)",
            index,
            self.data.columns.len()
        ))
    }
}

/// A row borrowed from a [`QueryResult`].
#[derive(Debug, Clone, Copy)]
pub struct Row<'r> {
    result: &'r QueryResult,
    index: usize,
}

impl<'r> Row<'r> {
    /// Position of this row in its result.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn len(&self) -> usize {
        self.result.data.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn field(&self, column: usize) -> Result<Field<'r>> {
        let data = &self.result.data;
        let name = data
            .columns
            .name_at(column)
            .ok_or_else(|| self.result.column_out_of_range(column))?;
        Ok(Field {
            name,
            raw: data.rows[self.index][column].as_deref(),
        })
    }

    pub fn field_named(&self, name: &str) -> Result<Field<'r>> {
        let index = self.result.column_index(name)?;
        self.field(index)
    }

    /// Typed value by column index.
    pub fn get<T: FromField>(&self, column: usize) -> Result<T> {
        self.field(column)?.get()
    }

    /// Typed value by column name.
    pub fn get_named<T: FromField>(&self, name: &str) -> Result<T> {
        self.field_named(name)?.get()
    }

    pub fn fields(&self) -> impl Iterator<Item = Field<'r>> + '_ {
        (0..self.len()).filter_map(move |i| self.field(i).ok())
    }
}

/// One field of a row, still in text format.
#[derive(Debug, Clone, Copy)]
pub struct Field<'r> {
    name: &'r str,
    raw: Option<&'r [u8]>,
}

impl<'r> Field<'r> {
    pub fn name(&self) -> &'r str {
        self.name
    }

    pub fn is_null(&self) -> bool {
        self.raw.is_none()
    }

    /// Raw field bytes; `None` for NULL.
    pub fn as_bytes(&self) -> Option<&'r [u8]> {
        self.raw
    }

    /// Field text; NULL and non-UTF-8 content are type errors.
    pub fn as_str(&self) -> Result<&'r str> {
        let raw = self.raw.ok_or_else(|| self.type_error("text", "NULL"))?;
        std::str::from_utf8(raw).map_err(|_| self.type_error("text", "non-UTF-8 bytes"))
    }

    /// Decode a `bytea` field in either hex (`\x..`) or escape format.
    pub fn as_binary(&self) -> Result<Vec<u8>> {
        let raw = self.raw.ok_or_else(|| self.type_error("bytea", "NULL"))?;
        decode_bytea(raw).ok_or_else(|| self.type_error("bytea", "malformed bytea text"))
    }

    pub fn get<T: FromField>(&self) -> Result<T> {
        T::from_field(self)
    }

    fn type_error(&self, expected: &'static str, actual: impl Into<String>) -> Error {
        Error::Type(TypeError {
            expected,
            actual: actual.into(),
            column: Some(self.name.to_string()),
        })
    }
}

fn decode_bytea(raw: &[u8]) -> Option<Vec<u8>> {
    if let Some(hex) = raw.strip_prefix(b"\\x") {
        if hex.len() % 2 != 0 {
            return None;
        }
        return hex
            .chunks_exact(2)
            .map(|pair| Some((hex_digit(pair[0])? << 4) | hex_digit(pair[1])?))
            .collect();
    }

    let mut out = Vec::with_capacity(raw.len());
    let mut i = 0;
    while i < raw.len() {
        if raw[i] != b'\\' {
            out.push(raw[i]);
            i += 1;
        } else if raw.get(i + 1) == Some(&b'\\') {
            out.push(b'\\');
            i += 2;
        } else {
            let digits = raw.get(i + 1..i + 4)?;
            let mut byte: u16 = 0;
            for d in digits {
                if !(b'0'..=b'7').contains(d) {
                    return None;
                }
                byte = byte * 8 + u16::from(d - b'0');
            }
            out.push(u8::try_from(byte).ok()?);
            i += 4;
        }
    }
    Some(out)
}

fn hex_digit(c: u8) -> Option<u8> {
    match c {
        b'0'..=b'9' => Some(c - b'0'),
        b'a'..=b'f' => Some(c - b'a' + 10),
        b'A'..=b'F' => Some(c - b'A' + 10),
        _ => None,
    }
}

/// Conversion from a text-format field.
pub trait FromField: Sized {
    fn from_field(field: &Field<'_>) -> Result<Self>;
}

impl FromField for String {
    fn from_field(field: &Field<'_>) -> Result<Self> {
        field.as_str().map(str::to_string)
    }
}

impl FromField for bool {
    fn from_field(field: &Field<'_>) -> Result<Self> {
        match field.as_str()? {
            "t" | "true" => Ok(true),
            "f" | "false" => Ok(false),
            other => Err(field.type_error("bool", other)),
        }
    }
}

macro_rules! from_field_parse {
    ($($ty:ty => $name:literal),* $(,)?) => {
        $(
            impl FromField for $ty {
                fn from_field(field: &Field<'_>) -> Result<Self> {
                    let text = field.as_str()?;
                    text.trim().parse::<$ty>().map_err(|_| field.type_error($name, text))
                }
            }
        )*
    };
}

from_field_parse! {
    i16 => "i16",
    i32 => "i32",
    i64 => "i64",
    u32 => "u32",
    u64 => "u64",
}

macro_rules! from_field_float {
    ($($ty:ty),*) => {
        $(
            impl FromField for $ty {
                fn from_field(field: &Field<'_>) -> Result<Self> {
                    let text = field.as_str()?;
                    match text {
                        "NaN" => Ok(<$ty>::NAN),
                        "Infinity" => Ok(<$ty>::INFINITY),
                        "-Infinity" => Ok(<$ty>::NEG_INFINITY),
                        _ => text
                            .parse::<$ty>()
                            .map_err(|_| field.type_error(stringify!($ty), text)),
                    }
                }
            }
        )*
    };
}

from_field_float!(f32, f64);

impl FromField for Vec<u8> {
    fn from_field(field: &Field<'_>) -> Result<Self> {
        field.as_binary()
    }
}

impl FromField for serde_json::Value {
    fn from_field(field: &Field<'_>) -> Result<Self> {
        let text = field.as_str()?;
        serde_json::from_str(text).map_err(|e| field.type_error("json", e.to_string()))
    }
}

impl<T: FromField> FromField for Option<T> {
    fn from_field(field: &Field<'_>) -> Result<Self> {
        if field.is_null() {
            Ok(None)
        } else {
            T::from_field(field).map(Some)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> QueryResult {
        QueryResult::new(
            ColumnInfo::new(vec![
                ("id".to_string(), 23),
                ("name".to_string(), 25),
                ("data".to_string(), 17),
            ]),
            vec![
                vec![
                    Some(b"1".to_vec()),
                    Some(b"alpha".to_vec()),
                    Some(b"\\x5465737400".to_vec()),
                ],
                vec![Some(b"2".to_vec()), None, Some(b"a\\000b\\\\".to_vec())],
            ],
        )
        .unwrap()
        .with_status("SELECT 2", Some(2))
    }

    #[test]
    fn navigation_and_metadata() {
        let r = sample();
        assert_eq!(r.len(), 2);
        assert_eq!(r.column_index("name").unwrap(), 1);
        assert_eq!(r.column_name(2).unwrap(), "data");
        assert_eq!(r.column_type(0).unwrap(), 23);
        assert_eq!(r.command_status(), "SELECT 2");
        assert_eq!(r.affected_rows(), Some(2));
        assert!(r.row(2).unwrap_err().is_usage());
        assert!(r.column_index("missing").unwrap_err().is_usage());
    }

    #[test]
    fn typed_access_and_nulls() {
        let r = sample();
        assert_eq!(r.get::<i32>(1, 0).unwrap(), 2);
        let row = r.row(1).unwrap();
        assert!(row.field_named("name").unwrap().is_null());
        assert_eq!(row.get_named::<Option<String>>("name").unwrap(), None);
        assert!(matches!(row.get::<String>(1), Err(Error::Type(_))));
        let names: Vec<String> = r
            .rows()
            .filter_map(|row| row.get::<Option<String>>(1).unwrap())
            .collect();
        assert_eq!(names, vec!["alpha".to_string()]);
    }

    #[test]
    fn bytea_hex_and_escape_formats() {
        let r = sample();
        assert_eq!(r.get::<Vec<u8>>(0, 2).unwrap(), b"Test\0");
        assert_eq!(r.get::<Vec<u8>>(1, 2).unwrap(), b"a\0b\\");
        assert_eq!(decode_bytea(b"\\x4"), None);
        assert_eq!(decode_bytea(b"\\9zz"), None);
    }

    #[test]
    fn scalar_parsing() {
        let r = QueryResult::new(
            ColumnInfo::from_names(["b", "f", "j"]),
            vec![vec![
                Some(b"t".to_vec()),
                Some(b"-Infinity".to_vec()),
                Some(br#"{"k":[1,2]}"#.to_vec()),
            ]],
        )
        .unwrap();
        assert!(r.get::<bool>(0, 0).unwrap());
        assert_eq!(r.get::<f64>(0, 1).unwrap(), f64::NEG_INFINITY);
        assert_eq!(
            r.get::<serde_json::Value>(0, 2).unwrap(),
            serde_json::json!({"k": [1, 2]})
        );
        assert!(r.get::<i64>(0, 0).is_err());
    }

    #[test]
    fn ragged_rows_are_rejected() {
        let err = QueryResult::new(ColumnInfo::from_names(["a"]), vec![vec![None, None]])
            .unwrap_err();
        assert!(err.is_internal());
    }

    #[test]
    fn shared_across_threads() {
        let r = sample();
        let clone = r.clone();
        let n = std::thread::spawn(move || clone.len()).join().unwrap();
        assert_eq!(n, r.len());
    }
}
