//! Values, result sets and transaction options shared by every backend

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A statement parameter
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Boolean
    Bool(bool),
    /// 64-bit integer
    Int(i64),
    /// Double precision float
    Float(f64),
    /// Text
    Text(String),
    /// Raw bytes
    Bytes(Vec<u8>),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        v.map_or(Value::Null, Into::into)
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Column {
    /// Column name
    pub name: String,
    /// Backend type identifier (OID for Postgres)
    pub type_id: u32,
}

/// One result row in text form
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Row {
    values: Vec<Option<String>>,
}

impl Row {
    /// Create a row from text cells
    pub fn new(values: Vec<Option<String>>) -> Self {
        Self { values }
    }

    /// Number of cells
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// True if the row has no cells
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Raw text of a cell (`None` for NULL or out of range)
    pub fn get_str(&self, idx: usize) -> Option<&str> {
        self.values.get(idx).and_then(|v| v.as_deref())
    }

    /// Parse a cell
    pub fn get<T: FromStr>(&self, idx: usize) -> Option<T> {
        self.get_str(idx).and_then(|s| s.parse().ok())
    }

    /// All cells
    pub fn values(&self) -> &[Option<String>] {
        &self.values
    }
}

/// A complete result set
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Rows {
    /// Column descriptions
    pub columns: Vec<Column>,
    /// Data rows
    pub rows: Vec<Row>,
}

impl Rows {
    /// Create a result set
    pub fn new(columns: Vec<Column>, rows: Vec<Row>) -> Self {
        Self { columns, rows }
    }

    /// Single-column, single-row convenience constructor
    pub fn scalar(name: impl Into<String>, value: Option<String>) -> Self {
        Self {
            columns: vec![Column {
                name: name.into(),
                type_id: 0,
            }],
            rows: vec![Row::new(vec![value])],
        }
    }

    /// Number of data rows
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    /// True when no rows were returned
    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// First cell of the first row
    pub fn first_value(&self) -> Option<&str> {
        self.rows.first().and_then(|r| r.get_str(0))
    }

    /// Index of a column by name
    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    /// Render rows as JSON objects keyed by column name
    pub fn to_json(&self) -> serde_json::Value {
        let rows = self
            .rows
            .iter()
            .map(|row| {
                let object = self
                    .columns
                    .iter()
                    .zip(row.values())
                    .map(|(col, cell)| {
                        let value = match cell {
                            Some(text) => serde_json::Value::String(text.clone()),
                            None => serde_json::Value::Null,
                        };
                        (col.name.clone(), value)
                    })
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            })
            .collect();
        serde_json::Value::Array(rows)
    }
}

/// Outcome of a statement that returns no rows
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ExecResult {
    /// Rows inserted, updated or deleted
    pub rows_affected: u64,
}

/// Transaction isolation level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// READ UNCOMMITTED
    ReadUncommitted,
    /// READ COMMITTED
    ReadCommitted,
    /// REPEATABLE READ
    RepeatableRead,
    /// SERIALIZABLE
    Serializable,
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            Self::ReadCommitted => write!(f, "READ COMMITTED"),
            Self::RepeatableRead => write!(f, "REPEATABLE READ"),
            Self::Serializable => write!(f, "SERIALIZABLE"),
        }
    }
}

/// Options for beginning a transaction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxOptions {
    /// Isolation level (backend default when unset)
    pub isolation: Option<IsolationLevel>,
    /// Read-only transaction
    pub read_only: bool,
}

impl TxOptions {
    /// Set the isolation level
    pub fn isolation(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Mark the transaction read-only
    pub fn read_only(mut self) -> Self {
        self.read_only = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_get_parses_cells() {
        let row = Row::new(vec![Some("42".into()), None, Some("abc".into())]);
        assert_eq!(row.get::<i64>(0), Some(42));
        assert_eq!(row.get::<i64>(1), None);
        assert_eq!(row.get::<i64>(2), None);
        assert_eq!(row.get_str(2), Some("abc"));
        assert_eq!(row.get_str(9), None);
    }

    #[test]
    fn test_rows_to_json() {
        let rows = Rows::new(
            vec![
                Column {
                    name: "id".into(),
                    type_id: 23,
                },
                Column {
                    name: "name".into(),
                    type_id: 25,
                },
            ],
            vec![Row::new(vec![Some("1".into()), None])],
        );
        assert_eq!(
            rows.to_json(),
            serde_json::json!([{ "id": "1", "name": null }])
        );
        assert_eq!(rows.column_index("name"), Some(1));
    }

    #[test]
    fn test_value_from_option() {
        assert_eq!(Value::from(None::<i64>), Value::Null);
        assert_eq!(Value::from(Some("x")), Value::Text("x".into()));
    }

    #[test]
    fn test_value_deserializes_untagged() {
        let values: Vec<Value> = serde_json::from_str(r#"[null, true, 7, 1.5, "s"]"#).unwrap();
        assert_eq!(
            values,
            vec![
                Value::Null,
                Value::Bool(true),
                Value::Int(7),
                Value::Float(1.5),
                Value::Text("s".into()),
            ]
        );
    }
}
