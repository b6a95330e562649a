//! Type definitions shared by the engine and its clients.
//!
//! Contains the value types, row structures and command results returned
//! for every statement.

use rusqlite::types::ValueRef;
use serde::{Deserialize, Serialize};
use std::fmt;

/// SQL value types accepted as statement parameters and returned in rows.
///
/// JSON-serializable so reports can embed query results directly.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    /// SQL NULL value
    Null,
    /// 64-bit signed integer
    Integer(i64),
    /// 64-bit floating point number
    Real(f64),
    /// UTF-8 text string
    Text(String),
}

impl From<ValueRef<'_>> for Value {
    fn from(value_ref: ValueRef<'_>) -> Self {
        match value_ref {
            ValueRef::Null | ValueRef::Blob(_) => Self::Null,
            ValueRef::Integer(i) => Self::Integer(i),
            ValueRef::Real(r) => Self::Real(r),
            ValueRef::Text(t) => Self::Text(String::from_utf8_lossy(t).to_string()),
        }
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl Value {
    /// Returns the value as an integer, if it is one.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }
}

/// A single row returned from a query.
///
/// Contains column names and their corresponding values in order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Row {
    /// Column names in order
    pub columns: Vec<String>,
    /// Values in same order as columns
    pub values: Vec<Value>,
}

impl Row {
    /// Creates a new row with the given columns and values.
    ///
    /// # Panics
    ///
    /// Panics if `columns.len()` != `values.len()`.
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        assert_eq!(
            columns.len(),
            values.len(),
            "Column count ({}) must match value count ({})",
            columns.len(),
            values.len()
        );
        Self { columns, values }
    }

    /// Builds a single-column row.
    pub fn single(column: &str, value: Value) -> Self {
        Self::new(vec![column.to_string()], vec![value])
    }

    /// Gets a value by column name, returning None if not found.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }
}

/// Command tag reported by the engine once a statement completes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CommandTag {
    Begin,
    Commit,
    /// Reported for `ROLLBACK`, and for `COMMIT` of an aborted transaction.
    Rollback,
    Set,
    Reset,
    CreateTable,
    Insert,
    Update,
    Select,
}

impl fmt::Display for CommandTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self {
            Self::Begin => "BEGIN",
            Self::Commit => "COMMIT",
            Self::Rollback => "ROLLBACK",
            Self::Set => "SET",
            Self::Reset => "RESET",
            Self::CreateTable => "CREATE TABLE",
            Self::Insert => "INSERT",
            Self::Update => "UPDATE",
            Self::Select => "SELECT",
        };
        f.write_str(tag)
    }
}

/// Result of executing one statement.
#[derive(Debug, Clone)]
pub struct Execution {
    pub tag: CommandTag,
    pub rows_affected: u64,
    pub rows: Vec<Row>,
}

impl Execution {
    pub(crate) fn tag(tag: CommandTag) -> Self {
        Self {
            tag,
            rows_affected: 0,
            rows: Vec::new(),
        }
    }

    pub(crate) fn affected(tag: CommandTag, rows_affected: u64) -> Self {
        Self {
            tag,
            rows_affected,
            rows: Vec::new(),
        }
    }

    pub(crate) fn rows(rows: Vec<Row>) -> Self {
        Self {
            tag: CommandTag::Select,
            rows_affected: rows.len() as u64,
            rows,
        }
    }

    /// Returns the first column of the first row, if any.
    pub fn scalar(&self) -> Option<&Value> {
        self.rows.first().and_then(|row| row.values.first())
    }
}
