use rusqlite::ErrorCode;
use thiserror::Error;

use crate::ddl::{AlterBatch, ColumnInfo};
use crate::value::Value;

/// Error surfaced by a backend. `transient` errors (lock waits, busy
/// databases) may succeed when retried; everything else will not.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{message}")]
pub struct BackendError {
    pub message: String,
    pub transient: bool,
}

impl BackendError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: false,
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            transient: true,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }
}

impl From<rusqlite::Error> for BackendError {
    fn from(err: rusqlite::Error) -> Self {
        let transient = matches!(
            err.sqlite_error_code(),
            Some(ErrorCode::DatabaseBusy) | Some(ErrorCode::DatabaseLocked)
        );
        Self {
            message: err.to_string(),
            transient,
        }
    }
}

/// One result row with its column names.
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    columns: Vec<String>,
    values: Vec<Value>,
}

impl Row {
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        Self { columns, values }
    }

    pub fn get(&self, column: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c == column)
            .and_then(|idx| self.values.get(idx))
    }

    pub fn value(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    pub fn values(&self) -> &[Value] {
        &self.values
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }
}

/// The minimal SQL surface the migration engine consumes.
///
/// Reads take `&self`, anything that may change the database takes
/// `&mut self`. Implementations must be usable strictly sequentially; the
/// engine never issues statements concurrently.
pub trait Backend {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError>;

    /// Executes a DML or DDL statement and returns the number of rows affected.
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError>;

    /// Applies every clause of `batch` to its table in a single pass.
    fn alter_table(&mut self, batch: &AlterBatch) -> Result<(), BackendError>;

    fn begin(&mut self) -> Result<(), BackendError>;
    fn commit(&mut self) -> Result<(), BackendError>;
    fn rollback(&mut self) -> Result<(), BackendError>;

    fn table_exists(&self, table: &str) -> Result<bool, BackendError>;

    /// Columns of `table` in declaration order; empty when the table is absent.
    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, BackendError>;

    /// Names of the indexes defined on `table`; empty when the table is absent.
    fn indexes(&self, table: &str) -> Result<Vec<String>, BackendError>;

    fn column_exists(&self, table: &str, column: &str) -> Result<bool, BackendError> {
        Ok(self.columns(table)?.iter().any(|c| c.name == column))
    }

    fn index_exists(&self, table: &str, index: &str) -> Result<bool, BackendError> {
        Ok(self.indexes(table)?.iter().any(|i| i == index))
    }
}
