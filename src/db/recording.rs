//! Test backend that records every mutating call made through it and can
//! inject failures.

use super::backend::{Backend, BackendError, Row};
use super::sqlite::SqliteBackend;
use crate::ddl::{AlterBatch, ColumnInfo};
use crate::value::Value;

pub struct RecordingBackend {
    pub inner: SqliteBackend,
    /// Text of every `execute` call and every flushed batch, in order.
    pub mutations: Vec<String>,
    pub batches: Vec<AlterBatch>,
    /// Statements containing this text fail with the paired error.
    pub fail_on: Option<(String, BackendError)>,
    /// Number of times the matching statement still fails before succeeding.
    pub fail_times: u32,
}

impl RecordingBackend {
    pub fn new(setup_sql: &str) -> Self {
        let inner = SqliteBackend::open_in_memory().unwrap();
        inner.connection().execute_batch(setup_sql).unwrap();
        Self {
            inner,
            mutations: Vec::new(),
            batches: Vec::new(),
            fail_on: None,
            fail_times: u32::MAX,
        }
    }

    pub fn fail_on(mut self, needle: &str, err: BackendError, times: u32) -> Self {
        self.fail_on = Some((needle.to_owned(), err));
        self.fail_times = times;
        self
    }

    pub fn clear(&mut self) {
        self.mutations.clear();
        self.batches.clear();
    }

    pub fn scalar(&self, sql: &str) -> Value {
        self.inner.query(sql, &[]).unwrap()[0].values()[0].clone()
    }

    fn injected(&mut self, text: &str) -> Result<(), BackendError> {
        if let Some((needle, err)) = &self.fail_on {
            if text.contains(needle.as_str()) && self.fail_times > 0 {
                self.fail_times -= 1;
                return Err(err.clone());
            }
        }
        Ok(())
    }
}

impl Backend for RecordingBackend {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError> {
        self.inner.query(sql, params)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError> {
        self.mutations.push(sql.to_owned());
        self.injected(sql)?;
        self.inner.execute(sql, params)
    }

    fn alter_table(&mut self, batch: &AlterBatch) -> Result<(), BackendError> {
        let text = batch.to_string();
        self.mutations.push(text.clone());
        self.batches.push(batch.clone());
        self.injected(&text)?;
        self.inner.alter_table(batch)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        self.inner.begin()
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.inner.commit()
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        self.inner.rollback()
    }

    fn table_exists(&self, table: &str) -> Result<bool, BackendError> {
        self.inner.table_exists(table)
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, BackendError> {
        self.inner.columns(table)
    }

    fn indexes(&self, table: &str) -> Result<Vec<String>, BackendError> {
        self.inner.indexes(table)
    }
}
