use std::fmt;

use log::{debug, warn};

use super::inspector::SchemaSnapshot;
use crate::db::{Backend, BackendError, RetryPolicy, Row};
use crate::ddl::{AlterBatch, ColumnInfo};
use crate::error::MigrateError;
use crate::value::Value;

/// How a statement's failure is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatementKind {
    /// Schema change. Failure aborts the step.
    Ddl,
    /// Data change. Failure aborts the step.
    Dml,
    /// Best-effort data fixup. Failure, or touching no row, is logged and
    /// the step continues.
    Advisory,
}

/// True when the statement's leading keyword changes the schema.
pub fn is_ddl(sql: &str) -> bool {
    let keyword = sql
        .trim_start()
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_ascii_uppercase();
    matches!(keyword.as_str(), "CREATE" | "ALTER" | "DROP")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Sql {
        sql: String,
        params: Vec<Value>,
        kind: StatementKind,
        /// Tables whose cached catalog state a successful DDL statement
        /// invalidates. Empty means unknown, which invalidates everything.
        tables: Vec<String>,
    },
    Alter(AlterBatch),
}

impl Statement {
    pub fn ddl(sql: impl Into<String>, tables: &[&str]) -> Self {
        Statement::Sql {
            sql: sql.into(),
            params: Vec::new(),
            kind: StatementKind::Ddl,
            tables: tables.iter().map(|t| t.to_string()).collect(),
        }
    }

    pub fn dml(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement::Sql {
            sql: sql.into(),
            params,
            kind: StatementKind::Dml,
            tables: Vec::new(),
        }
    }

    pub fn advisory(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Statement::Sql {
            sql: sql.into(),
            params,
            kind: StatementKind::Advisory,
            tables: Vec::new(),
        }
    }

    /// Schema-changing SQL is always [`StatementKind::Ddl`], whatever kind
    /// it was built with.
    pub fn kind(&self) -> StatementKind {
        match self {
            Statement::Sql { sql, .. } if is_ddl(sql) => StatementKind::Ddl,
            Statement::Sql { kind, .. } => *kind,
            Statement::Alter(_) => StatementKind::Ddl,
        }
    }
}

impl fmt::Display for Statement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Statement::Sql { sql, params, .. } if params.is_empty() => write!(f, "{sql}"),
            Statement::Sql { sql, params, .. } => {
                let bound = params
                    .iter()
                    .map(|p| p.to_sql_literal())
                    .collect::<Vec<_>>()
                    .join(", ");
                write!(f, "{sql} -- [{bound}]")
            }
            Statement::Alter(batch) => write!(f, "{batch}"),
        }
    }
}

/// Runs statements against the backend and answers inspector questions
/// through a [`SchemaSnapshot`] that it keeps in step with its own changes.
pub struct Executor<'a> {
    backend: &'a mut dyn Backend,
    snapshot: SchemaSnapshot,
    retry: RetryPolicy,
    executed: Vec<String>,
    advisories: Vec<String>,
}

impl<'a> Executor<'a> {
    pub fn new(backend: &'a mut dyn Backend, retry: RetryPolicy) -> Self {
        Self {
            backend,
            snapshot: SchemaSnapshot::new(),
            retry,
            executed: Vec::new(),
            advisories: Vec::new(),
        }
    }

    pub fn table_exists(&mut self, table: &str) -> Result<bool, MigrateError> {
        Ok(self.snapshot.table_exists(&*self.backend, table)?)
    }

    pub fn column_exists(&mut self, table: &str, column: &str) -> Result<bool, MigrateError> {
        Ok(self.snapshot.column_exists(&*self.backend, table, column)?)
    }

    pub fn column(&mut self, table: &str, column: &str) -> Result<Option<ColumnInfo>, MigrateError> {
        Ok(self.snapshot.column(&*self.backend, table, column)?)
    }

    pub fn index_exists(&mut self, table: &str, index: &str) -> Result<bool, MigrateError> {
        Ok(self.snapshot.index_exists(&*self.backend, table, index)?)
    }

    pub fn query(&mut self, sql: &str, params: &[Value]) -> Result<Vec<Row>, MigrateError> {
        let backend = &*self.backend;
        self.retry
            .run(sql, || backend.query(sql, params))
            .map_err(|e| MigrateError::StatementFailed {
                statement: sql.to_owned(),
                message: e.message,
            })
    }

    /// Runs a single-value query such as `SELECT COUNT(*) ...`.
    pub fn count(&mut self, sql: &str, params: &[Value]) -> Result<i64, MigrateError> {
        let rows = self.query(sql, params)?;
        Ok(rows
            .first()
            .and_then(|r| r.value(0))
            .and_then(Value::as_i64)
            .unwrap_or(0))
    }

    /// Executes a statement. Fatal failures are returned as
    /// [`MigrateError::StatementFailed`] carrying the statement text;
    /// advisory failures are recorded and reported as zero rows affected.
    pub fn execute(&mut self, statement: &Statement) -> Result<u64, MigrateError> {
        let text = statement.to_string();
        debug!("Executing: {}", text);
        self.executed.push(text.clone());

        let retry = self.retry.clone();
        let backend = &mut *self.backend;
        let result: Result<u64, BackendError> = match statement {
            Statement::Sql { sql, params, .. } => retry.run(sql, || backend.execute(sql, params)),
            Statement::Alter(batch) => retry.run(&batch.table, || backend.alter_table(batch).map(|_| 0)),
        };

        match (result, statement.kind()) {
            (Ok(affected), kind) => {
                match statement {
                    Statement::Alter(batch) => self.snapshot.invalidate(&batch.table),
                    Statement::Sql { tables, .. } if kind == StatementKind::Ddl => {
                        if tables.is_empty() {
                            self.snapshot.invalidate_all();
                        } else {
                            for table in tables {
                                self.snapshot.invalidate(table);
                            }
                        }
                    }
                    Statement::Sql { .. } => {}
                }
                if kind == StatementKind::Advisory && affected == 0 {
                    let note = format!("No rows affected by: {text}");
                    warn!("{}", note);
                    self.advisories.push(note);
                }
                Ok(affected)
            }
            (Err(e), StatementKind::Advisory) => {
                let note = format!("Advisory statement failed: {}: {}", text, e.message);
                warn!("{}", note);
                self.advisories.push(note);
                Ok(0)
            }
            (Err(e), _) => {
                // A failed DDL may have partially applied on backends
                // without transactional DDL; re-read the catalog.
                self.snapshot.invalidate_all();
                Err(MigrateError::StatementFailed {
                    statement: text,
                    message: e.message,
                })
            }
        }
    }

    /// Records an advisory condition detected outside a statement.
    pub fn advise(&mut self, note: String) {
        warn!("{}", note);
        self.advisories.push(note);
    }

    pub fn begin(&mut self) -> Result<(), MigrateError> {
        Ok(self.backend.begin()?)
    }

    pub fn commit(&mut self) -> Result<(), MigrateError> {
        Ok(self.backend.commit()?)
    }

    /// Rolls back the open transaction. Catalog state read inside it is
    /// discarded with it.
    pub fn rollback(&mut self) -> Result<(), MigrateError> {
        self.snapshot.invalidate_all();
        Ok(self.backend.rollback()?)
    }

    /// Text of every mutating statement issued so far.
    pub fn executed(&self) -> &[String] {
        &self.executed
    }

    pub fn advisories(&self) -> &[String] {
        &self.advisories
    }

    /// Removes and returns the advisory notes recorded so far.
    pub fn take_advisories(&mut self) -> Vec<String> {
        std::mem::take(&mut self.advisories)
    }
}
