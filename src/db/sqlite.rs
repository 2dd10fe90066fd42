use std::path::Path;
use std::time::Duration;

use log::info;
use rusqlite::config::DbConfig;
use rusqlite::{params_from_iter, Connection};

use super::backend::{Backend, BackendError, Row};
use super::rebuild;
use crate::ddl::{AlterBatch, ColumnInfo};
use crate::error::MigrateError;
use crate::value::Value;

/// [`Backend`] over a single persistent SQLite connection.
pub struct SqliteBackend {
    conn: Connection,
}

impl SqliteBackend {
    pub fn open(path: &Path, busy_timeout: Duration) -> Result<Self, MigrateError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(busy_timeout)?;
        info!("Database opened at: {}", path.display());
        Self::from_connection(conn)
    }

    pub fn open_in_memory() -> Result<Self, MigrateError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    /// Wraps an open connection. Double-quoted string literals are turned
    /// off so an unknown `"identifier"` is an error instead of a string.
    pub fn from_connection(conn: Connection) -> Result<Self, MigrateError> {
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DDL, false)?;
        conn.set_db_config(DbConfig::SQLITE_DBCONFIG_DQS_DML, false)?;
        Ok(Self { conn })
    }

    pub fn connection(&self) -> &Connection {
        &self.conn
    }
}

impl Backend for SqliteBackend {
    fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>, BackendError> {
        let mut stmt = self.conn.prepare(sql)?;
        let columns: Vec<String> = stmt
            .column_names()
            .into_iter()
            .map(String::from)
            .collect();
        let width = columns.len();

        let mut rows = stmt.query(params_from_iter(params.iter()))?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let mut values = Vec::with_capacity(width);
            for idx in 0..width {
                values.push(Value::from(row.get_ref(idx)?));
            }
            out.push(Row::new(columns.clone(), values));
        }
        Ok(out)
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<u64, BackendError> {
        let changed = self.conn.execute(sql, params_from_iter(params.iter()))?;
        Ok(changed as u64)
    }

    fn alter_table(&mut self, batch: &AlterBatch) -> Result<(), BackendError> {
        rebuild::apply_batch(&self.conn, batch)
    }

    fn begin(&mut self) -> Result<(), BackendError> {
        self.conn.execute_batch("BEGIN IMMEDIATE")?;
        Ok(())
    }

    fn commit(&mut self) -> Result<(), BackendError> {
        self.conn.execute_batch("COMMIT")?;
        Ok(())
    }

    fn rollback(&mut self) -> Result<(), BackendError> {
        if !self.conn.is_autocommit() {
            self.conn.execute_batch("ROLLBACK")?;
        }
        Ok(())
    }

    fn table_exists(&self, table: &str) -> Result<bool, BackendError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'table' AND name = ?1)",
            [table],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn columns(&self, table: &str) -> Result<Vec<ColumnInfo>, BackendError> {
        let mut stmt = self.conn.prepare(
            "SELECT name, type, \"notnull\", dflt_value, pk
             FROM pragma_table_info(?1)
             ORDER BY cid",
        )?;
        let columns = stmt
            .query_map([table], |row| {
                Ok(ColumnInfo {
                    name: row.get(0)?,
                    decl_type: row.get(1)?,
                    not_null: row.get::<_, i64>(2)? != 0,
                    default_sql: row.get(3)?,
                    pk: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(columns)
    }

    fn indexes(&self, table: &str) -> Result<Vec<String>, BackendError> {
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_index_list(?1) ORDER BY name")?;
        let names = stmt
            .query_map([table], |row| row.get(0))?
            .collect::<Result<Vec<String>, _>>()?;
        Ok(names)
    }

    fn column_exists(&self, table: &str, column: &str) -> Result<bool, BackendError> {
        let exists = self.conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info(?1) WHERE name = ?2",
            [table, column],
            |row| row.get(0),
        )?;
        Ok(exists)
    }

    fn index_exists(&self, table: &str, index: &str) -> Result<bool, BackendError> {
        let exists = self.conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND name = ?2)",
            [table, index],
            |row| row.get(0),
        )?;
        Ok(exists)
    }
}
