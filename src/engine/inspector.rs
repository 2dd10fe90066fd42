use std::collections::{HashMap, HashSet};

use crate::db::{Backend, BackendError};
use crate::ddl::ColumnInfo;

/// Lazily populated cache of which tables, columns and indexes exist.
///
/// Every answer is read from the backend the first time it is asked for and
/// served from memory afterwards, until [`invalidate`](Self::invalidate) is
/// called for the table. The executor invalidates after each successful
/// mutation, so the cache is never stale relative to the engine's own
/// changes. Concurrent outside changes are not tracked.
#[derive(Debug, Default)]
pub struct SchemaSnapshot {
    tables: HashMap<String, bool>,
    columns: HashMap<String, Vec<ColumnInfo>>,
    indexes: HashMap<String, HashSet<String>>,
    catalog_reads: usize,
}

impl SchemaSnapshot {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn table_exists(&mut self, backend: &dyn Backend, table: &str) -> Result<bool, BackendError> {
        if let Some(exists) = self.tables.get(table) {
            return Ok(*exists);
        }
        self.catalog_reads += 1;
        let exists = backend.table_exists(table)?;
        self.tables.insert(table.to_owned(), exists);
        Ok(exists)
    }

    /// Returns the column when both the table and the column exist. A missing
    /// table answers `None` rather than failing.
    pub fn column(
        &mut self,
        backend: &dyn Backend,
        table: &str,
        column: &str,
    ) -> Result<Option<ColumnInfo>, BackendError> {
        if !self.table_exists(backend, table)? {
            return Ok(None);
        }
        if !self.columns.contains_key(table) {
            self.catalog_reads += 1;
            let columns = backend.columns(table)?;
            self.columns.insert(table.to_owned(), columns);
        }
        Ok(self
            .columns
            .get(table)
            .and_then(|cols| cols.iter().find(|c| c.name == column))
            .cloned())
    }

    pub fn column_exists(
        &mut self,
        backend: &dyn Backend,
        table: &str,
        column: &str,
    ) -> Result<bool, BackendError> {
        Ok(self.column(backend, table, column)?.is_some())
    }

    pub fn index_exists(
        &mut self,
        backend: &dyn Backend,
        table: &str,
        index: &str,
    ) -> Result<bool, BackendError> {
        if !self.table_exists(backend, table)? {
            return Ok(false);
        }
        if !self.indexes.contains_key(table) {
            self.catalog_reads += 1;
            let names = backend.indexes(table)?.into_iter().collect();
            self.indexes.insert(table.to_owned(), names);
        }
        Ok(self
            .indexes
            .get(table)
            .map(|names| names.contains(index))
            .unwrap_or(false))
    }

    pub fn invalidate(&mut self, table: &str) {
        self.tables.remove(table);
        self.columns.remove(table);
        self.indexes.remove(table);
    }

    pub fn invalidate_all(&mut self) {
        self.tables.clear();
        self.columns.clear();
        self.indexes.clear();
    }

    /// Number of times the backend catalog has been consulted.
    pub fn catalog_reads(&self) -> usize {
        self.catalog_reads
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::SqliteBackend;

    fn backend() -> SqliteBackend {
        let backend = SqliteBackend::open_in_memory().unwrap();
        backend
            .connection()
            .execute_batch(
                "CREATE TABLE items (id INTEGER PRIMARY KEY, active INT);
                 CREATE INDEX active ON items (active);",
            )
            .unwrap();
        backend
    }

    #[test]
    fn test_repeated_reads_are_cached_and_identical() {
        let backend = backend();
        let mut snapshot = SchemaSnapshot::new();

        assert!(snapshot.column_exists(&backend, "items", "active").unwrap());
        let reads = snapshot.catalog_reads();
        for _ in 0..3 {
            assert!(snapshot.table_exists(&backend, "items").unwrap());
            assert!(snapshot.column_exists(&backend, "items", "active").unwrap());
            assert!(!snapshot.column_exists(&backend, "items", "is_active").unwrap());
        }
        assert_eq!(snapshot.catalog_reads(), reads);
    }

    #[test]
    fn test_missing_table_answers_false() {
        let backend = backend();
        let mut snapshot = SchemaSnapshot::new();
        assert!(!snapshot.table_exists(&backend, "widgets").unwrap());
        assert!(!snapshot.column_exists(&backend, "widgets", "id").unwrap());
        assert!(!snapshot.index_exists(&backend, "widgets", "active").unwrap());
    }

    #[test]
    fn test_invalidate_rereads_table() {
        let backend = backend();
        let mut snapshot = SchemaSnapshot::new();
        assert!(!snapshot.column_exists(&backend, "items", "name").unwrap());

        backend
            .connection()
            .execute_batch("ALTER TABLE items ADD COLUMN name TEXT")
            .unwrap();
        // still served from cache
        assert!(!snapshot.column_exists(&backend, "items", "name").unwrap());

        snapshot.invalidate("items");
        assert!(snapshot.column_exists(&backend, "items", "name").unwrap());
        assert!(snapshot.index_exists(&backend, "items", "active").unwrap());
    }
}
