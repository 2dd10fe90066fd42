//! Applies an [`AlterBatch`] to an SQLite table.
//!
//! SQLite's ALTER TABLE takes one clause at a time and cannot change a
//! column's type, so a batch is applied as a single table rebuild:
//!
//! 1. read the current columns, constraints and indexes from the catalog
//! 2. apply every clause to that in-memory description
//! 3. create `<table>__rebuild`, copy the rows across, drop the original and
//!    rename the rebuilt table into place
//! 4. recreate indexes and restore the AUTOINCREMENT sequence
//!
//! All of step 3 and 4 runs in one transaction, so a failed batch leaves the
//! table exactly as it was.

use std::collections::HashSet;

use log::{debug, warn};
use rusqlite::{Connection, OptionalExtension};

use super::backend::BackendError;
use crate::ddl::{normalize_type, quote_ident, quote_list, AlterBatch, AlterClause, IndexDef};

#[derive(Debug, Clone)]
struct Column {
    name: String,
    definition: String,
    /// Name of the column in the original table this one is copied from.
    source: Option<String>,
    pk: i64,
}

#[derive(Debug, Clone)]
struct ForeignKey {
    from: Vec<String>,
    table: String,
    to: Vec<Option<String>>,
    on_update: String,
    on_delete: String,
}

#[derive(Debug, Clone)]
struct Index {
    name: String,
    unique: bool,
    /// Column names; `None` marks an expression term.
    columns: Vec<Option<String>>,
    /// Original CREATE INDEX text, `None` for indexes added by the batch.
    sql: Option<String>,
}

/// In-memory description of a table while clauses are applied to it.
#[derive(Debug)]
struct TableShape {
    columns: Vec<Column>,
    unique_constraints: Vec<Vec<String>>,
    foreign_keys: Vec<ForeignKey>,
    indexes: Vec<Index>,
    autoincrement: bool,
}

impl TableShape {
    fn load(conn: &Connection, table: &str) -> Result<Self, BackendError> {
        let create_sql: Option<String> = conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .optional()?;
        let create_sql = create_sql
            .ok_or_else(|| BackendError::new(format!("no such table: {table}")))?;

        let columns = {
            let mut stmt = conn.prepare(
                "SELECT name, type, \"notnull\", dflt_value, pk
                 FROM pragma_table_info(?1)
                 ORDER BY cid",
            )?;
            let rows = stmt.query_map([table], |row| {
                let name: String = row.get(0)?;
                let decl_type: String = row.get(1)?;
                let not_null: i64 = row.get(2)?;
                let default_sql: Option<String> = row.get(3)?;
                let pk: i64 = row.get(4)?;

                let mut definition = decl_type;
                if not_null != 0 {
                    definition.push_str(" NOT NULL");
                }
                if let Some(default_sql) = default_sql {
                    definition.push_str(" DEFAULT ");
                    definition.push_str(&default_sql);
                }
                Ok(Column {
                    source: Some(name.clone()),
                    name,
                    definition,
                    pk,
                })
            })?;
            rows.collect::<Result<Vec<_>, _>>()?
        };

        let mut unique_constraints = Vec::new();
        let mut indexes = Vec::new();
        {
            let mut stmt = conn.prepare(
                "SELECT il.name, il.\"unique\", il.origin, m.sql
                 FROM pragma_index_list(?1) il
                 LEFT JOIN sqlite_master m ON m.type = 'index' AND m.name = il.name
                 ORDER BY il.seq DESC",
            )?;
            let listed = stmt
                .query_map([table], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)? != 0,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            for (name, unique, origin, sql) in listed {
                let columns = index_columns(conn, &name)?;
                match origin.as_str() {
                    "pk" => {}
                    "u" => unique_constraints.push(
                        columns
                            .into_iter()
                            .map(|c| {
                                c.ok_or_else(|| {
                                    BackendError::new(format!(
                                        "unsupported expression in UNIQUE constraint {name}"
                                    ))
                                })
                            })
                            .collect::<Result<Vec<_>, _>>()?,
                    ),
                    _ => indexes.push(Index {
                        name,
                        unique,
                        columns,
                        sql,
                    }),
                }
            }
        }

        let foreign_keys = {
            let mut stmt = conn.prepare(
                "SELECT id, \"table\", \"from\", \"to\", on_update, on_delete
                 FROM pragma_foreign_key_list(?1)
                 ORDER BY id, seq",
            )?;
            let rows = stmt
                .query_map([table], |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, String>(5)?,
                    ))
                })?
                .collect::<Result<Vec<_>, _>>()?;

            let mut keys: Vec<(i64, ForeignKey)> = Vec::new();
            for (id, parent, from, to, on_update, on_delete) in rows {
                match keys.last_mut() {
                    Some((last_id, fk)) if *last_id == id => {
                        fk.from.push(from);
                        fk.to.push(to);
                    }
                    _ => keys.push((
                        id,
                        ForeignKey {
                            from: vec![from],
                            table: parent,
                            to: vec![to],
                            on_update,
                            on_delete,
                        },
                    )),
                }
            }
            keys.into_iter().map(|(_, fk)| fk).collect()
        };

        Ok(Self {
            columns,
            unique_constraints,
            foreign_keys,
            indexes,
            autoincrement: create_sql.to_ascii_uppercase().contains("AUTOINCREMENT"),
        })
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|c| c.name == name)
    }

    fn apply(&mut self, clause: &AlterClause) -> Result<(), BackendError> {
        match clause {
            AlterClause::Change { old, column } => {
                let idx = self
                    .position(old)
                    .ok_or_else(|| BackendError::new(format!("no such column: {old}")))?;
                if column.name != *old && self.position(&column.name).is_some() {
                    return Err(BackendError::new(format!(
                        "duplicate column name: {}",
                        column.name
                    )));
                }
                let target = &mut self.columns[idx];
                target.name = column.name.clone();
                target.definition = column.definition_sql();
            }
            AlterClause::AddColumn(column) => {
                if self.position(&column.name).is_some() {
                    return Err(BackendError::new(format!(
                        "duplicate column name: {}",
                        column.name
                    )));
                }
                self.columns.push(Column {
                    name: column.name.clone(),
                    definition: column.definition_sql(),
                    source: None,
                    pk: 0,
                });
            }
            AlterClause::DropColumn(name) => {
                let idx = self
                    .position(name)
                    .ok_or_else(|| BackendError::new(format!("no such column: {name}")))?;
                if self.columns[idx].pk > 0 {
                    return Err(BackendError::new(format!(
                        "cannot drop PRIMARY KEY column: {name}"
                    )));
                }
                self.columns.remove(idx);
            }
            AlterClause::AddIndex(index) => {
                if self.indexes.iter().any(|i| i.name == index.name) {
                    return Err(BackendError::new(format!(
                        "index {} already exists",
                        index.name
                    )));
                }
                self.indexes.push(Index {
                    name: index.name.clone(),
                    unique: index.unique,
                    columns: index.columns.iter().cloned().map(Some).collect(),
                    sql: None,
                });
            }
            AlterClause::DropIndex(name) => {
                let idx = self
                    .indexes
                    .iter()
                    .position(|i| i.name == *name)
                    .ok_or_else(|| BackendError::new(format!("no such index: {name}")))?;
                self.indexes.remove(idx);
            }
        }
        Ok(())
    }

    /// Final name of a column of the original table, `None` once dropped.
    fn renamed(&self, original: &str) -> Option<&str> {
        self.columns
            .iter()
            .find(|c| c.source.as_deref() == Some(original))
            .map(|c| c.name.as_str())
    }

    fn create_sql(&self, table: &str) -> Result<String, BackendError> {
        let pk_columns: Vec<&Column> = {
            let mut pk: Vec<&Column> = self.columns.iter().filter(|c| c.pk > 0).collect();
            pk.sort_by_key(|c| c.pk);
            pk
        };
        let inline_pk = pk_columns.len() == 1;

        let mut parts = Vec::new();
        for column in &self.columns {
            let mut part = format!("{} {}", quote_ident(&column.name), column.definition);
            if inline_pk && column.pk > 0 {
                part.push_str(" PRIMARY KEY");
                let decl = column.definition.split_whitespace().next().unwrap_or("");
                if self.autoincrement && normalize_type(decl) == "INTEGER" {
                    part.push_str(" AUTOINCREMENT");
                }
            }
            parts.push(part);
        }
        if pk_columns.len() > 1 {
            let names: Vec<String> = pk_columns.iter().map(|c| c.name.clone()).collect();
            parts.push(format!("PRIMARY KEY ({})", quote_list(&names)));
        }

        for unique in &self.unique_constraints {
            let mapped: Vec<String> = unique
                .iter()
                .filter_map(|c| self.renamed(c).map(str::to_owned))
                .collect();
            if mapped.len() < unique.len() {
                warn!(
                    "Dropping UNIQUE ({}) on {}: a constrained column was removed",
                    unique.join(", "),
                    table
                );
                if mapped.is_empty() {
                    continue;
                }
            }
            parts.push(format!("UNIQUE ({})", quote_list(&mapped)));
        }

        for fk in &self.foreign_keys {
            let mut from = Vec::with_capacity(fk.from.len());
            for original in &fk.from {
                let name = self.renamed(original).ok_or_else(|| {
                    BackendError::new(format!(
                        "cannot drop column {original}: it is referenced by a FOREIGN KEY"
                    ))
                })?;
                from.push(name.to_owned());
            }
            let mut part = format!(
                "FOREIGN KEY ({}) REFERENCES {}",
                quote_list(&from),
                quote_ident(&fk.table)
            );
            let to: Option<Vec<String>> = fk.to.iter().cloned().collect();
            if let Some(to) = to {
                part.push_str(&format!(" ({})", quote_list(&to)));
            }
            if fk.on_update != "NO ACTION" {
                part.push_str(&format!(" ON UPDATE {}", fk.on_update));
            }
            if fk.on_delete != "NO ACTION" {
                part.push_str(&format!(" ON DELETE {}", fk.on_delete));
            }
            parts.push(part);
        }

        Ok(format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(table),
            parts.join(",\n    ")
        ))
    }

    /// CREATE INDEX statements for the rebuilt table. Indexes untouched by
    /// the batch keep their original text.
    fn index_sql(&self, table: &str) -> Result<Vec<String>, BackendError> {
        let mut statements = Vec::new();
        for index in &self.indexes {
            let untouched = index.columns.iter().all(|c| match c {
                Some(c) => self.renamed(c) == Some(c.as_str()),
                None => true,
            });
            if let (true, Some(sql)) = (untouched, &index.sql) {
                statements.push(sql.clone());
                continue;
            }

            if index.sql.is_some() {
                if index.columns.iter().any(Option::is_none) {
                    return Err(BackendError::new(format!(
                        "cannot rewrite expression index {}",
                        index.name
                    )));
                }
                if index
                    .sql
                    .as_deref()
                    .map(|s| s.to_ascii_uppercase().contains(" WHERE "))
                    .unwrap_or(false)
                {
                    return Err(BackendError::new(format!(
                        "cannot rewrite partial index {}",
                        index.name
                    )));
                }
            }

            // Columns of an index added by this batch already carry their
            // final names; columns of an existing index are original names.
            let columns: Vec<String> = if index.sql.is_none() {
                index.columns.iter().flatten().cloned().collect()
            } else {
                index
                    .columns
                    .iter()
                    .flatten()
                    .filter_map(|c| self.renamed(c).map(str::to_owned))
                    .collect()
            };
            if columns.is_empty() {
                warn!(
                    "Dropping index {} on {}: all of its columns were removed",
                    index.name, table
                );
                continue;
            }
            statements.push(
                IndexDef {
                    name: index.name.clone(),
                    columns,
                    unique: index.unique,
                }
                .create_sql(table),
            );
        }
        Ok(statements)
    }
}

fn index_columns(conn: &Connection, index: &str) -> Result<Vec<Option<String>>, BackendError> {
    let mut stmt = conn.prepare("SELECT name FROM pragma_index_info(?1) ORDER BY seqno")?;
    let columns = stmt
        .query_map([index], |row| row.get(0))?
        .collect::<Result<Vec<Option<String>>, _>>()?;
    Ok(columns)
}

pub(super) fn apply_batch(conn: &Connection, batch: &AlterBatch) -> Result<(), BackendError> {
    let table = batch.table.as_str();
    let mut shape = TableShape::load(conn, table)?;
    for clause in &batch.clauses {
        shape.apply(clause)?;
    }

    let new_names: HashSet<&str> = shape.columns.iter().map(|c| c.name.as_str()).collect();
    for index in shape.indexes.iter().filter(|i| i.sql.is_none()) {
        if let Some(missing) = index
            .columns
            .iter()
            .flatten()
            .find(|c| !new_names.contains(c.as_str()))
        {
            return Err(BackendError::new(format!(
                "index {} refers to unknown column {}",
                index.name, missing
            )));
        }
    }

    let rebuild_name = format!("{table}__rebuild");
    let create = shape
        .create_sql(&rebuild_name)?;
    let indexes = shape.index_sql(table)?;

    let copied: Vec<&Column> = shape.columns.iter().filter(|c| c.source.is_some()).collect();
    let copy = if copied.is_empty() {
        None
    } else {
        let targets: Vec<String> = copied.iter().map(|c| c.name.clone()).collect();
        let sources: Vec<String> = copied
            .iter()
            .filter_map(|c| c.source.clone())
            .collect();
        Some(format!(
            "INSERT INTO {} ({}) SELECT {} FROM {}",
            quote_ident(&rebuild_name),
            quote_list(&targets),
            quote_list(&sources),
            quote_ident(table)
        ))
    };

    let sequence: Option<i64> = if shape.autoincrement {
        conn.query_row(
            "SELECT seq FROM sqlite_sequence WHERE name = ?1",
            [table],
            |row| row.get(0),
        )
        .optional()?
    } else {
        None
    };

    debug!("Rebuilding {} for: {}", table, batch);

    let fk_enabled: bool = conn.query_row("PRAGMA foreign_keys", [], |row| row.get(0))?;
    let legacy_alter: bool = conn.query_row("PRAGMA legacy_alter_table", [], |row| row.get(0))?;
    if fk_enabled {
        conn.execute_batch("PRAGMA foreign_keys = OFF")?;
    }
    if !legacy_alter {
        conn.execute_batch("PRAGMA legacy_alter_table = ON")?;
    }

    let result = (|| -> Result<(), BackendError> {
        let tx = conn.unchecked_transaction()?;
        tx.execute_batch(&format!("DROP TABLE IF EXISTS {}", quote_ident(&rebuild_name)))?;
        tx.execute_batch(&create)?;
        if let Some(copy) = &copy {
            tx.execute(copy, [])?;
        }
        tx.execute_batch(&format!("DROP TABLE {}", quote_ident(table)))?;
        tx.execute_batch(&format!(
            "ALTER TABLE {} RENAME TO {}",
            quote_ident(&rebuild_name),
            quote_ident(table)
        ))?;
        for sql in &indexes {
            tx.execute_batch(sql)?;
        }
        if let Some(seq) = sequence {
            tx.execute(
                "UPDATE sqlite_sequence SET seq = ?2 WHERE name = ?1 AND seq < ?2",
                rusqlite::params![table, seq],
            )?;
            tx.execute(
                "INSERT INTO sqlite_sequence (name, seq)
                 SELECT ?1, ?2 WHERE NOT EXISTS (SELECT 1 FROM sqlite_sequence WHERE name = ?1)",
                rusqlite::params![table, seq],
            )?;
        }
        if fk_enabled {
            let violations: i64 = {
                let mut stmt = tx.prepare(&format!("PRAGMA foreign_key_check({})", quote_ident(table)))?;
                let mut rows = stmt.query([])?;
                let mut count = 0;
                while rows.next()?.is_some() {
                    count += 1;
                }
                count
            };
            if violations > 0 {
                return Err(BackendError::new(format!(
                    "rebuilding {table} would leave {violations} foreign key violation(s)"
                )));
            }
        }
        tx.commit()?;
        Ok(())
    })();

    if !legacy_alter {
        conn.execute_batch("PRAGMA legacy_alter_table = OFF")?;
    }
    if fk_enabled {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ddl::ColumnDef;
    use pretty_assertions::assert_eq;

    fn conn() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE entities (id INTEGER PRIMARY KEY AUTOINCREMENT, name TEXT);
             CREATE TABLE items (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 entities_id INT NOT NULL DEFAULT 0,
                 nom VARCHAR(200),
                 active INT,
                 legacy TEXT,
                 UNIQUE (entities_id, nom),
                 FOREIGN KEY (entities_id) REFERENCES entities (id)
             );
             CREATE INDEX nom ON items (nom);
             CREATE INDEX legacy ON items (legacy);
             INSERT INTO entities (id, name) VALUES (0, 'root');
             INSERT INTO items (id, entities_id, nom, active, legacy) VALUES
                 (1, 0, 'a', 1, 'x'),
                 (2, 0, 'b', 0, 'y'),
                 (9, 0, 'c', 1, NULL);
             DELETE FROM items WHERE id = 9;",
        )
        .unwrap();
        conn
    }

    fn column_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM pragma_table_info(?1) ORDER BY cid")
            .unwrap();
        stmt.query_map([table], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    fn index_names(conn: &Connection, table: &str) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'index' AND tbl_name = ?1 AND sql IS NOT NULL ORDER BY name")
            .unwrap();
        stmt.query_map([table], |row| row.get(0))
            .unwrap()
            .collect::<Result<Vec<String>, _>>()
            .unwrap()
    }

    #[test]
    fn test_batch_renames_retypes_and_drops_in_one_rebuild() {
        let conn = conn();
        let batch = AlterBatch {
            table: "items".to_string(),
            clauses: vec![
                AlterClause::Change {
                    old: "nom".to_string(),
                    column: ColumnDef::new("name", "VARCHAR(255)"),
                },
                AlterClause::Change {
                    old: "active".to_string(),
                    column: ColumnDef::new("is_active", "TINYINT(1)").not_null().with_default(0),
                },
                AlterClause::DropColumn("legacy".to_string()),
                AlterClause::AddColumn(ColumnDef::new("comment", "TEXT")),
                AlterClause::AddIndex(IndexDef::new("is_active", &["is_active"])),
            ],
        };
        apply_batch(&conn, &batch).unwrap();

        assert_eq!(
            column_names(&conn, "items"),
            vec!["id", "entities_id", "name", "is_active", "comment"]
        );
        assert_eq!(index_names(&conn, "items"), vec!["is_active", "nom"]);

        let rows: Vec<(i64, String, i64)> = conn
            .prepare("SELECT id, name, is_active FROM items ORDER BY id")
            .unwrap()
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?)))
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(rows, vec![(1, "a".to_string(), 1), (2, "b".to_string(), 0)]);

        let decl: String = conn
            .query_row(
                "SELECT type FROM pragma_table_info('items') WHERE name = 'is_active'",
                [],
                |r| r.get(0),
            )
            .unwrap();
        assert_eq!(decl, "TINYINT(1)");
    }

    #[test]
    fn test_constraints_follow_renamed_columns() {
        let conn = conn();
        let batch = AlterBatch {
            table: "items".to_string(),
            clauses: vec![AlterClause::Change {
                old: "nom".to_string(),
                column: ColumnDef::new("name", "VARCHAR(255)"),
            }],
        };
        apply_batch(&conn, &batch).unwrap();

        // UNIQUE (entities_id, name) survived the rename
        let dup = conn.execute(
            "INSERT INTO items (entities_id, name) VALUES (0, 'a')",
            [],
        );
        assert!(dup.is_err());

        let fk_parent: String = conn
            .query_row("SELECT \"table\" FROM pragma_foreign_key_list('items')", [], |r| r.get(0))
            .unwrap();
        assert_eq!(fk_parent, "entities");
    }

    #[test]
    fn test_autoincrement_sequence_is_preserved() {
        let conn = conn();
        let batch = AlterBatch {
            table: "items".to_string(),
            clauses: vec![AlterClause::DropColumn("legacy".to_string())],
        };
        apply_batch(&conn, &batch).unwrap();

        conn.execute("INSERT INTO items (nom) VALUES ('d')", []).unwrap();
        let id: i64 = conn
            .query_row("SELECT id FROM items WHERE nom = 'd'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(id, 10);
    }

    #[test]
    fn test_failed_batch_leaves_table_untouched() {
        let conn = conn();
        let batch = AlterBatch {
            table: "items".to_string(),
            clauses: vec![
                AlterClause::DropColumn("legacy".to_string()),
                AlterClause::Change {
                    old: "missing".to_string(),
                    column: ColumnDef::new("other", "TEXT"),
                },
            ],
        };
        let err = apply_batch(&conn, &batch).unwrap_err();
        assert!(err.message.contains("no such column: missing"));
        assert_eq!(
            column_names(&conn, "items"),
            vec!["id", "entities_id", "nom", "active", "legacy"]
        );
    }

    #[test]
    fn test_not_null_without_default_on_populated_table_rolls_back() {
        let conn = conn();
        let batch = AlterBatch {
            table: "items".to_string(),
            clauses: vec![AlterClause::Change {
                old: "legacy".to_string(),
                column: ColumnDef::new("legacy", "TEXT").not_null(),
            }],
        };
        conn.execute("UPDATE items SET legacy = NULL WHERE id = 1", []).unwrap();
        assert!(apply_batch(&conn, &batch).is_err());
        assert_eq!(
            column_names(&conn, "items"),
            vec!["id", "entities_id", "nom", "active", "legacy"]
        );
        assert!(!conn
            .query_row(
                "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE name = 'items__rebuild')",
                [],
                |r| r.get::<_, bool>(0)
            )
            .unwrap());
    }

    #[test]
    fn test_drop_index_and_duplicate_add_are_rejected_or_applied() {
        let conn = conn();
        let dup = AlterBatch {
            table: "items".to_string(),
            clauses: vec![AlterClause::AddIndex(IndexDef::new("nom", &["nom"]))],
        };
        assert!(apply_batch(&conn, &dup).is_err());

        let drop = AlterBatch {
            table: "items".to_string(),
            clauses: vec![AlterClause::DropIndex("legacy".to_string())],
        };
        apply_batch(&conn, &drop).unwrap();
        assert_eq!(index_names(&conn, "items"), vec!["nom"]);
    }
}
