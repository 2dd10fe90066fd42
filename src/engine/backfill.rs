//! Data backfill: rewrites existing row values so they are valid under an
//! upcoming schema change.
//!
//! Simple conversions run as one bulk UPDATE. Conversions whose new value
//! depends on per-row logic read the affected rows and write them back one
//! at a time inside a single transaction; a failure on any row rolls back
//! the whole task.

use std::collections::HashMap;
use std::fmt;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use super::executor::{Executor, Statement};
use super::guard::Guard;
use crate::db::Row;
use crate::ddl::quote_ident;
use crate::error::MigrateError;
use crate::value::Value;

/// Trusted SQL condition from the step definition. Parameters are bound as
/// `?1..?n` in order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Predicate {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapEntry {
    pub from: Value,
    pub to: Value,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rewrite {
    /// Any nonzero value becomes 1. NULL becomes `null_to`, or stays NULL
    /// when `null_to` is absent.
    Boolean {
        #[serde(default)]
        null_to: Option<i64>,
    },
    NullTo { value: Value },
    /// Caps integers to `[min, max]`.
    Clamp {
        #[serde(default)]
        min: Option<i64>,
        #[serde(default)]
        max: Option<i64>,
    },
    /// Sets the column to a trusted SQL expression.
    Expression { sql: String },
    /// Translates enumerated values, e.g. integer type codes to class names.
    /// Values without an entry take `fallback`, or are left alone.
    Map {
        entries: Vec<MapEntry>,
        #[serde(default)]
        fallback: Option<Value>,
    },
    /// Runs a rewriter registered with the [`RewriteRegistry`] on each row.
    Custom {
        name: String,
        #[serde(default)]
        inputs: Vec<String>,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    Bulk,
    RowByRow,
}

impl Rewrite {
    pub fn strategy(&self) -> Strategy {
        match self {
            Rewrite::Map { .. } | Rewrite::Custom { .. } => Strategy::RowByRow,
            _ => Strategy::Bulk,
        }
    }
}

impl fmt::Display for Rewrite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rewrite::Boolean { .. } => write!(f, "boolean normalization"),
            Rewrite::NullTo { value } => write!(f, "NULL to {value}"),
            Rewrite::Clamp { min, max } => write!(f, "clamp to [{min:?}, {max:?}]"),
            Rewrite::Expression { sql } => write!(f, "expression {sql}"),
            Rewrite::Map { entries, .. } => write!(f, "map of {} value(s)", entries.len()),
            Rewrite::Custom { name, .. } => write!(f, "rewriter '{name}'"),
        }
    }
}

fn default_key() -> String {
    "id".to_owned()
}

fn default_page_size() -> usize {
    500
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackfillTask {
    pub table: String,
    pub column: String,
    /// Column that identifies a row for row-by-row rewrites.
    #[serde(default = "default_key")]
    pub key: String,
    #[serde(default)]
    pub predicate: Option<Predicate>,
    pub rewrite: Rewrite,
    #[serde(default)]
    pub guards: Vec<Guard>,
    /// Rows read per query by row-by-row rewrites.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
}

impl BackfillTask {
    pub fn new(table: &str, column: &str, rewrite: Rewrite) -> Self {
        Self {
            table: table.to_owned(),
            column: column.to_owned(),
            key: default_key(),
            predicate: None,
            rewrite,
            guards: Vec::new(),
            page_size: default_page_size(),
        }
    }
}

impl fmt::Display for BackfillTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "backfill `{}`.`{}` ({})", self.table, self.column, self.rewrite)
    }
}

/// Computes a row's new value. `Ok(None)` leaves the row unchanged.
pub type RowRewriter = Box<dyn Fn(&Row) -> Result<Option<Value>, String>>;

/// Named per-row rewrite functions supplied by the host application.
#[derive(Default)]
pub struct RewriteRegistry {
    rewriters: HashMap<String, RowRewriter>,
}

impl RewriteRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, name: &str, rewriter: F)
    where
        F: Fn(&Row) -> Result<Option<Value>, String> + 'static,
    {
        self.rewriters.insert(name.to_owned(), Box::new(rewriter));
    }

    pub fn get(&self, name: &str) -> Option<&RowRewriter> {
        self.rewriters.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.rewriters.contains_key(name)
    }
}

/// Positional parameter list that hands out `?n` placeholders.
pub(super) struct Params {
    pub(super) values: Vec<Value>,
}

impl Params {
    pub(super) fn new(initial: Vec<Value>) -> Self {
        Self { values: initial }
    }

    pub(super) fn bind(&mut self, value: Value) -> String {
        self.values.push(value);
        format!("?{}", self.values.len())
    }
}

/// Runs `task` and returns the number of rows rewritten.
pub fn run_backfill(
    exec: &mut Executor<'_>,
    task: &BackfillTask,
    registry: &RewriteRegistry,
) -> Result<u64, MigrateError> {
    if !exec.column_exists(&task.table, &task.column)? {
        return Err(MigrateError::precondition(
            &task.table,
            format!("cannot backfill missing column `{}`", task.column),
        ));
    }
    let rewritten = match task.rewrite.strategy() {
        Strategy::Bulk => run_bulk(exec, task)?,
        Strategy::RowByRow => run_rows(exec, task, registry)?,
    };
    info!("{}: {} row(s) rewritten", task, rewritten);
    Ok(rewritten)
}

fn run_bulk(exec: &mut Executor<'_>, task: &BackfillTask) -> Result<u64, MigrateError> {
    let col = quote_ident(&task.column);
    let mut params = Params::new(
        task.predicate
            .as_ref()
            .map(|p| p.params.clone())
            .unwrap_or_default(),
    );

    // Parameters used only by SET are bound after the COUNT, which must not
    // see more parameters than its WHERE clause references.
    let mut set_only = None;
    let (set_expr, condition) = match &task.rewrite {
        Rewrite::Boolean { null_to: Some(null_to) } => {
            let p = format!("?{}", params.values.len() + 1);
            set_only = Some(Value::Integer(*null_to));
            (
                format!("CASE WHEN {col} IS NULL THEN {p} WHEN {col} <> 0 THEN 1 ELSE 0 END"),
                format!("{col} IS NULL OR {col} NOT IN (0, 1)"),
            )
        }
        Rewrite::Boolean { null_to: None } => (
            format!("CASE WHEN {col} <> 0 THEN 1 ELSE 0 END"),
            format!("{col} IS NOT NULL AND {col} NOT IN (0, 1)"),
        ),
        Rewrite::NullTo { value } => {
            let p = format!("?{}", params.values.len() + 1);
            set_only = Some(value.clone());
            (p, format!("{col} IS NULL"))
        }
        Rewrite::Clamp { min, max } => {
            let mut cases = Vec::new();
            let mut conditions = Vec::new();
            if let Some(min) = min {
                let p = params.bind(Value::Integer(*min));
                cases.push(format!("WHEN {col} < {p} THEN {p}"));
                conditions.push(format!("{col} < {p}"));
            }
            if let Some(max) = max {
                let p = params.bind(Value::Integer(*max));
                cases.push(format!("WHEN {col} > {p} THEN {p}"));
                conditions.push(format!("{col} > {p}"));
            }
            if cases.is_empty() {
                return Ok(0);
            }
            (
                format!("CASE {} ELSE {col} END", cases.join(" ")),
                conditions.join(" OR "),
            )
        }
        Rewrite::Expression { sql } => (format!("({sql})"), format!("{col} IS NOT ({sql})")),
        Rewrite::Map { .. } | Rewrite::Custom { .. } => {
            unreachable!("row-by-row rewrites are not run in bulk")
        }
    };

    let filter = match &task.predicate {
        Some(p) => format!("({}) AND ({})", p.sql, condition),
        None => condition,
    };
    let table = quote_ident(&task.table);

    let pending = exec.count(
        &format!("SELECT COUNT(*) FROM {table} WHERE {filter}"),
        &params.values,
    )?;
    if pending == 0 {
        debug!("{}: nothing to rewrite", task);
        return Ok(0);
    }
    params.values.extend(set_only);

    exec.execute(&Statement::dml(
        format!("UPDATE {table} SET {col} = {set_expr} WHERE {filter}"),
        params.values,
    ))
}

fn run_rows(
    exec: &mut Executor<'_>,
    task: &BackfillTask,
    registry: &RewriteRegistry,
) -> Result<u64, MigrateError> {
    let inputs: Vec<String> = match &task.rewrite {
        Rewrite::Custom { inputs, .. } if !inputs.is_empty() => {
            let mut inputs = inputs.clone();
            if !inputs.contains(&task.column) {
                inputs.push(task.column.clone());
            }
            inputs
        }
        _ => vec![task.column.clone()],
    };
    let rewriter = match &task.rewrite {
        Rewrite::Custom { name, .. } => Some(
            registry
                .get(name)
                .ok_or_else(|| MigrateError::UnknownRewriter(name.clone()))?,
        ),
        _ => None,
    };

    // Rows are read a page at a time, keyed on `task.key`. Predicate
    // parameters come first, the last key seen is bound after them.
    let mut select = format!(
        "SELECT {}, {} FROM {}",
        quote_ident(&task.key),
        inputs.iter().map(|c| quote_ident(c)).collect::<Vec<_>>().join(", "),
        quote_ident(&task.table)
    );
    let mut params = Vec::new();
    let mut conditions = Vec::new();
    if let Some(p) = &task.predicate {
        conditions.push(format!("({})", p.sql));
        params = p.params.clone();
    }
    let order = format!(
        " ORDER BY {} LIMIT {}",
        quote_ident(&task.key),
        task.page_size.max(1)
    );
    let first_page = if conditions.is_empty() {
        format!("{select}{order}")
    } else {
        format!("{select} WHERE {}{order}", conditions.join(" AND "))
    };
    conditions.push(format!("{} > ?{}", quote_ident(&task.key), params.len() + 1));
    select = format!("{select} WHERE {}{order}", conditions.join(" AND "));

    let update = format!(
        "UPDATE {} SET {} = ?1 WHERE {} = ?2",
        quote_ident(&task.table),
        quote_ident(&task.column),
        quote_ident(&task.key)
    );

    let mut converted = 0u64;
    let mut begun = false;
    let mut last_key: Option<Value> = None;
    loop {
        let rows = match &last_key {
            None => exec.query(&first_page, &params)?,
            Some(last) => {
                let mut page_params = params.clone();
                page_params.push(last.clone());
                exec.query(&select, &page_params)?
            }
        };

        for row in &rows {
            let key = row.value(0).cloned().unwrap_or_default();
            // Column values start after the key.
            let current = inputs
                .iter()
                .position(|c| *c == task.column)
                .and_then(|idx| row.value(idx + 1))
                .cloned()
                .unwrap_or_default();

            let computed = match (&task.rewrite, rewriter) {
                (Rewrite::Map { entries, fallback }, _) => Ok(entries
                    .iter()
                    .find(|e| e.from.matches(&current))
                    .map(|e| e.to.clone())
                    .or_else(|| fallback.clone())),
                (_, Some(rewriter)) => rewriter(row),
                _ => Ok(None),
            };

            let new_value = match computed {
                Ok(Some(v)) if !v.matches(&current) || v.is_null() != current.is_null() => v,
                Ok(_) => continue,
                Err(message) => {
                    return fail_rows(exec, task, begun, &key, converted, message);
                }
            };

            if !begun {
                exec.begin()?;
                begun = true;
            }
            match exec.execute(&Statement::dml(update.clone(), vec![new_value, key.clone()])) {
                Ok(1) => converted += 1,
                Ok(n) => {
                    return fail_rows(
                        exec,
                        task,
                        begun,
                        &key,
                        converted,
                        format!("update matched {n} rows instead of 1"),
                    );
                }
                Err(e) => return fail_rows(exec, task, begun, &key, converted, e.to_string()),
            }
        }

        if rows.len() < task.page_size.max(1) {
            break;
        }
        match rows.last().and_then(|r| r.value(0)) {
            Some(key) if !key.is_null() => last_key = Some(key.clone()),
            _ => break,
        }
    }

    if begun {
        exec.commit()?;
    }
    Ok(converted)
}

fn fail_rows(
    exec: &mut Executor<'_>,
    task: &BackfillTask,
    begun: bool,
    key: &Value,
    converted: u64,
    message: String,
) -> Result<u64, MigrateError> {
    if begun {
        exec.rollback()?;
    }
    Err(MigrateError::BackfillPartialFailure {
        table: task.table.clone(),
        column: task.column.clone(),
        key: key.to_string(),
        converted,
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::recording::RecordingBackend;
    use crate::db::RetryPolicy;
    use pretty_assertions::assert_eq;
    use proptest::prelude::*;

    const SETUP: &str = "
        CREATE TABLE items (id INTEGER PRIMARY KEY, active INT, level INT, itemtype TEXT, label TEXT);
        INSERT INTO items (id, active, level, itemtype, label) VALUES
            (1, 0, 5, '1', 'a'),
            (2, -1, -4, '2', NULL),
            (3, 2, 250, '14', 'c'),
            (4, NULL, NULL, '99', NULL),
            (5, 1, 10, 'Computer', 'e');";

    fn column_values(backend: &RecordingBackend, column: &str) -> Vec<Value> {
        crate::db::Backend::query(
            backend,
            &format!("SELECT {column} FROM items ORDER BY id"),
            &[],
        )
        .unwrap()
        .into_iter()
        .map(|r| r.values()[0].clone())
        .collect()
    }

    #[test]
    fn test_boolean_normalization_with_default() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new("items", "active", Rewrite::Boolean { null_to: Some(0) });
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 3);
        drop(exec);
        assert_eq!(
            column_values(&backend, "active"),
            vec![0.into(), 1.into(), 1.into(), 0.into(), 1.into()]
        );
    }

    #[test]
    fn test_bulk_rerun_issues_no_statement() {
        let mut backend = RecordingBackend::new(SETUP);
        let task = BackfillTask::new("items", "active", Rewrite::Boolean { null_to: Some(0) });
        {
            let mut exec = Executor::new(&mut backend, RetryPolicy::none());
            run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap();
        }
        backend.clear();
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 0);
        assert!(exec.executed().is_empty());
    }

    #[test]
    fn test_boolean_keeps_nulls_without_null_to() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new("items", "active", Rewrite::Boolean { null_to: None });
        run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap();
        drop(exec);
        assert_eq!(
            column_values(&backend, "active"),
            vec![0.into(), 1.into(), 1.into(), Value::Null, 1.into()]
        );
    }

    #[test]
    fn test_clamp_with_predicate() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let mut task = BackfillTask::new(
            "items",
            "level",
            Rewrite::Clamp { min: Some(0), max: Some(100) },
        );
        task.predicate = Some(Predicate {
            sql: "id <> ?1".to_string(),
            params: vec![Value::Integer(2)],
        });
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 1);
        drop(exec);
        assert_eq!(
            column_values(&backend, "level"),
            vec![5.into(), (-4).into(), 100.into(), Value::Null, 10.into()]
        );
    }

    #[test]
    fn test_null_to_value() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new("items", "label", Rewrite::NullTo { value: "".into() });
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 2);
    }

    #[test]
    fn test_map_translates_codes_row_by_row() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new(
            "items",
            "itemtype",
            Rewrite::Map {
                entries: vec![
                    MapEntry { from: 1.into(), to: "Computer".into() },
                    MapEntry { from: 2.into(), to: "NetworkEquipment".into() },
                    MapEntry { from: 14.into(), to: "Document".into() },
                ],
                fallback: None,
            },
        );
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 3);
        // second pass finds nothing left to translate
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 0);
        drop(exec);
        assert_eq!(
            column_values(&backend, "itemtype"),
            vec![
                "Computer".into(),
                "NetworkEquipment".into(),
                "Document".into(),
                "99".into(),
                "Computer".into()
            ]
        );
    }

    #[test]
    fn test_row_rewrites_read_in_pages() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let mut task = BackfillTask::new(
            "items",
            "itemtype",
            Rewrite::Map {
                entries: vec![
                    MapEntry { from: 1.into(), to: "Computer".into() },
                    MapEntry { from: 99.into(), to: "Unknown".into() },
                ],
                fallback: None,
            },
        );
        task.page_size = 2;
        task.predicate = Some(Predicate {
            sql: "id <> ?1".to_string(),
            params: vec![2.into()],
        });
        // rows 1 and 4 sit on different pages
        assert_eq!(run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap(), 2);
        drop(exec);
        assert_eq!(
            column_values(&backend, "itemtype"),
            vec![
                "Computer".into(),
                "2".into(),
                "14".into(),
                "Unknown".into(),
                "Computer".into()
            ]
        );
    }

    #[test]
    fn test_custom_rewriter_reads_inputs() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut registry = RewriteRegistry::new();
        registry.register("label_from_level", |row: &Row| {
            match row.get("level").and_then(Value::as_i64) {
                Some(level) => Ok(Some(Value::from(format!("level-{level}")))),
                None => Ok(None),
            }
        });
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new(
            "items",
            "label",
            Rewrite::Custom { name: "label_from_level".to_string(), inputs: vec!["level".to_string()] },
        );
        assert_eq!(run_backfill(&mut exec, &task, &registry).unwrap(), 4);
        drop(exec);
        assert_eq!(column_values(&backend, "label")[2], Value::from("level-250"));
        assert_eq!(column_values(&backend, "label")[3], Value::Null);
    }

    #[test]
    fn test_unknown_rewriter_is_reported() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new(
            "items",
            "label",
            Rewrite::Custom { name: "nope".to_string(), inputs: vec![] },
        );
        assert!(matches!(
            run_backfill(&mut exec, &task, &RewriteRegistry::new()),
            Err(MigrateError::UnknownRewriter(name)) if name == "nope"
        ));
    }

    #[test]
    fn test_row_failure_rolls_back_whole_backfill() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut registry = RewriteRegistry::new();
        registry.register("strict", |row: &Row| {
            let code = row.get("itemtype").and_then(Value::as_i64);
            match code {
                Some(99) => Err("unknown type code 99".to_string()),
                Some(code) => Ok(Some(Value::from(format!("type-{code}")))),
                None => Ok(None),
            }
        });
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new(
            "items",
            "itemtype",
            Rewrite::Custom { name: "strict".to_string(), inputs: vec![] },
        );
        let err = run_backfill(&mut exec, &task, &registry).unwrap_err();
        match err {
            MigrateError::BackfillPartialFailure { key, converted, message, .. } => {
                assert_eq!(key, "4");
                assert_eq!(converted, 3);
                assert!(message.contains("99"));
            }
            other => panic!("unexpected error {other:?}"),
        }
        drop(exec);
        // nothing from the failed pass survives
        assert_eq!(
            column_values(&backend, "itemtype"),
            vec!["1".into(), "2".into(), "14".into(), "99".into(), "Computer".into()]
        );
    }

    #[test]
    fn test_missing_column_is_precondition_failure() {
        let mut backend = RecordingBackend::new(SETUP);
        let mut exec = Executor::new(&mut backend, RetryPolicy::none());
        let task = BackfillTask::new("items", "nope", Rewrite::NullTo { value: 0.into() });
        assert!(matches!(
            run_backfill(&mut exec, &task, &RewriteRegistry::new()),
            Err(MigrateError::PreconditionFailed { .. })
        ));
    }

    proptest! {
        /// Whatever integers or NULLs a legacy flag column holds, boolean
        /// normalization leaves only 0 and 1.
        #[test]
        fn prop_boolean_normalization_reaches_domain(values in prop::collection::vec(prop::option::of(any::<i64>()), 0..30)) {
            let mut backend = RecordingBackend::new("CREATE TABLE flags (id INTEGER PRIMARY KEY, active INT);");
            for v in &values {
                crate::db::Backend::execute(
                    &mut backend,
                    "INSERT INTO flags (active) VALUES (?1)",
                    &[Value::from(*v)],
                ).unwrap();
            }
            let mut exec = Executor::new(&mut backend, RetryPolicy::none());
            let task = BackfillTask::new("flags", "active", Rewrite::Boolean { null_to: Some(0) });
            run_backfill(&mut exec, &task, &RewriteRegistry::new()).unwrap();
            drop(exec);

            let invalid = backend.scalar("SELECT COUNT(*) FROM flags WHERE active IS NULL OR active NOT IN (0, 1)");
            prop_assert_eq!(invalid, Value::Integer(0));
            let ones = backend.scalar("SELECT COUNT(*) FROM flags WHERE active = 1");
            let expected = values.iter().filter(|v| matches!(v, Some(x) if *x != 0)).count() as i64;
            prop_assert_eq!(ones, Value::Integer(expected));
        }
    }
}
