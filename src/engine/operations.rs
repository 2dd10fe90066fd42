//! The entries a step definition lists under each phase, and how each one is
//! applied.
//!
//! Every operation inspects the catalog before acting and reports
//! [`Outcome::Skipped`] when its target state already holds, so a step can
//! be re-run after a partial failure. Column and index changes are not
//! executed directly; they are queued on the phase's [`ChangeAccumulator`].

use std::collections::BTreeMap;
use std::fmt;

use log::info;
use serde::{Deserialize, Serialize};

use super::accumulator::ChangeAccumulator;
use super::backfill::{run_backfill, BackfillTask, Params, Predicate, Rewrite, RewriteRegistry};
use super::executor::{is_ddl, Executor, Statement, StatementKind};
use super::guard::{first_failing, Guard};
use crate::ddl::{quote_ident, quote_list, AlterClause, ColumnDef, IndexDef};
use crate::error::MigrateError;
use crate::value::Value;

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Executed immediately.
    Applied,
    /// Queued on the accumulator; runs when the phase flushes.
    Queued,
    Skipped(String),
}

impl Outcome {
    fn skipped(reason: impl Into<String>) -> Self {
        Outcome::Skipped(reason.into())
    }

    pub fn is_skipped(&self) -> bool {
        matches!(self, Outcome::Skipped(_))
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Applied => write!(f, "applied"),
            Outcome::Queued => write!(f, "queued"),
            Outcome::Skipped(reason) => write!(f, "skipped ({reason})"),
        }
    }
}

// Tables

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableRename {
    pub from: String,
    pub to: String,
    /// Archive an occupied target as `backup_<to>` instead of failing.
    #[serde(default)]
    pub backup: bool,
}

impl TableRename {
    pub fn backup_name(&self) -> String {
        format!("backup_{}", self.to)
    }
}

impl fmt::Display for TableRename {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "rename table `{}` to `{}`", self.from, self.to)
    }
}

fn rename_sql(from: &str, to: &str) -> String {
    format!("ALTER TABLE {} RENAME TO {}", quote_ident(from), quote_ident(to))
}

pub fn rename_table(exec: &mut Executor<'_>, rename: &TableRename) -> Result<Outcome, MigrateError> {
    let source = exec.table_exists(&rename.from)?;
    let target = exec.table_exists(&rename.to)?;

    if !source {
        if target {
            return Ok(Outcome::skipped("already renamed"));
        }
        return Err(MigrateError::precondition(
            &rename.from,
            format!("neither `{}` nor `{}` exists", rename.from, rename.to),
        ));
    }

    if rename.backup {
        let backup = rename.backup_name();
        if exec.table_exists(&backup)? {
            info!("Dropping stale backup table `{}`", backup);
            exec.execute(&Statement::ddl(
                format!("DROP TABLE {}", quote_ident(&backup)),
                &[&backup],
            ))?;
        }
        if target {
            info!("Archiving `{}` as `{}`", rename.to, backup);
            exec.execute(&Statement::ddl(
                rename_sql(&rename.to, &backup),
                &[&rename.to, &backup],
            ))?;
        }
    } else if target {
        return Err(MigrateError::precondition(
            &rename.to,
            format!("cannot rename `{}`: target already exists", rename.from),
        ));
    }

    exec.execute(&Statement::ddl(
        rename_sql(&rename.from, &rename.to),
        &[&rename.from, &rename.to],
    ))?;
    Ok(Outcome::Applied)
}

// Columns

/// Rename and/or retype of one column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnChange {
    pub table: String,
    pub old_name: String,
    /// Absent for a retype in place.
    #[serde(default)]
    pub new_name: Option<String>,
    #[serde(rename = "type")]
    pub new_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
    /// Ensure an index `<table>_<column>` on the new column exists.
    #[serde(default)]
    pub index: bool,
}

impl ColumnChange {
    pub fn new(table: &str, old_name: &str, new_name: &str, new_type: &str) -> Self {
        Self {
            table: table.to_owned(),
            old_name: old_name.to_owned(),
            new_name: (old_name != new_name).then(|| new_name.to_owned()),
            new_type: new_type.to_owned(),
            nullable: true,
            default: None,
            comment: None,
            index: false,
        }
    }

    pub fn new_name(&self) -> &str {
        self.new_name.as_deref().unwrap_or(&self.old_name)
    }

    /// Name of the index `index = true` creates: `<table>_<column>`.
    pub fn index_name(&self) -> String {
        format!("{}_{}", self.table, self.new_name())
    }

    pub fn target(&self) -> ColumnDef {
        ColumnDef {
            name: self.new_name().to_owned(),
            sql_type: self.new_type.clone(),
            nullable: self.nullable,
            default: self.default.clone(),
            comment: self.comment.clone(),
        }
    }

    /// Backfill that must complete before the column is narrowed, if any.
    fn backfill(&self, source: &str, boolean: bool) -> Option<BackfillTask> {
        let rewrite = if boolean {
            let null_to = if self.nullable {
                None
            } else {
                Some(self.default.as_ref().and_then(Value::as_i64).unwrap_or(0))
            };
            Rewrite::Boolean { null_to }
        } else {
            match (&self.default, self.nullable) {
                (Some(value), false) if !value.is_null() => Rewrite::NullTo {
                    value: value.clone(),
                },
                _ => return None,
            }
        };
        Some(BackfillTask::new(&self.table, source, rewrite))
    }
}

impl fmt::Display for ColumnChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.new_name() == self.old_name {
            write!(f, "retype `{}`.`{}` to {}", self.table, self.old_name, self.new_type)
        } else {
            write!(
                f,
                "change `{}`.`{}` to `{}` {}",
                self.table,
                self.old_name,
                self.new_name(),
                self.new_type
            )
        }
    }
}

/// Queues the change unless it is already applied. When the change narrows
/// the column, the data backfill runs first, before anything is queued.
pub fn change_column(
    exec: &mut Executor<'_>,
    acc: &mut ChangeAccumulator,
    change: &ColumnChange,
    boolean: bool,
) -> Result<Outcome, MigrateError> {
    let table = change.table.as_str();
    let old = change.old_name.as_str();
    let new = change.new_name();

    if !exec.table_exists(table)? {
        return Err(MigrateError::precondition(table, "table is missing"));
    }
    if acc.has_pending_target(table, new) {
        return Err(MigrateError::precondition(
            table,
            format!("`{new}` collides with a pending change"),
        ));
    }
    if acc.has_pending_source(table, old) {
        return Err(MigrateError::precondition(
            table,
            format!("`{old}` already has a pending change"),
        ));
    }

    let old_col = exec.column(table, old)?;
    let new_col = if new != old { exec.column(table, new)? } else { None };
    let (source, current) = match (old_col, new_col) {
        (Some(_), Some(_)) => {
            return Err(MigrateError::precondition(
                table,
                format!("both `{old}` and `{new}` exist"),
            ))
        }
        (Some(col), None) => (old, col),
        (None, Some(col)) => (new, col),
        (None, None) => {
            return Err(MigrateError::precondition(
                table,
                format!("column `{old}` is missing"),
            ))
        }
    };

    let target = change.target();
    let mut outcome = Outcome::skipped("already applied");
    if source != new || !current.satisfies(&target) {
        if let Some(task) = change.backfill(source, boolean) {
            run_backfill(exec, &task, &RewriteRegistry::default())?;
        }
        acc.add_column_change(
            table,
            AlterClause::Change {
                old: source.to_owned(),
                column: target,
            },
        );
        outcome = Outcome::Queued;
    }

    if change.index {
        // Index names share one namespace across the schema.
        let index = change.index_name();
        match acc.pending_index(table, &index) {
            Some(AlterClause::DropIndex(_)) => {
                return Err(MigrateError::precondition(
                    table,
                    format!("index `{index}` has a pending drop"),
                ))
            }
            Some(_) => {}
            None if exec.index_exists(table, &index)? => {}
            None => {
                acc.add_column_change(table, AlterClause::AddIndex(IndexDef::new(&index, &[new])));
                outcome = Outcome::Queued;
            }
        }
    }
    Ok(outcome)
}

// Indexes

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexAction {
    Add,
    Drop,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexChange {
    pub table: String,
    pub name: String,
    pub action: IndexAction,
    #[serde(default)]
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexChange {
    pub fn add(table: &str, name: &str, columns: &[&str]) -> Self {
        Self {
            table: table.to_owned(),
            name: name.to_owned(),
            action: IndexAction::Add,
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn drop(table: &str, name: &str) -> Self {
        Self {
            table: table.to_owned(),
            name: name.to_owned(),
            action: IndexAction::Drop,
            columns: Vec::new(),
            unique: false,
        }
    }
}

impl fmt::Display for IndexChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.action {
            IndexAction::Add => write!(
                f,
                "add index `{}` on `{}` ({})",
                self.name,
                self.table,
                self.columns.join(", ")
            ),
            IndexAction::Drop => write!(f, "drop index `{}` on `{}`", self.name, self.table),
        }
    }
}

/// Adding an index that exists, or dropping one that does not, is a skip.
pub fn apply_index_change(
    exec: &mut Executor<'_>,
    acc: &mut ChangeAccumulator,
    change: &IndexChange,
) -> Result<Outcome, MigrateError> {
    let table = change.table.as_str();
    if !exec.table_exists(table)? {
        return Err(MigrateError::precondition(table, "table is missing"));
    }
    match (acc.pending_index(table, &change.name), change.action) {
        (Some(AlterClause::AddIndex(_)), IndexAction::Add)
        | (Some(AlterClause::DropIndex(_)), IndexAction::Drop) => {
            return Ok(Outcome::skipped("already pending"));
        }
        (Some(_), _) => {
            return Err(MigrateError::precondition(
                table,
                format!("{change} conflicts with a pending change to the same index"),
            ));
        }
        (None, _) => {}
    }
    let exists = exec.index_exists(table, &change.name)?;

    match change.action {
        IndexAction::Add => {
            if exists {
                return Ok(Outcome::skipped("index exists"));
            }
            for column in &change.columns {
                if !exec.column_exists(table, column)? && !acc.has_pending_target(table, column) {
                    return Err(MigrateError::precondition(
                        table,
                        format!("cannot index missing column `{column}`"),
                    ));
                }
            }
            acc.add_column_change(
                table,
                AlterClause::AddIndex(IndexDef {
                    name: change.name.clone(),
                    columns: change.columns.clone(),
                    unique: change.unique,
                }),
            );
        }
        IndexAction::Drop => {
            if !exists {
                return Ok(Outcome::skipped("index absent"));
            }
            acc.add_column_change(table, AlterClause::DropIndex(change.name.clone()));
        }
    }
    Ok(Outcome::Queued)
}

// Structural fixups and raw SQL

/// Trusted SQL from the step definition, run only when all guards hold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawSql {
    pub sql: String,
    #[serde(default)]
    pub params: Vec<Value>,
    #[serde(default)]
    pub advisory: bool,
    #[serde(default)]
    pub guards: Vec<Guard>,
}

impl fmt::Display for RawSql {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sql `{}`", self.sql)
    }
}

pub fn run_sql(exec: &mut Executor<'_>, raw: &RawSql) -> Result<Outcome, MigrateError> {
    if let Some(guard) = first_failing(&raw.guards, exec)? {
        return Ok(Outcome::skipped(format!("guard not met: {guard}")));
    }
    let kind = if is_ddl(&raw.sql) {
        StatementKind::Ddl
    } else if raw.advisory {
        StatementKind::Advisory
    } else {
        StatementKind::Dml
    };
    exec.execute(&Statement::Sql {
        sql: raw.sql.clone(),
        params: raw.params.clone(),
        kind,
        tables: Vec::new(),
    })?;
    Ok(Outcome::Applied)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum StructuralChange {
    AddColumn { table: String, column: ColumnDef },
    DropColumn { table: String, column: String },
    Sql(RawSql),
}

impl fmt::Display for StructuralChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StructuralChange::AddColumn { table, column } => {
                write!(f, "add column `{}`.`{}`", table, column.name)
            }
            StructuralChange::DropColumn { table, column } => {
                write!(f, "drop column `{table}`.`{column}`")
            }
            StructuralChange::Sql(raw) => raw.fmt(f),
        }
    }
}

pub fn apply_structural(
    exec: &mut Executor<'_>,
    acc: &mut ChangeAccumulator,
    change: &StructuralChange,
) -> Result<Outcome, MigrateError> {
    match change {
        StructuralChange::AddColumn { table, column } => {
            if !exec.table_exists(table)? {
                return Err(MigrateError::precondition(table, "table is missing"));
            }
            if exec.column_exists(table, &column.name)? || acc.has_pending_target(table, &column.name)
            {
                return Ok(Outcome::skipped("column exists"));
            }
            acc.add_column_change(table, AlterClause::AddColumn(column.clone()));
            Ok(Outcome::Queued)
        }
        StructuralChange::DropColumn { table, column } => {
            if !exec.column_exists(table, column)? {
                return Ok(Outcome::skipped("column absent"));
            }
            if acc.has_pending_source(table, column) {
                return Err(MigrateError::precondition(
                    table,
                    format!("`{column}` already has a pending change"),
                ));
            }
            acc.add_column_change(table, AlterClause::DropColumn(column.clone()));
            Ok(Outcome::Queued)
        }
        StructuralChange::Sql(raw) => run_sql(exec, raw),
    }
}

// Auxiliary objects

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateTable {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    #[serde(default)]
    pub primary_key: Vec<String>,
    #[serde(default)]
    pub indexes: Vec<IndexDef>,
    /// Seed rows, keyed by column name.
    #[serde(default)]
    pub rows: Vec<BTreeMap<String, Value>>,
}

impl CreateTable {
    pub fn create_sql(&self) -> String {
        let mut parts: Vec<String> = self.columns.iter().map(ColumnDef::to_sql).collect();
        if !self.primary_key.is_empty() {
            parts.push(format!("PRIMARY KEY ({})", quote_list(&self.primary_key)));
        }
        format!(
            "CREATE TABLE {} (\n    {}\n)",
            quote_ident(&self.name),
            parts.join(",\n    ")
        )
    }
}

impl fmt::Display for CreateTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "create table `{}`", self.name)
    }
}

/// Creates the table, its indexes and seed rows in one transaction, so a
/// failure never leaves a half-built table that a re-run would skip.
pub fn create_table(exec: &mut Executor<'_>, table: &CreateTable) -> Result<Outcome, MigrateError> {
    if exec.table_exists(&table.name)? {
        return Ok(Outcome::skipped("table exists"));
    }

    exec.begin()?;
    match populate(exec, table) {
        Ok(()) => {
            exec.commit()?;
            Ok(Outcome::Applied)
        }
        Err(e) => {
            exec.rollback()?;
            Err(e)
        }
    }
}

fn populate(exec: &mut Executor<'_>, table: &CreateTable) -> Result<(), MigrateError> {
    let name = table.name.as_str();
    exec.execute(&Statement::ddl(table.create_sql(), &[name]))?;
    for index in &table.indexes {
        exec.execute(&Statement::ddl(index.create_sql(name), &[name]))?;
    }
    for row in &table.rows {
        let columns: Vec<String> = row.keys().cloned().collect();
        let placeholders = (1..=columns.len())
            .map(|i| format!("?{i}"))
            .collect::<Vec<_>>()
            .join(", ");
        exec.execute(&Statement::dml(
            format!(
                "INSERT INTO {} ({}) VALUES ({})",
                quote_ident(name),
                quote_list(&columns),
                placeholders
            ),
            row.values().cloned().collect(),
        ))?;
    }
    Ok(())
}

// Final fixups

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Fixup {
    /// `UPDATE table SET ... WHERE filter`. Touching no row is advisory
    /// unless `advisory` is false.
    Update {
        table: String,
        set: BTreeMap<String, Value>,
        #[serde(default)]
        filter: Option<Predicate>,
        #[serde(default = "default_true")]
        advisory: bool,
    },
    Sql(RawSql),
}

impl fmt::Display for Fixup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fixup::Update { table, filter, .. } => match filter {
                Some(p) => write!(f, "update `{}` where {}", table, p.sql),
                None => write!(f, "update `{table}`"),
            },
            Fixup::Sql(raw) => raw.fmt(f),
        }
    }
}

pub fn apply_fixup(exec: &mut Executor<'_>, fixup: &Fixup) -> Result<Outcome, MigrateError> {
    let (table, set, filter, advisory) = match fixup {
        Fixup::Sql(raw) => return run_sql(exec, raw),
        Fixup::Update { table, set, filter, advisory } => (table, set, filter, *advisory),
    };
    if set.is_empty() {
        return Ok(Outcome::skipped("nothing to set"));
    }
    if !exec.table_exists(table)? {
        let detail = "table is missing";
        if advisory {
            exec.advise(format!("Skipped {fixup}: {detail}"));
            return Ok(Outcome::skipped(detail));
        }
        return Err(MigrateError::precondition(table, detail));
    }

    let mut params = Params::new(filter.as_ref().map(|p| p.params.clone()).unwrap_or_default());
    let where_sql = filter.as_ref().map(|p| format!("({})", p.sql));
    let quoted = quote_ident(table);

    let matching = exec.count(
        &format!(
            "SELECT COUNT(*) FROM {} WHERE {}",
            quoted,
            where_sql.as_deref().unwrap_or("1")
        ),
        &params.values,
    )?;
    if matching == 0 {
        let detail = "no matching row";
        if advisory {
            exec.advise(format!("No rows affected by {fixup}"));
            return Ok(Outcome::skipped(detail));
        }
        return Err(MigrateError::precondition(table, format!("{fixup}: {detail}")));
    }

    let mut assignments = Vec::new();
    let mut differs = Vec::new();
    for (column, value) in set {
        let p = params.bind(value.clone());
        assignments.push(format!("{} = {}", quote_ident(column), p));
        differs.push(format!("{} IS NOT {}", quote_ident(column), p));
    }
    let mut filter_sql = format!("({})", differs.join(" OR "));
    if let Some(where_sql) = &where_sql {
        filter_sql = format!("{where_sql} AND {filter_sql}");
    }

    let stale = exec.count(
        &format!("SELECT COUNT(*) FROM {quoted} WHERE {filter_sql}"),
        &params.values,
    )?;
    if stale == 0 {
        return Ok(Outcome::skipped("already up to date"));
    }

    let sql = format!(
        "UPDATE {} SET {} WHERE {}",
        quoted,
        assignments.join(", "),
        filter_sql
    );
    let statement = if advisory {
        Statement::advisory(sql, params.values)
    } else {
        Statement::dml(sql, params.values)
    };
    exec.execute(&statement)?;
    Ok(Outcome::Applied)
}

/// One entry of a step definition, borrowed for the phase that runs it.
#[derive(Debug, Clone, Copy)]
pub enum Operation<'d> {
    RenameTable(&'d TableRename),
    /// `boolean` selects the boolean normalization backfill.
    ChangeColumn { change: &'d ColumnChange, boolean: bool },
    Structural(&'d StructuralChange),
    Index(&'d IndexChange),
    Backfill(&'d BackfillTask),
    CreateTable(&'d CreateTable),
    Fixup(&'d Fixup),
}

impl Operation<'_> {
    pub fn apply(
        &self,
        exec: &mut Executor<'_>,
        acc: &mut ChangeAccumulator,
        registry: &RewriteRegistry,
    ) -> Result<Outcome, MigrateError> {
        match *self {
            Operation::RenameTable(rename) => rename_table(exec, rename),
            Operation::ChangeColumn { change, boolean } => change_column(exec, acc, change, boolean),
            Operation::Structural(change) => apply_structural(exec, acc, change),
            Operation::Index(change) => apply_index_change(exec, acc, change),
            Operation::Backfill(task) => {
                if let Some(guard) = first_failing(&task.guards, exec)? {
                    return Ok(Outcome::skipped(format!("guard not met: {guard}")));
                }
                match run_backfill(exec, task, registry)? {
                    0 => Ok(Outcome::skipped("no rows to rewrite")),
                    _ => Ok(Outcome::Applied),
                }
            }
            Operation::CreateTable(table) => create_table(exec, table),
            Operation::Fixup(fixup) => apply_fixup(exec, fixup),
        }
    }
}

impl fmt::Display for Operation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::RenameTable(op) => op.fmt(f),
            Operation::ChangeColumn { change, .. } => change.fmt(f),
            Operation::Structural(op) => op.fmt(f),
            Operation::Index(op) => op.fmt(f),
            Operation::Backfill(op) => op.fmt(f),
            Operation::CreateTable(op) => op.fmt(f),
            Operation::Fixup(op) => op.fmt(f),
        }
    }
}
