//! Backend-neutral descriptions of schema objects and ALTER clauses.
//!
//! These are what the change accumulator collects and what a backend applies.
//! The `Display` impls give the canonical statement text used in reports and
//! failure messages.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::value::Value;

/// Quotes an identifier, doubling any embedded quote characters.
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Joins identifiers as a quoted, comma separated list.
pub fn quote_list(names: &[String]) -> String {
    names
        .iter()
        .map(|n| quote_ident(n))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Normalizes a declared column type for comparison:
/// `tinyint( 1 )` and `TINYINT(1)` compare equal.
pub fn normalize_type(decl: &str) -> String {
    let upper = decl.trim().to_ascii_uppercase();
    let mut out = String::with_capacity(upper.len());
    let mut pending_space = false;
    for c in upper.chars() {
        if c.is_whitespace() {
            pending_space = true;
            continue;
        }
        if pending_space && !matches!(c, '(' | ')' | ',') && !out.ends_with(['(', ',']) {
            out.push(' ');
        }
        pending_space = false;
        out.push(c);
    }
    out
}

fn default_true() -> bool {
    true
}

/// Target definition of a column.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub sql_type: String,
    #[serde(default = "default_true")]
    pub nullable: bool,
    #[serde(default)]
    pub default: Option<Value>,
    #[serde(default)]
    pub comment: Option<String>,
}

impl ColumnDef {
    pub fn new(name: &str, sql_type: &str) -> Self {
        Self {
            name: name.to_owned(),
            sql_type: sql_type.to_owned(),
            nullable: true,
            default: None,
            comment: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: impl Into<Value>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn with_comment(mut self, comment: &str) -> Self {
        self.comment = Some(comment.to_owned());
        self
    }

    /// Column definition as it appears in CREATE TABLE or a CHANGE clause.
    pub fn to_sql(&self) -> String {
        format!("{} {}", quote_ident(&self.name), self.definition_sql())
    }

    /// Everything after the column name: type, constraints and comment.
    pub fn definition_sql(&self) -> String {
        let mut sql = self.sql_type.trim().to_owned();
        if !self.nullable {
            sql.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(&default.to_sql_literal());
        }
        if let Some(comment) = &self.comment {
            sql.push_str(&format!(" /* {} */", comment.replace("*/", "* /")));
        }
        sql
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexDef {
    pub fn new(name: &str, columns: &[&str]) -> Self {
        Self {
            name: name.to_owned(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            unique: false,
        }
    }

    pub fn create_sql(&self, table: &str) -> String {
        format!(
            "CREATE {}INDEX {} ON {} ({})",
            if self.unique { "UNIQUE " } else { "" },
            quote_ident(&self.name),
            quote_ident(table),
            quote_list(&self.columns)
        )
    }
}

/// One clause of a combined ALTER statement.
#[derive(Debug, Clone, PartialEq)]
pub enum AlterClause {
    /// Rename and/or retype `old` to the given definition.
    Change { old: String, column: ColumnDef },
    AddColumn(ColumnDef),
    DropColumn(String),
    AddIndex(IndexDef),
    DropIndex(String),
}

impl fmt::Display for AlterClause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AlterClause::Change { old, column } => {
                write!(f, "CHANGE {} {}", quote_ident(old), column.to_sql())
            }
            AlterClause::AddColumn(column) => write!(f, "ADD COLUMN {}", column.to_sql()),
            AlterClause::DropColumn(name) => write!(f, "DROP COLUMN {}", quote_ident(name)),
            AlterClause::AddIndex(index) => write!(
                f,
                "ADD {}INDEX {} ({})",
                if index.unique { "UNIQUE " } else { "" },
                quote_ident(&index.name),
                quote_list(&index.columns)
            ),
            AlterClause::DropIndex(name) => write!(f, "DROP INDEX {}", quote_ident(name)),
        }
    }
}

/// All pending clauses for one table, issued as a single ALTER.
#[derive(Debug, Clone, PartialEq)]
pub struct AlterBatch {
    pub table: String,
    pub clauses: Vec<AlterClause>,
}

impl fmt::Display for AlterBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let clauses = self
            .clauses
            .iter()
            .map(|c| c.to_string())
            .collect::<Vec<_>>()
            .join(", ");
        write!(f, "ALTER TABLE {} {}", quote_ident(&self.table), clauses)
    }
}

/// A column as reported by the live catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnInfo {
    pub name: String,
    pub decl_type: String,
    pub not_null: bool,
    /// Default as raw SQL text, exactly as the catalog reports it.
    pub default_sql: Option<String>,
    /// 1-based position within the primary key, 0 when not part of it.
    pub pk: i64,
}

impl ColumnInfo {
    /// True when this column already has the type, nullability and default
    /// of `def`. Comments are not compared: the catalog does not keep them.
    pub fn satisfies(&self, def: &ColumnDef) -> bool {
        let wanted = def
            .default
            .as_ref()
            .and_then(|v| normalize_default(&v.to_sql_literal()));
        let current = self.default_sql.as_deref().and_then(normalize_default);
        normalize_type(&self.decl_type) == normalize_type(&def.sql_type)
            && self.not_null == !def.nullable
            && current == wanted
    }
}

/// Default expression text with surrounding whitespace and parentheses
/// removed. `NULL` is the same as no default.
fn normalize_default(sql: &str) -> Option<String> {
    let mut text = sql.trim();
    while is_wrapped(text) {
        text = text[1..text.len() - 1].trim();
    }
    if text.is_empty() || text.eq_ignore_ascii_case("NULL") {
        None
    } else {
        Some(text.to_owned())
    }
}

/// True when the opening parenthesis closes at the very end: `(a)` but not
/// `(a) + (b)`.
fn is_wrapped(text: &str) -> bool {
    if text.len() < 2 || !text.starts_with('(') || !text.ends_with(')') {
        return false;
    }
    let mut depth = 0usize;
    for (i, c) in text.char_indices() {
        match c {
            '(' => depth += 1,
            ')' => {
                depth = depth.saturating_sub(1);
                if depth == 0 && i + 1 < text.len() {
                    return false;
                }
            }
            _ => {}
        }
    }
    true
}
