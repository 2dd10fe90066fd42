use std::fmt;

use serde::{Deserialize, Serialize};

use super::executor::Executor;
use crate::error::MigrateError;

/// A catalog condition that must hold for a guarded entry to run. Guards are
/// how raw SQL and data conversions stay idempotent: once the schema reaches
/// the state the entry produces, the guard fails and the entry is skipped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "when", rename_all = "snake_case")]
pub enum Guard {
    TableExists { table: String },
    TableMissing { table: String },
    ColumnExists { table: String, column: String },
    ColumnMissing { table: String, column: String },
    IndexExists { table: String, index: String },
    IndexMissing { table: String, index: String },
}

impl Guard {
    pub fn holds(&self, exec: &mut Executor<'_>) -> Result<bool, MigrateError> {
        match self {
            Guard::TableExists { table } => exec.table_exists(table),
            Guard::TableMissing { table } => Ok(!exec.table_exists(table)?),
            Guard::ColumnExists { table, column } => exec.column_exists(table, column),
            Guard::ColumnMissing { table, column } => Ok(!exec.column_exists(table, column)?),
            Guard::IndexExists { table, index } => exec.index_exists(table, index),
            Guard::IndexMissing { table, index } => Ok(!exec.index_exists(table, index)?),
        }
    }
}

impl fmt::Display for Guard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Guard::TableExists { table } => write!(f, "table `{table}` exists"),
            Guard::TableMissing { table } => write!(f, "table `{table}` is missing"),
            Guard::ColumnExists { table, column } => write!(f, "`{table}`.`{column}` exists"),
            Guard::ColumnMissing { table, column } => write!(f, "`{table}`.`{column}` is missing"),
            Guard::IndexExists { table, index } => write!(f, "index `{index}` on `{table}` exists"),
            Guard::IndexMissing { table, index } => {
                write!(f, "index `{index}` on `{table}` is missing")
            }
        }
    }
}

/// Returns the first guard that does not hold, or `None` when all hold.
pub fn first_failing<'g>(
    guards: &'g [Guard],
    exec: &mut Executor<'_>,
) -> Result<Option<&'g Guard>, MigrateError> {
    for guard in guards {
        if !guard.holds(exec)? {
            return Ok(Some(guard));
        }
    }
    Ok(None)
}
