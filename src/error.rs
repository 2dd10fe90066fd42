use rusqlite::Error as RusqliteError;
use std::io;
use thiserror::Error;

use crate::db::BackendError;
use crate::engine::StepFailure;

#[derive(Error, Debug)]
pub enum MigrateError {
    #[error("I/O error: {0}")]
    IoError(#[from] io::Error),

    #[error("Database error: {0}")]
    DatabaseError(#[from] RusqliteError),

    #[error("Backend error: {0}")]
    Backend(#[from] BackendError),

    #[error("Error: {0}")]
    Error(String),

    /// A table or column the operation depends on is absent and the absence is
    /// not explained by the change having already been applied.
    #[error("Precondition failed on `{table}`: {detail}")]
    PreconditionFailed { table: String, detail: String },

    /// The backend rejected a statement that was not marked advisory.
    #[error("Statement failed: {message}\n  statement: {statement}")]
    StatementFailed { statement: String, message: String },

    #[error(
        "Backfill of `{table}`.`{column}` failed at row {key} after {converted} row(s): {message}"
    )]
    BackfillPartialFailure {
        table: String,
        column: String,
        key: String,
        converted: u64,
        message: String,
    },

    #[error("Invalid phase transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Migration step '{0}' has already been executed")]
    AlreadyExecuted(String),

    #[error("No row rewriter registered under the name '{0}'")]
    UnknownRewriter(String),

    #[error("Invalid step definition '{step}': {message}")]
    Definition { step: String, message: String },

    #[error("No migration path from {from} to {to}")]
    NoMigrationPath { from: String, to: String },

    #[error("Database is at version {db_version}, newer than the newest known version {known}")]
    DatabaseNewer { db_version: String, known: String },

    #[error(transparent)]
    StepFailed(#[from] Box<StepFailure>),
}

impl MigrateError {
    pub fn precondition(table: &str, detail: impl Into<String>) -> Self {
        MigrateError::PreconditionFailed {
            table: table.to_owned(),
            detail: detail.into(),
        }
    }

    /// The statement text attached to the error, if there is one.
    pub fn statement(&self) -> Option<&str> {
        match self {
            MigrateError::StatementFailed { statement, .. } => Some(statement),
            MigrateError::StepFailed(failure) => failure.statement.as_deref(),
            _ => None,
        }
    }
}
