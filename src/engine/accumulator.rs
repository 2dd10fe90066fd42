use crate::ddl::{AlterBatch, AlterClause};

use super::executor::Statement;

/// Collects pending ALTER clauses per table so that every change a phase
/// makes to one table is issued as a single ALTER.
///
/// An accumulator belongs to one phase: the sequencer creates it when the
/// phase starts and drains it when the phase ends. Clauses are not
/// validated here; callers check existence through the inspector first.
#[derive(Debug, Default)]
pub struct ChangeAccumulator {
    pending: Vec<AlterBatch>,
}

impl ChangeAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_column_change(&mut self, table: &str, clause: AlterClause) {
        match self.pending.iter_mut().find(|b| b.table == table) {
            Some(batch) => batch.clauses.push(clause),
            None => self.pending.push(AlterBatch {
                table: table.to_owned(),
                clauses: vec![clause],
            }),
        }
    }

    /// Turns the table's pending clauses into one ALTER statement and clears
    /// them. Returns `None` when nothing is pending for the table.
    pub fn flush(&mut self, table: &str) -> Option<Statement> {
        let idx = self.pending.iter().position(|b| b.table == table)?;
        let batch = self.pending.remove(idx);
        if batch.clauses.is_empty() {
            return None;
        }
        Some(Statement::Alter(batch))
    }

    /// Flushes every table, in the order each table was first touched.
    pub fn drain(&mut self) -> Vec<Statement> {
        self.pending
            .drain(..)
            .filter(|b| !b.clauses.is_empty())
            .map(Statement::Alter)
            .collect()
    }

    pub fn pending(&self, table: &str) -> &[AlterClause] {
        self.pending
            .iter()
            .find(|b| b.table == table)
            .map(|b| b.clauses.as_slice())
            .unwrap_or(&[])
    }

    pub fn is_empty(&self) -> bool {
        self.pending.iter().all(|b| b.clauses.is_empty())
    }

    /// True when a pending clause already produces a column named `column`.
    pub fn has_pending_target(&self, table: &str, column: &str) -> bool {
        self.pending(table).iter().any(|c| match c {
            AlterClause::Change { column: def, .. } | AlterClause::AddColumn(def) => {
                def.name == column
            }
            _ => false,
        })
    }

    /// True when a pending clause already consumes the column named `column`.
    pub fn has_pending_source(&self, table: &str, column: &str) -> bool {
        self.pending(table).iter().any(|c| match c {
            AlterClause::Change { old, .. } => old == column,
            AlterClause::DropColumn(name) => name == column,
            _ => false,
        })
    }

    /// The latest pending ADD INDEX or DROP INDEX clause for `index`.
    pub fn pending_index(&self, table: &str, index: &str) -> Option<&AlterClause> {
        self.pending(table).iter().rev().find(|c| match c {
            AlterClause::AddIndex(def) => def.name == index,
            AlterClause::DropIndex(name) => name == index,
            _ => false,
        })
    }
}
