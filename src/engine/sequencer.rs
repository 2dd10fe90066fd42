// Step phases, in order:
//   NotStarted
//   RenamingTables            table renames, with optional backup of an occupied target
//   RenamingColumns           column renames
//   RewritingBooleans         integer flags to booleans, values normalized first
//   RewritingText             retype to TEXT family
//   RewritingVarcharChar      retype to VARCHAR/CHAR
//   RewritingInt              retype to integer family
//   StructuralFixups          add/drop columns, guarded raw SQL
//   IndexManagement           add/drop indexes
//   DataSemanticsConversion   value rewrites (codes to labels, ...)
//   AuxiliaryObjectCreation   new tables with seed rows
//   Finalizing                row fixups (config version, ...)
//   Done
// Failed is reachable from any working phase. Each phase gets its own change
// accumulator, drained when the phase ends.

use std::fmt;

use log::{info, Level};
use logging_timer::timer;
use serde::Serialize;
use strum_macros::{AsRefStr, Display, EnumIter};
use thiserror::Error;

use super::accumulator::ChangeAccumulator;
use super::backfill::{Rewrite, RewriteRegistry};
use super::executor::{Executor, Statement};
use super::progress::OutputSink;
use crate::db::{Backend, RetryPolicy};
use crate::ddl::{AlterBatch, AlterClause};
use crate::error::MigrateError;
use crate::steps::StepDefinition;

#[derive(AsRefStr, EnumIter, Display, Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    NotStarted,
    RenamingTables,
    RenamingColumns,
    RewritingBooleans,
    RewritingText,
    RewritingVarcharChar,
    RewritingInt,
    StructuralFixups,
    IndexManagement,
    DataSemanticsConversion,
    AuxiliaryObjectCreation,
    Finalizing,
    Done,
    Failed,
}

impl Phase {
    /// The phases that do work, in execution order.
    pub const WORK: [Phase; 11] = [
        Phase::RenamingTables,
        Phase::RenamingColumns,
        Phase::RewritingBooleans,
        Phase::RewritingText,
        Phase::RewritingVarcharChar,
        Phase::RewritingInt,
        Phase::StructuralFixups,
        Phase::IndexManagement,
        Phase::DataSemanticsConversion,
        Phase::AuxiliaryObjectCreation,
        Phase::Finalizing,
    ];

    /// The phase that follows this one on success.
    pub fn next(self) -> Option<Phase> {
        match self {
            Phase::NotStarted => Some(Phase::RenamingTables),
            Phase::Finalizing => Some(Phase::Done),
            Phase::Done | Phase::Failed => None,
            working => {
                let idx = Phase::WORK.iter().position(|p| *p == working)?;
                Phase::WORK.get(idx + 1).copied()
            }
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Phase::NotStarted => "Not started",
            Phase::RenamingTables => "Renaming tables",
            Phase::RenamingColumns => "Renaming columns",
            Phase::RewritingBooleans => "Converting boolean columns",
            Phase::RewritingText => "Converting text columns",
            Phase::RewritingVarcharChar => "Converting varchar and char columns",
            Phase::RewritingInt => "Converting integer columns",
            Phase::StructuralFixups => "Applying structural changes",
            Phase::IndexManagement => "Updating indexes",
            Phase::DataSemanticsConversion => "Converting data",
            Phase::AuxiliaryObjectCreation => "Creating auxiliary tables",
            Phase::Finalizing => "Finalizing",
            Phase::Done => "Done",
            Phase::Failed => "Failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Phase::Done | Phase::Failed)
    }
}

/// Tracks the current phase and only permits strictly forward, sequential
/// transitions, or a move to `Failed` from a working phase.
#[derive(Debug)]
pub struct PhaseMachine {
    phase: Phase,
}

impl Default for PhaseMachine {
    fn default() -> Self {
        Self {
            phase: Phase::NotStarted,
        }
    }
}

impl PhaseMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn phase(&self) -> Phase {
        self.phase
    }

    pub fn advance(&mut self, to: Phase) -> Result<(), MigrateError> {
        if self.phase.next() != Some(to) {
            return Err(MigrateError::InvalidTransition {
                from: self.phase.to_string(),
                to: to.to_string(),
            });
        }
        self.phase = to;
        Ok(())
    }

    pub fn fail(&mut self) -> Result<(), MigrateError> {
        if self.phase.is_terminal() || self.phase == Phase::NotStarted {
            return Err(MigrateError::InvalidTransition {
                from: self.phase.to_string(),
                to: Phase::Failed.to_string(),
            });
        }
        self.phase = Phase::Failed;
        Ok(())
    }
}

/// A step definition bound to its lifecycle. A step runs at most once; a
/// re-run after failure uses a fresh `MigrationStep` and relies on every
/// operation skipping work that is already done.
pub struct MigrationStep {
    definition: StepDefinition,
    machine: PhaseMachine,
    log: Vec<String>,
}

impl MigrationStep {
    pub fn new(definition: StepDefinition) -> Self {
        Self {
            definition,
            machine: PhaseMachine::new(),
            log: Vec::new(),
        }
    }

    pub fn definition(&self) -> &StepDefinition {
        &self.definition
    }

    pub fn phase(&self) -> Phase {
        self.machine.phase()
    }

    pub fn log(&self) -> &[String] {
        &self.log
    }
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct StepReport {
    pub step: String,
    pub applied: usize,
    pub skipped: usize,
    /// Every mutating statement issued, in order.
    pub statements: Vec<String>,
    pub advisories: Vec<String>,
}

#[derive(Debug, Error)]
#[error("Step '{step}' failed during {phase} at {operation}: {error}")]
pub struct StepFailure {
    pub step: String,
    pub phase: Phase,
    pub operation: String,
    pub statement: Option<String>,
    #[source]
    pub error: MigrateError,
}

/// Drives a [`MigrationStep`] through every phase against one backend.
pub struct StepSequencer<'s> {
    sink: &'s dyn OutputSink,
    registry: RewriteRegistry,
    retry: RetryPolicy,
}

impl<'s> StepSequencer<'s> {
    pub fn new(sink: &'s dyn OutputSink) -> Self {
        Self {
            sink,
            registry: RewriteRegistry::new(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_registry(mut self, registry: RewriteRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn registry(&self) -> &RewriteRegistry {
        &self.registry
    }

    pub fn run_step(
        &self,
        backend: &mut dyn Backend,
        step: &mut MigrationStep,
    ) -> Result<StepReport, StepFailure> {
        let name = step.definition.label();
        if step.phase() != Phase::NotStarted {
            return Err(StepFailure {
                step: name.clone(),
                phase: step.phase(),
                operation: "start".to_string(),
                statement: None,
                error: MigrateError::AlreadyExecuted(name),
            });
        }

        // Rewriters are resolved before any phase touches the schema.
        for task in &step.definition.conversions {
            if let Rewrite::Custom { name: rewriter, .. } = &task.rewrite {
                if !self.registry.contains(rewriter) {
                    return Err(StepFailure {
                        step: name,
                        phase: Phase::NotStarted,
                        operation: task.to_string(),
                        statement: None,
                        error: MigrateError::UnknownRewriter(rewriter.clone()),
                    });
                }
            }
        }

        info!("Running migration step {}", name);
        let mut report = StepReport {
            step: name.clone(),
            ..Default::default()
        };
        let mut exec = Executor::new(backend, self.retry.clone());

        for phase in Phase::WORK {
            let result = step
                .machine
                .advance(phase)
                .map_err(|e| ("start".to_string(), e))
                .and_then(|_| self.run_phase(&mut exec, step, phase, &mut report));

            if let Err((operation, error)) = result {
                let _ = step.machine.fail();
                let failure = StepFailure {
                    step: name,
                    phase,
                    operation,
                    statement: error.statement().map(str::to_owned),
                    error,
                };
                step.log.push(failure.to_string());
                self.sink.announce_failed(&failure.to_string());
                return Err(failure);
            }
        }

        // Finalizing -> Done is always valid once every phase succeeded.
        step.machine
            .advance(Phase::Done)
            .map_err(|error| StepFailure {
                step: name.clone(),
                phase: Phase::Finalizing,
                operation: "finish".to_string(),
                statement: None,
                error,
            })?;

        report.statements = exec.executed().to_vec();
        info!(
            "Step {} complete: {} applied, {} skipped, {} statement(s)",
            name,
            report.applied,
            report.skipped,
            report.statements.len()
        );
        self.sink.announce_complete();
        Ok(report)
    }

    fn run_phase(
        &self,
        exec: &mut Executor<'_>,
        step: &mut MigrationStep,
        phase: Phase,
        report: &mut StepReport,
    ) -> Result<(), (String, MigrateError)> {
        let _tmr = timer!(Level::Debug; "StepSequencer::run_phase", "{}", phase);
        self.sink.announce_phase(phase.label());

        let mut acc = ChangeAccumulator::new();
        for op in step.definition.operations(phase) {
            let outcome = op
                .apply(exec, &mut acc, &self.registry)
                .map_err(|e| (op.to_string(), e))?;
            if outcome.is_skipped() {
                report.skipped += 1;
            } else {
                report.applied += 1;
            }
            let entry = format!("{op}: {outcome}");
            info!("{}", entry);
            step.log.push(entry);
            self.forward_advisories(exec, report);
        }

        for statement in acc.drain() {
            exec.execute(&statement)
                .map_err(|e| (statement.to_string(), e))?;
            if let Statement::Alter(batch) = &statement {
                verify_batch(exec, batch).map_err(|e| (statement.to_string(), e))?;
            }
        }
        self.forward_advisories(exec, report);
        Ok(())
    }

    fn forward_advisories(&self, exec: &mut Executor<'_>, report: &mut StepReport) {
        for note in exec.take_advisories() {
            self.sink.announce_error(&note);
            report.advisories.push(note);
        }
    }
}

/// Re-reads the catalog after a flushed batch and confirms every clause took
/// effect.
fn verify_batch(exec: &mut Executor<'_>, batch: &AlterBatch) -> Result<(), MigrateError> {
    let table = batch.table.as_str();
    for clause in &batch.clauses {
        let holds = match clause {
            AlterClause::Change { column, .. } => exec
                .column(table, &column.name)?
                .map(|info| info.satisfies(column))
                .unwrap_or(false),
            AlterClause::AddColumn(column) => exec.column_exists(table, &column.name)?,
            AlterClause::DropColumn(name) => !exec.column_exists(table, name)?,
            AlterClause::AddIndex(index) => exec.index_exists(table, &index.name)?,
            AlterClause::DropIndex(name) => !exec.index_exists(table, name)?,
        };
        if !holds {
            return Err(MigrateError::StatementFailed {
                statement: batch.to_string(),
                message: format!("`{clause}` did not take effect"),
            });
        }
    }
    Ok(())
}

impl fmt::Display for StepReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{}: {} applied, {} skipped",
            self.step, self.applied, self.skipped
        )?;
        for statement in &self.statements {
            writeln!(f, "  {statement}")?;
        }
        for note in &self.advisories {
            writeln!(f, "  warning: {note}")?;
        }
        Ok(())
    }
}
