mod accumulator;
mod backfill;
mod executor;
mod guard;
mod inspector;
mod operations;
mod progress;
mod sequencer;

pub use accumulator::ChangeAccumulator;
pub use backfill::{
    run_backfill, BackfillTask, MapEntry, Predicate, Rewrite, RewriteRegistry, RowRewriter,
    Strategy,
};
pub use executor::{is_ddl, Executor, Statement, StatementKind};
pub use guard::Guard;
pub use inspector::SchemaSnapshot;
pub use operations::{
    ColumnChange, CreateTable, Fixup, IndexAction, IndexChange, Operation, Outcome, RawSql,
    StructuralChange, TableRename,
};
pub use progress::{HistorySink, LogSink, MigrationMessage, NoopSink, OutputSink};
pub use sequencer::{MigrationStep, Phase, PhaseMachine, StepFailure, StepReport, StepSequencer};
