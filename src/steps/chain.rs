use chrono::Utc;
use log::{info, warn};
use serde::Serialize;

use super::{SchemaVersion, StepDefinition};
use crate::db::Backend;
use crate::engine::{MigrationStep, StepReport, StepSequencer};
use crate::error::MigrateError;
use crate::value::Value;

const META_TABLE: &str = "migration_meta";
const HISTORY_TABLE: &str = "migration_history";
const VERSION_KEY: &str = "schema_version";

const CREATE_META_SQL: &str = "CREATE TABLE IF NOT EXISTS migration_meta (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
)";

const CREATE_HISTORY_SQL: &str = "CREATE TABLE IF NOT EXISTS migration_history (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    name TEXT NOT NULL,
    from_version TEXT NOT NULL,
    to_version TEXT NOT NULL,
    checksum TEXT NOT NULL,
    applied_at TEXT NOT NULL
)";

/// A row of `migration_history`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AppliedStep {
    pub name: String,
    pub from_version: String,
    pub to_version: String,
    pub checksum: String,
    pub applied_at: String,
}

/// Where a database stands relative to the chain.
#[derive(Debug, Clone, Serialize)]
pub struct ChainStatus {
    pub current: String,
    /// True when the database has no recorded version and `current` is the
    /// chain's starting version.
    pub assumed: bool,
    pub latest: String,
    pub pending: Vec<String>,
    pub history: Vec<AppliedStep>,
}

/// Ordered, contiguous list of steps: each step starts at the version the
/// previous one ends at.
#[derive(Debug)]
pub struct MigrationChain {
    steps: Vec<StepDefinition>,
}

impl MigrationChain {
    pub fn new(mut steps: Vec<StepDefinition>) -> Result<Self, MigrateError> {
        if steps.is_empty() {
            return Err(MigrateError::Error("No migration steps defined".into()));
        }
        steps.sort_by(|a, b| a.from_version.cmp(&b.from_version));
        for pair in steps.windows(2) {
            if pair[0].to_version != pair[1].from_version {
                return Err(MigrateError::Definition {
                    step: pair[1].label(),
                    message: format!(
                        "starts at {} but the previous step ends at {}",
                        pair[1].from_version, pair[0].to_version
                    ),
                });
            }
        }
        Ok(Self { steps })
    }

    pub fn steps(&self) -> &[StepDefinition] {
        &self.steps
    }

    pub fn first_version(&self) -> &SchemaVersion {
        &self.steps[0].from_version
    }

    pub fn latest_version(&self) -> &SchemaVersion {
        &self.steps[self.steps.len() - 1].to_version
    }

    /// Steps leading from `current` to `target`, in order.
    pub fn path(
        &self,
        current: &SchemaVersion,
        target: &SchemaVersion,
    ) -> Result<Vec<&StepDefinition>, MigrateError> {
        if current > self.latest_version() {
            return Err(MigrateError::DatabaseNewer {
                db_version: current.to_string(),
                known: self.latest_version().to_string(),
            });
        }
        let no_path = || MigrateError::NoMigrationPath {
            from: current.to_string(),
            to: target.to_string(),
        };
        if target < current {
            return Err(no_path());
        }
        if target == current {
            return Ok(Vec::new());
        }

        let start = self
            .steps
            .iter()
            .position(|s| s.from_version == *current)
            .ok_or_else(no_path)?;
        let mut path = Vec::new();
        for step in &self.steps[start..] {
            path.push(step);
            if step.to_version == *target {
                return Ok(path);
            }
            if step.to_version > *target {
                break;
            }
        }
        Err(no_path())
    }

    pub fn status(&self, backend: &dyn Backend) -> Result<ChainStatus, MigrateError> {
        let recorded = read_version(backend)?;
        let assumed = recorded.is_none();
        let current = recorded.unwrap_or_else(|| self.first_version().clone());
        let pending = self
            .path(&current, self.latest_version())?
            .into_iter()
            .map(StepDefinition::label)
            .collect();
        Ok(ChainStatus {
            current: current.to_string(),
            assumed,
            latest: self.latest_version().to_string(),
            pending,
            history: history(backend)?,
        })
    }

    /// Runs every step between the database's version and `target` (the
    /// newest version when `None`). `assume_from` is used only when the
    /// database has no recorded version.
    pub fn upgrade(
        &self,
        backend: &mut dyn Backend,
        sequencer: &StepSequencer<'_>,
        assume_from: Option<&SchemaVersion>,
        target: Option<&SchemaVersion>,
    ) -> Result<Vec<StepReport>, MigrateError> {
        let current = match (read_version(backend)?, assume_from) {
            (Some(recorded), Some(assumed)) => {
                if recorded != *assumed {
                    warn!(
                        "Ignoring starting version {}: database records version {}",
                        assumed, recorded
                    );
                }
                recorded
            }
            (Some(recorded), None) => recorded,
            (None, Some(assumed)) => assumed.clone(),
            (None, None) => self.first_version().clone(),
        };
        let target = target.unwrap_or_else(|| self.latest_version());
        let path = self.path(&current, target)?;
        self.check_recorded_checksums(&*backend)?;

        if path.is_empty() {
            info!("Database is already at version {}", current);
            return Ok(Vec::new());
        }

        let mut reports = Vec::new();
        for definition in path {
            let mut step = MigrationStep::new(definition.clone());
            let report = sequencer
                .run_step(backend, &mut step)
                .map_err(|failure| MigrateError::StepFailed(Box::new(failure)))?;
            record_step(backend, definition)?;
            info!("Database is now at version {}", definition.to_version);
            reports.push(report);
        }
        Ok(reports)
    }

    fn check_recorded_checksums(&self, backend: &dyn Backend) -> Result<(), MigrateError> {
        for applied in history(backend)? {
            let definition = self.steps.iter().find(|s| {
                s.from_version.as_str() == applied.from_version
                    && s.to_version.as_str() == applied.to_version
            });
            if let Some(definition) = definition {
                if definition.checksum() != applied.checksum {
                    warn!(
                        "Step {} was applied with a different definition (checksum {} recorded, {} now)",
                        definition.label(),
                        applied.checksum,
                        definition.checksum()
                    );
                }
            }
        }
        Ok(())
    }
}

pub fn read_version(backend: &dyn Backend) -> Result<Option<SchemaVersion>, MigrateError> {
    if !backend.table_exists(META_TABLE)? {
        return Ok(None);
    }
    let rows = backend.query(
        "SELECT value FROM migration_meta WHERE key = ?1",
        &[Value::from(VERSION_KEY)],
    )?;
    match rows.first().and_then(|r| r.value(0)).and_then(Value::as_str) {
        Some(text) => Ok(Some(text.parse()?)),
        None => Ok(None),
    }
}

pub fn history(backend: &dyn Backend) -> Result<Vec<AppliedStep>, MigrateError> {
    if !backend.table_exists(HISTORY_TABLE)? {
        return Ok(Vec::new());
    }
    let rows = backend.query(
        "SELECT name, from_version, to_version, checksum, applied_at
         FROM migration_history ORDER BY id",
        &[],
    )?;
    let text = |row: &crate::db::Row, idx: usize| {
        row.value(idx)
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_owned()
    };
    Ok(rows
        .iter()
        .map(|row| AppliedStep {
            name: text(row, 0),
            from_version: text(row, 1),
            to_version: text(row, 2),
            checksum: text(row, 3),
            applied_at: text(row, 4),
        })
        .collect())
}

/// Records a completed step and moves the stored version forward, both in
/// one transaction.
fn record_step(backend: &mut dyn Backend, definition: &StepDefinition) -> Result<(), MigrateError> {
    backend.execute(CREATE_META_SQL, &[])?;
    backend.execute(CREATE_HISTORY_SQL, &[])?;

    backend.begin()?;
    let result = (|| -> Result<(), MigrateError> {
        backend.execute(
            "INSERT INTO migration_history (name, from_version, to_version, checksum, applied_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            &[
                Value::from(definition.label()),
                Value::from(definition.from_version.as_str()),
                Value::from(definition.to_version.as_str()),
                Value::from(definition.checksum()),
                Value::from(Utc::now().to_rfc3339()),
            ],
        )?;
        backend.execute(
            "INSERT INTO migration_meta (key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            &[
                Value::from(VERSION_KEY),
                Value::from(definition.to_version.as_str()),
            ],
        )?;
        Ok(())
    })();

    match result {
        Ok(()) => Ok(backend.commit()?),
        Err(e) => {
            backend.rollback()?;
            Err(e)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::recording::RecordingBackend;
    use crate::db::RetryPolicy;
    use crate::engine::NoopSink;
    use pretty_assertions::assert_eq;

    fn step(from: &str, to: &str, body: &str) -> StepDefinition {
        StepDefinition::from_toml(
            &format!("from_version = \"{from}\"\nto_version = \"{to}\"\n{body}"),
            "test",
        )
        .unwrap()
    }

    fn chain() -> MigrationChain {
        MigrationChain::new(vec![
            step(
                "0.78",
                "0.80",
                r#"
                [[structural]]
                op = "add_column"
                table = "items"
                column = { name = "date_creation", type = "TIMESTAMP" }
                "#,
            ),
            step(
                "0.72.3",
                "0.78",
                r#"
                [[rename_columns]]
                table = "items"
                old_name = "nom"
                new_name = "name"
                type = "VARCHAR(255)"
                "#,
            ),
        ])
        .unwrap()
    }

    fn v(s: &str) -> SchemaVersion {
        s.parse().unwrap()
    }

    #[test]
    fn test_chain_must_be_contiguous() {
        let err = MigrationChain::new(vec![step("1", "2", ""), step("3", "4", "")]).unwrap_err();
        assert!(matches!(err, MigrateError::Definition { .. }));
    }

    #[test]
    fn test_path_selection() {
        let chain = chain();
        assert_eq!(chain.path(&v("0.72.3"), &v("0.80")).unwrap().len(), 2);
        assert_eq!(chain.path(&v("0.78"), &v("0.80")).unwrap().len(), 1);
        assert!(chain.path(&v("0.80"), &v("0.80")).unwrap().is_empty());
        assert!(matches!(
            chain.path(&v("0.75"), &v("0.80")),
            Err(MigrateError::NoMigrationPath { .. })
        ));
        assert!(matches!(
            chain.path(&v("0.72.3"), &v("0.79")),
            Err(MigrateError::NoMigrationPath { .. })
        ));
        assert!(matches!(
            chain.path(&v("0.85"), &v("0.80")),
            Err(MigrateError::DatabaseNewer { .. })
        ));
    }

    #[test]
    fn test_upgrade_records_history_and_is_idempotent() {
        let mut backend =
            RecordingBackend::new("CREATE TABLE items (id INTEGER PRIMARY KEY, nom TEXT);");
        let chain = chain();
        let sink = NoopSink;
        let sequencer = StepSequencer::new(&sink).with_retry(RetryPolicy::none());

        let reports = chain.upgrade(&mut backend, &sequencer, None, None).unwrap();
        assert_eq!(reports.len(), 2);
        assert_eq!(read_version(&backend).unwrap(), Some(v("0.80")));
        let applied = history(&backend).unwrap();
        assert_eq!(applied.len(), 2);
        assert_eq!(applied[0].to_version, "0.78");
        assert_eq!(applied[0].checksum, chain.steps()[0].checksum());
        assert!(chrono::DateTime::parse_from_rfc3339(&applied[1].applied_at).is_ok());

        backend.clear();
        let reports = chain.upgrade(&mut backend, &sequencer, None, None).unwrap();
        assert!(reports.is_empty());
        assert!(backend.mutations.is_empty());

        let status = chain.status(&backend).unwrap();
        assert_eq!(status.current, "0.80");
        assert!(!status.assumed);
        assert!(status.pending.is_empty());
    }

    #[test]
    fn test_upgrade_to_intermediate_target() {
        let mut backend =
            RecordingBackend::new("CREATE TABLE items (id INTEGER PRIMARY KEY, nom TEXT);");
        let chain = chain();
        let sink = NoopSink;
        let sequencer = StepSequencer::new(&sink).with_retry(RetryPolicy::none());

        let status = chain.status(&backend).unwrap();
        assert!(status.assumed);
        assert_eq!(status.pending.len(), 2);

        chain
            .upgrade(&mut backend, &sequencer, None, Some(&v("0.78")))
            .unwrap();
        assert_eq!(read_version(&backend).unwrap(), Some(v("0.78")));
        assert!(!backend.column_exists("items", "date_creation").unwrap());
        assert_eq!(chain.status(&backend).unwrap().pending, vec!["0.78 -> 0.80".to_string()]);
    }

    #[test]
    fn test_failed_step_leaves_version_unchanged() {
        let mut backend = RecordingBackend::new("CREATE TABLE other (id INTEGER PRIMARY KEY);");
        let chain = chain();
        let sink = NoopSink;
        let sequencer = StepSequencer::new(&sink).with_retry(RetryPolicy::none());

        let err = chain
            .upgrade(&mut backend, &sequencer, None, None)
            .unwrap_err();
        match err {
            MigrateError::StepFailed(failure) => {
                assert_eq!(failure.step, "0.72.3 -> 0.78");
                assert!(matches!(failure.error, MigrateError::PreconditionFailed { .. }));
            }
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(read_version(&backend).unwrap(), None);
    }
}
