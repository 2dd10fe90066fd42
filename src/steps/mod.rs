//! Step definitions: the data that tells the engine what one version-to-version
//! upgrade changes. Definitions are TOML documents, one step per file.

mod chain;
mod version;

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use log::debug;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::engine::{
    is_ddl, BackfillTask, ColumnChange, CreateTable, Fixup, IndexChange, Operation, Phase,
    StructuralChange, TableRename,
};
use crate::error::MigrateError;

pub use chain::{history, read_version, AppliedStep, ChainStatus, MigrationChain};
pub use version::SchemaVersion;

/// One migration step as loaded from its definition file. Each list holds the
/// entries of one phase, applied in file order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StepDefinition {
    #[serde(default)]
    pub name: String,
    pub from_version: SchemaVersion,
    pub to_version: SchemaVersion,
    #[serde(default)]
    pub rename_tables: Vec<TableRename>,
    #[serde(default)]
    pub rename_columns: Vec<ColumnChange>,
    #[serde(default)]
    pub booleans: Vec<ColumnChange>,
    #[serde(default)]
    pub text: Vec<ColumnChange>,
    #[serde(default)]
    pub varchar_char: Vec<ColumnChange>,
    #[serde(default)]
    pub int: Vec<ColumnChange>,
    #[serde(default)]
    pub structural: Vec<StructuralChange>,
    #[serde(default)]
    pub indexes: Vec<IndexChange>,
    #[serde(default)]
    pub conversions: Vec<BackfillTask>,
    #[serde(default)]
    pub auxiliary: Vec<CreateTable>,
    #[serde(default)]
    pub finalize: Vec<Fixup>,
}

impl StepDefinition {
    /// Parses and validates a definition. `origin` names the source in errors.
    pub fn from_toml(text: &str, origin: &str) -> Result<Self, MigrateError> {
        let definition: StepDefinition =
            toml::from_str(text).map_err(|e| MigrateError::Definition {
                step: origin.to_owned(),
                message: e.to_string(),
            })?;
        definition.validate()?;
        Ok(definition)
    }

    pub fn load_file(path: &Path) -> Result<Self, MigrateError> {
        debug!("Loading step definition {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::from_toml(&text, &path.display().to_string())
    }

    /// Loads a single file, or every `*.toml` file in a directory, sorted by
    /// `from_version`.
    pub fn load_path(path: &Path) -> Result<Vec<Self>, MigrateError> {
        if path.is_file() {
            return Ok(vec![Self::load_file(path)?]);
        }
        let mut definitions = Vec::new();
        for entry in fs::read_dir(path)? {
            let entry_path = entry?.path();
            if entry_path.is_file()
                && entry_path.extension().and_then(|e| e.to_str()) == Some("toml")
            {
                definitions.push(Self::load_file(&entry_path)?);
            }
        }
        definitions.sort_by(|a, b| a.from_version.cmp(&b.from_version));
        Ok(definitions)
    }

    /// The step's name, or `<from> -> <to>` when it has none.
    pub fn label(&self) -> String {
        if self.name.trim().is_empty() {
            format!("{} -> {}", self.from_version, self.to_version)
        } else {
            self.name.clone()
        }
    }

    /// SHA-256 over the definition's canonical JSON form, hex encoded.
    pub fn checksum(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        hex::encode(hasher.finalize())
    }

    /// The entries of `phase`, in the order they run.
    pub fn operations(&self, phase: Phase) -> Vec<Operation<'_>> {
        fn columns(changes: &[ColumnChange], boolean: bool) -> Vec<Operation<'_>> {
            changes
                .iter()
                .map(|change| Operation::ChangeColumn { change, boolean })
                .collect()
        }

        match phase {
            Phase::RenamingTables => self.rename_tables.iter().map(Operation::RenameTable).collect(),
            Phase::RenamingColumns => columns(&self.rename_columns, false),
            Phase::RewritingBooleans => columns(&self.booleans, true),
            Phase::RewritingText => columns(&self.text, false),
            Phase::RewritingVarcharChar => columns(&self.varchar_char, false),
            Phase::RewritingInt => columns(&self.int, false),
            Phase::StructuralFixups => self.structural.iter().map(Operation::Structural).collect(),
            Phase::IndexManagement => self.indexes.iter().map(Operation::Index).collect(),
            Phase::DataSemanticsConversion => {
                self.conversions.iter().map(Operation::Backfill).collect()
            }
            Phase::AuxiliaryObjectCreation => {
                self.auxiliary.iter().map(Operation::CreateTable).collect()
            }
            Phase::Finalizing => self.finalize.iter().map(Operation::Fixup).collect(),
            Phase::NotStarted | Phase::Done | Phase::Failed => Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        Phase::WORK.iter().all(|p| self.operations(*p).is_empty())
    }

    pub fn validate(&self) -> Result<(), MigrateError> {
        let fail = |message: String| MigrateError::Definition {
            step: self.label(),
            message,
        };

        if self.from_version >= self.to_version {
            return Err(fail(format!(
                "from_version {} is not older than to_version {}",
                self.from_version, self.to_version
            )));
        }

        for rename in &self.rename_tables {
            require_ident(&rename.from, "table").map_err(&fail)?;
            require_ident(&rename.to, "table").map_err(&fail)?;
        }

        let column_phases = [
            ("rename_columns", &self.rename_columns),
            ("booleans", &self.booleans),
            ("text", &self.text),
            ("varchar_char", &self.varchar_char),
            ("int", &self.int),
        ];
        for (phase, changes) in column_phases {
            let mut targets = HashSet::new();
            for change in changes {
                require_ident(&change.table, "table").map_err(&fail)?;
                require_ident(&change.old_name, "column").map_err(&fail)?;
                require_ident(change.new_name(), "column").map_err(&fail)?;
                if change.new_type.trim().is_empty() {
                    return Err(fail(format!("{change}: missing type")));
                }
                if !targets.insert((change.table.as_str(), change.new_name())) {
                    return Err(fail(format!(
                        "{phase}: more than one change produces `{}`.`{}`",
                        change.table,
                        change.new_name()
                    )));
                }
            }
        }

        for change in &self.structural {
            match change {
                StructuralChange::AddColumn { table, column } => {
                    require_ident(table, "table").map_err(&fail)?;
                    require_ident(&column.name, "column").map_err(&fail)?;
                }
                StructuralChange::DropColumn { table, column } => {
                    require_ident(table, "table").map_err(&fail)?;
                    require_ident(column, "column").map_err(&fail)?;
                }
                StructuralChange::Sql(raw) => {
                    if raw.sql.trim().is_empty() {
                        return Err(fail("empty sql entry".to_string()));
                    }
                    if raw.advisory && is_ddl(&raw.sql) {
                        return Err(fail(format!("{raw}: schema changes cannot be advisory")));
                    }
                }
            }
        }

        for index in &self.indexes {
            require_ident(&index.table, "table").map_err(&fail)?;
            require_ident(&index.name, "index").map_err(&fail)?;
            if index.action == crate::engine::IndexAction::Add && index.columns.is_empty() {
                return Err(fail(format!("{index}: no columns")));
            }
        }

        for task in &self.conversions {
            require_ident(&task.table, "table").map_err(&fail)?;
            require_ident(&task.column, "column").map_err(&fail)?;
            require_ident(&task.key, "column").map_err(&fail)?;
        }

        for table in &self.auxiliary {
            require_ident(&table.name, "table").map_err(&fail)?;
            if table.columns.is_empty() {
                return Err(fail(format!("{table}: no columns")));
            }
            for key in &table.primary_key {
                if !table.columns.iter().any(|c| &c.name == key) {
                    return Err(fail(format!("{table}: primary key column `{key}` is not defined")));
                }
            }
            for index in &table.indexes {
                require_ident(&index.name, "index").map_err(&fail)?;
                if index.columns.is_empty() {
                    return Err(fail(format!("{table}: index `{}` has no columns", index.name)));
                }
                if let Some(missing) = index
                    .columns
                    .iter()
                    .find(|col| !table.columns.iter().any(|c| &c.name == *col))
                {
                    return Err(fail(format!(
                        "{table}: index `{}` column `{missing}` is not defined",
                        index.name
                    )));
                }
            }
        }

        for fixup in &self.finalize {
            match fixup {
                Fixup::Update { table, set, .. } => {
                    require_ident(table, "table").map_err(&fail)?;
                    for column in set.keys() {
                        require_ident(column, "column").map_err(&fail)?;
                    }
                }
                Fixup::Sql(raw) => {
                    if raw.advisory && is_ddl(&raw.sql) {
                        return Err(fail(format!("{raw}: schema changes cannot be advisory")));
                    }
                }
            }
        }
        Ok(())
    }
}

fn require_ident(name: &str, what: &str) -> Result<(), String> {
    if name.trim().is_empty() {
        Err(format!("empty {what} name"))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{Rewrite, StructuralChange};
    use crate::value::Value;
    use pretty_assertions::assert_eq;
    use std::io::Write;

    const STEP: &str = r#"
name = "0.72.3 to 0.78"
from_version = "0.72.3"
to_version = "0.78"

[[rename_tables]]
from = "glpi_networkequipments"
to = "glpi_networkequipment"
backup = true

[[booleans]]
table = "glpi_items"
old_name = "active"
new_name = "is_active"
type = "TINYINT(1)"
nullable = false
default = 0

[[structural]]
op = "sql"
sql = "ALTER TABLE glpi_rules ADD COLUMN sub_type TEXT"
guards = [{ when = "column_missing", table = "glpi_rules", column = "sub_type" }]

[[conversions]]
table = "glpi_items"
column = "itemtype"
rewrite = { kind = "map", entries = [{ from = 1, to = "Computer" }, { from = 2, to = "NetworkEquipment" }] }
"#;

    #[test]
    fn test_parse_definition() {
        let def = StepDefinition::from_toml(STEP, "inline").unwrap();
        assert_eq!(def.label(), "0.72.3 to 0.78");
        assert_eq!(def.rename_tables.len(), 1);
        assert!(def.rename_tables[0].backup);
        assert_eq!(def.booleans[0].default, Some(Value::Integer(0)));
        assert!(matches!(&def.structural[0], StructuralChange::Sql(raw) if raw.guards.len() == 1));
        match &def.conversions[0].rewrite {
            Rewrite::Map { entries, fallback } => {
                assert_eq!(entries.len(), 2);
                assert_eq!(entries[1].to, Value::from("NetworkEquipment"));
                assert!(fallback.is_none());
            }
            other => panic!("unexpected rewrite {other:?}"),
        }
        assert_eq!(def.conversions[0].key, "id");
        assert_eq!(def.operations(Phase::RewritingBooleans).len(), 1);
        assert!(def.operations(Phase::Done).is_empty());
    }

    #[test]
    fn test_unknown_fields_are_rejected() {
        let err = StepDefinition::from_toml(
            "from_version = \"1\"\nto_version = \"2\"\nrenames = []\n",
            "inline",
        )
        .unwrap_err();
        assert!(matches!(err, MigrateError::Definition { .. }));
    }

    #[test]
    fn test_duplicate_targets_in_phase_are_rejected() {
        let text = r#"
from_version = "1"
to_version = "2"

[[rename_columns]]
table = "items"
old_name = "a"
new_name = "c"
type = "TEXT"

[[rename_columns]]
table = "items"
old_name = "b"
new_name = "c"
type = "TEXT"
"#;
        let err = StepDefinition::from_toml(text, "inline").unwrap_err();
        assert!(err.to_string().contains("more than one change produces `items`.`c`"));
    }

    #[test]
    fn test_auxiliary_index_columns_must_be_defined() {
        let text = r#"
from_version = "1"
to_version = "2"

[[auxiliary]]
name = "broken"
columns = [{ name = "id", type = "INTEGER" }]
indexes = [{ name = "broken_missing", columns = ["missing"] }]
"#;
        let err = StepDefinition::from_toml(text, "inline").unwrap_err();
        assert!(err
            .to_string()
            .contains("index `broken_missing` column `missing` is not defined"));
    }

    #[test]
    fn test_advisory_schema_sql_is_rejected() {
        let structural = r#"
from_version = "1"
to_version = "2"

[[structural]]
op = "sql"
sql = "ALTER TABLE items ADD COLUMN date_mod TEXT"
advisory = true
"#;
        let err = StepDefinition::from_toml(structural, "inline").unwrap_err();
        assert!(err.to_string().contains("schema changes cannot be advisory"));

        let finalize = r#"
from_version = "1"
to_version = "2"

[[finalize]]
op = "sql"
sql = "drop index legacy"
advisory = true
"#;
        let err = StepDefinition::from_toml(finalize, "inline").unwrap_err();
        assert!(err.to_string().contains("schema changes cannot be advisory"));

        let data_fixup = r#"
from_version = "1"
to_version = "2"

[[finalize]]
op = "sql"
sql = "UPDATE configs SET version = '2'"
advisory = true
"#;
        assert!(StepDefinition::from_toml(data_fixup, "inline").is_ok());
    }

    #[test]
    fn test_versions_must_increase() {
        let err = StepDefinition::from_toml("from_version = \"2\"\nto_version = \"1\"\n", "inline")
            .unwrap_err();
        assert!(err.to_string().contains("is not older than"));
    }

    #[test]
    fn test_checksum_tracks_content() {
        let a = StepDefinition::from_toml(STEP, "inline").unwrap();
        let mut b = a.clone();
        assert_eq!(a.checksum(), b.checksum());
        assert_eq!(a.checksum().len(), 64);
        b.booleans[0].default = Some(Value::Integer(1));
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_load_directory_sorts_by_version() {
        let dir = tempfile::tempdir().unwrap();
        for (file, from, to) in [("b.toml", "0.78", "0.80"), ("a.toml", "0.72.3", "0.78")] {
            let mut f = fs::File::create(dir.path().join(file)).unwrap();
            writeln!(f, "from_version = \"{from}\"\nto_version = \"{to}\"").unwrap();
        }
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let defs = StepDefinition::load_path(dir.path()).unwrap();
        let versions: Vec<String> = defs.iter().map(|d| d.from_version.to_string()).collect();
        assert_eq!(versions, vec!["0.72.3".to_string(), "0.78".to_string()]);

        let single = StepDefinition::load_path(&dir.path().join("a.toml")).unwrap();
        assert_eq!(single.len(), 1);
    }
}
