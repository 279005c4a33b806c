//! The declarative data model for a desired schema change.
//!
//! A [MigrationUnit] is a named, ordered group of [Step]s applied and tracked
//! as one whole. Steps carry no side effects of their own: each one can be
//! checked against a schema snapshot without touching the database, which is
//! what makes re-running a unit safe.

use std::collections::BTreeSet;

use sha2::{Digest, Sha256};

/// Declaration of a single column.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnSpec {
    pub name: String,
    /// Declared SQL type, e.g. `INTEGER` or `VARCHAR(255)`.
    pub sql_type: String,
    pub not_null: bool,
    /// Default value rendered verbatim into the DDL, e.g. `0` or `'none'`.
    pub default: Option<String>,
    pub primary_key: bool,
    pub unique: bool,
}

impl ColumnSpec {
    pub fn new(name: impl Into<String>, sql_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql_type: sql_type.into(),
            not_null: false,
            default: None,
            primary_key: false,
            unique: false,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.not_null = true;
        self
    }

    pub fn default_value(mut self, value: impl Into<String>) -> Self {
        self.default = Some(value.into());
        self
    }

    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    /// Full column definition for CREATE TABLE.
    pub(crate) fn render(&self) -> String {
        let mut def = format!("\"{}\" {}", self.name, self.sql_type);
        if self.primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if self.unique && !self.primary_key {
            def.push_str(" UNIQUE");
        }
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }

    /// Column definition for ALTER TABLE ADD COLUMN. SQLite rejects PRIMARY
    /// KEY and UNIQUE here; uniqueness is enforced through a separate index.
    pub(crate) fn render_for_add(&self) -> String {
        let mut def = format!("\"{}\" {}", self.name, self.sql_type);
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }
}

/// Declaration of a single index.
#[derive(Debug, Clone, PartialEq)]
pub struct IndexSpec {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

impl IndexSpec {
    pub fn new<I, S>(name: impl Into<String>, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            unique: false,
        }
    }

    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }

    pub(crate) fn render(&self, table: &str) -> String {
        let kind = if self.unique { "UNIQUE INDEX" } else { "INDEX" };
        let columns = self
            .columns
            .iter()
            .map(|c| format!("\"{}\"", c))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "CREATE {} \"{}\" ON \"{}\" ({})",
            kind, self.name, table, columns
        )
    }
}

/// The kind of constraint an `AddConstraint` step declares.
#[derive(Debug, Clone, PartialEq)]
pub enum ConstraintKind {
    Unique {
        columns: Vec<String>,
    },
    ForeignKey {
        columns: Vec<String>,
        parent_table: String,
        parent_columns: Vec<String>,
    },
    Check {
        expression: String,
    },
}

/// A declarative data transformation over existing rows.
///
/// `value` is a SQL expression evaluated against each row of `table`; the
/// generated UPDATE always carries a guard so rows already carrying a value
/// are never touched, letting an interrupted backfill resume where it
/// stopped. Without an explicit guard, rows where `column` is NULL are the
/// ones filled.
#[derive(Debug, Clone, PartialEq)]
pub struct BackfillSpec {
    pub description: String,
    pub table: String,
    pub column: String,
    pub value: String,
    pub guard: Option<String>,
}

impl BackfillSpec {
    pub fn new(
        description: impl Into<String>,
        table: impl Into<String>,
        column: impl Into<String>,
        value: impl Into<String>,
    ) -> Self {
        Self {
            description: description.into(),
            table: table.into(),
            column: column.into(),
            value: value.into(),
            guard: None,
        }
    }

    /// Replace the default `column IS NULL` guard with a custom predicate.
    pub fn with_guard(mut self, guard: impl Into<String>) -> Self {
        self.guard = Some(guard.into());
        self
    }

    pub(crate) fn guard_clause(&self) -> String {
        match &self.guard {
            Some(guard) => format!("({})", guard),
            None => format!("\"{}\" IS NULL", self.column),
        }
    }
}

/// One atomic declared change.
///
/// Each variant can be decided "already applied" from a [SchemaSnapshot]
/// (backfills are gated by the ledger instead); see [crate::pending].
///
/// [SchemaSnapshot]: crate::SchemaSnapshot
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    CreateTable {
        table: String,
        columns: Vec<ColumnSpec>,
        indexes: Vec<IndexSpec>,
    },
    AddColumn {
        table: String,
        column: ColumnSpec,
    },
    ModifyColumn {
        table: String,
        column: ColumnSpec,
        /// When set, the step counts as applied once the live column's
        /// declared type matches `column.sql_type`. Without it the step is
        /// re-issued on every run and must therefore converge on repeat.
        skip_if_type_matches: bool,
    },
    AddIndex {
        table: String,
        index: IndexSpec,
    },
    AddConstraint {
        table: String,
        name: String,
        kind: ConstraintKind,
    },
    Backfill(BackfillSpec),
}

impl Step {
    pub fn create_table(table: impl Into<String>, columns: Vec<ColumnSpec>) -> Self {
        Self::CreateTable {
            table: table.into(),
            columns,
            indexes: Vec::new(),
        }
    }

    pub fn create_table_with_indexes(
        table: impl Into<String>,
        columns: Vec<ColumnSpec>,
        indexes: Vec<IndexSpec>,
    ) -> Self {
        Self::CreateTable {
            table: table.into(),
            columns,
            indexes,
        }
    }

    pub fn add_column(table: impl Into<String>, column: ColumnSpec) -> Self {
        Self::AddColumn {
            table: table.into(),
            column,
        }
    }

    pub fn modify_column(table: impl Into<String>, column: ColumnSpec) -> Self {
        Self::ModifyColumn {
            table: table.into(),
            column,
            skip_if_type_matches: false,
        }
    }

    /// Like [Step::modify_column], but skipped on later runs once the live
    /// column already carries the declared type.
    pub fn modify_column_if_type_differs(table: impl Into<String>, column: ColumnSpec) -> Self {
        Self::ModifyColumn {
            table: table.into(),
            column,
            skip_if_type_matches: true,
        }
    }

    pub fn add_index(table: impl Into<String>, index: IndexSpec) -> Self {
        Self::AddIndex {
            table: table.into(),
            index,
        }
    }

    pub fn add_unique_constraint<I, S>(
        table: impl Into<String>,
        name: impl Into<String>,
        columns: I,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::AddConstraint {
            table: table.into(),
            name: name.into(),
            kind: ConstraintKind::Unique {
                columns: columns.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn add_constraint(
        table: impl Into<String>,
        name: impl Into<String>,
        kind: ConstraintKind,
    ) -> Self {
        Self::AddConstraint {
            table: table.into(),
            name: name.into(),
            kind,
        }
    }

    pub fn backfill(spec: BackfillSpec) -> Self {
        Self::Backfill(spec)
    }

    /// The table this step touches.
    pub fn table(&self) -> &str {
        match self {
            Self::CreateTable { table, .. }
            | Self::AddColumn { table, .. }
            | Self::ModifyColumn { table, .. }
            | Self::AddIndex { table, .. }
            | Self::AddConstraint { table, .. } => table,
            Self::Backfill(spec) => &spec.table,
        }
    }

    /// Human-readable label used in reports and previews.
    pub fn describe(&self) -> String {
        match self {
            Self::CreateTable { table, .. } => format!("create table {}", table),
            Self::AddColumn { table, column } => format!("add column {}.{}", table, column.name),
            Self::ModifyColumn { table, column, .. } => {
                format!("modify column {}.{}", table, column.name)
            }
            Self::AddIndex { table, index } => format!("add index {} on {}", index.name, table),
            Self::AddConstraint { table, name, .. } => {
                format!("add constraint {} on {}", name, table)
            }
            Self::Backfill(spec) => format!("backfill {}.{}", spec.table, spec.column),
        }
    }

    /// Canonical encoding fed into the unit checksum. Any change to the
    /// declared content must change this string.
    fn fingerprint(&self) -> String {
        match self {
            Self::CreateTable {
                table,
                columns,
                indexes,
            } => {
                let columns = columns.iter().map(|c| c.render()).collect::<Vec<_>>();
                let indexes = indexes
                    .iter()
                    .map(|i| i.render(table))
                    .collect::<Vec<_>>();
                format!(
                    "create-table:{}:[{}]:[{}]",
                    table,
                    columns.join(","),
                    indexes.join(",")
                )
            }
            Self::AddColumn { table, column } => {
                format!("add-column:{}:{}", table, column.render())
            }
            Self::ModifyColumn {
                table,
                column,
                skip_if_type_matches,
            } => format!(
                "modify-column:{}:{}:{}",
                table,
                column.render(),
                skip_if_type_matches
            ),
            Self::AddIndex { table, index } => {
                format!("add-index:{}:{}", table, index.render(table))
            }
            Self::AddConstraint { table, name, kind } => {
                format!("add-constraint:{}:{}:{:?}", table, name, kind)
            }
            Self::Backfill(spec) => format!(
                "backfill:{}:{}:{}:{}",
                spec.table,
                spec.column,
                spec.value,
                spec.guard_clause()
            ),
        }
    }
}

/// A named, ordered group of schema and data steps applied and tracked as one
/// whole.
///
/// The name must be stable across runs: it is the key under which the ledger
/// records the unit. A unit whose intent changes gets a new name; reusing a
/// name with different steps is reported as drift, never silently reapplied.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationUnit {
    name: String,
    steps: Vec<Step>,
}

impl MigrationUnit {
    pub fn new(name: impl Into<String>, steps: Vec<Step>) -> Self {
        Self {
            name: name.into(),
            steps,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// SHA-256 over the unit name and every step's canonical encoding.
    /// Changes iff the declared content changes.
    pub fn checksum(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.name.as_bytes());
        for step in &self.steps {
            hasher.update(b"|");
            hasher.update(step.fingerprint().as_bytes());
        }
        format!("{:x}", hasher.finalize())
    }

    /// Every table named by this unit's steps, used to scope snapshots.
    pub fn tables_touched(&self) -> BTreeSet<String> {
        self.steps.iter().map(|s| s.table().to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn users_unit() -> MigrationUnit {
        MigrationUnit::new(
            "create_users",
            vec![Step::create_table(
                "users",
                vec![
                    ColumnSpec::new("id", "INTEGER").primary_key(),
                    ColumnSpec::new("name", "TEXT").not_null(),
                ],
            )],
        )
    }

    #[test]
    fn checksum_is_stable_for_identical_content() {
        assert_eq!(users_unit().checksum(), users_unit().checksum());
    }

    #[test]
    fn checksum_changes_when_steps_change() {
        let changed = MigrationUnit::new(
            "create_users",
            vec![Step::create_table(
                "users",
                vec![
                    ColumnSpec::new("id", "INTEGER").primary_key(),
                    ColumnSpec::new("name", "TEXT").not_null(),
                    ColumnSpec::new("email", "TEXT"),
                ],
            )],
        );
        assert_ne!(users_unit().checksum(), changed.checksum());
    }

    #[test]
    fn checksum_changes_when_name_changes() {
        let renamed = MigrationUnit::new("create_users_v2", users_unit().steps().to_vec());
        assert_ne!(users_unit().checksum(), renamed.checksum());
    }

    #[test]
    fn column_rendering() {
        let column = ColumnSpec::new("matricule", "VARCHAR(50)")
            .unique()
            .default_value("''");
        assert_eq!(column.render(), "\"matricule\" VARCHAR(50) UNIQUE DEFAULT ''");
        // ADD COLUMN cannot carry UNIQUE in SQLite
        assert_eq!(column.render_for_add(), "\"matricule\" VARCHAR(50) DEFAULT ''");
    }

    #[test]
    fn index_rendering() {
        let index = IndexSpec::new("idx_users_name", ["name", "email"]).unique();
        assert_eq!(
            index.render("users"),
            "CREATE UNIQUE INDEX \"idx_users_name\" ON \"users\" (\"name\", \"email\")"
        );
    }

    #[test]
    fn tables_touched_collects_every_step() {
        let unit = MigrationUnit::new(
            "mixed",
            vec![
                Step::create_table("users", vec![ColumnSpec::new("id", "INTEGER")]),
                Step::add_column("grades", ColumnSpec::new("weight", "REAL")),
                Step::backfill(BackfillSpec::new("seed weights", "grades", "weight", "1.0")),
            ],
        );
        let binding = unit.tables_touched();
        let tables: Vec<&str> = binding.iter().map(|s| s.as_str()).collect();
        assert_eq!(tables, vec!["grades", "users"]);
    }

    #[test]
    fn describe_labels_name_the_change() {
        assert_eq!(
            Step::add_column("users", ColumnSpec::new("matricule", "VARCHAR(50)")).describe(),
            "add column users.matricule"
        );
        assert_eq!(
            Step::add_index("users", IndexSpec::new("idx_users_name", ["name"])).describe(),
            "add index idx_users_name on users"
        );
    }

    #[test]
    fn backfill_guard_defaults_to_null_check() {
        let spec = BackfillSpec::new("derive", "users", "matricule", "'x'");
        assert_eq!(spec.guard_clause(), "\"matricule\" IS NULL");
        let custom = spec.with_guard("matricule = ''");
        assert_eq!(custom.guard_clause(), "(matricule = '')");
    }
}
