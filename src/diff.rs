//! Computes which steps of a unit are still missing from a live schema.
//!
//! This replaces the hand-written existence probe every migration script used
//! to carry: satisfaction is decided mechanically from the declared step and
//! a [SchemaSnapshot], with no side effects.

use crate::snapshot::SchemaSnapshot;
use crate::spec::{MigrationUnit, Step};

/// Whether a single step's effect is already present in the snapshot.
///
/// Presence-by-name is the idempotency key for structural steps: an existing
/// column or index satisfies its step even if its definition differs, which
/// matches how re-runnable setup scripts have always probed. `ModifyColumn`
/// is re-issued unless its type marker is set and matches, and backfills are
/// never decided from schema alone (the ledger gates them at unit level,
/// avoiding a data scan on every run).
pub fn satisfied(step: &Step, snapshot: &SchemaSnapshot) -> bool {
    match step {
        Step::CreateTable { table, .. } => snapshot.has_table(table),
        Step::AddColumn { table, column } => snapshot.has_column(table, &column.name),
        Step::ModifyColumn {
            table,
            column,
            skip_if_type_matches,
        } => {
            *skip_if_type_matches
                && snapshot
                    .column(table, &column.name)
                    .map(|live| live.type_name.eq_ignore_ascii_case(&column.sql_type))
                    .unwrap_or(false)
        }
        Step::AddIndex { table, index } => snapshot.has_index(table, &index.name),
        Step::AddConstraint { table, name, .. } => snapshot.has_constraint(table, name),
        Step::Backfill(_) => false,
    }
}

/// The subsequence of `unit`'s steps not yet satisfied by `snapshot`, in
/// declaration order. Steps are never reordered: later steps may depend on
/// earlier ones.
pub fn pending<'u>(unit: &'u MigrationUnit, snapshot: &SchemaSnapshot) -> Vec<&'u Step> {
    unit.steps()
        .iter()
        .filter(|step| !satisfied(step, snapshot))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{inspect, Scope};
    use crate::spec::{BackfillSpec, ColumnSpec, IndexSpec};
    use rusqlite::Connection;

    fn snapshot_of(setup: &str) -> SchemaSnapshot {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(setup).unwrap();
        inspect(&conn, &Scope::All).unwrap()
    }

    #[test]
    fn create_table_satisfied_by_presence_alone() {
        let snapshot = snapshot_of("CREATE TABLE users (id INTEGER)");
        // declared columns are not re-verified once the table exists
        let step = Step::create_table(
            "users",
            vec![
                ColumnSpec::new("id", "INTEGER"),
                ColumnSpec::new("name", "TEXT"),
            ],
        );
        assert!(satisfied(&step, &snapshot));
    }

    #[test]
    fn add_column_keys_on_column_name() {
        let snapshot = snapshot_of("CREATE TABLE users (id INTEGER, name TEXT)");
        let present = Step::add_column("users", ColumnSpec::new("name", "VARCHAR(99)"));
        let missing = Step::add_column("users", ColumnSpec::new("matricule", "VARCHAR(50)"));
        assert!(satisfied(&present, &snapshot));
        assert!(!satisfied(&missing, &snapshot));
    }

    #[test]
    fn modify_column_reissued_without_marker() {
        let snapshot = snapshot_of("CREATE TABLE users (id INTEGER, note TEXT)");
        let step = Step::modify_column("users", ColumnSpec::new("note", "TEXT"));
        assert!(!satisfied(&step, &snapshot));
    }

    #[test]
    fn modify_column_marker_skips_on_type_match() {
        let snapshot = snapshot_of("CREATE TABLE users (id INTEGER, note TEXT)");
        let matching =
            Step::modify_column_if_type_differs("users", ColumnSpec::new("note", "text"));
        let differing =
            Step::modify_column_if_type_differs("users", ColumnSpec::new("note", "VARCHAR(255)"));
        assert!(satisfied(&matching, &snapshot));
        assert!(!satisfied(&differing, &snapshot));
    }

    #[test]
    fn add_index_and_constraint_key_on_name() {
        let snapshot = snapshot_of(
            "CREATE TABLE users (id INTEGER, email TEXT);
             CREATE UNIQUE INDEX uq_users_email ON users (email);",
        );
        assert!(satisfied(
            &Step::add_index("users", IndexSpec::new("uq_users_email", ["email"])),
            &snapshot
        ));
        assert!(satisfied(
            &Step::add_unique_constraint("users", "uq_users_email", ["email"]),
            &snapshot
        ));
        assert!(!satisfied(
            &Step::add_index("users", IndexSpec::new("idx_users_name", ["name"])),
            &snapshot
        ));
    }

    #[test]
    fn backfill_is_never_satisfied_from_schema() {
        let snapshot = snapshot_of("CREATE TABLE users (id INTEGER, matricule TEXT)");
        let step = Step::backfill(BackfillSpec::new(
            "derive matricule",
            "users",
            "matricule",
            "'REG-' || id",
        ));
        assert!(!satisfied(&step, &snapshot));
    }

    #[test]
    fn pending_preserves_declaration_order() {
        let snapshot = snapshot_of("CREATE TABLE users (id INTEGER)");
        let unit = MigrationUnit::new(
            "mixed",
            vec![
                Step::create_table("users", vec![ColumnSpec::new("id", "INTEGER")]),
                Step::add_column("users", ColumnSpec::new("matricule", "VARCHAR(50)")),
                Step::add_index("users", IndexSpec::new("idx_users_matricule", ["matricule"])),
            ],
        );
        let pending = pending(&unit, &snapshot);
        let labels: Vec<String> = pending.iter().map(|s| s.describe()).collect();
        assert_eq!(
            labels,
            vec![
                "add column users.matricule",
                "add index idx_users_matricule on users"
            ]
        );
    }
}
