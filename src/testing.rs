//! Testing utilities for migration development and verification.
//!
//! This module provides a harness for exercising migration units against an
//! in-memory database: run the units, seed and query data, assert on the
//! resulting schema, and capture snapshots for comparison.

use rusqlite::{Connection, Row};

use crate::error::Error;
use crate::report::RunReport;
use crate::runner::Runner;
use crate::snapshot::{inspect, SchemaSnapshot, Scope};

/// A test harness wrapping a [Runner] and a scratch database.
///
/// Construct it with the same runner the production code uses; as the unit
/// list grows, assertions written against earlier units should not change.
///
/// # Example
///
/// ```
/// use tablewright::testing::MigrationTestHarness;
/// use tablewright::{ColumnSpec, MigrationUnit, Runner, Step};
///
/// # fn test() -> Result<(), tablewright::Error> {
/// let runner = Runner::new(vec![MigrationUnit::new(
///     "create_users",
///     vec![Step::create_table(
///         "users",
///         vec![
///             ColumnSpec::new("id", "INTEGER").primary_key(),
///             ColumnSpec::new("name", "TEXT"),
///         ],
///     )],
/// )]);
/// let mut harness = MigrationTestHarness::new(runner);
///
/// let report = harness.run()?;
/// assert!(report.succeeded());
///
/// harness.execute("INSERT INTO users VALUES (1, 'alice')")?;
/// harness.assert_table_exists("users")?;
/// let name: String = harness.query_one("SELECT name FROM users WHERE id = 1")?;
/// assert_eq!(name, "alice");
/// # Ok(())
/// # }
/// # test().unwrap();
/// ```
pub struct MigrationTestHarness {
    conn: Connection,
    runner: Runner,
}

impl MigrationTestHarness {
    /// Create a harness over an in-memory SQLite database.
    pub fn new(runner: Runner) -> Self {
        let conn = Connection::open_in_memory().expect("Failed to create in-memory test database");
        Self { conn, runner }
    }

    /// Create a harness with a custom connection, for file-based databases
    /// or special settings.
    pub fn with_connection(conn: Connection, runner: Runner) -> Self {
        Self { conn, runner }
    }

    /// Run every unit and return the report.
    pub fn run(&mut self) -> Result<RunReport, Error> {
        self.runner.run(&mut self.conn)
    }

    /// Direct access to the underlying connection.
    pub fn conn(&mut self) -> &mut Connection {
        &mut self.conn
    }

    /// Execute a SQL statement (for setting up test data).
    pub fn execute(&mut self, sql: &str) -> Result<usize, Error> {
        Ok(self.conn.execute(sql, [])?)
    }

    /// Query a single value from the database.
    pub fn query_one<T>(&mut self, sql: &str) -> Result<T, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let result = self.conn.query_row(sql, [], |row| row.get(0))?;
        Ok(result)
    }

    /// Query all values from a single-column result.
    pub fn query_all<T>(&mut self, sql: &str) -> Result<Vec<T>, Error>
    where
        T: rusqlite::types::FromSql,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Query with a custom row mapper.
    pub fn query_map<T, F>(&mut self, sql: &str, f: F) -> Result<Vec<T>, Error>
    where
        F: FnMut(&Row) -> rusqlite::Result<T>,
    {
        let mut stmt = self.conn.prepare(sql)?;
        let results = stmt.query_map([], f)?.collect::<Result<Vec<T>, _>>()?;
        Ok(results)
    }

    /// Assert that a table exists in the database.
    pub fn assert_table_exists(&mut self, table: &str) -> Result<(), Error> {
        let snapshot = inspect(&self.conn, &Scope::tables([table]))?;
        if snapshot.has_table(table) {
            Ok(())
        } else {
            Err(Error::Generic(format!(
                "Table '{}' does not exist",
                table
            )))
        }
    }

    /// Assert that a table does not exist in the database.
    pub fn assert_table_not_exists(&mut self, table: &str) -> Result<(), Error> {
        let snapshot = inspect(&self.conn, &Scope::tables([table]))?;
        if snapshot.has_table(table) {
            Err(Error::Generic(format!(
                "Table '{}' exists but should not",
                table
            )))
        } else {
            Ok(())
        }
    }

    /// Assert that a column exists in a table.
    pub fn assert_column_exists(&mut self, table: &str, column: &str) -> Result<(), Error> {
        let snapshot = inspect(&self.conn, &Scope::tables([table]))?;
        if snapshot.has_column(table, column) {
            Ok(())
        } else {
            Err(Error::Generic(format!(
                "Column '{}' does not exist in table '{}'",
                column, table
            )))
        }
    }

    /// Assert that an index (or a named constraint) exists on a table.
    pub fn assert_index_exists(&mut self, table: &str, index: &str) -> Result<(), Error> {
        let snapshot = inspect(&self.conn, &Scope::tables([table]))?;
        if snapshot.has_index(table, index) || snapshot.has_constraint(table, index) {
            Ok(())
        } else {
            Err(Error::Generic(format!(
                "Index '{}' does not exist on table '{}'",
                index, table
            )))
        }
    }

    /// Capture the current database schema as a snapshot.
    pub fn capture_schema(&mut self) -> Result<SchemaSnapshot, Error> {
        inspect(&self.conn, &Scope::All)
    }

    /// Assert that the current schema matches a previously captured snapshot.
    pub fn assert_schema_matches(&mut self, expected: &SchemaSnapshot) -> Result<(), Error> {
        let actual = self.capture_schema()?;
        if &actual == expected {
            Ok(())
        } else {
            Err(Error::Generic(format!(
                "Schema does not match expected snapshot.\nExpected: {:#?}\nActual: {:#?}",
                expected, actual
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ColumnSpec, IndexSpec, MigrationUnit, Step};

    fn runner() -> Runner {
        Runner::new(vec![MigrationUnit::new(
            "create_users",
            vec![Step::create_table_with_indexes(
                "users",
                vec![
                    ColumnSpec::new("id", "INTEGER").primary_key(),
                    ColumnSpec::new("name", "TEXT").not_null(),
                ],
                vec![IndexSpec::new("idx_users_name", ["name"])],
            )],
        )])
    }

    #[test]
    fn run_and_assert_schema() {
        let mut harness = MigrationTestHarness::new(runner());
        let report = harness.run().unwrap();
        assert!(report.succeeded());

        harness.assert_table_exists("users").unwrap();
        harness.assert_column_exists("users", "name").unwrap();
        harness
            .assert_index_exists("users", "idx_users_name")
            .unwrap();
        harness.assert_table_not_exists("nowhere").unwrap();
        assert!(harness.assert_table_exists("nowhere").is_err());
        assert!(harness.assert_column_exists("users", "nowhere").is_err());
    }

    #[test]
    fn query_helpers_roundtrip_data() {
        let mut harness = MigrationTestHarness::new(runner());
        harness.run().unwrap();
        harness
            .execute("INSERT INTO users VALUES (1, 'alice')")
            .unwrap();
        harness
            .execute("INSERT INTO users VALUES (2, 'bob')")
            .unwrap();

        let count: i64 = harness.query_one("SELECT COUNT(*) FROM users").unwrap();
        assert_eq!(count, 2);
        let names: Vec<String> = harness
            .query_all("SELECT name FROM users ORDER BY id")
            .unwrap();
        assert_eq!(names, vec!["alice", "bob"]);
        let pairs = harness
            .query_map("SELECT id, name FROM users ORDER BY id", |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })
            .unwrap();
        assert_eq!(pairs, vec![(1, "alice".to_string()), (2, "bob".to_string())]);
    }

    #[test]
    fn schema_capture_detects_divergence() {
        let mut harness = MigrationTestHarness::new(runner());
        harness.run().unwrap();
        let captured = harness.capture_schema().unwrap();
        harness.assert_schema_matches(&captured).unwrap();

        harness.execute("CREATE TABLE stray (id INTEGER)").unwrap();
        assert!(harness.assert_schema_matches(&captured).is_err());
    }
}
