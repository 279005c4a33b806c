#![cfg_attr(docsrs, feature(doc_cfg))]
//! `tablewright` is an idempotent schema-migration engine for SQLite.
//!
//! Core concepts:
//! - Desired schema changes are *declared*, not scripted: a [MigrationUnit] is
//!   a named, ordered group of [Step]s (create table, add column, add index,
//!   backfill, ...). The engine inspects live metadata, computes which steps
//!   are still missing, and applies only those.
//! - A persisted ledger records which units have completed, so data backfills
//!   are never re-run and a unit whose declaration changed under a recorded
//!   name is refused as drift instead of silently reapplied.
//!
//! # Motivation
//!
//! Idempotent setup scripts tend to accumulate the same boilerplate: probe
//! `sqlite_master` for a table, probe `table_info` for a column, wrap every
//! statement in its own error check, print and continue. Each script
//! reimplements the probing slightly differently and none of them track what
//! already ran. Declaring the desired state once moves all of that into one
//! engine: the existence checks become a mechanical diff, the error handling
//! becomes a structured per-step report, and completion is recorded in a
//! ledger table.
//!
//! # Example
//!
//! ```
//! use tablewright::{ColumnSpec, MigrationUnit, Runner, Step, UnitOutcome};
//! use rusqlite::Connection;
//!
//! let unit = MigrationUnit::new(
//!     "create_users",
//!     vec![Step::create_table(
//!         "users",
//!         vec![
//!             ColumnSpec::new("id", "INTEGER").primary_key(),
//!             ColumnSpec::new("name", "TEXT"),
//!         ],
//!     )],
//! );
//!
//! let runner = Runner::new(vec![unit]);
//! let mut conn = Connection::open_in_memory().unwrap();
//!
//! let report = runner.run(&mut conn).unwrap();
//! assert_eq!(report.exit_code(), 0);
//! assert_eq!(report.units[0].outcome, UnitOutcome::Applied);
//!
//! // the schema is in place
//! let mut stmt = conn.prepare("PRAGMA table_info(users)").unwrap();
//! let columns = stmt
//!     .query_map([], |row| row.get::<_, String>(1))
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(columns, vec!["id", "name"]);
//!
//! // a second run changes nothing: the ledger short-circuits the unit
//! let report = runner.run(&mut conn).unwrap();
//! assert_eq!(report.units[0].outcome, UnitOutcome::AlreadyApplied);
//! ```
//!
//! Backfills derive data for rows that don't have it yet, with a guard that
//! makes them safe to resume:
//!
//! ```
//! use tablewright::{BackfillSpec, ColumnSpec, MigrationUnit, Runner, Step};
//! use rusqlite::Connection;
//!
//! let mut conn = Connection::open_in_memory().unwrap();
//! conn.execute_batch(
//!     "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT);
//!      INSERT INTO users (id, name) VALUES (1, 'alice');",
//! )
//! .unwrap();
//!
//! let rollout = MigrationUnit::new(
//!     "matricule_rollout",
//!     vec![
//!         Step::add_column("users", ColumnSpec::new("matricule", "VARCHAR(50)")),
//!         Step::backfill(BackfillSpec::new(
//!             "derive matricule from row id",
//!             "users",
//!             "matricule",
//!             "'REG-' || printf('%05d', \"id\")",
//!         )),
//!     ],
//! );
//!
//! let report = Runner::new(vec![rollout]).run(&mut conn).unwrap();
//! assert!(report.succeeded());
//!
//! let matricule: String = conn
//!     .query_row("SELECT matricule FROM users WHERE id = 1", [], |row| row.get(0))
//!     .unwrap();
//! assert_eq!(matricule, "REG-00001");
//! ```
//!
//! # Failure handling
//!
//! Step errors never crash a run: each step's outcome lands on the report and
//! the unit ends `Failed` (rolled back) or `PartiallyApplied` (per-step
//! commits), with `RunReport::exit_code` reflecting the whole run. A unit the
//! ledger records as failed is refused until an operator resolves it. See
//! [Runner] for the execution model, locking and timeouts.
//!
//! # Features
//!
//! - `testing` - the [testing] harness and serde derives on schema snapshots.
//! - `tracing` - structured spans and events through the `tracing` crate.

mod backfill;
mod diff;
mod error;
mod ledger;
mod report;
mod runner;
mod snapshot;
mod spec;

pub use backfill::apply_backfill;
pub use diff::{pending, satisfied};
pub use error::Error;
pub use ledger::{Ledger, LedgerEntry, LedgerStatus, DEFAULT_LEDGER_TABLE_NAME};
pub use report::{ActionReport, RunReport, SkipReason, StepOutcome, UnitOutcome, UnitReport};
pub use runner::{Runner, TransactionMode, UnitPreview, DEFAULT_LOCK_TABLE_NAME};
pub use snapshot::{inspect, ColumnState, IndexState, Scope, SchemaSnapshot, TableState};
pub use spec::{BackfillSpec, ColumnSpec, ConstraintKind, IndexSpec, MigrationUnit, Step};

#[cfg(feature = "testing")]
#[cfg_attr(docsrs, doc(cfg(feature = "testing")))]
pub mod testing;
