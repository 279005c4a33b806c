//! Executes migration units against a live database.
//!
//! The runner ties the other components together: it consults the ledger,
//! takes a fresh scoped snapshot per unit, asks the diff for the steps still
//! missing, executes them, and records the outcome. Units run strictly in the
//! given order, sequentially, on a single connection.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rusqlite::{params, Connection};

use crate::backfill::apply_backfill;
use crate::diff;
use crate::error::Error;
use crate::ledger::{Ledger, LedgerEntry, LedgerStatus, DEFAULT_LEDGER_TABLE_NAME};
use crate::report::{ActionReport, RunReport, SkipReason, StepOutcome, UnitOutcome, UnitReport};
use crate::snapshot::{inspect, ColumnState, Scope};
use crate::spec::{ColumnSpec, ConstraintKind, MigrationUnit, Step};

/// Default name of the run-lock table.
pub const DEFAULT_LOCK_TABLE_NAME: &str = "_tablewright_lock_";

/// How a unit's pending steps are committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionMode {
    /// All of a unit's steps commit together; a failure rolls the whole unit
    /// back. The default, since SQLite DDL is transactional.
    PerUnit,
    /// Each step commits on its own, the way engines without transactional
    /// DDL behave. A failure leaves earlier steps applied and the unit is
    /// reported partially applied.
    PerStep,
}

/// One unit's pending work, as computed by [Runner::preview].
#[derive(Debug, Clone, PartialEq)]
pub struct UnitPreview {
    pub unit: String,
    /// Labels of the steps a run would execute, in order. Empty when the
    /// unit is already applied.
    pub pending: Vec<String>,
}

/// The entrypoint for running a sequence of [MigrationUnit]s.
///
/// Construct with the full list of units; names must be unique and non-empty.
/// Configuration follows the builder pattern and execution happens in
/// [Runner::run].
pub struct Runner {
    units: Vec<MigrationUnit>,
    ledger_table_name: String,
    lock_table_name: String,
    busy_timeout: Duration,
    unit_timeout: Option<Duration>,
    transaction_mode: TransactionMode,
    stop_on_failure: bool,
    retry_previously_failed: bool,
    cancel_flag: Option<Arc<AtomicBool>>,
    on_unit_start: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_unit_complete: Option<Box<dyn Fn(&str, Duration) + Send + Sync>>,
    on_unit_skipped: Option<Box<dyn Fn(&str) + Send + Sync>>,
    on_unit_error: Option<Box<dyn Fn(&str, &Error) + Send + Sync>>,
}

// Manual Debug impl since closures don't implement Debug
impl std::fmt::Debug for Runner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runner")
            .field("units", &self.units)
            .field("ledger_table_name", &self.ledger_table_name)
            .field("lock_table_name", &self.lock_table_name)
            .field("busy_timeout", &self.busy_timeout)
            .field("unit_timeout", &self.unit_timeout)
            .field("transaction_mode", &self.transaction_mode)
            .field("stop_on_failure", &self.stop_on_failure)
            .field("retry_previously_failed", &self.retry_previously_failed)
            .field("on_unit_start", &self.on_unit_start.is_some())
            .field("on_unit_complete", &self.on_unit_complete.is_some())
            .field("on_unit_skipped", &self.on_unit_skipped.is_some())
            .field("on_unit_error", &self.on_unit_error.is_some())
            .finish()
    }
}

impl Runner {
    /// Create a new Runner, validating unit invariants.
    /// Returns an error if unit names are empty or collide.
    pub fn try_new(units: Vec<MigrationUnit>) -> Result<Self, String> {
        let mut seen = BTreeSet::new();
        for unit in &units {
            if unit.name().trim().is_empty() {
                return Err("Migration unit name must not be empty".to_string());
            }
            if !seen.insert(unit.name().to_string()) {
                return Err(format!(
                    "Duplicate migration unit name found: {}",
                    unit.name()
                ));
            }
        }

        Ok(Self {
            units,
            ledger_table_name: DEFAULT_LEDGER_TABLE_NAME.to_string(),
            lock_table_name: DEFAULT_LOCK_TABLE_NAME.to_string(),
            busy_timeout: Duration::from_secs(30),
            unit_timeout: None,
            transaction_mode: TransactionMode::PerUnit,
            stop_on_failure: true,
            retry_previously_failed: false,
            cancel_flag: None,
            on_unit_start: None,
            on_unit_complete: None,
            on_unit_skipped: None,
            on_unit_error: None,
        })
    }

    /// Create a new Runner, panicking if unit metadata is invalid.
    /// For a non-panicking version, use `try_new`.
    pub fn new(units: Vec<MigrationUnit>) -> Self {
        match Self::try_new(units) {
            Ok(runner) => runner,
            Err(err) => panic!("{}", err),
        }
    }

    /// Set a custom name for the ledger table.
    /// Defaults to "_tablewright_ledger_".
    pub fn with_ledger_table_name(mut self, name: impl Into<String>) -> Self {
        self.ledger_table_name = name.into();
        self
    }

    /// Set a custom name for the run-lock table.
    /// Defaults to "_tablewright_lock_".
    pub fn with_lock_table_name(mut self, name: impl Into<String>) -> Self {
        self.lock_table_name = name.into();
        self
    }

    /// Set the busy timeout for database operations, controlling how long
    /// concurrent access waits for locks. Defaults to 30 seconds.
    pub fn with_busy_timeout(mut self, timeout: Duration) -> Self {
        self.busy_timeout = timeout;
        self
    }

    /// Give every unit a time budget. The budget is checked between steps;
    /// once exceeded the unit stops with a timeout cause instead of running
    /// its remaining steps.
    pub fn with_unit_timeout(mut self, timeout: Duration) -> Self {
        self.unit_timeout = Some(timeout);
        self
    }

    pub fn with_transaction_mode(mut self, mode: TransactionMode) -> Self {
        self.transaction_mode = mode;
        self
    }

    /// Whether a failed unit aborts the rest of the run. Defaults to true;
    /// aborted units still appear in the report as not run.
    pub fn stop_on_failure(mut self, stop: bool) -> Self {
        self.stop_on_failure = stop;
        self
    }

    /// Allow units the ledger records as failed to run again. Off by
    /// default: a failed entry needs operator resolution, either through
    /// this flag or [Runner::mark_resolved].
    pub fn retry_previously_failed(mut self, retry: bool) -> Self {
        self.retry_previously_failed = retry;
        self
    }

    /// Install a cancellation flag. When set, the run stops before the next
    /// unit starts; the unit in flight always finishes.
    pub fn with_cancel_flag(mut self, flag: Arc<AtomicBool>) -> Self {
        self.cancel_flag = Some(flag);
        self
    }

    /// Set a callback invoked when a unit starts executing.
    pub fn on_unit_start<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_unit_start = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a unit completes successfully.
    /// The callback receives the unit name and duration.
    pub fn on_unit_complete<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, Duration) + Send + Sync + 'static,
    {
        self.on_unit_complete = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a unit is skipped, either because the
    /// ledger already records it or because every step was found satisfied.
    pub fn on_unit_skipped<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_unit_skipped = Some(Box::new(callback));
        self
    }

    /// Set a callback invoked when a unit fails, drifts or is refused.
    pub fn on_unit_error<F>(mut self, callback: F) -> Self
    where
        F: Fn(&str, &Error) + Send + Sync + 'static,
    {
        self.on_unit_error = Some(Box::new(callback));
        self
    }

    /// Get a reference to all units in this runner.
    pub fn units(&self) -> &[MigrationUnit] {
        &self.units
    }

    /// Which steps each unit would execute, without running anything.
    pub fn preview(&self, conn: &Connection) -> Result<Vec<UnitPreview>, Error> {
        let ledger = Ledger::new(self.ledger_table_name.clone());
        let mut previews = Vec::with_capacity(self.units.len());
        for unit in &self.units {
            if let Some(entry) = ledger.entry(conn, unit.name())? {
                if entry.status == LedgerStatus::Applied && entry.checksum == unit.checksum() {
                    previews.push(UnitPreview {
                        unit: unit.name().to_string(),
                        pending: Vec::new(),
                    });
                    continue;
                }
            }
            let snapshot = inspect(conn, &Scope::Tables(unit.tables_touched()))?;
            previews.push(UnitPreview {
                unit: unit.name().to_string(),
                pending: diff::pending(unit, &snapshot)
                    .iter()
                    .map(|s| s.describe())
                    .collect(),
            });
        }
        Ok(previews)
    }

    /// The ledger's record of every unit that has run, oldest first.
    pub fn history(&self, conn: &Connection) -> Result<Vec<LedgerEntry>, Error> {
        Ledger::new(self.ledger_table_name.clone()).entries(conn)
    }

    /// Clear a failed ledger entry so the unit can run again.
    pub fn mark_resolved(&self, conn: &Connection, unit: &str) -> Result<(), Error> {
        Ledger::new(self.ledger_table_name.clone()).mark_resolved(conn, unit)
    }

    /// Run every unit in order and return the per-unit, per-step report.
    ///
    /// Step failures never abort the run; they are captured on the report
    /// and the unit outcome reflects them. Only an unreachable store or a
    /// held run lock makes this return `Err`.
    pub fn run(&self, conn: &mut Connection) -> Result<RunReport, Error> {
        conn.busy_timeout(self.busy_timeout)
            .map_err(Error::Connectivity)?;
        self.acquire_lock(conn)?;
        let result = self.run_locked(conn);
        self.release_lock(conn);
        result
    }

    fn run_locked(&self, conn: &mut Connection) -> Result<RunReport, Error> {
        let ledger = Ledger::new(self.ledger_table_name.clone());
        ledger.ensure(conn)?;

        #[cfg(feature = "tracing")]
        tracing::debug!(
            units = ?self.units.iter().map(|u| u.name()).collect::<Vec<_>>(),
            transaction_mode = ?self.transaction_mode,
            "Considering migration units to run"
        );

        let mut reports = Vec::with_capacity(self.units.len());
        let mut halted = false;
        for unit in &self.units {
            if !halted && self.cancelled() {
                #[cfg(feature = "tracing")]
                tracing::info!("Run cancelled between units");
                halted = true;
            }
            if halted {
                reports.push(UnitReport::without_actions(
                    unit.name(),
                    UnitOutcome::NotRun,
                    None,
                ));
                continue;
            }

            let report = self.run_unit(conn, &ledger, unit)?;
            let ok = matches!(
                report.outcome,
                UnitOutcome::Applied | UnitOutcome::AlreadyApplied
            );
            reports.push(report);
            if !ok && self.stop_on_failure {
                halted = true;
            }
        }
        Ok(RunReport { units: reports })
    }

    fn run_unit(
        &self,
        conn: &mut Connection,
        ledger: &Ledger,
        unit: &MigrationUnit,
    ) -> Result<UnitReport, Error> {
        #[cfg(feature = "tracing")]
        let _span = tracing::info_span!("unit_apply", unit = %unit.name()).entered();

        let checksum = unit.checksum();
        if let Some(entry) = ledger.entry(conn, unit.name())? {
            match entry.status {
                LedgerStatus::Applied => {
                    if entry.checksum == checksum {
                        #[cfg(feature = "tracing")]
                        tracing::debug!("Skipping unit (ledger records it applied)");
                        if let Some(callback) = &self.on_unit_skipped {
                            callback(unit.name());
                        }
                        let actions = unit
                            .steps()
                            .iter()
                            .map(|s| ActionReport::skipped(s, SkipReason::UnitAlreadyApplied))
                            .collect();
                        return Ok(UnitReport {
                            unit: unit.name().to_string(),
                            outcome: UnitOutcome::AlreadyApplied,
                            actions,
                            error: None,
                        });
                    }
                    let error = Error::SpecDrift {
                        unit: unit.name().to_string(),
                        recorded: entry.checksum,
                        supplied: checksum,
                    };
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Refusing drifted unit");
                    if let Some(callback) = &self.on_unit_error {
                        callback(unit.name(), &error);
                    }
                    return Ok(UnitReport::without_actions(
                        unit.name(),
                        UnitOutcome::Drifted,
                        Some(error),
                    ));
                }
                LedgerStatus::Failed if !self.retry_previously_failed => {
                    let error = Error::Generic(format!(
                        "unit '{}' failed on a previous run; resolve it and re-run with \
                         retry_previously_failed, or clear it with mark_resolved",
                        unit.name()
                    ));
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %error, "Refusing previously-failed unit");
                    if let Some(callback) = &self.on_unit_error {
                        callback(unit.name(), &error);
                    }
                    return Ok(UnitReport::without_actions(
                        unit.name(),
                        UnitOutcome::FailedPreviously,
                        Some(error),
                    ));
                }
                LedgerStatus::Failed => {
                    #[cfg(feature = "tracing")]
                    tracing::info!("Re-running previously-failed unit");
                }
            }
        }

        if let Some(callback) = &self.on_unit_start {
            callback(unit.name());
        }
        #[cfg(feature = "tracing")]
        tracing::info!("Starting migration unit");

        // One fresh snapshot per unit: earlier units may have changed the
        // tables this one touches.
        let snapshot = inspect(conn, &Scope::Tables(unit.tables_touched()))?;
        let satisfied: Vec<bool> = unit
            .steps()
            .iter()
            .map(|step| diff::satisfied(step, &snapshot))
            .collect();

        if satisfied.iter().all(|s| *s) {
            // Everything already present: stamp the unit without executing.
            #[cfg(feature = "tracing")]
            tracing::info!("Every step already satisfied, stamping unit");
            if let Some(callback) = &self.on_unit_skipped {
                callback(unit.name());
            }
            ledger.record(conn, unit.name(), &checksum, LedgerStatus::Applied)?;
            let actions = unit
                .steps()
                .iter()
                .map(|s| ActionReport::skipped(s, SkipReason::AlreadySatisfied))
                .collect();
            return Ok(UnitReport {
                unit: unit.name().to_string(),
                outcome: UnitOutcome::Applied,
                actions,
                error: None,
            });
        }

        match self.transaction_mode {
            TransactionMode::PerUnit => {
                self.run_unit_transactional(conn, ledger, unit, &checksum, &satisfied)
            }
            TransactionMode::PerStep => {
                self.run_unit_per_step(conn, ledger, unit, &checksum, &satisfied)
            }
        }
    }

    fn run_unit_transactional(
        &self,
        conn: &mut Connection,
        ledger: &Ledger,
        unit: &MigrationUnit,
        checksum: &str,
        satisfied: &[bool],
    ) -> Result<UnitReport, Error> {
        let started = Instant::now();
        let total = unit.steps().len();
        let mut actions: Vec<ActionReport> = Vec::with_capacity(total);
        let mut unit_error: Option<Error> = None;
        let mut step_failed = false;

        let tx = conn.transaction().map_err(Error::Connectivity)?;
        for (idx, step) in unit.steps().iter().enumerate() {
            if satisfied[idx] {
                actions.push(ActionReport::skipped(step, SkipReason::AlreadySatisfied));
                continue;
            }
            if let Some(error) = self.budget_exceeded(unit.name(), started) {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "Unit ran out of time budget");
                if let Some(callback) = &self.on_unit_error {
                    callback(unit.name(), &error);
                }
                unit_error = Some(error);
                break;
            }
            match execute_step(&tx, step) {
                Ok(rows_affected) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(step = %step.describe(), "Step applied");
                    actions.push(ActionReport::applied(step, rows_affected));
                }
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(step = %step.describe(), error = %error, "Step failed");
                    if let Some(callback) = &self.on_unit_error {
                        callback(unit.name(), &error);
                    }
                    actions.push(ActionReport::failed(step, error));
                    step_failed = true;
                    break;
                }
            }
        }

        if !step_failed && unit_error.is_none() {
            // Stamp the ledger inside the same transaction as the steps.
            ledger.record(&tx, unit.name(), checksum, LedgerStatus::Applied)?;
            match tx.commit() {
                Ok(()) => {
                    let elapsed = started.elapsed();
                    #[cfg(feature = "tracing")]
                    tracing::info!(duration_ms = elapsed.as_millis(), "Unit applied");
                    if let Some(callback) = &self.on_unit_complete {
                        callback(unit.name(), elapsed);
                    }
                    return Ok(UnitReport {
                        unit: unit.name().to_string(),
                        outcome: UnitOutcome::Applied,
                        actions,
                        error: None,
                    });
                }
                Err(e) => {
                    let error = Error::Sqlite(e);
                    if let Some(callback) = &self.on_unit_error {
                        callback(unit.name(), &error);
                    }
                    unit_error = Some(error);
                }
            }
        } else {
            // Dropping the transaction rolls the unit back.
            drop(tx);
        }

        for action in &mut actions {
            if matches!(action.outcome, StepOutcome::Applied { .. }) {
                action.outcome = StepOutcome::RolledBack;
            }
        }
        pad_not_attempted(&mut actions, unit);
        ledger.record(conn, unit.name(), checksum, LedgerStatus::Failed)?;
        Ok(UnitReport {
            unit: unit.name().to_string(),
            outcome: UnitOutcome::Failed,
            actions,
            error: unit_error,
        })
    }

    fn run_unit_per_step(
        &self,
        conn: &mut Connection,
        ledger: &Ledger,
        unit: &MigrationUnit,
        checksum: &str,
        satisfied: &[bool],
    ) -> Result<UnitReport, Error> {
        let started = Instant::now();
        let total = unit.steps().len();
        let mut actions: Vec<ActionReport> = Vec::with_capacity(total);
        let mut unit_error: Option<Error> = None;
        let mut step_failed = false;

        for (idx, step) in unit.steps().iter().enumerate() {
            if satisfied[idx] {
                actions.push(ActionReport::skipped(step, SkipReason::AlreadySatisfied));
                continue;
            }
            if let Some(error) = self.budget_exceeded(unit.name(), started) {
                #[cfg(feature = "tracing")]
                tracing::error!(error = %error, "Unit ran out of time budget");
                if let Some(callback) = &self.on_unit_error {
                    callback(unit.name(), &error);
                }
                unit_error = Some(error);
                break;
            }
            match execute_step(conn, step) {
                Ok(rows_affected) => {
                    #[cfg(feature = "tracing")]
                    tracing::debug!(step = %step.describe(), "Step applied");
                    actions.push(ActionReport::applied(step, rows_affected));
                }
                Err(error) => {
                    #[cfg(feature = "tracing")]
                    tracing::error!(step = %step.describe(), error = %error, "Step failed");
                    if let Some(callback) = &self.on_unit_error {
                        callback(unit.name(), &error);
                    }
                    actions.push(ActionReport::failed(step, error));
                    step_failed = true;
                    break;
                }
            }
        }

        if !step_failed && unit_error.is_none() {
            ledger.record(conn, unit.name(), checksum, LedgerStatus::Applied)?;
            let elapsed = started.elapsed();
            #[cfg(feature = "tracing")]
            tracing::info!(duration_ms = elapsed.as_millis(), "Unit applied");
            if let Some(callback) = &self.on_unit_complete {
                callback(unit.name(), elapsed);
            }
            return Ok(UnitReport {
                unit: unit.name().to_string(),
                outcome: UnitOutcome::Applied,
                actions,
                error: None,
            });
        }

        // Steps that committed stay committed; report exactly which.
        let any_applied = actions
            .iter()
            .any(|a| matches!(a.outcome, StepOutcome::Applied { .. }));
        pad_not_attempted(&mut actions, unit);
        ledger.record(conn, unit.name(), checksum, LedgerStatus::Failed)?;
        Ok(UnitReport {
            unit: unit.name().to_string(),
            outcome: if any_applied {
                UnitOutcome::PartiallyApplied
            } else {
                UnitOutcome::Failed
            },
            actions,
            error: unit_error,
        })
    }

    fn budget_exceeded(&self, unit: &str, started: Instant) -> Option<Error> {
        let budget = self.unit_timeout?;
        if started.elapsed() >= budget {
            Some(Error::Timeout {
                unit: unit.to_string(),
                budget,
            })
        } else {
            None
        }
    }

    fn cancelled(&self) -> bool {
        self.cancel_flag
            .as_ref()
            .map(|flag| flag.load(Ordering::SeqCst))
            .unwrap_or(false)
    }

    /// Take the run lock, so two operators or two deploy pipelines cannot
    /// race structural changes against the same database.
    fn acquire_lock(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    acquired_at TEXT NOT NULL
                )",
                self.lock_table_name
            ),
            [],
        )
        .map_err(Error::Connectivity)?;

        let acquired_at = Utc::now().to_rfc3339();
        match conn.execute(
            &format!(
                "INSERT INTO {} (id, acquired_at) VALUES (1, ?1)",
                self.lock_table_name
            ),
            params![acquired_at],
        ) {
            Ok(_) => Ok(()),
            Err(e) if is_constraint_violation(&e) => {
                let held_since: String = conn
                    .query_row(
                        &format!("SELECT acquired_at FROM {}", self.lock_table_name),
                        [],
                        |row| row.get(0),
                    )
                    .unwrap_or_else(|_| "unknown".to_string());
                Err(Error::LockHeld {
                    acquired_at: held_since,
                })
            }
            Err(e) => Err(Error::Connectivity(e)),
        }
    }

    /// Best-effort release; runs on every exit path of [Runner::run].
    fn release_lock(&self, conn: &Connection) {
        let _ = conn.execute(&format!("DELETE FROM {}", self.lock_table_name), []);
    }
}

fn pad_not_attempted(actions: &mut Vec<ActionReport>, unit: &MigrationUnit) {
    for step in unit.steps().iter().skip(actions.len()) {
        actions.push(ActionReport::not_attempted(step));
    }
}

fn is_constraint_violation(error: &rusqlite::Error) -> bool {
    matches!(
        error,
        rusqlite::Error::SqliteFailure(e, _) if e.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

/// Execute one step. Returns the affected row count for backfills.
fn execute_step(conn: &Connection, step: &Step) -> Result<Option<usize>, Error> {
    match step {
        Step::CreateTable {
            table,
            columns,
            indexes,
        } => {
            let defs: Vec<String> = columns.iter().map(|c| c.render()).collect();
            conn.execute(
                &format!("CREATE TABLE \"{}\" ({})", table, defs.join(", ")),
                [],
            )?;
            for index in indexes {
                conn.execute(&index.render(table), [])?;
            }
            Ok(None)
        }
        Step::AddColumn { table, column } => {
            conn.execute(
                &format!(
                    "ALTER TABLE \"{}\" ADD COLUMN {}",
                    table,
                    column.render_for_add()
                ),
                [],
            )?;
            // SQLite cannot add a UNIQUE column in place; enforce through an
            // index under a derived name.
            if column.unique {
                conn.execute(
                    &format!(
                        "CREATE UNIQUE INDEX IF NOT EXISTS \"{}_{}_key\" ON \"{}\" (\"{}\")",
                        table, column.name, table, column.name
                    ),
                    [],
                )?;
            }
            Ok(None)
        }
        Step::ModifyColumn { table, column, .. } => {
            rebuild_with_column(conn, table, column)?;
            Ok(None)
        }
        Step::AddIndex { table, index } => {
            conn.execute(&index.render(table), [])?;
            Ok(None)
        }
        Step::AddConstraint { table, name, kind } => {
            match kind {
                ConstraintKind::Unique { columns } => {
                    let cols = columns
                        .iter()
                        .map(|c| format!("\"{}\"", c))
                        .collect::<Vec<_>>()
                        .join(", ");
                    conn.execute(
                        &format!("CREATE UNIQUE INDEX \"{}\" ON \"{}\" ({})", name, table, cols),
                        [],
                    )?;
                }
                ConstraintKind::ForeignKey { .. } => {
                    return Err(Error::Generic(format!(
                        "sqlite cannot add foreign key \"{}\" to existing table \"{}\"; \
                         declare it when the table is created",
                        name, table
                    )));
                }
                ConstraintKind::Check { .. } => {
                    return Err(Error::Generic(format!(
                        "sqlite cannot add check constraint \"{}\" to existing table \"{}\"; \
                         declare it when the table is created",
                        name, table
                    )));
                }
            }
            Ok(None)
        }
        Step::Backfill(spec) => apply_backfill(conn, spec).map(Some),
    }
}

/// SQLite has no MODIFY COLUMN; rebuild the table with the new definition
/// substituted, copy the rows, swap names, and re-create the explicitly
/// created indexes. Live metadata is read here rather than taken from the
/// unit's snapshot, since earlier steps of the unit may have changed it.
fn rebuild_with_column(conn: &Connection, table: &str, new_def: &ColumnSpec) -> Result<(), Error> {
    let live = read_live_columns(conn, table)?;
    if live.is_empty() {
        return Err(Error::Generic(format!(
            "cannot modify a column on missing table \"{}\"",
            table
        )));
    }
    let target = live
        .iter()
        .position(|c| c.name.eq_ignore_ascii_case(&new_def.name))
        .ok_or_else(|| {
            Error::Generic(format!(
                "cannot modify missing column \"{}\" on \"{}\"",
                new_def.name, table
            ))
        })?;

    let pk_count = live.iter().filter(|c| c.primary_key).count();
    let inline_pk = pk_count <= 1;
    let mut defs: Vec<String> = Vec::with_capacity(live.len() + 1);
    for (idx, column) in live.iter().enumerate() {
        if idx == target {
            defs.push(new_def.render());
        } else {
            defs.push(column.render(inline_pk));
        }
    }
    if !inline_pk {
        let pk_cols = live
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| format!("\"{}\"", c.name))
            .collect::<Vec<_>>()
            .join(", ");
        defs.push(format!("PRIMARY KEY ({})", pk_cols));
    }

    // Index DDL to replay after the swap. Constraint-enforcing automatic
    // indexes carry no sql and are reproduced by the column definitions.
    let index_sql: Vec<String> = {
        let mut stmt = conn.prepare(
            "SELECT sql FROM sqlite_master WHERE type = 'index' \
             AND tbl_name = ?1 COLLATE NOCASE AND sql IS NOT NULL",
        )?;
        let x = stmt.query_map([table], |row| row.get(0))?
            .collect::<Result<_, _>>()?;
        x
    };

    let staging = format!("{}__rebuild", table);
    let names = live
        .iter()
        .map(|c| format!("\"{}\"", c.name))
        .collect::<Vec<_>>()
        .join(", ");
    conn.execute(
        &format!("CREATE TABLE \"{}\" ({})", staging, defs.join(", ")),
        [],
    )?;
    conn.execute(
        &format!(
            "INSERT INTO \"{}\" ({}) SELECT {} FROM \"{}\"",
            staging, names, names, table
        ),
        [],
    )?;
    conn.execute(&format!("DROP TABLE \"{}\"", table), [])?;
    conn.execute(
        &format!("ALTER TABLE \"{}\" RENAME TO \"{}\"", staging, table),
        [],
    )?;
    for sql in index_sql {
        conn.execute(&sql, [])?;
    }
    Ok(())
}

fn read_live_columns(conn: &Connection, table: &str) -> Result<Vec<ColumnState>, Error> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info(\"{}\")", table))?;
    let columns = stmt
        .query_map([], |row| {
            Ok(ColumnState {
                name: row.get(1)?,
                type_name: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })?
        .collect::<Result<_, _>>()?;
    Ok(columns)
}
