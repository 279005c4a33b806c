//! Executes declarative data backfills.
//!
//! A backfill populates a column from other columns of the same row (or from
//! row identity) rather than changing structure. The generated UPDATE always
//! carries the step's guard, so rows that already hold a value are never
//! touched: a manually-interrupted backfill resumes, and a completed one
//! affects zero rows.

use rusqlite::Connection;

use crate::error::Error;
use crate::spec::BackfillSpec;

/// Run one backfill, returning the number of rows transformed.
///
/// After the update, any row still matching the guard means the declared
/// expression failed to produce a usable value for it; that surfaces as
/// [Error::Data] and the owning unit is not marked applied.
pub fn apply_backfill(conn: &Connection, spec: &BackfillSpec) -> Result<usize, Error> {
    let guard = spec.guard_clause();
    let rows = conn.execute(
        &format!(
            "UPDATE \"{}\" SET \"{}\" = {} WHERE {}",
            spec.table, spec.column, spec.value, guard
        ),
        [],
    )?;

    let remaining: i64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM \"{}\" WHERE {}", spec.table, guard),
        [],
        |row| row.get(0),
    )?;
    if remaining > 0 {
        return Err(Error::Data(format!(
            "{} row(s) in \"{}\" still match the guard after '{}'",
            remaining, spec.table, spec.description
        )));
    }
    Ok(rows)
}
