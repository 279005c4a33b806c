use std::time::Duration;

/// Error type for the tablewright crate.
///
/// Only [Error::Connectivity] and [Error::LockHeld] abort a whole run; every
/// other variant is captured on the report of the unit or step it belongs to.
#[derive(thiserror::Error, Debug, PartialEq)]
pub enum Error {
    /// Schema metadata or the ledger store could not be read or written.
    #[error("database unreachable: {0}")]
    Connectivity(rusqlite::Error),
    /// A DDL or DML statement failed while applying a step.
    #[error("{0}")]
    Sqlite(rusqlite::Error),
    /// The ledger holds an applied entry for this unit name with different content.
    #[error("unit '{unit}' drifted: ledger recorded checksum {recorded}, supplied steps hash to {supplied}")]
    SpecDrift {
        unit: String,
        recorded: String,
        supplied: String,
    },
    /// A backfill left rows that still match its guard.
    #[error("backfill produced invalid data: {0}")]
    Data(String),
    /// A unit ran past its configured time budget.
    #[error("unit '{unit}' exceeded its time budget of {budget:?}")]
    Timeout { unit: String, budget: Duration },
    /// Another runner holds the migration lock for this database.
    #[error("another migration run holds the lock (acquired at {acquired_at})")]
    LockHeld { acquired_at: String },
    #[error("{0}")]
    Generic(String),
}

impl From<rusqlite::Error> for Error {
    fn from(value: rusqlite::Error) -> Self {
        Self::Sqlite(value)
    }
}

impl From<String> for Error {
    fn from(value: String) -> Self {
        Self::Generic(value)
    }
}
