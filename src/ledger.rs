//! The persisted record of which units have run.
//!
//! The ledger is the single source of truth for "has this unit completed".
//! Live-schema checks alone cannot safely gate data backfills, so the runner
//! consults the ledger before re-running anything and records every outcome
//! here. The ledger's own table is provisioned with the same create-if-missing
//! idiom as any unit, always before user units run.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};

use crate::error::Error;

/// Default name of the ledger table.
pub const DEFAULT_LEDGER_TABLE_NAME: &str = "_tablewright_ledger_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerStatus {
    Applied,
    Failed,
}

impl LedgerStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::Applied => "applied",
            Self::Failed => "failed",
        }
    }

    fn parse(value: &str) -> Result<Self, Error> {
        match value {
            "applied" => Ok(Self::Applied),
            "failed" => Ok(Self::Failed),
            other => Err(Error::Generic(format!(
                "unknown ledger status '{}'",
                other
            ))),
        }
    }
}

/// One recorded unit.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEntry {
    pub unit: String,
    pub checksum: String,
    pub applied_at: DateTime<Utc>,
    pub status: LedgerStatus,
}

/// Handle on the ledger table. The runner is the sole writer.
#[derive(Debug, Clone)]
pub struct Ledger {
    table: String,
}

impl Ledger {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table
    }

    /// Create the ledger table if it does not exist yet.
    pub fn ensure(&self, conn: &Connection) -> Result<(), Error> {
        conn.execute(
            &format!(
                "CREATE TABLE IF NOT EXISTS {} (
                    name TEXT PRIMARY KEY NOT NULL,
                    checksum TEXT NOT NULL,
                    applied_at TEXT NOT NULL,
                    status TEXT NOT NULL
                )",
                self.table
            ),
            [],
        )
        .map_err(Error::Connectivity)?;
        Ok(())
    }

    fn table_exists(&self, conn: &Connection) -> Result<bool, Error> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type = 'table' AND name = ?1")
            .map_err(Error::Connectivity)?;
        let exists = stmt
            .query([&self.table])
            .map_err(Error::Connectivity)?
            .next()
            .map_err(Error::Connectivity)?
            .is_some();
        Ok(exists)
    }

    /// Look up one unit. Reads against a database where the ledger was never
    /// provisioned return None rather than failing.
    pub fn entry(&self, conn: &Connection, unit: &str) -> Result<Option<LedgerEntry>, Error> {
        if !self.table_exists(conn)? {
            return Ok(None);
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT name, checksum, applied_at, status FROM {} WHERE name = ?1",
                self.table
            ))
            .map_err(Error::Connectivity)?;
        let row: Option<(String, String, String, String)> = stmt
            .query_row([unit], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map(Some)
            .or_else(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(Error::Connectivity(other)),
            })?;
        row.map(Self::entry_from_row).transpose()
    }

    pub fn is_applied(&self, conn: &Connection, unit: &str) -> Result<bool, Error> {
        Ok(matches!(
            self.entry(conn, unit)?,
            Some(LedgerEntry {
                status: LedgerStatus::Applied,
                ..
            })
        ))
    }

    pub fn checksum_of(&self, conn: &Connection, unit: &str) -> Result<Option<String>, Error> {
        Ok(self.entry(conn, unit)?.map(|e| e.checksum))
    }

    /// Insert or replace the record for a unit, stamped now.
    pub fn record(
        &self,
        conn: &Connection,
        unit: &str,
        checksum: &str,
        status: LedgerStatus,
    ) -> Result<(), Error> {
        conn.execute(
            &format!(
                "INSERT INTO {} (name, checksum, applied_at, status) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(name) DO UPDATE SET
                    checksum = excluded.checksum,
                    applied_at = excluded.applied_at,
                    status = excluded.status",
                self.table
            ),
            params![unit, checksum, Utc::now().to_rfc3339(), status.as_str()],
        )
        .map_err(Error::Connectivity)?;
        Ok(())
    }

    /// Clear a failed entry so the unit can run again. Applied entries are
    /// left untouched.
    pub fn mark_resolved(&self, conn: &Connection, unit: &str) -> Result<(), Error> {
        if !self.table_exists(conn)? {
            return Ok(());
        }
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE name = ?1 AND status = 'failed'",
                self.table
            ),
            [unit],
        )
        .map_err(Error::Connectivity)?;
        Ok(())
    }

    /// All recorded units, oldest first.
    pub fn entries(&self, conn: &Connection) -> Result<Vec<LedgerEntry>, Error> {
        if !self.table_exists(conn)? {
            return Ok(Vec::new());
        }
        let mut stmt = conn
            .prepare(&format!(
                "SELECT name, checksum, applied_at, status FROM {} ORDER BY applied_at, name",
                self.table
            ))
            .map_err(Error::Connectivity)?;
        let rows: Vec<(String, String, String, String)> = stmt
            .query_map([], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })
            .map_err(Error::Connectivity)?
            .collect::<Result<_, _>>()
            .map_err(Error::Connectivity)?;
        rows.into_iter().map(Self::entry_from_row).collect()
    }

    fn entry_from_row(
        (unit, checksum, applied_at, status): (String, String, String, String),
    ) -> Result<LedgerEntry, Error> {
        let applied_at = DateTime::parse_from_rfc3339(&applied_at)
            .map_err(|e| Error::Generic(format!("malformed ledger timestamp: {}", e)))?
            .with_timezone(&Utc);
        Ok(LedgerEntry {
            unit,
            checksum,
            applied_at,
            status: LedgerStatus::parse(&status)?,
        })
    }
}
