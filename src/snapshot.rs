//! Live schema inspection.
//!
//! [inspect] reads the database's authoritative metadata and returns a
//! normalized [SchemaSnapshot]. Absence is a valid result: a table or column
//! that does not exist simply does not appear, and an empty database yields
//! an empty snapshot. Snapshots are rebuilt fresh for every unit the runner
//! executes, since one unit's effect changes the next unit's view.

use std::collections::{BTreeMap, BTreeSet};

use rusqlite::Connection;

use crate::error::Error;

/// Which tables a snapshot should cover.
#[derive(Debug, Clone, PartialEq)]
pub enum Scope {
    All,
    Tables(BTreeSet<String>),
}

impl Scope {
    pub fn tables<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self::Tables(names.into_iter().map(Into::into).collect())
    }

    fn includes(&self, name: &str) -> bool {
        match self {
            Self::All => true,
            Self::Tables(set) => set.iter().any(|t| t.eq_ignore_ascii_case(name)),
        }
    }
}

/// A column as the database reports it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "testing", derive(serde::Serialize, serde::Deserialize))]
pub struct ColumnState {
    pub name: String,
    /// Declared type, possibly empty (SQLite allows typeless columns).
    pub type_name: String,
    pub not_null: bool,
    pub default_value: Option<String>,
    pub primary_key: bool,
}

impl ColumnState {
    /// Re-render this column as a definition, used when a table is rebuilt.
    pub(crate) fn render(&self, inline_primary_key: bool) -> String {
        let mut def = format!("\"{}\"", self.name);
        if !self.type_name.is_empty() {
            def.push(' ');
            def.push_str(&self.type_name);
        }
        if self.primary_key && inline_primary_key {
            def.push_str(" PRIMARY KEY");
        }
        if self.not_null {
            def.push_str(" NOT NULL");
        }
        if let Some(default) = &self.default_value {
            def.push_str(" DEFAULT ");
            def.push_str(default);
        }
        def
    }
}

/// An index as the database reports it.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "testing", derive(serde::Serialize, serde::Deserialize))]
pub struct IndexState {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// One table's columns, indexes and constraint names.
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "testing", derive(serde::Serialize, serde::Deserialize))]
pub struct TableState {
    /// Columns in definition order.
    pub columns: Vec<ColumnState>,
    pub indexes: BTreeMap<String, IndexState>,
    /// Names of indexes the database created to enforce table constraints
    /// (UNIQUE and PRIMARY KEY origins).
    pub constraints: BTreeSet<String>,
}

/// A point-in-time read of live schema metadata.
#[derive(Debug, Clone, PartialEq, Default)]
#[cfg_attr(feature = "testing", derive(serde::Serialize, serde::Deserialize))]
pub struct SchemaSnapshot {
    pub tables: BTreeMap<String, TableState>,
}

impl SchemaSnapshot {
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Identifier lookups are ASCII-case-insensitive, matching SQLite.
    pub fn table(&self, name: &str) -> Option<&TableState> {
        self.tables
            .iter()
            .find(|(t, _)| t.eq_ignore_ascii_case(name))
            .map(|(_, state)| state)
    }

    pub fn has_table(&self, name: &str) -> bool {
        self.table(name).is_some()
    }

    pub fn column(&self, table: &str, column: &str) -> Option<&ColumnState> {
        self.table(table)?
            .columns
            .iter()
            .find(|c| c.name.eq_ignore_ascii_case(column))
    }

    pub fn has_column(&self, table: &str, column: &str) -> bool {
        self.column(table, column).is_some()
    }

    pub fn has_index(&self, table: &str, index: &str) -> bool {
        self.table(table)
            .map(|t| t.indexes.keys().any(|i| i.eq_ignore_ascii_case(index)))
            .unwrap_or(false)
    }

    /// A constraint is visible either under its own created-index name or as
    /// one of the database's constraint-enforcing indexes.
    pub fn has_constraint(&self, table: &str, name: &str) -> bool {
        self.table(table)
            .map(|t| {
                t.constraints.iter().any(|c| c.eq_ignore_ascii_case(name))
                    || t.indexes.keys().any(|i| i.eq_ignore_ascii_case(name))
            })
            .unwrap_or(false)
    }
}

/// Read the live schema for the given scope.
///
/// Never fails on missing tables or columns; a metadata read that cannot be
/// performed at all maps to [Error::Connectivity].
pub fn inspect(conn: &Connection, scope: &Scope) -> Result<SchemaSnapshot, Error> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master WHERE type = 'table' \
             AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(Error::Connectivity)?;
    let names: Vec<String> = stmt
        .query_map([], |row| row.get(0))
        .map_err(Error::Connectivity)?
        .collect::<Result<_, _>>()
        .map_err(Error::Connectivity)?;

    let mut tables = BTreeMap::new();
    for name in names.into_iter().filter(|n| scope.includes(n)) {
        let state = inspect_table(conn, &name)?;
        tables.insert(name, state);
    }
    Ok(SchemaSnapshot { tables })
}

fn inspect_table(conn: &Connection, table: &str) -> Result<TableState, Error> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", table))
        .map_err(Error::Connectivity)?;
    let columns: Vec<ColumnState> = stmt
        .query_map([], |row| {
            Ok(ColumnState {
                name: row.get(1)?,
                type_name: row.get(2)?,
                not_null: row.get::<_, i64>(3)? != 0,
                default_value: row.get(4)?,
                primary_key: row.get::<_, i64>(5)? != 0,
            })
        })
        .map_err(Error::Connectivity)?
        .collect::<Result<_, _>>()
        .map_err(Error::Connectivity)?;

    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list(\"{}\")", table))
        .map_err(Error::Connectivity)?;
    let listed: Vec<(String, bool, String)> = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(Error::Connectivity)?
        .collect::<Result<_, _>>()
        .map_err(Error::Connectivity)?;

    let mut indexes = BTreeMap::new();
    let mut constraints = BTreeSet::new();
    for (name, unique, origin) in listed {
        let columns = index_columns(conn, &name)?;
        if origin == "c" {
            indexes.insert(
                name.clone(),
                IndexState {
                    name,
                    columns,
                    unique,
                },
            );
        } else {
            // "u" and "pk" entries enforce table constraints
            constraints.insert(name);
        }
    }

    Ok(TableState {
        columns,
        indexes,
        constraints,
    })
}

fn index_columns(conn: &Connection, index: &str) -> Result<Vec<String>, Error> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_info(\"{}\")", index))
        .map_err(Error::Connectivity)?;
    let columns: Vec<Option<String>> = stmt
        .query_map([], |row| row.get(2))
        .map_err(Error::Connectivity)?
        .collect::<Result<_, _>>()
        .map_err(Error::Connectivity)?;
    // expression index entries report no column name
    Ok(columns.into_iter().flatten().collect())
}
