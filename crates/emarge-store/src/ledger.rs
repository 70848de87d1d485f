//! Attendance ledger — the per-user, per-day clock-in/clock-out state
//! machine over SQLite.
//!
//! States per (identity, day): `Absent` (no row) → `ClockedIn` (row with
//! start_time) → `ClockedOut` (both times set). A day never regresses to
//! `Absent` once a row exists, and the core never deletes rows.

use crate::schema::SCHEMA;
use chrono::{NaiveDate, NaiveTime};
use emarge_core::Identity;
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;
use std::sync::Mutex;
use thiserror::Error;

const DAY_FMT: &str = "%Y-%m-%d";
const TIME_FMT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("no active session for identity {identity} on {day}")]
    NoActiveSession { identity: Identity, day: NaiveDate },
    #[error("ledger database: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("corrupt ledger row: {0}")]
    Corrupt(String),
}

/// Derived state of one (identity, day) pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttendanceState {
    Absent,
    ClockedIn,
    ClockedOut,
}

/// One attendance row. Unique per (identity, day).
#[derive(Debug, Clone, PartialEq)]
pub struct AttendanceRecord {
    pub id: i64,
    pub identity: Identity,
    pub day: NaiveDate,
    pub start_time: Option<NaiveTime>,
    pub end_time: Option<NaiveTime>,
}

impl AttendanceRecord {
    pub fn state(&self) -> AttendanceState {
        match (self.start_time, self.end_time) {
            (_, Some(_)) => AttendanceState::ClockedOut,
            (Some(_), None) => AttendanceState::ClockedIn,
            (None, None) => AttendanceState::Absent,
        }
    }
}

/// SQLite-backed attendance ledger.
///
/// All writes go through one guarded connection; the `UNIQUE(identity,
/// day)` constraint makes duplicate clock-ins collapse at the storage
/// layer even across processes.
pub struct AttendanceLedger {
    conn: Mutex<Connection>,
}

impl AttendanceLedger {
    /// Open (or create) the ledger database at `path`.
    pub fn open(path: &Path) -> Result<Self, LedgerError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| LedgerError::Corrupt(format!("cannot create {}: {e}", parent.display())))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        tracing::info!(path = %path.display(), "attendance ledger opened");
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory ledger for tests.
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Record a clock-in. Idempotent per (identity, day): the first
    /// recorded timestamp wins, later attempts leave the row untouched.
    /// Returns the canonical record either way.
    pub fn record_clock_in(
        &self,
        identity: Identity,
        day: NaiveDate,
        time: NaiveTime,
    ) -> Result<AttendanceRecord, LedgerError> {
        let conn = self.lock();
        let inserted = conn.execute(
            "INSERT INTO attendance (identity, day, start_time)
             VALUES (?1, ?2, ?3)
             ON CONFLICT (identity, day) DO NOTHING",
            params![
                identity,
                day.format(DAY_FMT).to_string(),
                time.format(TIME_FMT).to_string()
            ],
        )?;

        if inserted == 0 {
            tracing::debug!(identity, day = %day, "clock-in repeated; keeping first timestamp");
        } else {
            tracing::info!(identity, day = %day, time = %time, "clock-in recorded");
        }

        Self::fetch(&conn, identity, day)?.ok_or(LedgerError::NoActiveSession { identity, day })
    }

    /// Record a clock-out on the existing row for (identity, day).
    ///
    /// Scoped by both identity and day, never by day alone, so two
    /// users attending the same day cannot overwrite each other.
    /// Fails with [`LedgerError::NoActiveSession`] when no clock-in
    /// happened yet.
    pub fn record_clock_out(
        &self,
        identity: Identity,
        day: NaiveDate,
        time: NaiveTime,
    ) -> Result<AttendanceRecord, LedgerError> {
        let conn = self.lock();
        let updated = conn.execute(
            "UPDATE attendance SET end_time = ?3 WHERE identity = ?1 AND day = ?2",
            params![
                identity,
                day.format(DAY_FMT).to_string(),
                time.format(TIME_FMT).to_string()
            ],
        )?;

        if updated == 0 {
            return Err(LedgerError::NoActiveSession { identity, day });
        }

        tracing::info!(identity, day = %day, time = %time, "clock-out recorded");
        Self::fetch(&conn, identity, day)?.ok_or(LedgerError::NoActiveSession { identity, day })
    }

    /// The record for (identity, day), if any.
    pub fn record_for(
        &self,
        identity: Identity,
        day: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, LedgerError> {
        Self::fetch(&self.lock(), identity, day)
    }

    /// Derived attendance state for (identity, day).
    pub fn state_for(
        &self,
        identity: Identity,
        day: NaiveDate,
    ) -> Result<AttendanceState, LedgerError> {
        Ok(self
            .record_for(identity, day)?
            .map(|r| r.state())
            .unwrap_or(AttendanceState::Absent))
    }

    /// All records for one identity, oldest day first.
    pub fn records_for(&self, identity: Identity) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, identity, day, start_time, end_time
             FROM attendance WHERE identity = ?1 ORDER BY day",
        )?;
        let rows = stmt.query_map(params![identity], row_to_parts)?;

        let mut records = Vec::new();
        for row in rows {
            records.push(parts_to_record(row?)?);
        }
        Ok(records)
    }

    fn fetch(
        conn: &Connection,
        identity: Identity,
        day: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, LedgerError> {
        let parts = conn
            .query_row(
                "SELECT id, identity, day, start_time, end_time
                 FROM attendance WHERE identity = ?1 AND day = ?2",
                params![identity, day.format(DAY_FMT).to_string()],
                row_to_parts,
            )
            .optional()?;

        parts.map(parts_to_record).transpose()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        // A poisoned mutex means a panic mid-query; the connection itself
        // is still usable.
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

type RowParts = (i64, i64, String, Option<String>, Option<String>);

fn row_to_parts(row: &rusqlite::Row<'_>) -> rusqlite::Result<RowParts> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn parts_to_record(parts: RowParts) -> Result<AttendanceRecord, LedgerError> {
    let (id, identity, day, start_time, end_time) = parts;

    let day = NaiveDate::parse_from_str(&day, DAY_FMT)
        .map_err(|e| LedgerError::Corrupt(format!("bad day {day:?}: {e}")))?;
    let parse_time = |t: Option<String>| -> Result<Option<NaiveTime>, LedgerError> {
        t.map(|t| {
            NaiveTime::parse_from_str(&t, TIME_FMT)
                .map_err(|e| LedgerError::Corrupt(format!("bad time {t:?}: {e}")))
        })
        .transpose()
    };

    Ok(AttendanceRecord {
        id,
        identity,
        day,
        start_time: parse_time(start_time)?,
        end_time: parse_time(end_time)?,
    })
}
