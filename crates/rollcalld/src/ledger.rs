//! Attendance ledger backed by one SQLite database per group.
//!
//! Uniqueness of (identity, date) is enforced by the schema and every insert
//! is a single `INSERT OR IGNORE`, so concurrent writers (including other
//! daemon instances sharing the data directory) can never double-count.
//! Each group has its own connection behind its own mutex; groups never
//! block each other.

use crate::config::Cutoffs;
use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use rusqlite::{params, Connection};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S";

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid group name: {0:?}")]
    InvalidGroup(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

/// Derived once at insertion and never recomputed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceStatus {
    OnTime,
    Late,
}

impl AttendanceStatus {
    fn as_str(self) -> &'static str {
        match self {
            Self::OnTime => "on_time",
            Self::Late => "late",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "on_time" => Some(Self::OnTime),
            "late" => Some(Self::Late),
            _ => None,
        }
    }
}

/// Status for an arrival at `at`: before noon the morning cutoff applies,
/// otherwise the afternoon one. Arriving exactly at a cutoff is on time.
pub fn status_for(at: NaiveDateTime, cutoffs: &Cutoffs) -> AttendanceStatus {
    let time = at.time();
    let limit = if time.hour() < 12 {
        cutoffs.morning
    } else {
        cutoffs.afternoon
    };
    if time > limit {
        AttendanceStatus::Late
    } else {
        AttendanceStatus::OnTime
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AttendanceRecord {
    pub identity: String,
    pub date: NaiveDate,
    pub first_seen: NaiveTime,
    pub status: AttendanceStatus,
}

/// Group names double as directory names; keep them to a safe alphabet.
pub fn validate_group(group: &str) -> bool {
    !group.is_empty()
        && group.len() <= 64
        && !group.starts_with('.')
        && group
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
}

enum Location {
    Directory(PathBuf),
    Memory,
}

pub struct AttendanceLedger {
    location: Location,
    cutoffs: Cutoffs,
    groups: Mutex<HashMap<String, Arc<Mutex<Connection>>>>,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl AttendanceLedger {
    /// Ledger storing `<dir>/<group>/attendance.db` per group.
    pub fn open(dir: impl Into<PathBuf>, cutoffs: Cutoffs) -> Self {
        Self {
            location: Location::Directory(dir.into()),
            cutoffs,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Ledger with one in-memory database per group.
    pub fn in_memory(cutoffs: Cutoffs) -> Self {
        Self {
            location: Location::Memory,
            cutoffs,
            groups: Mutex::new(HashMap::new()),
        }
    }

    /// Record the first sighting of `identity` in `group` on the date of
    /// `when`. Returns `true` if this call inserted the record.
    pub fn record_if_absent(
        &self,
        group: &str,
        identity: &str,
        when: NaiveDateTime,
    ) -> Result<bool, LedgerError> {
        let conn = self.connection(group)?;
        let status = status_for(when, &self.cutoffs);

        let inserted = lock(&conn).execute(
            "INSERT OR IGNORE INTO attendance
                 (identity, date, first_time, status, timestamp_iso)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity,
                when.format(DATE_FORMAT).to_string(),
                when.format(TIME_FORMAT).to_string(),
                status.as_str(),
                when.format("%Y-%m-%d %H:%M:%S").to_string(),
            ],
        )? == 1;

        if inserted {
            tracing::info!(group, identity, status = status.as_str(), "attendance recorded");
        } else {
            tracing::debug!(group, identity, "attendance already recorded today");
        }
        Ok(inserted)
    }

    /// Records of one day, ordered by first sighting.
    pub fn records_for(
        &self,
        group: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, LedgerError> {
        let conn = self.connection(group)?;
        let conn = lock(&conn);
        let mut stmt = conn.prepare(
            "SELECT identity, first_time, status FROM attendance
             WHERE date = ?1 ORDER BY first_time, id",
        )?;
        let rows = stmt.query_map(params![date.format(DATE_FORMAT).to_string()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (identity, first_time, status) = row?;
            let first_seen = NaiveTime::parse_from_str(&first_time, TIME_FORMAT)
                .map_err(|e| LedgerError::Corrupt(format!("first_time {first_time:?}: {e}")))?;
            let status = AttendanceStatus::parse(&status)
                .ok_or_else(|| LedgerError::Corrupt(format!("status {status:?}")))?;
            records.push(AttendanceRecord {
                identity,
                date,
                first_seen,
                status,
            });
        }
        Ok(records)
    }

    /// Delete one day's records from every group ledger, including ones on
    /// disk not opened since startup. Returns the number of records removed.
    pub fn clear_day(&self, date: NaiveDate) -> Result<usize, LedgerError> {
        for group in self.groups_on_disk()? {
            self.connection(&group)?;
        }
        let groups: Vec<(String, Arc<Mutex<Connection>>)> = lock(&self.groups)
            .iter()
            .map(|(g, c)| (g.clone(), Arc::clone(c)))
            .collect();

        let day = date.format(DATE_FORMAT).to_string();
        let mut removed = 0;
        for (group, conn) in groups {
            let n = lock(&conn).execute("DELETE FROM attendance WHERE date = ?1", params![day])?;
            tracing::info!(group, removed = n, date = %day, "attendance cleared");
            removed += n;
        }
        Ok(removed)
    }

    fn groups_on_disk(&self) -> Result<Vec<String>, LedgerError> {
        let Location::Directory(dir) = &self.location else {
            return Ok(Vec::new());
        };
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut groups = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let path = entry?.path();
            if !path.join("attendance.db").is_file() {
                continue;
            }
            if let Some(name) = path.file_name().and_then(|n| n.to_str()) {
                if validate_group(name) {
                    groups.push(name.to_string());
                }
            }
        }
        Ok(groups)
    }

    fn connection(&self, group: &str) -> Result<Arc<Mutex<Connection>>, LedgerError> {
        if let Some(conn) = lock(&self.groups).get(group) {
            return Ok(Arc::clone(conn));
        }
        if !validate_group(group) {
            return Err(LedgerError::InvalidGroup(group.to_string()));
        }

        // Opened outside the registry lock; a racing opener loses to the
        // first insert and its connection is dropped.
        let conn = self.open_connection(group)?;
        let mut groups = lock(&self.groups);
        let entry = groups
            .entry(group.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(conn)));
        Ok(Arc::clone(entry))
    }

    fn open_connection(&self, group: &str) -> Result<Connection, LedgerError> {
        let conn = match &self.location {
            Location::Memory => Connection::open_in_memory()?,
            Location::Directory(dir) => {
                let group_dir = dir.join(group);
                std::fs::create_dir_all(&group_dir)?;
                let conn = Connection::open(group_dir.join("attendance.db"))?;
                conn.busy_timeout(Duration::from_secs(10))?;
                conn.query_row("PRAGMA journal_mode=WAL", [], |_| Ok(()))?;
                conn
            }
        };

        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS attendance (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                identity TEXT NOT NULL,
                date TEXT NOT NULL,
                first_time TEXT NOT NULL,
                status TEXT NOT NULL,
                timestamp_iso TEXT NOT NULL,
                UNIQUE(identity, date)
            );",
        )?;
        tracing::debug!(group, "attendance ledger opened");
        Ok(conn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    fn at(date: &str, time: &str) -> NaiveDateTime {
        NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S").unwrap()
    }

    fn day(date: &str) -> NaiveDate {
        NaiveDate::parse_from_str(date, DATE_FORMAT).unwrap()
    }

    #[test]
    fn test_status_cutoffs() {
        let c = Cutoffs::default();
        assert_eq!(status_for(at("2026-03-02", "06:30:00"), &c), AttendanceStatus::OnTime);
        assert_eq!(status_for(at("2026-03-02", "06:45:00"), &c), AttendanceStatus::OnTime);
        assert_eq!(status_for(at("2026-03-02", "06:45:01"), &c), AttendanceStatus::Late);
        assert_eq!(status_for(at("2026-03-02", "11:59:59"), &c), AttendanceStatus::Late);
        assert_eq!(status_for(at("2026-03-02", "12:30:00"), &c), AttendanceStatus::OnTime);
        assert_eq!(status_for(at("2026-03-02", "13:16:00"), &c), AttendanceStatus::Late);
    }

    #[test]
    fn test_first_photo_of_the_day_wins() {
        let ledger = AttendanceLedger::in_memory(Cutoffs::default());
        assert!(ledger.record_if_absent("g1", "alice", at("2026-03-02", "06:40:00")).unwrap());
        assert!(!ledger.record_if_absent("g1", "alice", at("2026-03-02", "07:10:00")).unwrap());

        let records = ledger.records_for("g1", day("2026-03-02")).unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].first_seen, NaiveTime::from_hms_opt(6, 40, 0).unwrap());
        assert_eq!(records[0].status, AttendanceStatus::OnTime);
    }

    #[test]
    fn test_next_day_records_again() {
        let ledger = AttendanceLedger::in_memory(Cutoffs::default());
        assert!(ledger.record_if_absent("g1", "alice", at("2026-03-02", "06:40:00")).unwrap());
        assert!(ledger.record_if_absent("g1", "alice", at("2026-03-03", "06:40:00")).unwrap());
    }

    #[test]
    fn test_groups_are_separate() {
        let ledger = AttendanceLedger::in_memory(Cutoffs::default());
        let when = at("2026-03-02", "08:00:00");
        assert!(ledger.record_if_absent("g1", "alice", when).unwrap());
        assert!(ledger.record_if_absent("g2", "alice", when).unwrap());
        assert_eq!(ledger.records_for("g2", day("2026-03-02")).unwrap().len(), 1);
    }

    #[test]
    fn test_concurrent_inserts_record_once() {
        let ledger = Arc::new(AttendanceLedger::in_memory(Cutoffs::default()));
        let when = at("2026-03-02", "06:50:00");

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                thread::spawn(move || ledger.record_if_absent("g1", "bob", when).unwrap())
            })
            .collect();

        let inserted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|&b| b)
            .count();
        assert_eq!(inserted, 1);
        assert_eq!(ledger.records_for("g1", day("2026-03-02")).unwrap().len(), 1);
    }

    #[test]
    fn test_uniqueness_holds_across_instances() {
        let dir = tempfile::tempdir().unwrap();
        let a = AttendanceLedger::open(dir.path(), Cutoffs::default());
        let b = AttendanceLedger::open(dir.path(), Cutoffs::default());
        let when = at("2026-03-02", "09:00:00");

        assert!(a.record_if_absent("g1", "carol", when).unwrap());
        assert!(!b.record_if_absent("g1", "carol", when).unwrap());
        assert!(dir.path().join("g1").join("attendance.db").exists());
    }

    #[test]
    fn test_clear_day_only_touches_that_day() {
        let ledger = AttendanceLedger::in_memory(Cutoffs::default());
        ledger.record_if_absent("g1", "alice", at("2026-03-01", "06:40:00")).unwrap();
        ledger.record_if_absent("g1", "alice", at("2026-03-02", "06:40:00")).unwrap();
        ledger.record_if_absent("g2", "bob", at("2026-03-02", "06:40:00")).unwrap();

        assert_eq!(ledger.clear_day(day("2026-03-02")).unwrap(), 2);
        assert_eq!(ledger.records_for("g1", day("2026-03-01")).unwrap().len(), 1);
        assert!(ledger.record_if_absent("g1", "alice", at("2026-03-02", "13:05:00")).unwrap());
    }

    #[test]
    fn test_clear_day_reaches_groups_opened_by_earlier_instance() {
        let dir = tempfile::tempdir().unwrap();
        let when = at("2026-03-02", "07:10:00");
        AttendanceLedger::open(dir.path(), Cutoffs::default())
            .record_if_absent("g1", "dave", when)
            .unwrap();

        let restarted = AttendanceLedger::open(dir.path(), Cutoffs::default());
        assert_eq!(restarted.clear_day(day("2026-03-02")).unwrap(), 1);
        assert!(restarted.records_for("g1", day("2026-03-02")).unwrap().is_empty());
    }

    #[test]
    fn test_rejects_unsafe_group_names() {
        let ledger = AttendanceLedger::in_memory(Cutoffs::default());
        let when = at("2026-03-02", "06:40:00");
        for bad in ["", "../etc", "a/b", ".hidden"] {
            assert!(matches!(
                ledger.record_if_absent(bad, "x", when),
                Err(LedgerError::InvalidGroup(_))
            ));
        }
        assert!(validate_group("12A1"));
        assert!(validate_group("cs-101_b"));
    }
}
