//! Append-only record lists in a single SQLite file.
//!
//! Each operation opens its own connection; WAL journaling lets readers run
//! beside the single writer. Legacy flat `<list>.json` files are imported once
//! per list, guarded by a sentinel row committed in the same transaction.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, TransactionBehavior, params};
use serde::Serialize;
use serde_json::Value;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Mutex;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{LookoutError, StoreError};
use crate::snap::storage::FileLock;
use crate::snap::util::{epoch_secs_f64, now_utc_iso, parse_iso};

pub const DB_FILE: &str = "records.db";
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS records (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    list_name TEXT NOT NULL,
    timestamp TEXT,
    timestamp_epoch REAL,
    data TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_records_list_id ON records (list_name, id);
CREATE INDEX IF NOT EXISTS idx_records_list_ts ON records (list_name, timestamp_epoch);
CREATE TABLE IF NOT EXISTS record_migrations (
    list_name TEXT PRIMARY KEY,
    migrated_at TEXT NOT NULL,
    imported INTEGER NOT NULL
);
";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordList {
    Descriptions,
    Compare10m,
    CompareHourly,
    CompareCustom,
    DailyReports,
    Usage,
}

impl RecordList {
    pub const ALL: [RecordList; 6] = [
        RecordList::Descriptions,
        RecordList::Compare10m,
        RecordList::CompareHourly,
        RecordList::CompareCustom,
        RecordList::DailyReports,
        RecordList::Usage,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Descriptions => "descriptions",
            Self::Compare10m => "compare_10m",
            Self::CompareHourly => "compare_hourly",
            Self::CompareCustom => "compare_custom",
            Self::DailyReports => "daily_reports",
            Self::Usage => "usage",
        }
    }

    pub fn legacy_file(self) -> String {
        format!("{}.json", self.as_str())
    }

    fn required_fields(self) -> &'static [&'static str] {
        match self {
            Self::Descriptions => &["snapshot", "text"],
            Self::Compare10m | Self::CompareHourly | Self::CompareCustom => {
                &["snapshot_a", "snapshot_b", "text"]
            }
            Self::DailyReports => &["date", "summary"],
            Self::Usage => &["provider", "model"],
        }
    }

    /// Schema hook applied to new appends. Legacy imports bypass it.
    pub fn validate(self, record: &Value) -> Result<(), String> {
        let Some(object) = record.as_object() else {
            return Err("record must be a JSON object".to_string());
        };
        for field in self.required_fields() {
            if object.get(*field).is_none_or(Value::is_null) {
                return Err(format!("missing field `{field}`"));
            }
        }
        Ok(())
    }
}

impl fmt::Display for RecordList {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RecordList {
    type Err = LookoutError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let wanted = raw.trim().replace('-', "_");
        RecordList::ALL
            .into_iter()
            .find(|list| list.as_str() == wanted)
            .ok_or_else(|| LookoutError::UnknownList(raw.to_string()))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FetchOptions {
    pub limit: Option<usize>,
    pub offset: usize,
    pub newest_first: bool,
}

/// Pull the record timestamp (`timestamp`, legacy `ts`) and its epoch.
pub fn record_timestamp(record: &Value) -> (Option<String>, Option<f64>) {
    let raw = record
        .get("timestamp")
        .and_then(Value::as_str)
        .or_else(|| record.get("ts").and_then(Value::as_str));
    match raw {
        Some(text) => (
            Some(text.to_string()),
            parse_iso(text).map(epoch_secs_f64),
        ),
        None => (None, None),
    }
}

#[derive(Debug)]
pub struct RecordStore {
    data_dir: PathBuf,
    db_path: PathBuf,
    migrated: Mutex<HashSet<RecordList>>,
}

impl RecordStore {
    pub fn open(data_dir: &Path) -> Result<Self, StoreError> {
        fs::create_dir_all(data_dir)?;
        let store = Self {
            data_dir: data_dir.to_path_buf(),
            db_path: data_dir.join(DB_FILE),
            migrated: Mutex::new(HashSet::new()),
        };
        let conn = store.connect()?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        debug!(db = %store.db_path.display(), journal_mode = %mode, "record store opened");
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(store)
    }

    pub fn db_path(&self) -> &Path {
        &self.db_path
    }

    fn connect(&self) -> Result<Connection, StoreError> {
        let conn = Connection::open(&self.db_path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;
        Ok(conn)
    }

    fn is_migrated(&self, list: RecordList) -> bool {
        self.migrated
            .lock()
            .map(|set| set.contains(&list))
            .unwrap_or(false)
    }

    fn mark_migrated(&self, list: RecordList) {
        if let Ok(mut set) = self.migrated.lock() {
            set.insert(list);
        }
    }

    fn ensure_migrated(&self, conn: &mut Connection, list: RecordList) -> Result<(), StoreError> {
        if self.is_migrated(list) {
            return Ok(());
        }

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let done: Option<i64> = tx
            .query_row(
                "SELECT imported FROM record_migrations WHERE list_name = ?1",
                params![list.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        if done.is_some() {
            tx.commit()?;
            self.mark_migrated(list);
            return Ok(());
        }

        let existing: i64 = tx.query_row(
            "SELECT COUNT(*) FROM records WHERE list_name = ?1",
            params![list.as_str()],
            |row| row.get(0),
        )?;

        let mut imported = 0i64;
        let legacy_path = self.data_dir.join(list.legacy_file());
        if existing == 0 && legacy_path.is_file() {
            let entries = self.read_legacy_entries(&legacy_path)?;
            for entry in entries {
                if !entry.is_object() {
                    continue;
                }
                let Ok(data) = serde_json::to_string(&entry) else {
                    continue;
                };
                let (timestamp, epoch) = record_timestamp(&entry);
                tx.execute(
                    "INSERT INTO records (list_name, timestamp, timestamp_epoch, data) \
                     VALUES (?1, ?2, ?3, ?4)",
                    params![list.as_str(), timestamp, epoch, data],
                )?;
                imported += 1;
            }
        }

        tx.execute(
            "INSERT INTO record_migrations (list_name, migrated_at, imported) VALUES (?1, ?2, ?3)",
            params![list.as_str(), now_utc_iso(), imported],
        )?;
        tx.commit()?;
        self.mark_migrated(list);
        if imported > 0 {
            info!(list = %list, imported, "imported legacy record list");
        }
        Ok(())
    }

    fn read_legacy_entries(&self, path: &Path) -> Result<Vec<Value>, StoreError> {
        let lock_path = PathBuf::from(format!("{}.lock", path.display()));
        let _guard = FileLock::exclusive(&lock_path).map_err(StoreError::Lock)?;
        let raw = fs::read_to_string(path)?;
        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Array(entries)) => Ok(entries),
            Ok(_) => {
                warn!(path = %path.display(), "legacy record list is not an array; skipped");
                Ok(Vec::new())
            }
            Err(err) => {
                warn!(
                    path = %path.display(),
                    error = %err,
                    "legacy record list unreadable; skipped"
                );
                Ok(Vec::new())
            }
        }
    }

    pub fn append<T: Serialize + ?Sized>(
        &self,
        list: RecordList,
        record: &T,
    ) -> Result<i64, StoreError> {
        let value = serde_json::to_value(record)?;
        list.validate(&value).map_err(|reason| StoreError::Rejected {
            list: list.as_str(),
            reason,
        })?;
        let data = serde_json::to_string(&value)?;
        let (timestamp, epoch) = record_timestamp(&value);

        let mut conn = self.connect()?;
        self.ensure_migrated(&mut conn, list)?;
        conn.execute(
            "INSERT INTO records (list_name, timestamp, timestamp_epoch, data) \
             VALUES (?1, ?2, ?3, ?4)",
            params![list.as_str(), timestamp, epoch, data],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn fetch(&self, list: RecordList, opts: &FetchOptions) -> Result<Vec<Value>, StoreError> {
        let mut conn = self.connect()?;
        self.ensure_migrated(&mut conn, list)?;
        let sql = if opts.newest_first {
            "SELECT data FROM records WHERE list_name = ?1 ORDER BY id DESC LIMIT ?2 OFFSET ?3"
        } else {
            "SELECT data FROM records WHERE list_name = ?1 ORDER BY id ASC LIMIT ?2 OFFSET ?3"
        };
        let limit = opts
            .limit
            .map(|n| i64::try_from(n).unwrap_or(i64::MAX))
            .unwrap_or(-1);
        let offset = i64::try_from(opts.offset).unwrap_or(i64::MAX);
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params![list.as_str(), limit, offset], |row| {
            row.get::<_, String>(0)
        })?;
        decode_rows(rows)
    }

    pub fn fetch_since(
        &self,
        list: RecordList,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Value>, StoreError> {
        let mut conn = self.connect()?;
        self.ensure_migrated(&mut conn, list)?;
        let mut stmt = conn.prepare(
            "SELECT data FROM records WHERE list_name = ?1 AND timestamp_epoch >= ?2 \
             ORDER BY id ASC",
        )?;
        let rows = stmt.query_map(params![list.as_str(), epoch_secs_f64(cutoff)], |row| {
            row.get::<_, String>(0)
        })?;
        decode_rows(rows)
    }

    /// Delete records older than `cutoff`. Records without a parsable
    /// timestamp are never pruned. Dry runs only count.
    pub fn prune(
        &self,
        list: RecordList,
        cutoff: DateTime<Utc>,
        dry_run: bool,
    ) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        self.ensure_migrated(&mut conn, list)?;
        let cutoff_epoch = epoch_secs_f64(cutoff);
        if dry_run {
            let n: i64 = conn.query_row(
                "SELECT COUNT(*) FROM records WHERE list_name = ?1 \
                 AND timestamp_epoch IS NOT NULL AND timestamp_epoch < ?2",
                params![list.as_str(), cutoff_epoch],
                |row| row.get(0),
            )?;
            return Ok(usize::try_from(n).unwrap_or(0));
        }
        let removed = conn.execute(
            "DELETE FROM records WHERE list_name = ?1 \
             AND timestamp_epoch IS NOT NULL AND timestamp_epoch < ?2",
            params![list.as_str(), cutoff_epoch],
        )?;
        Ok(removed)
    }

    pub fn count(&self, list: RecordList) -> Result<usize, StoreError> {
        let mut conn = self.connect()?;
        self.ensure_migrated(&mut conn, list)?;
        let n: i64 = conn.query_row(
            "SELECT COUNT(*) FROM records WHERE list_name = ?1",
            params![list.as_str()],
            |row| row.get(0),
        )?;
        Ok(usize::try_from(n).unwrap_or(0))
    }
}

fn decode_rows<I>(rows: I) -> Result<Vec<Value>, StoreError>
where
    I: Iterator<Item = rusqlite::Result<String>>,
{
    let mut out = Vec::new();
    for row in rows {
        out.push(serde_json::from_str(&row?)?);
    }
    Ok(out)
}
