// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! SQLite-backed font catalog
//!
//! One row per font, keyed by slug. The store is the only place that
//! persists download state, and every state transition is a single guarded
//! `UPDATE`, so a reader never observes a half-applied change.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info};

use super::record::{
    CatalogStats, Category, DownloadState, FontEntry, FontRecord, ListFilter, UpsertOutcome,
};
use crate::download::bucket_for;
use crate::error::StoreError;

/// Schema version written to `PRAGMA user_version`
pub const SCHEMA_VERSION: i64 = 1;

/// Rows fetched per round trip by the lazy iterators
const PAGE_SIZE: usize = 128;

const COLUMNS: &str = "id, name, category, source_url, download_url, download_state, \
     local_archive_path, archive_sha256, last_error, stale, first_seen_at, last_synced_at, \
     last_attempt_at, lower(name)";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS fonts (
    id TEXT PRIMARY KEY,
    name TEXT NOT NULL,
    category TEXT,
    bucket TEXT NOT NULL,
    source_url TEXT NOT NULL,
    download_url TEXT,
    download_state TEXT NOT NULL DEFAULT 'not_fetched'
        CHECK (download_state IN ('not_fetched', 'fetched', 'extracted', 'failed')),
    local_archive_path TEXT,
    archive_sha256 TEXT,
    last_error TEXT,
    stale INTEGER NOT NULL DEFAULT 0,
    first_seen_at TEXT NOT NULL,
    last_synced_at TEXT NOT NULL,
    last_attempt_at TEXT,
    CHECK ((download_state IN ('fetched', 'extracted'))
        = (local_archive_path IS NOT NULL AND local_archive_path <> ''))
);

CREATE INDEX IF NOT EXISTS idx_fonts_name ON fonts(lower(name), id);
CREATE INDEX IF NOT EXISTS idx_fonts_state ON fonts(download_state);
CREATE INDEX IF NOT EXISTS idx_fonts_category ON fonts(category);
CREATE INDEX IF NOT EXISTS idx_fonts_bucket ON fonts(bucket);
CREATE INDEX IF NOT EXISTS idx_fonts_download_url ON fonts(download_url);
CREATE INDEX IF NOT EXISTS idx_fonts_archive ON fonts(local_archive_path);
"#;

/// The persistent font catalog
pub struct CatalogStore {
    conn: Mutex<Connection>,
    path: Option<PathBuf>,
}

impl CatalogStore {
    /// Open or create a catalog file
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        let conn = Connection::open(path).map_err(|e| StoreError::Open {
            path: path.to_path_buf(),
            source: e,
        })?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        let store = Self {
            conn: Mutex::new(conn),
            path: Some(path.to_path_buf()),
        };
        store.init_schema()?;
        info!("Opened catalog {}", path.display());
        Ok(store)
    }

    /// Create an in-memory catalog (for testing)
    pub fn in_memory() -> Result<Self, StoreError> {
        let store = Self {
            conn: Mutex::new(Connection::open_in_memory()?),
            path: None,
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Flush and close the underlying connection
    pub fn close(self) -> Result<(), StoreError> {
        let conn = self.conn.into_inner().map_err(|_| StoreError::Poisoned)?;
        conn.close().map_err(|(_, e)| StoreError::Unavailable(e))
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;

        match found {
            0 => {
                conn.execute_batch(SCHEMA)?;
                conn.execute_batch(&format!("PRAGMA user_version = {SCHEMA_VERSION};"))?;
                debug!("Created catalog schema v{}", SCHEMA_VERSION);
                Ok(())
            }
            SCHEMA_VERSION => Ok(()),
            other => Err(StoreError::SchemaVersion {
                path: self.path.clone().unwrap_or_default(),
                found: other,
                expected: SCHEMA_VERSION,
            }),
        }
    }

    /// Insert a new font, or refresh the metadata of a known one.
    ///
    /// Download state and archive path are never touched here. `last_synced_at`
    /// is bumped and the stale flag cleared in every case.
    pub fn upsert(&self, entry: &FontEntry) -> Result<UpsertOutcome, StoreError> {
        let now = now_stamp();
        let category = entry.category.map(|c| c.key());
        let bucket = bucket_for(&entry.name);

        let mut conn = self.lock()?;
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, Option<String>, String, Option<String>)> = tx
            .query_row(
                "SELECT name, category, source_url, download_url FROM fonts WHERE id = ?1",
                [&entry.id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;

        let outcome = match existing {
            None => {
                tx.execute(
                    "INSERT INTO fonts (id, name, category, bucket, source_url, download_url,
                                        download_state, first_seen_at, last_synced_at)
                     VALUES (?1, ?2, ?3, ?7, ?4, ?5, 'not_fetched', ?6, ?6)",
                    params![
                        entry.id,
                        entry.name,
                        category,
                        entry.source_url,
                        entry.download_url,
                        now,
                        bucket
                    ],
                )?;
                UpsertOutcome::Added
            }
            Some((name, old_category, source_url, download_url)) => {
                let category_changed = category.is_some() && old_category.as_deref() != category;
                let download_changed =
                    entry.download_url.is_some() && entry.download_url != download_url;
                let changed = name != entry.name
                    || source_url != entry.source_url
                    || category_changed
                    || download_changed;

                if changed {
                    tx.execute(
                        "UPDATE fonts
                         SET name = ?2, category = COALESCE(?3, category), source_url = ?4,
                             download_url = COALESCE(?5, download_url),
                             last_synced_at = ?6, stale = 0, bucket = ?7
                         WHERE id = ?1",
                        params![
                            entry.id,
                            entry.name,
                            category,
                            entry.source_url,
                            entry.download_url,
                            now,
                            bucket
                        ],
                    )?;
                    UpsertOutcome::Updated
                } else {
                    tx.execute(
                        "UPDATE fonts SET last_synced_at = ?2, stale = 0 WHERE id = ?1",
                        params![entry.id, now],
                    )?;
                    UpsertOutcome::Unchanged
                }
            }
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Mark a known font as seen without changing its metadata
    pub fn touch_synced(&self, id: &str) -> Result<bool, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET last_synced_at = ?2, stale = 0 WHERE id = ?1",
            params![id, now_stamp()],
        )?;
        Ok(changed > 0)
    }

    /// Look up a font by id
    pub fn get(&self, id: &str) -> Result<Option<FontRecord>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM fonts WHERE id = ?1"),
                [id],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    /// First record whose archive link is `url`
    pub fn find_by_download_url(&self, url: &str) -> Result<Option<FontRecord>, StoreError> {
        let conn = self.lock()?;
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM fonts WHERE download_url = ?1 ORDER BY id LIMIT 1"
                ),
                [url],
                RawRow::from_row,
            )
            .optional()?;
        raw.map(RawRow::into_record).transpose()
    }

    /// Id of the record whose archive lives at `path`, if any
    pub fn archive_owner(&self, path: &Path) -> Result<Option<String>, StoreError> {
        let conn = self.lock()?;
        let owner = conn
            .query_row(
                "SELECT id FROM fonts WHERE local_archive_path = ?1 ORDER BY id LIMIT 1",
                [path.to_string_lossy()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(owner)
    }

    /// Lazily iterate records that are not yet extracted, ordered by name.
    ///
    /// Rows are read a page at a time, so records finished while the
    /// iterator is alive drop out of the remaining pages. Calling this again
    /// starts from the beginning.
    pub fn list_pending(&self, filter: ListFilter) -> RecordIter<'_> {
        RecordIter::new(self, filter, true)
    }

    /// Lazily iterate all records matching the filter, ordered by name
    pub fn list(&self, filter: ListFilter) -> RecordIter<'_> {
        RecordIter::new(self, filter, false)
    }

    /// Case-insensitive substring search on name and slug
    pub fn search(
        &self,
        query: &str,
        category: Option<Category>,
    ) -> Result<Vec<FontRecord>, StoreError> {
        let filter = ListFilter {
            query: Some(query.trim().to_string()).filter(|q| !q.is_empty()),
            category,
            ..ListFilter::default()
        };
        self.list(filter).collect()
    }

    /// Record that a retrieval attempt is starting
    pub fn record_attempt(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET last_attempt_at = ?2 WHERE id = ?1",
            params![id, now_stamp()],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRecord(id.to_string()));
        }
        Ok(())
    }

    /// NotFetched -> Fetched, once the archive is in place
    pub fn mark_fetched(
        &self,
        id: &str,
        path: &Path,
        content_hash: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts
             SET download_state = 'fetched', local_archive_path = ?2, archive_sha256 = ?3,
                 last_error = NULL
             WHERE id = ?1 AND download_state = 'not_fetched'",
            params![id, path.to_string_lossy(), content_hash],
        )?;
        check_transition(&conn, id, changed, DownloadState::Fetched)
    }

    /// Fetched -> Extracted
    pub fn mark_extracted(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET download_state = 'extracted', last_error = NULL
             WHERE id = ?1 AND download_state = 'fetched'",
            [id],
        )?;
        check_transition(&conn, id, changed, DownloadState::Extracted)
    }

    /// NotFetched -> Failed, keeping the reason for display
    pub fn mark_failed(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET download_state = 'failed', last_error = ?2
             WHERE id = ?1 AND download_state = 'not_fetched'",
            params![id, reason],
        )?;
        check_transition(&conn, id, changed, DownloadState::Failed)
    }

    /// Failed -> NotFetched, on explicit user request
    pub fn retry_failed(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET download_state = 'not_fetched', last_error = NULL
             WHERE id = ?1 AND download_state = 'failed'",
            [id],
        )?;
        check_transition(&conn, id, changed, DownloadState::NotFetched)
    }

    /// Return every Failed record to NotFetched
    pub fn retry_all_failed(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET download_state = 'not_fetched', last_error = NULL
             WHERE download_state = 'failed'",
            [],
        )?;
        Ok(changed)
    }

    /// Remember a non-retrieval error (e.g. extraction) without changing state
    pub fn record_error(&self, id: &str, reason: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET last_error = ?2 WHERE id = ?1",
            params![id, reason],
        )?;
        if changed == 0 {
            return Err(StoreError::UnknownRecord(id.to_string()));
        }
        Ok(())
    }

    /// Flag fonts of a category that were not seen since `seen_before`
    pub fn mark_stale(
        &self,
        category: Category,
        seen_before: DateTime<Utc>,
    ) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let changed = conn.execute(
            "UPDATE fonts SET stale = 1
             WHERE category = ?1 AND last_synced_at < ?2 AND stale = 0",
            params![category.key(), stamp(seen_before)],
        )?;
        Ok(changed)
    }

    /// Count records per state
    pub fn stats(&self) -> Result<CatalogStats, StoreError> {
        let conn = self.lock()?;
        let mut stats = CatalogStats::default();

        let mut stmt = conn
            .prepare_cached("SELECT download_state, COUNT(*) FROM fonts GROUP BY download_state")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (state, count) = row?;
            let count = count as usize;
            stats.total += count;
            match DownloadState::parse(&state) {
                Some(DownloadState::NotFetched) => stats.not_fetched = count,
                Some(DownloadState::Fetched) => stats.fetched = count,
                Some(DownloadState::Extracted) => stats.extracted = count,
                Some(DownloadState::Failed) => stats.failed = count,
                None => {}
            }
        }

        let stale: i64 = conn.query_row("SELECT COUNT(*) FROM fonts WHERE stale = 1", [], |row| {
            row.get(0)
        })?;
        stats.stale = stale as usize;

        Ok(stats)
    }

    fn fetch_page(
        &self,
        filter: &ListFilter,
        pending_only: bool,
        after: Option<&(String, String)>,
        limit: usize,
    ) -> Result<Vec<(String, FontRecord)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare_cached(&format!(
            "SELECT {COLUMNS} FROM fonts
             WHERE (?1 = 0 OR download_state <> 'extracted')
               AND (?2 IS NULL OR category = ?2)
               AND (?3 IS NULL OR download_state = ?3)
               AND (?4 IS NULL OR instr(lower(name), lower(?4)) > 0
                               OR instr(lower(id), lower(?4)) > 0)
               AND (?5 IS NULL OR lower(name) > ?5 OR (lower(name) = ?5 AND id > ?6))
               AND (?8 IS NULL OR bucket = ?8)
             ORDER BY lower(name), id
             LIMIT ?7"
        ))?;

        let rows = stmt.query_map(
            params![
                pending_only,
                filter.category.map(|c| c.key()),
                filter.state.map(|s| s.as_str()),
                filter.query,
                after.map(|(folded, _)| folded.as_str()),
                after.map(|(_, id)| id.as_str()),
                limit as i64,
                filter.bucket,
            ],
            RawRow::from_row,
        )?;

        let mut page = Vec::new();
        for raw in rows {
            let raw = raw?;
            let folded = raw.folded_name.clone();
            page.push((folded, raw.into_record()?));
        }
        Ok(page)
    }
}

/// Lazy, restartable iteration over catalog rows in name order
pub struct RecordIter<'a> {
    store: &'a CatalogStore,
    filter: ListFilter,
    pending_only: bool,
    cursor: Option<(String, String)>,
    buffer: VecDeque<FontRecord>,
    exhausted: bool,
}

impl<'a> RecordIter<'a> {
    fn new(store: &'a CatalogStore, filter: ListFilter, pending_only: bool) -> Self {
        Self {
            store,
            filter,
            pending_only,
            cursor: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }
    }
}

impl Iterator for RecordIter<'_> {
    type Item = Result<FontRecord, StoreError>;

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(record) = self.buffer.pop_front() {
            return Some(Ok(record));
        }
        if self.exhausted {
            return None;
        }

        let page = match self.store.fetch_page(
            &self.filter,
            self.pending_only,
            self.cursor.as_ref(),
            PAGE_SIZE,
        ) {
            Ok(page) => page,
            Err(e) => {
                self.exhausted = true;
                return Some(Err(e));
            }
        };

        if page.len() < PAGE_SIZE {
            self.exhausted = true;
        }
        if let Some((folded, record)) = page.last() {
            self.cursor = Some((folded.clone(), record.id.clone()));
        }
        self.buffer.extend(page.into_iter().map(|(_, record)| record));

        self.buffer.pop_front().map(Ok)
    }
}

/// Column values as stored, before validation
struct RawRow {
    id: String,
    name: String,
    category: Option<String>,
    source_url: String,
    download_url: Option<String>,
    download_state: String,
    local_archive_path: Option<String>,
    archive_sha256: Option<String>,
    last_error: Option<String>,
    stale: bool,
    first_seen_at: String,
    last_synced_at: String,
    last_attempt_at: Option<String>,
    folded_name: String,
}

impl RawRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            name: row.get(1)?,
            category: row.get(2)?,
            source_url: row.get(3)?,
            download_url: row.get(4)?,
            download_state: row.get(5)?,
            local_archive_path: row.get(6)?,
            archive_sha256: row.get(7)?,
            last_error: row.get(8)?,
            stale: row.get(9)?,
            first_seen_at: row.get(10)?,
            last_synced_at: row.get(11)?,
            last_attempt_at: row.get(12)?,
            folded_name: row.get(13)?,
        })
    }

    fn into_record(self) -> Result<FontRecord, StoreError> {
        let corrupt = |reason: String| StoreError::CorruptRow {
            id: self.id.clone(),
            reason,
        };

        let download_state = DownloadState::parse(&self.download_state)
            .ok_or_else(|| corrupt(format!("unknown state '{}'", self.download_state)))?;
        let category = self
            .category
            .as_deref()
            .map(|key| key.parse().map_err(corrupt))
            .transpose()?;
        let first_seen_at = parse_stamp(&self.first_seen_at).map_err(corrupt)?;
        let last_synced_at = parse_stamp(&self.last_synced_at).map_err(corrupt)?;
        let last_attempt_at = self
            .last_attempt_at
            .as_deref()
            .map(parse_stamp)
            .transpose()
            .map_err(corrupt)?;

        Ok(FontRecord {
            id: self.id,
            name: self.name,
            category,
            source_url: self.source_url,
            download_url: self.download_url,
            download_state,
            local_archive_path: self.local_archive_path.map(PathBuf::from),
            archive_sha256: self.archive_sha256,
            last_error: self.last_error,
            stale: self.stale,
            first_seen_at,
            last_synced_at,
            last_attempt_at,
        })
    }
}

/// Turn a zero-row guarded update into the matching error
fn check_transition(
    conn: &Connection,
    id: &str,
    changed: usize,
    to: DownloadState,
) -> Result<(), StoreError> {
    if changed > 0 {
        return Ok(());
    }

    let current: Option<String> = conn
        .query_row(
            "SELECT download_state FROM fonts WHERE id = ?1",
            [id],
            |row| row.get(0),
        )
        .optional()?;

    match current.as_deref().map(DownloadState::parse) {
        Some(Some(from)) => Err(StoreError::InvalidTransition {
            id: id.to_string(),
            from,
            to,
        }),
        Some(None) => Err(StoreError::CorruptRow {
            id: id.to_string(),
            reason: "unknown state".to_string(),
        }),
        None => Err(StoreError::UnknownRecord(id.to_string())),
    }
}

/// Timestamps are stored as fixed-width UTC RFC 3339 so they sort as text
fn stamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn now_stamp() -> String {
    stamp(Utc::now())
}

fn parse_stamp(s: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| format!("bad timestamp '{s}': {e}"))
}
