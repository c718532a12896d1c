//! Ledger trait and SQLite implementation.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{Connection, OptionalExtension};

use super::error::LedgerError;
use super::schema;
use super::types::{
    BatchGet, ClaimRequest, ClaimResult, Completion, LedgerSummary, RunStats, SyncRecord,
    SyncStatus,
};

/// Trait for ledger operations.
///
/// Object-safe so it can be shared as `Arc<dyn SyncLedger>` across transfer
/// workers. Every mutation touches exactly one `(provider, item_id)` record.
#[async_trait]
pub trait SyncLedger: Send + Sync {
    async fn get(&self, provider: &str, item_id: &str) -> Result<Option<SyncRecord>, LedgerError>;

    /// Look up many records at once. Keys the store could not process are
    /// returned in `unprocessed` rather than failing the whole call.
    async fn batch_get(&self, provider: &str, item_ids: &[String])
        -> Result<BatchGet, LedgerError>;

    /// Write a full record. With `expected_previous` set, the write only
    /// happens if the stored status matches (a missing record never matches).
    async fn put(
        &self,
        record: &SyncRecord,
        expected_previous: Option<SyncStatus>,
    ) -> Result<(), LedgerError>;

    /// Atomically move an item to IN_PROGRESS unless it is already completed
    /// or another worker took it less than `lease` ago.
    async fn claim(
        &self,
        request: &ClaimRequest<'_>,
        lease: Duration,
    ) -> Result<ClaimResult, LedgerError>;

    /// Extend the caller's IN_PROGRESS lease. Fails with `ConditionFailed`
    /// once the record has left IN_PROGRESS.
    async fn touch(&self, provider: &str, item_id: &str) -> Result<(), LedgerError>;

    /// Move an IN_PROGRESS record to COMPLETED. Any other current status
    /// is left alone and reported as `ConditionFailed`.
    async fn mark_completed(
        &self,
        provider: &str,
        item_id: &str,
        completion: &Completion,
    ) -> Result<(), LedgerError>;

    /// Move an IN_PROGRESS record to FAILED and bump its retry count.
    /// Returns the new count.
    async fn mark_failed(
        &self,
        provider: &str,
        item_id: &str,
        error: &str,
    ) -> Result<u32, LedgerError>;

    async fn failed_records(&self) -> Result<Vec<SyncRecord>, LedgerError>;

    async fn completed_records(&self) -> Result<Vec<SyncRecord>, LedgerError>;

    async fn summary(&self) -> Result<LedgerSummary, LedgerError>;

    /// Start a new sync run and return its ID.
    async fn start_run(&self, correlation_id: &str) -> Result<i64, LedgerError>;

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), LedgerError>;
}

const RECORD_COLUMNS: &str = "provider, item_id, source_filename, destination_key, expected_size, \
     bytes_transferred, status, retry_count, last_error, note, created_at, updated_at, \
     transfer_duration_secs, throughput_mbps";

/// SQLite implementation of the ledger.
pub struct SqliteLedger {
    /// rusqlite::Connection is not Sync; every call holds the lock for a
    /// single statement or transaction and never across an await.
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl std::fmt::Debug for SqliteLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteLedger")
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

impl SqliteLedger {
    /// Open or create a ledger at the given path.
    pub async fn open(path: &Path) -> Result<Self, LedgerError> {
        let path = path.to_path_buf();
        let path_clone = path.clone();

        let conn = tokio::task::spawn_blocking(move || {
            if let Some(parent) = path_clone.parent() {
                if !parent.as_os_str().is_empty() {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        LedgerError::Query(format!("cannot create {}: {e}", parent.display()))
                    })?;
                }
            }
            let conn = Connection::open(&path_clone).map_err(|e| LedgerError::Open {
                path: path_clone.clone(),
                source: e,
            })?;

            conn.pragma_update(None, "journal_mode", "WAL")
                .map_err(LedgerError::Migration)?;
            conn.pragma_update(None, "synchronous", "NORMAL")
                .map_err(LedgerError::Migration)?;
            // Overlapping runs share the file; wait for the writer instead of failing.
            conn.busy_timeout(Duration::from_secs(5))
                .map_err(LedgerError::Migration)?;

            schema::migrate(&conn)?;

            Ok::<_, LedgerError>(conn)
        })
        .await??;

        Ok(Self {
            conn: Mutex::new(conn),
            path,
        })
    }

    /// Open an in-memory ledger (for testing).
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self, LedgerError> {
        let conn = Connection::open_in_memory().map_err(|e| LedgerError::Open {
            path: PathBuf::from(":memory:"),
            source: e,
        })?;
        schema::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: PathBuf::from(":memory:"),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, LedgerError> {
        self.conn
            .lock()
            .map_err(|e| LedgerError::Query(e.to_string()))
    }
}

fn load_record(
    conn: &Connection,
    provider: &str,
    item_id: &str,
) -> Result<Option<SyncRecord>, LedgerError> {
    conn.query_row(
        &format!("SELECT {RECORD_COLUMNS} FROM sync_records WHERE provider = ?1 AND item_id = ?2"),
        [provider, item_id],
        row_to_record,
    )
    .optional()
    .map_err(LedgerError::query)
}

fn upsert_record(conn: &Connection, record: &SyncRecord) -> Result<(), LedgerError> {
    conn.execute(
        &format!(
            r#"
            INSERT INTO sync_records ({RECORD_COLUMNS})
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
            ON CONFLICT(provider, item_id) DO UPDATE SET
                source_filename = excluded.source_filename,
                destination_key = excluded.destination_key,
                expected_size = excluded.expected_size,
                bytes_transferred = excluded.bytes_transferred,
                status = excluded.status,
                retry_count = excluded.retry_count,
                last_error = excluded.last_error,
                note = excluded.note,
                updated_at = excluded.updated_at,
                transfer_duration_secs = excluded.transfer_duration_secs,
                throughput_mbps = excluded.throughput_mbps
            "#
        ),
        rusqlite::params![
            record.provider,
            record.item_id,
            record.source_filename,
            record.destination_key,
            record.expected_size as i64,
            record.bytes_transferred.map(|b| b as i64),
            record.status.as_str(),
            record.retry_count,
            record.last_error,
            record.note,
            record.created_at.timestamp_millis(),
            record.updated_at.timestamp_millis(),
            record.transfer_duration_secs,
            record.throughput_mbps,
        ],
    )
    .map_err(LedgerError::query)?;
    Ok(())
}

/// Explain why a conditional update on an IN_PROGRESS record touched no rows.
fn not_in_progress(conn: &Connection, provider: &str, item_id: &str) -> LedgerError {
    match load_record(conn, provider, item_id) {
        Ok(Some(record)) => LedgerError::ConditionFailed {
            item_id: item_id.to_string(),
            expected: SyncStatus::InProgress,
            found: Some(record.status),
        },
        Ok(None) => LedgerError::NotFound(item_id.to_string()),
        Err(e) => e,
    }
}

fn records_with_status(
    conn: &Connection,
    status: SyncStatus,
) -> Result<Vec<SyncRecord>, LedgerError> {
    let mut stmt = conn
        .prepare_cached(&format!(
            "SELECT {RECORD_COLUMNS} FROM sync_records WHERE status = ?1 ORDER BY updated_at"
        ))
        .map_err(LedgerError::query)?;

    let records = stmt
        .query_map([status.as_str()], row_to_record)
        .map_err(LedgerError::query)?
        .collect::<Result<Vec<_>, _>>()
        .map_err(LedgerError::query)?;
    Ok(records)
}

#[async_trait]
impl SyncLedger for SqliteLedger {
    async fn get(&self, provider: &str, item_id: &str) -> Result<Option<SyncRecord>, LedgerError> {
        let conn = self.lock()?;
        load_record(&conn, provider, item_id)
    }

    async fn batch_get(
        &self,
        provider: &str,
        item_ids: &[String],
    ) -> Result<BatchGet, LedgerError> {
        let mut result = BatchGet::default();
        if item_ids.is_empty() {
            return Ok(result);
        }

        let conn = self.lock()?;
        let placeholders = vec!["?"; item_ids.len()].join(", ");
        let mut stmt = conn
            .prepare(&format!(
                "SELECT {RECORD_COLUMNS} FROM sync_records WHERE provider = ? AND item_id IN ({placeholders})"
            ))
            .map_err(LedgerError::query)?;

        let params = std::iter::once(provider).chain(item_ids.iter().map(String::as_str));
        let records = stmt
            .query_map(rusqlite::params_from_iter(params), row_to_record)
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;

        for record in records {
            result.found.insert(record.item_id.clone(), record);
        }
        result.missing = item_ids
            .iter()
            .filter(|id| !result.found.contains_key(id.as_str()))
            .cloned()
            .collect();
        Ok(result)
    }

    async fn put(
        &self,
        record: &SyncRecord,
        expected_previous: Option<SyncStatus>,
    ) -> Result<(), LedgerError> {
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(LedgerError::query)?;

        if let Some(expected) = expected_previous {
            let found = load_record(&tx, &record.provider, &record.item_id)?.map(|r| r.status);
            if found != Some(expected) {
                return Err(LedgerError::ConditionFailed {
                    item_id: record.item_id.clone(),
                    expected,
                    found,
                });
            }
        }

        upsert_record(&tx, record)?;
        tx.commit().map_err(LedgerError::query)?;
        Ok(())
    }

    async fn claim(
        &self,
        request: &ClaimRequest<'_>,
        lease: Duration,
    ) -> Result<ClaimResult, LedgerError> {
        let now = Utc::now();
        let mut conn = self.lock()?;
        let tx = conn.transaction().map_err(LedgerError::query)?;

        let existing = load_record(&tx, request.provider, request.item_id)?;
        let record = match existing {
            Some(record) if record.status == SyncStatus::Completed => {
                return Ok(ClaimResult::AlreadyCompleted(Box::new(record)));
            }
            Some(record)
                if record.status == SyncStatus::InProgress
                    && (now - record.updated_at)
                        .to_std()
                        .map(|age| age < lease)
                        .unwrap_or(true) =>
            {
                return Ok(ClaimResult::HeldElsewhere {
                    since: record.updated_at,
                });
            }
            Some(mut record) => {
                if record.status == SyncStatus::InProgress {
                    tracing::warn!(
                        item_id = %record.item_id,
                        since = %record.updated_at,
                        "Reclaiming stale in-progress record"
                    );
                }
                record.status = SyncStatus::InProgress;
                record.source_filename = request.source_filename.to_string();
                record.expected_size = request.expected_size;
                record.updated_at = now;
                record
            }
            None => SyncRecord::new(
                request.provider,
                request.item_id,
                request.source_filename,
                request.expected_size,
                SyncStatus::InProgress,
            ),
        };

        let retry_count = record.retry_count;
        upsert_record(&tx, &record)?;
        tx.commit().map_err(LedgerError::query)?;
        Ok(ClaimResult::Claimed { retry_count })
    }

    async fn touch(&self, provider: &str, item_id: &str) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE sync_records SET updated_at = ?1 WHERE provider = ?2 AND item_id = ?3 AND status = 'IN_PROGRESS'",
                rusqlite::params![Utc::now().timestamp_millis(), provider, item_id],
            )
            .map_err(LedgerError::query)?;
        if rows == 0 {
            return Err(not_in_progress(&conn, provider, item_id));
        }
        Ok(())
    }

    async fn mark_completed(
        &self,
        provider: &str,
        item_id: &str,
        completion: &Completion,
    ) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                r#"
                UPDATE sync_records SET
                    status = 'COMPLETED',
                    destination_key = ?1,
                    bytes_transferred = ?2,
                    transfer_duration_secs = ?3,
                    throughput_mbps = ?4,
                    note = ?5,
                    last_error = NULL,
                    updated_at = ?6
                WHERE provider = ?7 AND item_id = ?8 AND status = 'IN_PROGRESS'
                "#,
                rusqlite::params![
                    completion.destination_key,
                    completion.bytes_transferred as i64,
                    completion.duration_secs,
                    completion.throughput_mbps,
                    completion.note,
                    Utc::now().timestamp_millis(),
                    provider,
                    item_id,
                ],
            )
            .map_err(LedgerError::query)?;

        if rows == 0 {
            return Err(not_in_progress(&conn, provider, item_id));
        }
        Ok(())
    }

    async fn mark_failed(
        &self,
        provider: &str,
        item_id: &str,
        error: &str,
    ) -> Result<u32, LedgerError> {
        let conn = self.lock()?;
        let rows = conn
            .execute(
                "UPDATE sync_records SET status = 'FAILED', retry_count = retry_count + 1, last_error = ?1, updated_at = ?2 WHERE provider = ?3 AND item_id = ?4 AND status = 'IN_PROGRESS'",
                rusqlite::params![error, Utc::now().timestamp_millis(), provider, item_id],
            )
            .map_err(LedgerError::query)?;
        if rows == 0 {
            return Err(not_in_progress(&conn, provider, item_id));
        }

        let retry_count: u32 = conn
            .query_row(
                "SELECT retry_count FROM sync_records WHERE provider = ?1 AND item_id = ?2",
                [provider, item_id],
                |row| row.get(0),
            )
            .map_err(LedgerError::query)?;
        Ok(retry_count)
    }

    async fn failed_records(&self) -> Result<Vec<SyncRecord>, LedgerError> {
        let conn = self.lock()?;
        records_with_status(&conn, SyncStatus::Failed)
    }

    async fn completed_records(&self) -> Result<Vec<SyncRecord>, LedgerError> {
        let conn = self.lock()?;
        records_with_status(&conn, SyncStatus::Completed)
    }

    async fn summary(&self) -> Result<LedgerSummary, LedgerError> {
        let conn = self.lock()?;

        let mut summary = LedgerSummary {
            total: 0,
            completed: 0,
            pending: 0,
            in_progress: 0,
            failed: 0,
            last_run_started: None,
            last_run_completed: None,
            last_run_outcome: None,
        };

        let mut stmt = conn
            .prepare("SELECT status, COUNT(*) FROM sync_records GROUP BY status")
            .map_err(LedgerError::query)?;
        let counts = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))
            .map_err(LedgerError::query)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(LedgerError::query)?;

        for (status, count) in counts {
            let count = count as u64;
            summary.total += count;
            match SyncStatus::from_str(&status) {
                Some(SyncStatus::Completed) => summary.completed += count,
                Some(SyncStatus::Pending) => summary.pending += count,
                Some(SyncStatus::InProgress) => summary.in_progress += count,
                Some(SyncStatus::Failed) => summary.failed += count,
                None => tracing::warn!("Unknown status '{}' in ledger", status),
            }
        }

        let last_run: Option<(i64, Option<i64>, Option<String>)> = conn
            .query_row(
                "SELECT started_at, completed_at, outcome FROM sync_runs ORDER BY id DESC LIMIT 1",
                [],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
            .map_err(LedgerError::query)?;

        if let Some((started, completed, outcome)) = last_run {
            summary.last_run_started = Utc.timestamp_opt(started, 0).single();
            summary.last_run_completed =
                completed.and_then(|ts| Utc.timestamp_opt(ts, 0).single());
            summary.last_run_outcome = outcome;
        }

        Ok(summary)
    }

    async fn start_run(&self, correlation_id: &str) -> Result<i64, LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO sync_runs (correlation_id, started_at) VALUES (?1, ?2)",
            rusqlite::params![correlation_id, Utc::now().timestamp()],
        )
        .map_err(LedgerError::query)?;
        Ok(conn.last_insert_rowid())
    }

    async fn complete_run(&self, run_id: i64, stats: &RunStats) -> Result<(), LedgerError> {
        let conn = self.lock()?;
        conn.execute(
            r#"
            UPDATE sync_runs SET
                completed_at = ?1, pages = ?2, items_listed = ?3, items_dispatched = ?4,
                items_completed = ?5, items_failed = ?6, bytes_transferred = ?7,
                outcome = ?8, interrupted = ?9
            WHERE id = ?10
            "#,
            rusqlite::params![
                Utc::now().timestamp(),
                stats.pages as i64,
                stats.items_listed as i64,
                stats.items_dispatched as i64,
                stats.items_completed as i64,
                stats.items_failed as i64,
                stats.bytes_transferred as i64,
                stats.outcome,
                stats.interrupted,
                run_id,
            ],
        )
        .map_err(LedgerError::query)?;
        Ok(())
    }
}

/// Record timestamps are Unix milliseconds so short leases stay meaningful.
fn timestamp_millis(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or(DateTime::UNIX_EPOCH)
}

fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<SyncRecord> {
    let status: String = row.get(6)?;
    let status = SyncStatus::from_str(&status).unwrap_or_else(|| {
        tracing::warn!("Unknown status '{}' in ledger, treating as pending", status);
        SyncStatus::Pending
    });

    Ok(SyncRecord {
        provider: row.get(0)?,
        item_id: row.get(1)?,
        source_filename: row.get(2)?,
        destination_key: row.get(3)?,
        expected_size: row.get::<_, i64>(4)?.max(0) as u64,
        bytes_transferred: row.get::<_, Option<i64>>(5)?.map(|b| b.max(0) as u64),
        status,
        retry_count: row.get(7)?,
        last_error: row.get(8)?,
        note: row.get(9)?,
        created_at: timestamp_millis(row.get(10)?),
        updated_at: timestamp_millis(row.get(11)?),
        transfer_duration_secs: row.get(12)?,
        throughput_mbps: row.get(13)?,
    })
}
