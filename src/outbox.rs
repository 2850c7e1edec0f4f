//! # Submission Outbox
//!
//! SQLite-backed queue for activity payloads whose submission failed.
//!
//! The default submission path logs and drops failures. An app that wants
//! territory gains to survive flaky networks routes submissions through
//! [`SubmissionOutbox::submit_or_enqueue`] and calls
//! [`SubmissionOutbox::flush`] when connectivity returns (or on a timer).
//!
//! ## Retry policy
//!
//! - Retryable failures are transport errors, 5xx, 408 and 429.
//! - After the n-th failed attempt the entry waits `base * 2^(n-1)`.
//! - Entries are dropped after `outbox_max_attempts` attempts, or at once
//!   when the service rejects them (any other 4xx, undecodable answer).

use chrono::{DateTime, Duration, TimeZone, Utc};
use log::{debug, info, warn};
use rusqlite::{params, Connection, OptionalExtension};

use crate::submission::{ActivityIngestion, ActivityPayload, SubmitOutcome};
use crate::{Result, TerritoryConfig, TerritoryError};

/// Longest wait between two attempts.
const MAX_BACKOFF_SECS: i64 = 6 * 60 * 60;

/// One queued payload.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingSubmission {
    pub id: i64,
    pub payload: ActivityPayload,
    /// Failed attempts so far
    pub attempts: u32,
    pub next_attempt_at: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// What one [`SubmissionOutbox::flush`] did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushReport {
    /// Accepted by the service and removed
    pub sent: usize,
    /// Failed again, rescheduled
    pub rescheduled: usize,
    /// Removed without success (rejected or out of attempts)
    pub dropped: usize,
    /// Not due yet
    pub waiting: usize,
}

/// Persistent queue of unsent activities.
pub struct SubmissionOutbox {
    db: Connection,
    max_attempts: u32,
    base_backoff_secs: u64,
}

impl SubmissionOutbox {
    // ========================================================================
    // Initialization
    // ========================================================================

    /// Open (or create) the outbox database at `db_path`.
    pub fn new(db_path: &str, config: &TerritoryConfig) -> Result<Self> {
        config.validate()?;
        let db = Connection::open(db_path)?;
        Self::init_schema(&db)?;

        Ok(Self {
            db,
            max_attempts: config.outbox_max_attempts,
            base_backoff_secs: config.outbox_base_backoff_secs,
        })
    }

    /// In-memory outbox (for testing).
    pub fn in_memory(config: &TerritoryConfig) -> Result<Self> {
        Self::new(":memory:", config)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS pending_submissions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                payload BLOB NOT NULL,
                attempts INTEGER NOT NULL DEFAULT 0,
                next_attempt_at INTEGER NOT NULL,
                last_error TEXT,
                created_at INTEGER DEFAULT (strftime('%s', 'now'))
            );

            CREATE INDEX IF NOT EXISTS idx_pending_next_attempt
                ON pending_submissions(next_attempt_at);
            "#,
        )?;
        Ok(())
    }

    // ========================================================================
    // Queue
    // ========================================================================

    /// Queue `payload`, due immediately.
    pub fn enqueue(&self, payload: &ActivityPayload, now: DateTime<Utc>) -> Result<i64> {
        self.insert(payload, 0, now, None)
    }

    fn insert(
        &self,
        payload: &ActivityPayload,
        attempts: u32,
        next_attempt_at: DateTime<Utc>,
        last_error: Option<&str>,
    ) -> Result<i64> {
        let blob = rmp_serde::to_vec_named(payload).map_err(|e| TerritoryError::Persistence {
            message: format!("Failed to encode payload: {}", e),
        })?;
        self.db.execute(
            "INSERT INTO pending_submissions (payload, attempts, next_attempt_at, last_error)
             VALUES (?, ?, ?, ?)",
            params![blob, attempts, next_attempt_at.timestamp(), last_error],
        )?;
        let id = self.db.last_insert_rowid();
        debug!(
            "[SubmissionOutbox] Queued submission {} ({} cells)",
            id,
            payload.h3_indexes.len()
        );
        Ok(id)
    }

    pub fn len(&self) -> Result<usize> {
        let count: i64 = self
            .db
            .query_row("SELECT COUNT(*) FROM pending_submissions", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Every queued entry, oldest first.
    pub fn pending(&self) -> Result<Vec<PendingSubmission>> {
        self.load(
            "SELECT id, payload, attempts, next_attempt_at, last_error
             FROM pending_submissions ORDER BY id",
            None,
        )
    }

    /// Entries whose next attempt is at or before `now`, oldest first.
    pub fn due(&self, now: DateTime<Utc>) -> Result<Vec<PendingSubmission>> {
        self.load(
            "SELECT id, payload, attempts, next_attempt_at, last_error
             FROM pending_submissions WHERE next_attempt_at <= ? ORDER BY id",
            Some(now.timestamp()),
        )
    }

    pub fn get(&self, id: i64) -> Result<Option<PendingSubmission>> {
        let row = self
            .db
            .query_row(
                "SELECT id, payload, attempts, next_attempt_at, last_error
                 FROM pending_submissions WHERE id = ?",
                params![id],
                row_to_raw,
            )
            .optional()?;
        row.map(decode_row).transpose()
    }

    fn load(&self, sql: &str, before: Option<i64>) -> Result<Vec<PendingSubmission>> {
        let mut stmt = self.db.prepare(sql)?;
        let rows = match before {
            Some(ts) => stmt
                .query_map(params![ts], row_to_raw)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
            None => stmt
                .query_map([], row_to_raw)?
                .collect::<rusqlite::Result<Vec<_>>>()?,
        };
        rows.into_iter().map(decode_row).collect()
    }

    pub fn remove(&self, id: i64) -> Result<bool> {
        let deleted = self
            .db
            .execute("DELETE FROM pending_submissions WHERE id = ?", params![id])?;
        Ok(deleted > 0)
    }

    pub fn clear(&self) -> Result<()> {
        self.db.execute("DELETE FROM pending_submissions", [])?;
        Ok(())
    }

    /// Wait after `attempts` failed attempts: `base * 2^(attempts-1)`, capped.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(30);
        let secs = (self.base_backoff_secs as i64)
            .saturating_mul(1i64 << exponent)
            .min(MAX_BACKOFF_SECS);
        Duration::seconds(secs)
    }

    /// Record a failed attempt. Returns `false` when the entry was dropped.
    fn record_failure(
        &self,
        entry: &PendingSubmission,
        error: &TerritoryError,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let attempts = entry.attempts + 1;
        if !is_retryable(error) || attempts >= self.max_attempts {
            warn!(
                "[SubmissionOutbox] Dropping submission {} after {} attempts: {}",
                entry.id, attempts, error
            );
            self.remove(entry.id)?;
            return Ok(false);
        }

        let next = now + self.backoff(attempts);
        self.db.execute(
            "UPDATE pending_submissions SET attempts = ?, next_attempt_at = ?, last_error = ?
             WHERE id = ?",
            params![attempts, next.timestamp(), error.to_string(), entry.id],
        )?;
        Ok(true)
    }

    // ========================================================================
    // Sending
    // ========================================================================

    /// Try every due entry once.
    pub async fn flush<I: ActivityIngestion>(
        &mut self,
        ingestion: &I,
        now: DateTime<Utc>,
    ) -> Result<FlushReport> {
        let mut report = FlushReport {
            waiting: self.len()?,
            ..Default::default()
        };

        for entry in self.due(now)? {
            report.waiting -= 1;
            match ingestion.ingest(&entry.payload).await {
                Ok(()) => {
                    self.remove(entry.id)?;
                    report.sent += 1;
                }
                Err(e) => {
                    if self.record_failure(&entry, &e, now)? {
                        report.rescheduled += 1;
                    } else {
                        report.dropped += 1;
                    }
                }
            }
        }

        if report.sent + report.rescheduled + report.dropped > 0 {
            info!(
                "[SubmissionOutbox] Flush: {} sent, {} rescheduled, {} dropped, {} waiting",
                report.sent, report.rescheduled, report.dropped, report.waiting
            );
        }
        Ok(report)
    }

    /// Send `payload` now; park it for retry if the failure is retryable.
    pub async fn submit_or_enqueue<I: ActivityIngestion>(
        &mut self,
        ingestion: &I,
        payload: ActivityPayload,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        match ingestion.ingest(&payload).await {
            Ok(()) => Ok(SubmitOutcome::Accepted),
            Err(e) => {
                if is_retryable(&e) && self.max_attempts > 1 {
                    self.insert(&payload, 1, now + self.backoff(1), Some(&e.to_string()))?;
                    info!("[SubmissionOutbox] Submission failed, queued for retry: {}", e);
                } else {
                    warn!("[SubmissionOutbox] Submission rejected, not queued: {}", e);
                }
                Ok(SubmitOutcome::Failed(e))
            }
        }
    }
}

type RawRow = (i64, Vec<u8>, u32, i64, Option<String>);

fn row_to_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
    ))
}

fn decode_row(row: RawRow) -> Result<PendingSubmission> {
    let (id, blob, attempts, next_attempt_at, last_error) = row;
    let payload: ActivityPayload =
        rmp_serde::from_slice(&blob).map_err(|e| TerritoryError::Persistence {
            message: format!("Corrupt outbox entry {}: {}", id, e),
        })?;
    let next_attempt_at = Utc
        .timestamp_opt(next_attempt_at, 0)
        .single()
        .ok_or_else(|| TerritoryError::Persistence {
            message: format!("Invalid timestamp in outbox entry {}", id),
        })?;

    Ok(PendingSubmission {
        id,
        payload,
        attempts,
        next_attempt_at,
        last_error,
    })
}

fn is_retryable(error: &TerritoryError) -> bool {
    match error {
        TerritoryError::Http { status_code, .. } => match status_code {
            None => true,
            Some(code) => *code >= 500 || *code == 408 || *code == 429,
        },
        _ => false,
    }
}
