use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};

use crate::core::error::TriageError;
use crate::core::model::{format_timestamp, parse_timestamp, Alert, QueueMessage};
use crate::core::ports::queue::QueuePort;

/// Durable at-least-once job queue. A claim is a time-bounded lease; a job
/// whose lease lapses without an ack becomes deliverable again.
pub struct SqliteJobQueue {
    db_path: PathBuf,
    lease: Duration,
}

impl SqliteJobQueue {
    pub fn new(db_path: PathBuf, lease: Duration) -> Self {
        Self { db_path, lease }
    }

    fn open(&self) -> Result<Connection, TriageError> {
        open_queue(&self.db_path)
    }
}

fn open_queue(path: &Path) -> Result<Connection, TriageError> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    conn.execute_batch(
        "
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;

        CREATE TABLE IF NOT EXISTS jobs (
            job_id TEXT PRIMARY KEY,
            alert_id TEXT NOT NULL,
            alert_json TEXT NOT NULL,
            enqueued_at TEXT NOT NULL,
            attempt_count INTEGER NOT NULL DEFAULT 0,
            state TEXT NOT NULL CHECK (state IN ('queued', 'claimed')),
            claimed_by TEXT,
            lease_expires_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_jobs_state ON jobs(state, enqueued_at);
        ",
    )?;
    Ok(conn)
}

impl QueuePort for SqliteJobQueue {
    fn enqueue(&self, message: &QueueMessage) -> Result<(), TriageError> {
        let conn = self.open()?;
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO jobs (job_id, alert_id, alert_json, enqueued_at, attempt_count, state)
             VALUES (?1, ?2, ?3, ?4, ?5, 'queued')",
            params![
                message.job_id,
                message.alert_snapshot.id,
                serde_json::to_string(&message.alert_snapshot)?,
                format_timestamp(&message.enqueued_at),
                i64::from(message.attempt_count),
            ],
        )?;
        if inserted == 0 {
            log::debug!("job {} already enqueued", message.job_id);
        }
        Ok(())
    }

    fn claim(&self, worker_id: &str) -> Result<Option<QueueMessage>, TriageError> {
        let mut conn = self.open()?;
        let now = Utc::now();
        let now_ts = format_timestamp(&now);
        let lease = chrono::Duration::from_std(self.lease)
            .map_err(|e| TriageError::Config(format!("invalid lease duration: {e}")))?;
        let expires_at = format_timestamp(&(now + lease));

        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let candidate: Option<(String, String, String, i64)> = tx
            .query_row(
                "SELECT job_id, alert_json, enqueued_at, attempt_count
                 FROM jobs
                 WHERE state = 'queued'
                    OR (state = 'claimed' AND lease_expires_at <= ?1)
                 ORDER BY enqueued_at ASC, rowid ASC
                 LIMIT 1",
                params![now_ts],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        let Some((job_id, alert_json, enqueued_at, attempt_count)) = candidate else {
            return Ok(None);
        };

        let attempt_count = attempt_count + 1;
        tx.execute(
            "UPDATE jobs
             SET state = 'claimed', claimed_by = ?2, lease_expires_at = ?3, attempt_count = ?4
             WHERE job_id = ?1",
            params![job_id, worker_id, expires_at, attempt_count],
        )?;
        tx.commit()?;

        let alert: Alert = serde_json::from_str(&alert_json)?;
        Ok(Some(QueueMessage {
            job_id,
            alert_snapshot: alert,
            enqueued_at: parse_timestamp(&enqueued_at)?,
            attempt_count: attempt_count as u32,
        }))
    }

    fn ack(&self, job_id: &str, worker_id: &str) -> Result<(), TriageError> {
        let conn = self.open()?;
        let removed = conn.execute(
            "DELETE FROM jobs WHERE job_id = ?1 AND (claimed_by = ?2 OR state = 'queued')",
            params![job_id, worker_id],
        )?;
        if removed > 0 {
            return Ok(());
        }
        let holder: Option<Option<String>> = conn
            .query_row(
                "SELECT claimed_by FROM jobs WHERE job_id = ?1",
                params![job_id],
                |row| row.get(0),
            )
            .optional()?;
        match holder {
            None => Ok(()),
            Some(owner) => Err(TriageError::JobRedeliveryConflict {
                job_id: job_id.to_string(),
                owner: owner.unwrap_or_default(),
            }),
        }
    }

    fn release(&self, job_id: &str, worker_id: &str) -> Result<(), TriageError> {
        let conn = self.open()?;
        conn.execute(
            "UPDATE jobs
             SET state = 'queued', claimed_by = NULL, lease_expires_at = NULL
             WHERE job_id = ?1 AND claimed_by = ?2",
            params![job_id, worker_id],
        )?;
        Ok(())
    }

    fn pending_count(&self) -> Result<usize, TriageError> {
        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM jobs", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{message, remove_db, temp_db_path};

    fn queue(lease_ms: u64) -> (SqliteJobQueue, PathBuf) {
        let path = temp_db_path("queue");
        (
            SqliteJobQueue::new(path.clone(), Duration::from_millis(lease_ms)),
            path,
        )
    }

    #[test]
    fn job_is_leased_to_one_worker_at_a_time() {
        let (queue, path) = queue(60_000);
        queue.enqueue(&message("job-1", 0)).expect("enqueue");
        queue.enqueue(&message("job-1", 0)).expect("enqueue twice");
        assert_eq!(queue.pending_count().expect("count"), 1);

        let claimed = queue.claim("w1").expect("claim").expect("job");
        assert_eq!(claimed.job_id, "job-1");
        assert_eq!(claimed.attempt_count, 1);
        assert!(queue.claim("w2").expect("claim").is_none());

        let err = queue.ack("job-1", "w2").expect_err("not the holder");
        assert!(matches!(err, TriageError::JobRedeliveryConflict { .. }));

        queue.ack("job-1", "w1").expect("ack");
        assert_eq!(queue.pending_count().expect("count"), 0);
        queue.ack("job-1", "w1").expect("ack is idempotent");

        remove_db(&path);
    }

    #[test]
    fn expired_lease_is_redelivered_with_higher_attempt() {
        let (queue, path) = queue(0);
        queue.enqueue(&message("job-1", 0)).expect("enqueue");

        let first = queue.claim("w1").expect("claim").expect("job");
        let second = queue.claim("w2").expect("claim").expect("redelivered");
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(second.attempt_count, 2);

        remove_db(&path);
    }

    #[test]
    fn released_job_returns_in_fifo_order() {
        let (queue, path) = queue(60_000);
        queue.enqueue(&message("job-1", 0)).expect("enqueue 1");
        queue.enqueue(&message("job-2", 0)).expect("enqueue 2");

        let first = queue.claim("w1").expect("claim").expect("job");
        assert_eq!(first.job_id, "job-1");
        queue.release("job-1", "w1").expect("release");

        let again = queue.claim("w1").expect("claim").expect("job");
        assert_eq!(again.job_id, "job-1");
        assert_eq!(again.attempt_count, 2);

        remove_db(&path);
    }
}
