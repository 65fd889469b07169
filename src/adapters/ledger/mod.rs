use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::core::error::TriageError;
use crate::core::model::{
    format_timestamp, parse_timestamp, Alert, Conclusion, NewTraceStep, QueueMessage, Run,
    RunMetrics, RunStatus, RunSummary, StepKind, TraceStep,
};
use crate::core::ports::ledger::{LedgerPort, RunClaim, RunOutcome};

const RUN_COLUMNS: &str = "run_id, alert_json, status, conclusion_json, corrected_conclusion, created_at, completed_at,
     iterations, tool_calls, duration_ms, ungrounded, failure_reason, worker_id, attempt, validated_seq";

pub struct LedgerDb {
    conn: Connection,
}

/// Ledger handle that opens a connection per operation, so it can be shared
/// freely across worker tasks.
pub struct SqliteLedger {
    db_path: PathBuf,
}

impl SqliteLedger {
    pub fn new(db_path: PathBuf) -> Self {
        Self { db_path }
    }

    fn db(&self) -> Result<LedgerDb, TriageError> {
        LedgerDb::open(&self.db_path)
    }
}

impl LedgerPort for SqliteLedger {
    fn claim_run(&self, message: &QueueMessage, worker_id: &str) -> Result<RunClaim, TriageError> {
        self.db()?.claim_run(message, worker_id)
    }

    fn append_step(
        &self,
        run_id: &str,
        worker_id: &str,
        step: NewTraceStep,
    ) -> Result<TraceStep, TriageError> {
        self.db()?.append_step(run_id, worker_id, step)
    }

    fn finish_run(
        &self,
        run_id: &str,
        worker_id: &str,
        outcome: RunOutcome,
    ) -> Result<Run, TriageError> {
        self.db()?.finish_run(run_id, worker_id, outcome)
    }

    fn abandon_run(&self, run_id: &str, reason: &str) -> Result<Option<Run>, TriageError> {
        self.db()?.abandon_run(run_id, reason)
    }

    fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        corrected_conclusion: Option<&str>,
    ) -> Result<Run, TriageError> {
        self.db()?.transition(run_id, to, corrected_conclusion)
    }

    fn get_run(&self, run_id: &str) -> Result<Option<Run>, TriageError> {
        self.db()?.get_run(run_id)
    }

    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, TriageError> {
        self.db()?.list_runs(status, limit)
    }

    fn validated_runs(&self, after_seq: i64) -> Result<Vec<Run>, TriageError> {
        self.db()?.validated_runs(after_seq)
    }
}

enum ClaimKind {
    Started,
    Resumed,
    Settled,
}

impl LedgerDb {
    pub fn open(path: &Path) -> Result<Self, TriageError> {
        let conn = Connection::open(path)?;
        conn.busy_timeout(Duration::from_secs(5))?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS runs (
                run_id TEXT PRIMARY KEY,
                alert_json TEXT NOT NULL,
                status TEXT NOT NULL CHECK (status IN
                    ('pending', 'in_progress', 'completed', 'failed', 'approved', 'corrected', 'rejected')),
                conclusion_json TEXT,
                corrected_conclusion TEXT,
                created_at TEXT NOT NULL,
                completed_at TEXT,
                feedback_at TEXT,
                iterations INTEGER NOT NULL DEFAULT 0,
                tool_calls INTEGER NOT NULL DEFAULT 0,
                duration_ms INTEGER NOT NULL DEFAULT 0,
                ungrounded INTEGER NOT NULL DEFAULT 0,
                failure_reason TEXT,
                worker_id TEXT,
                attempt INTEGER NOT NULL DEFAULT 0,
                validated_seq INTEGER UNIQUE
            );

            CREATE INDEX IF NOT EXISTS idx_runs_status ON runs(status);
            CREATE INDEX IF NOT EXISTS idx_runs_validated ON runs(validated_seq);

            CREATE TABLE IF NOT EXISTS trace_steps (
                run_id TEXT NOT NULL,
                sequence_no INTEGER NOT NULL,
                kind TEXT NOT NULL,
                input TEXT NOT NULL,
                output TEXT NOT NULL,
                error TEXT,
                ts TEXT NOT NULL,
                PRIMARY KEY (run_id, sequence_no),
                FOREIGN KEY (run_id) REFERENCES runs(run_id)
            );

            CREATE TRIGGER IF NOT EXISTS trace_steps_no_update
            BEFORE UPDATE ON trace_steps
            BEGIN
                SELECT RAISE(ABORT, 'trace steps are append-only');
            END;

            CREATE TRIGGER IF NOT EXISTS trace_steps_no_delete
            BEFORE DELETE ON trace_steps
            BEGIN
                SELECT RAISE(ABORT, 'trace steps are append-only');
            END;
            ",
        )?;
        Ok(Self { conn })
    }

    pub fn claim_run(
        &mut self,
        message: &QueueMessage,
        worker_id: &str,
    ) -> Result<RunClaim, TriageError> {
        let run_id = message.job_id.as_str();
        let attempt = i64::from(message.attempt_count);
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let existing: Option<(String, Option<String>, i64)> = tx
            .query_row(
                "SELECT status, worker_id, attempt FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()?;

        let kind = match existing {
            None => {
                let alert_json = serde_json::to_string(&message.alert_snapshot)?;
                let created_at = format_timestamp(&Utc::now());
                tx.execute(
                    "INSERT INTO runs (run_id, alert_json, status, created_at)
                     VALUES (?1, ?2, ?3, ?4)",
                    params![run_id, alert_json, RunStatus::Pending.as_str(), created_at],
                )?;
                tx.execute(
                    "UPDATE runs SET status = ?2, worker_id = ?3, attempt = ?4
                     WHERE run_id = ?1 AND status = ?5",
                    params![
                        run_id,
                        RunStatus::InProgress.as_str(),
                        worker_id,
                        attempt,
                        RunStatus::Pending.as_str()
                    ],
                )?;
                ClaimKind::Started
            }
            Some((status, owner, owned_attempt)) => {
                let status: RunStatus = status.parse()?;
                if status.is_settled() {
                    ClaimKind::Settled
                } else {
                    let same_claim =
                        owner.as_deref() == Some(worker_id) && owned_attempt == attempt;
                    if !same_claim && owned_attempt >= attempt {
                        return Err(TriageError::JobRedeliveryConflict {
                            job_id: run_id.to_string(),
                            owner: format!(
                                "{} (attempt {owned_attempt})",
                                owner.unwrap_or_default()
                            ),
                        });
                    }
                    tx.execute(
                        "UPDATE runs SET status = ?2, worker_id = ?3, attempt = ?4
                         WHERE run_id = ?1 AND status IN (?5, ?2)",
                        params![
                            run_id,
                            RunStatus::InProgress.as_str(),
                            worker_id,
                            attempt,
                            RunStatus::Pending.as_str()
                        ],
                    )?;
                    ClaimKind::Resumed
                }
            }
        };
        tx.commit()?;

        let run = self
            .get_run(run_id)?
            .ok_or_else(|| TriageError::NotFound(run_id.to_string()))?;
        Ok(match kind {
            ClaimKind::Started => RunClaim::Started(run),
            ClaimKind::Resumed => RunClaim::Resumed(run),
            ClaimKind::Settled => RunClaim::Settled(run),
        })
    }

    pub fn append_step(
        &mut self,
        run_id: &str,
        worker_id: &str,
        step: NewTraceStep,
    ) -> Result<TraceStep, TriageError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;

        let state: Option<(String, Option<String>)> = tx
            .query_row(
                "SELECT status, worker_id FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, owner)) = state else {
            return Err(TriageError::NotFound(run_id.to_string()));
        };
        if status != RunStatus::InProgress.as_str() || owner.as_deref() != Some(worker_id) {
            return Err(TriageError::JobRedeliveryConflict {
                job_id: run_id.to_string(),
                owner: format!("{} ({status})", owner.unwrap_or_default()),
            });
        }

        let sequence_no: i64 = tx.query_row(
            "SELECT COALESCE(MAX(sequence_no), 0) + 1 FROM trace_steps WHERE run_id = ?1",
            params![run_id],
            |row| row.get(0),
        )?;
        let timestamp = Utc::now();
        tx.execute(
            "INSERT INTO trace_steps (run_id, sequence_no, kind, input, output, error, ts)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                run_id,
                sequence_no,
                step.kind.as_str(),
                serde_json::to_string(&step.input)?,
                serde_json::to_string(&step.output)?,
                step.error.as_deref(),
                format_timestamp(&timestamp),
            ],
        )?;
        tx.commit()?;

        Ok(TraceStep {
            sequence_no: sequence_no as u32,
            kind: step.kind,
            input: step.input,
            output: step.output,
            timestamp,
            error: step.error,
        })
    }

    pub fn finish_run(
        &mut self,
        run_id: &str,
        worker_id: &str,
        outcome: RunOutcome,
    ) -> Result<Run, TriageError> {
        if !RunStatus::InProgress.can_transition_to(outcome.status) {
            return Err(TriageError::IllegalTransition {
                run_id: run_id.to_string(),
                from: RunStatus::InProgress,
                to: outcome.status,
            });
        }
        let conclusion_json = outcome
            .conclusion
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let changed = self.conn.execute(
            "UPDATE runs
             SET status = ?3,
                 conclusion_json = ?4,
                 failure_reason = ?5,
                 iterations = ?6,
                 tool_calls = ?7,
                 duration_ms = ?8,
                 ungrounded = ?9,
                 completed_at = ?10
             WHERE run_id = ?1 AND worker_id = ?2 AND status = ?11",
            params![
                run_id,
                worker_id,
                outcome.status.as_str(),
                conclusion_json,
                outcome.failure_reason.as_deref(),
                i64::from(outcome.metrics.iterations),
                i64::from(outcome.metrics.tool_calls),
                outcome.metrics.duration_ms as i64,
                outcome.ungrounded,
                format_timestamp(&Utc::now()),
                RunStatus::InProgress.as_str(),
            ],
        )?;

        let run = self
            .get_run(run_id)?
            .ok_or_else(|| TriageError::NotFound(run_id.to_string()))?;
        if changed == 0 {
            if run.status != RunStatus::InProgress {
                return Err(TriageError::IllegalTransition {
                    run_id: run_id.to_string(),
                    from: run.status,
                    to: outcome.status,
                });
            }
            return Err(TriageError::JobRedeliveryConflict {
                job_id: run_id.to_string(),
                owner: run.worker_id.unwrap_or_default(),
            });
        }
        Ok(run)
    }

    pub fn abandon_run(&mut self, run_id: &str, reason: &str) -> Result<Option<Run>, TriageError> {
        self.conn.execute(
            "UPDATE runs
             SET status = ?2, failure_reason = ?3, completed_at = ?4
             WHERE run_id = ?1 AND status IN (?5, ?6)",
            params![
                run_id,
                RunStatus::Failed.as_str(),
                reason,
                format_timestamp(&Utc::now()),
                RunStatus::Pending.as_str(),
                RunStatus::InProgress.as_str(),
            ],
        )?;
        self.get_run(run_id)
    }

    pub fn transition(
        &mut self,
        run_id: &str,
        to: RunStatus,
        corrected_conclusion: Option<&str>,
    ) -> Result<Run, TriageError> {
        let corrected = corrected_conclusion
            .map(str::trim)
            .filter(|text| !text.is_empty());
        if to == RunStatus::Corrected && corrected.is_none() {
            return Err(TriageError::Validation(
                "a Corrected run requires a non-empty corrected_conclusion".to_string(),
            ));
        }
        if to != RunStatus::Corrected && corrected.is_some() {
            return Err(TriageError::Validation(format!(
                "corrected_conclusion is only accepted with Corrected, not {to}"
            )));
        }

        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let current: Option<String> = tx
            .query_row(
                "SELECT status FROM runs WHERE run_id = ?1",
                params![run_id],
                |row| row.get(0),
            )
            .optional()?;
        let Some(current) = current else {
            return Err(TriageError::NotFound(run_id.to_string()));
        };
        let current: RunStatus = current.parse()?;
        if !current.can_transition_to(to) {
            return Err(TriageError::IllegalTransition {
                run_id: run_id.to_string(),
                from: current,
                to,
            });
        }

        let validated_seq: Option<i64> = if to.is_validated() {
            Some(tx.query_row(
                "SELECT COALESCE(MAX(validated_seq), 0) + 1 FROM runs",
                [],
                |row| row.get(0),
            )?)
        } else {
            None
        };

        let changed = tx.execute(
            "UPDATE runs
             SET status = ?2,
                 corrected_conclusion = COALESCE(?3, corrected_conclusion),
                 validated_seq = COALESCE(?4, validated_seq),
                 feedback_at = ?5
             WHERE run_id = ?1 AND status = ?6",
            params![
                run_id,
                to.as_str(),
                corrected,
                validated_seq,
                format_timestamp(&Utc::now()),
                current.as_str(),
            ],
        )?;
        if changed == 0 {
            return Err(TriageError::IllegalTransition {
                run_id: run_id.to_string(),
                from: current,
                to,
            });
        }
        tx.commit()?;

        self.get_run(run_id)?
            .ok_or_else(|| TriageError::NotFound(run_id.to_string()))
    }

    pub fn get_run(&self, run_id: &str) -> Result<Option<Run>, TriageError> {
        let row = self
            .conn
            .query_row(
                &format!("SELECT {RUN_COLUMNS} FROM runs WHERE run_id = ?1"),
                params![run_id],
                RunRow::from_row,
            )
            .optional()?;
        match row {
            Some(row) => {
                let trace = self.load_trace(run_id)?;
                Ok(Some(row.into_run(trace)?))
            }
            None => Ok(None),
        }
    }

    pub fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS},
                    (SELECT COUNT(*) FROM trace_steps t WHERE t.run_id = runs.run_id)
             FROM runs
             WHERE ?1 IS NULL OR status = ?1
             ORDER BY created_at DESC, run_id DESC
             LIMIT ?2"
        ))?;
        let rows = stmt.query_map(
            params![status.map(RunStatus::as_str), limit as i64],
            |row| Ok((RunRow::from_row(row)?, row.get::<_, i64>(15)?)),
        )?;

        let mut summaries = Vec::new();
        for row in rows {
            let (row, steps) = row?;
            let mut summary = row.into_run(Vec::new())?.summary();
            summary.steps = steps as usize;
            summaries.push(summary);
        }
        Ok(summaries)
    }

    pub fn validated_runs(&self, after_seq: i64) -> Result<Vec<Run>, TriageError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {RUN_COLUMNS}
             FROM runs
             WHERE status IN (?1, ?2) AND validated_seq > ?3
             ORDER BY validated_seq ASC"
        ))?;
        let rows = stmt.query_map(
            params![
                RunStatus::Approved.as_str(),
                RunStatus::Corrected.as_str(),
                after_seq
            ],
            RunRow::from_row,
        )?;

        let mut pending = Vec::new();
        for row in rows {
            pending.push(row?);
        }
        let mut runs = Vec::with_capacity(pending.len());
        for row in pending {
            let trace = self.load_trace(&row.run_id)?;
            runs.push(row.into_run(trace)?);
        }
        Ok(runs)
    }

    fn load_trace(&self, run_id: &str) -> Result<Vec<TraceStep>, TriageError> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence_no, kind, input, output, error, ts
             FROM trace_steps
             WHERE run_id = ?1
             ORDER BY sequence_no ASC",
        )?;
        let rows = stmt.query_map(params![run_id], |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, Option<String>>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut trace = Vec::new();
        for row in rows {
            let (sequence_no, kind, input, output, error, ts) = row?;
            let kind = StepKind::parse(&kind).ok_or_else(|| {
                TriageError::Validation(format!("unknown trace step kind '{kind}'"))
            })?;
            trace.push(TraceStep {
                sequence_no: sequence_no as u32,
                kind,
                input: serde_json::from_str(&input)?,
                output: serde_json::from_str(&output)?,
                timestamp: parse_timestamp(&ts)?,
                error,
            });
        }
        Ok(trace)
    }
}

struct RunRow {
    run_id: String,
    alert_json: String,
    status: String,
    conclusion_json: Option<String>,
    corrected_conclusion: Option<String>,
    created_at: String,
    completed_at: Option<String>,
    iterations: i64,
    tool_calls: i64,
    duration_ms: i64,
    ungrounded: bool,
    failure_reason: Option<String>,
    worker_id: Option<String>,
    attempt: i64,
    validated_seq: Option<i64>,
}

impl RunRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            run_id: row.get(0)?,
            alert_json: row.get(1)?,
            status: row.get(2)?,
            conclusion_json: row.get(3)?,
            corrected_conclusion: row.get(4)?,
            created_at: row.get(5)?,
            completed_at: row.get(6)?,
            iterations: row.get(7)?,
            tool_calls: row.get(8)?,
            duration_ms: row.get(9)?,
            ungrounded: row.get(10)?,
            failure_reason: row.get(11)?,
            worker_id: row.get(12)?,
            attempt: row.get(13)?,
            validated_seq: row.get(14)?,
        })
    }

    fn into_run(self, trace: Vec<TraceStep>) -> Result<Run, TriageError> {
        let alert: Alert = serde_json::from_str(&self.alert_json)?;
        let conclusion = match self.conclusion_json.as_deref().map(str::trim) {
            Some(raw) if !raw.is_empty() => Some(serde_json::from_str::<Conclusion>(raw)?),
            _ => None,
        };
        Ok(Run {
            id: self.run_id,
            alert,
            status: self.status.parse()?,
            trace,
            conclusion,
            corrected_conclusion: self.corrected_conclusion,
            created_at: parse_timestamp(&self.created_at)?,
            completed_at: self
                .completed_at
                .as_deref()
                .map(parse_timestamp)
                .transpose()?,
            metrics: RunMetrics {
                iterations: self.iterations as u32,
                tool_calls: self.tool_calls as u32,
                duration_ms: self.duration_ms as u64,
            },
            ungrounded: self.ungrounded,
            failure_reason: self.failure_reason,
            worker_id: self.worker_id,
            attempt: self.attempt as u32,
            validated_seq: self.validated_seq,
        })
    }
}
