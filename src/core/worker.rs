use std::ops::AddAssign;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;

use crate::core::agent::Agent;
use crate::core::error::TriageError;
use crate::core::model::RunStatus;
use crate::core::ports::ledger::LedgerPort;
use crate::core::ports::queue::QueuePort;

const ABANDON_REASON: &str = "delivery_attempts_exhausted";

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub pool_size: usize,
    /// Idle wait between empty polls of the queue.
    pub poll_interval: Duration,
    /// Deliveries allowed per job before it is dropped and its run failed.
    pub max_delivery_attempts: u32,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            pool_size: 4,
            poll_interval: Duration::from_millis(500),
            max_delivery_attempts: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// The agent settled the run and the job was acknowledged.
    Settled(RunStatus),
    /// Too many deliveries: the job was dropped.
    Abandoned,
    /// Another worker owns the job now; nothing was written.
    Conflict,
    /// Processing failed; the job goes back on the queue.
    Released,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolReport {
    pub processed: usize,
    pub completed: usize,
    pub failed: usize,
    pub abandoned: usize,
    pub conflicts: usize,
    pub released: usize,
}

impl PoolReport {
    fn record(&mut self, outcome: &JobOutcome) {
        self.processed += 1;
        match outcome {
            JobOutcome::Settled(RunStatus::Failed) => self.failed += 1,
            JobOutcome::Settled(_) => self.completed += 1,
            JobOutcome::Abandoned => self.abandoned += 1,
            JobOutcome::Conflict => self.conflicts += 1,
            JobOutcome::Released => self.released += 1,
        }
    }
}

impl AddAssign for PoolReport {
    fn add_assign(&mut self, other: Self) {
        self.processed += other.processed;
        self.completed += other.completed;
        self.failed += other.failed;
        self.abandoned += other.abandoned;
        self.conflicts += other.conflicts;
        self.released += other.released;
    }
}

/// Fixed-size pool of workers. Each worker finishes one job before claiming
/// the next; runs proceed concurrently across workers.
#[derive(Clone)]
pub struct WorkerPool {
    agent: Arc<Agent>,
    queue: Arc<dyn QueuePort>,
    ledger: Arc<dyn LedgerPort>,
    config: WorkerPoolConfig,
}

impl WorkerPool {
    pub fn new(
        agent: Arc<Agent>,
        queue: Arc<dyn QueuePort>,
        ledger: Arc<dyn LedgerPort>,
        config: WorkerPoolConfig,
    ) -> Self {
        Self {
            agent,
            queue,
            ledger,
            config,
        }
    }

    fn worker_ids(&self) -> Vec<String> {
        let pid = std::process::id();
        (0..self.config.pool_size.max(1))
            .map(|index| format!("worker-{pid}-{index}"))
            .collect()
    }

    /// Serves the queue until `shutdown` flips to true. In-flight jobs are
    /// finished before a worker exits.
    pub async fn run(&self, shutdown: watch::Receiver<bool>) -> PoolReport {
        let mut handles = Vec::new();
        for worker_id in self.worker_ids() {
            let pool = self.clone();
            let shutdown = shutdown.clone();
            handles.push(tokio::spawn(async move {
                pool.serve(&worker_id, shutdown).await
            }));
        }
        self.join(handles).await
    }

    /// Processes jobs until the queue has nothing deliverable left.
    pub async fn drain(&self) -> PoolReport {
        let mut handles = Vec::new();
        for worker_id in self.worker_ids() {
            let pool = self.clone();
            handles.push(tokio::spawn(async move {
                let mut report = PoolReport::default();
                loop {
                    match pool.process_one(&worker_id).await {
                        Ok(Some(outcome)) => report.record(&outcome),
                        Ok(None) => break,
                        Err(err) => {
                            log::error!("{worker_id} stopped draining: {err}");
                            break;
                        }
                    }
                }
                report
            }));
        }
        self.join(handles).await
    }

    async fn join(&self, handles: Vec<tokio::task::JoinHandle<PoolReport>>) -> PoolReport {
        let mut total = PoolReport::default();
        for handle in handles {
            match handle.await {
                Ok(report) => total += report,
                Err(err) => log::error!("worker task panicked: {err}"),
            }
        }
        log::info!(
            "pool finished: processed={} completed={} failed={} abandoned={} released={}",
            total.processed,
            total.completed,
            total.failed,
            total.abandoned,
            total.released
        );
        total
    }

    async fn serve(&self, worker_id: &str, mut shutdown: watch::Receiver<bool>) -> PoolReport {
        let mut report = PoolReport::default();
        log::debug!("{worker_id} started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let idle = match self.process_one(worker_id).await {
                Ok(Some(outcome)) => {
                    report.record(&outcome);
                    false
                }
                Ok(None) => true,
                Err(err) => {
                    log::error!("{worker_id} queue error: {err}");
                    true
                }
            };
            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                    changed = shutdown.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
        log::debug!("{worker_id} stopped after {} job(s)", report.processed);
        report
    }

    /// Claims and settles at most one job. `Ok(None)` means the queue is empty.
    pub async fn process_one(&self, worker_id: &str) -> Result<Option<JobOutcome>, TriageError> {
        let Some(message) = self.queue.claim(worker_id)? else {
            return Ok(None);
        };
        let job_id = message.job_id.clone();

        if message.attempt_count > self.config.max_delivery_attempts {
            log::warn!(
                "job {job_id} delivered {} times; dropping it",
                message.attempt_count
            );
            if let Some(run) = self.ledger.abandon_run(&job_id, ABANDON_REASON)? {
                log::warn!("run {job_id} is {}", run.status);
            }
            self.queue.ack(&job_id, worker_id)?;
            return Ok(Some(JobOutcome::Abandoned));
        }

        log::debug!(
            "{worker_id} picked job {job_id} (attempt {})",
            message.attempt_count
        );
        let outcome = match self.agent.investigate(&message, worker_id).await {
            Ok(run) => {
                self.acknowledge(&job_id, worker_id)?;
                JobOutcome::Settled(run.status)
            }
            Err(err @ TriageError::JobRedeliveryConflict { .. }) => {
                log::warn!("{worker_id} lost job {job_id}: {err}");
                JobOutcome::Conflict
            }
            Err(err) => {
                log::error!("job {job_id} failed on {worker_id}: {err}");
                self.queue.release(&job_id, worker_id)?;
                JobOutcome::Released
            }
        };
        Ok(Some(outcome))
    }

    /// A lease that lapsed mid-run may already belong to another worker;
    /// the run is settled either way, so that is not an error.
    fn acknowledge(&self, job_id: &str, worker_id: &str) -> Result<(), TriageError> {
        match self.queue.ack(job_id, worker_id) {
            Err(TriageError::JobRedeliveryConflict { owner, .. }) => {
                log::warn!("job {job_id} re-leased to {owner} before ack");
                Ok(())
            }
            other => other,
        }
    }
}
