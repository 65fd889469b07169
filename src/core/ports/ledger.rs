use crate::core::error::TriageError;
use crate::core::model::{
    Conclusion, NewTraceStep, QueueMessage, Run, RunMetrics, RunStatus, RunSummary, TraceStep,
};

/// Result of asking the ledger for ownership of a job's run.
#[derive(Debug, Clone)]
pub enum RunClaim {
    /// Fresh run, moved Pending -> InProgress for this worker.
    Started(Run),
    /// Run already InProgress from an earlier delivery; its trace must be replayed.
    Resumed(Run),
    /// Nothing left for the agent to do.
    Settled(Run),
}

impl RunClaim {
    pub fn run(&self) -> &Run {
        match self {
            RunClaim::Started(run) | RunClaim::Resumed(run) | RunClaim::Settled(run) => run,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub status: RunStatus,
    pub conclusion: Option<Conclusion>,
    pub failure_reason: Option<String>,
    pub metrics: RunMetrics,
    pub ungrounded: bool,
}

pub trait LedgerPort: Send + Sync {
    fn claim_run(&self, message: &QueueMessage, worker_id: &str) -> Result<RunClaim, TriageError>;

    /// Appends the next step of an InProgress run owned by `worker_id`.
    fn append_step(
        &self,
        run_id: &str,
        worker_id: &str,
        step: NewTraceStep,
    ) -> Result<TraceStep, TriageError>;

    fn finish_run(
        &self,
        run_id: &str,
        worker_id: &str,
        outcome: RunOutcome,
    ) -> Result<Run, TriageError>;

    /// Forces a run that never settled to Failed regardless of owner.
    /// Returns `None` when no run exists for the id.
    fn abandon_run(&self, run_id: &str, reason: &str) -> Result<Option<Run>, TriageError>;

    /// Compare-and-set transition used by the feedback gateway.
    fn transition(
        &self,
        run_id: &str,
        to: RunStatus,
        corrected_conclusion: Option<&str>,
    ) -> Result<Run, TriageError>;

    fn get_run(&self, run_id: &str) -> Result<Option<Run>, TriageError>;

    fn list_runs(
        &self,
        status: Option<RunStatus>,
        limit: usize,
    ) -> Result<Vec<RunSummary>, TriageError>;

    /// Approved or Corrected runs validated after `after_seq`, in the order
    /// they were validated.
    fn validated_runs(&self, after_seq: i64) -> Result<Vec<Run>, TriageError>;
}
