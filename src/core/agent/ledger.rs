use crate::core::error::TriageError;
use crate::core::model::{Conclusion, NewTraceStep, Run, RunMetrics, RunStatus};
use crate::core::ports::emitter::EmitterPort;
use crate::core::ports::ledger::{LedgerPort, RunOutcome};

use super::events::emit_trace_step;
use super::state::InvestigationState;

/// Persists the step first; only a committed step reaches loop state and listeners.
pub(super) fn record_step(
    ledger: &dyn LedgerPort,
    emitter: &dyn EmitterPort,
    run_id: &str,
    worker_id: &str,
    state: &mut InvestigationState,
    step: NewTraceStep,
) -> Result<(), TriageError> {
    let committed = ledger.append_step(run_id, worker_id, step)?;
    emit_trace_step(emitter, run_id, &committed);
    state.record(committed);
    Ok(())
}

pub(super) fn complete_run(
    ledger: &dyn LedgerPort,
    run_id: &str,
    worker_id: &str,
    conclusion: Conclusion,
    metrics: RunMetrics,
    ungrounded: bool,
) -> Result<Run, TriageError> {
    ledger.finish_run(
        run_id,
        worker_id,
        RunOutcome {
            status: RunStatus::Completed,
            conclusion: Some(conclusion),
            failure_reason: None,
            metrics,
            ungrounded,
        },
    )
}

pub(super) fn fail_run(
    ledger: &dyn LedgerPort,
    run_id: &str,
    worker_id: &str,
    reason: &str,
    metrics: RunMetrics,
    ungrounded: bool,
) -> Result<Run, TriageError> {
    ledger.finish_run(
        run_id,
        worker_id,
        RunOutcome {
            status: RunStatus::Failed,
            conclusion: None,
            failure_reason: Some(reason.to_string()),
            metrics,
            ungrounded,
        },
    )
}
