use crate::core::error::TriageError;
use crate::core::model::{FeedbackUpdate, Run, RunStatus};
use crate::core::ports::ledger::LedgerPort;

/// Records a reviewer's verdict on a completed run. The ledger applies it as
/// a compare-and-set, so concurrent reviews of one run settle on one winner.
pub fn apply_feedback(ledger: &dyn LedgerPort, update: &FeedbackUpdate) -> Result<Run, TriageError> {
    if !matches!(
        update.new_status,
        RunStatus::Approved | RunStatus::Corrected | RunStatus::Rejected
    ) {
        return Err(TriageError::Validation(format!(
            "feedback must be approved, corrected or rejected, not {}",
            update.new_status
        )));
    }
    if update.run_id.trim().is_empty() {
        return Err(TriageError::Validation("feedback requires a run_id".to_string()));
    }

    let run = ledger.transition(
        &update.run_id,
        update.new_status,
        update.corrected_conclusion.as_deref(),
    )?;
    log::info!("run {} marked {}", run.id, run.status);
    Ok(run)
}
