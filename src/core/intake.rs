use chrono::Utc;

use crate::core::error::TriageError;
use crate::core::model::{Alert, AlertSubmission, Job, QueueMessage};
use crate::core::ports::queue::QueuePort;

/// Validates an alert and queues one job for it. Malformed submissions are
/// rejected before anything is written.
pub fn submit_alert(queue: &dyn QueuePort, submission: AlertSubmission) -> Result<Job, TriageError> {
    submission.validate()?;
    let now = Utc::now();
    let message = QueueMessage {
        job_id: uuid::Uuid::new_v4().to_string(),
        alert_snapshot: Alert::from_submission(submission, now),
        enqueued_at: now,
        attempt_count: 0,
    };
    queue.enqueue(&message)?;
    log::info!(
        "queued job {} for {}",
        message.job_id,
        message.alert_snapshot.headline()
    );
    Ok(message.job())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::adapters::queue::SqliteJobQueue;
    use crate::testing::{cpu_submission, remove_db, temp_db_path};

    #[test]
    fn valid_alert_yields_exactly_one_job() {
        let db_path = temp_db_path("intake");
        let queue = SqliteJobQueue::new(db_path.clone(), Duration::from_secs(60));

        let job = submit_alert(&queue, cpu_submission()).expect("submit");
        assert_eq!(job.attempt_count, 0);
        assert_eq!(queue.pending_count().expect("count"), 1);

        let claimed = queue.claim("w1").expect("claim").expect("message");
        assert_eq!(claimed.job_id, job.id);
        assert_eq!(claimed.alert_snapshot.fingerprint, "cpu-high-podA");
        assert_eq!(claimed.alert_snapshot.id, job.alert_id);

        remove_db(&db_path);
    }

    #[test]
    fn malformed_alert_is_rejected_without_enqueueing() {
        let db_path = temp_db_path("intake-invalid");
        let queue = SqliteJobQueue::new(db_path.clone(), Duration::from_secs(60));

        let mut submission = cpu_submission();
        submission.fingerprint = String::new();
        let err = submit_alert(&queue, submission).expect_err("must reject");
        assert!(matches!(err, TriageError::Validation(_)));
        assert!(err.is_client_error());
        assert_eq!(queue.pending_count().expect("count"), 0);

        remove_db(&db_path);
    }
}
