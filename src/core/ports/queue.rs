use crate::core::error::TriageError;
use crate::core::model::QueueMessage;

pub trait QueuePort: Send + Sync {
    /// Idempotent per job id.
    fn enqueue(&self, message: &QueueMessage) -> Result<(), TriageError>;

    /// Leases the oldest deliverable job to `worker_id`, bumping its attempt count.
    fn claim(&self, worker_id: &str) -> Result<Option<QueueMessage>, TriageError>;

    /// Destroys the job. Fails with `JobRedeliveryConflict` if another worker holds the lease.
    fn ack(&self, job_id: &str, worker_id: &str) -> Result<(), TriageError>;

    /// Returns a leased job to the queue for redelivery.
    fn release(&self, job_id: &str, worker_id: &str) -> Result<(), TriageError>;

    fn pending_count(&self) -> Result<usize, TriageError>;
}
