use std::collections::BTreeMap;
use std::path::PathBuf;

use chrono::Utc;
use serde_json::json;

use crate::core::model::{Alert, AlertSubmission, QueueMessage};

pub fn temp_db_path(label: &str) -> PathBuf {
    std::env::temp_dir().join(format!("triage-{label}-{}.db", uuid::Uuid::new_v4()))
}

pub fn remove_db(path: &PathBuf) {
    let _ = std::fs::remove_file(path);
    let _ = std::fs::remove_file(path.with_extension("db-wal"));
    let _ = std::fs::remove_file(path.with_extension("db-shm"));
}

pub fn cpu_submission() -> AlertSubmission {
    let mut payload = BTreeMap::new();
    payload.insert("alertname".to_string(), json!("HighCPU"));
    payload.insert("pod".to_string(), json!("podA"));
    payload.insert("namespace".to_string(), json!("prod"));
    AlertSubmission {
        source: "prometheus".to_string(),
        severity: "critical".to_string(),
        fingerprint: "cpu-high-podA".to_string(),
        payload,
    }
}

pub fn message(job_id: &str, attempt_count: u32) -> QueueMessage {
    QueueMessage {
        job_id: job_id.to_string(),
        alert_snapshot: Alert::from_submission(cpu_submission(), Utc::now()),
        enqueued_at: Utc::now(),
        attempt_count,
    }
}
