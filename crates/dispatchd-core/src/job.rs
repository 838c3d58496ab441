//! Job identity and lifecycle types.

use chrono::Utc;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// Lifecycle state of a build job.
///
/// Transitions are monotonic: `Pending -> Running -> {Completed, Failed,
/// Cancelled}`. A terminal job never re-enters an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Completed | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a job's progress, served by the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct JobStatusInfo {
    pub job_id: String,
    pub status: JobStatus,
    /// Coarse progress indicator: 0 pending, 10 running, 100 terminal.
    pub progress: u8,
    /// Unix seconds; `None` until the job starts.
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    #[serde(skip)]
    pub completed: bool,
}

/// Snapshot of a job's outcome, served by the result endpoint.
///
/// `status` reads `"in_progress"` until the job is terminal; the `completed`
/// flag lets callers distinguish "not ready yet" from "unknown job".
#[derive(Debug, Clone, Serialize)]
pub struct JobResultInfo {
    pub job_id: String,
    pub status: String,
    pub exit_code: i32,
    pub output: String,
    pub completed_at: Option<i64>,
    #[serde(skip)]
    pub completed: bool,
}

/// Generate a job id unique within one running server: millisecond
/// timestamp plus a random four-digit disambiguator.
pub fn generate_job_id() -> String {
    let millis = Utc::now().timestamp_millis();
    let salt: u32 = rand::thread_rng().gen_range(1000..10000);
    format!("{millis}-{salt}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(!JobStatus::Pending.is_terminal());
        assert!(!JobStatus::Running.is_terminal());
        assert!(JobStatus::Completed.is_terminal());
        assert!(JobStatus::Failed.is_terminal());
        assert!(JobStatus::Cancelled.is_terminal());
    }

    #[test]
    fn status_serializes_lowercase() {
        let s = serde_json::to_string(&JobStatus::Cancelled).unwrap();
        assert_eq!(s, "\"cancelled\"");
    }

    #[test]
    fn job_ids_have_timestamp_and_salt() {
        let id = generate_job_id();
        let (millis, salt) = id.split_once('-').unwrap();
        assert!(millis.parse::<i64>().unwrap() > 0);
        let salt: u32 = salt.parse().unwrap();
        assert!((1000..10000).contains(&salt));
    }

    #[test]
    fn job_ids_are_distinct() {
        let ids: std::collections::HashSet<_> =
            (0..64).map(|_| generate_job_id()).collect();
        // Same-millisecond collisions are possible but the salt makes 64
        // identical ids vanishingly unlikely.
        assert!(ids.len() > 1);
    }
}
