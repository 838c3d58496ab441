//! In-memory job registry: the job map, the pending FIFO queue and the
//! worker wakeup signal.
//!
//! The registry exclusively owns all job records; callers only ever receive
//! snapshots. One mutex protects the map and queue together and is held
//! only for bookkeeping, never while a build runs.

use chrono::{DateTime, Utc};
use dispatchd_core::{BuildConfig, JobResultInfo, JobStatus, JobStatusInfo, generate_job_id};
use std::collections::{HashMap, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{info, warn};

/// One tracked build job. Mutated only under the registry lock by the
/// worker that claimed it, except for the atomic cancel flag.
struct Job {
    id: String,
    repo_path: PathBuf,
    config: BuildConfig,
    status: JobStatus,
    progress: u8,
    exit_code: i32,
    output: String,
    started_at: Option<DateTime<Utc>>,
    completed_at: Option<DateTime<Utc>>,
    cancelled: Arc<AtomicBool>,
}

/// Everything a worker needs to execute a claimed job, detached from the
/// registry lock.
pub(crate) struct ClaimedJob {
    pub id: String,
    pub repo_path: PathBuf,
    pub config: BuildConfig,
    pub cancelled: Arc<AtomicBool>,
}

struct RegistryState {
    jobs: HashMap<String, Job>,
    queue: VecDeque<String>,
}

pub struct JobRegistry {
    state: Mutex<RegistryState>,
    queue_ready: Notify,
    shutdown: AtomicBool,
    build_root: PathBuf,
}

impl JobRegistry {
    pub fn new(build_root: PathBuf) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                jobs: HashMap::new(),
                queue: VecDeque::new(),
            }),
            queue_ready: Notify::new(),
            shutdown: AtomicBool::new(false),
            build_root,
        }
    }

    fn state(&self) -> MutexGuard<'_, RegistryState> {
        // A worker that panicked mid-bookkeeping cannot leave the registry
        // unusable for everyone else.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Per-job private build directory.
    pub fn build_dir(&self, job_id: &str) -> PathBuf {
        self.build_root.join(job_id)
    }

    pub fn submit(&self, repo_path: PathBuf, config: BuildConfig) -> String {
        let job_id = generate_job_id();
        let job = Job {
            id: job_id.clone(),
            repo_path,
            config,
            status: JobStatus::Pending,
            progress: 0,
            exit_code: -1,
            output: String::new(),
            started_at: None,
            completed_at: None,
            cancelled: Arc::new(AtomicBool::new(false)),
        };

        {
            let mut state = self.state();
            state.jobs.insert(job_id.clone(), job);
            state.queue.push_back(job_id.clone());
        }
        self.queue_ready.notify_one();

        info!(job_id = %job_id, "Created new build job");
        job_id
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatusInfo> {
        let state = self.state();
        let job = state.jobs.get(job_id)?;
        Some(JobStatusInfo {
            job_id: job.id.clone(),
            status: job.status,
            progress: job.progress,
            started_at: job.started_at.map(|t| t.timestamp()),
            completed_at: job.completed_at.map(|t| t.timestamp()),
            completed: job.status.is_terminal(),
        })
    }

    pub fn result(&self, job_id: &str) -> Option<JobResultInfo> {
        let state = self.state();
        let job = state.jobs.get(job_id)?;
        let completed = job.status.is_terminal();
        Some(JobResultInfo {
            job_id: job.id.clone(),
            status: if completed {
                job.status.as_str().to_string()
            } else {
                "in_progress".to_string()
            },
            exit_code: job.exit_code,
            output: job.output.clone(),
            completed_at: job.completed_at.map(|t| t.timestamp()),
            completed,
        })
    }

    /// Set the cancellation flag if the job is not already terminal.
    /// Cancellation is cooperative: the owning worker observes the flag and
    /// finalizes the job as Cancelled.
    pub fn cancel(&self, job_id: &str) -> bool {
        let state = self.state();
        match state.jobs.get(job_id) {
            Some(job) if !job.status.is_terminal() => {
                !job.cancelled.swap(true, Ordering::SeqCst)
            }
            _ => false,
        }
    }

    /// Remove terminal jobs whose completion is older than the threshold
    /// and delete their build directories.
    pub fn sweep_expired(&self, max_age_seconds: u64) {
        let now = Utc::now();
        let expired: Vec<String> = {
            let mut state = self.state();
            let expired: Vec<String> = state
                .jobs
                .values()
                .filter(|job| match job.completed_at {
                    Some(done) => (now - done).num_seconds() > max_age_seconds as i64,
                    None => false,
                })
                .map(|job| job.id.clone())
                .collect();
            for id in &expired {
                state.jobs.remove(id);
            }
            expired
        };

        // Directory removal happens outside the lock; the dirs belong to
        // jobs no worker can touch anymore.
        for id in expired {
            info!(job_id = %id, "Cleaning expired job");
            if let Err(e) = std::fs::remove_dir_all(self.build_dir(&id)) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(job_id = %id, error = %e, "Failed to remove build directory");
                }
            }
        }
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.queue_ready.notify_waiters();
    }

    /// Block until a job can be claimed or shutdown is requested. Returns
    /// `None` on shutdown, even if jobs are still queued.
    pub(crate) async fn next_job(&self) -> Option<ClaimedJob> {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return None;
            }
            if let Some(claim) = self.try_claim() {
                return Some(claim);
            }
            self.queue_ready.notified().await;
        }
    }

    fn try_claim(&self) -> Option<ClaimedJob> {
        let mut state = self.state();
        while let Some(job_id) = state.queue.pop_front() {
            // The job may have been swept while queued
            let Some(job) = state.jobs.get(&job_id) else {
                warn!(job_id = %job_id, "Queued job no longer in registry");
                continue;
            };
            let claim = ClaimedJob {
                id: job.id.clone(),
                repo_path: job.repo_path.clone(),
                config: job.config.clone(),
                cancelled: job.cancelled.clone(),
            };
            // Notify holds at most one permit, so back-to-back submissions
            // can signal fewer times than there are queued jobs. Pass the
            // wakeup along; an idle worker re-checks the queue anyway.
            if !state.queue.is_empty() {
                self.queue_ready.notify_one();
            }
            return Some(claim);
        }
        None
    }

    /// Transition a claimed job to Running. No-op if the job is already
    /// terminal or gone.
    pub(crate) fn mark_running(&self, job_id: &str) {
        let mut state = self.state();
        if let Some(job) = state.jobs.get_mut(job_id) {
            if !job.status.is_terminal() {
                job.status = JobStatus::Running;
                job.progress = 10;
                job.started_at = Some(Utc::now());
            }
        }
    }

    /// Record a terminal outcome. Transitions are monotonic: a job that is
    /// already terminal keeps its first outcome.
    pub(crate) fn finalize(&self, job_id: &str, status: JobStatus, exit_code: i32, output: String) {
        let mut state = self.state();
        if let Some(job) = state.jobs.get_mut(job_id) {
            if job.status.is_terminal() {
                return;
            }
            job.status = status;
            job.progress = 100;
            job.exit_code = exit_code;
            job.output = output;
            job.completed_at = Some(Utc::now());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> JobRegistry {
        JobRegistry::new(std::env::temp_dir().join("dispatchd-registry-tests"))
    }

    #[test]
    fn unknown_job_reports_not_found() {
        let registry = registry();
        assert!(registry.status("12345-6789").is_none());
        assert!(registry.result("12345-6789").is_none());
        assert!(!registry.cancel("12345-6789"));
    }

    #[test]
    fn submitted_job_starts_pending() {
        let registry = registry();
        let id = registry.submit(PathBuf::from("/tmp/repo"), BuildConfig::default());

        let status = registry.status(&id).unwrap();
        assert_eq!(status.status, JobStatus::Pending);
        assert_eq!(status.progress, 0);
        assert!(status.started_at.is_none());
        assert!(!status.completed);

        let result = registry.result(&id).unwrap();
        assert_eq!(result.status, "in_progress");
        assert!(!result.completed);
    }

    #[test]
    fn claim_is_fifo() {
        let registry = registry();
        let first = registry.submit(PathBuf::from("/a"), BuildConfig::default());
        let second = registry.submit(PathBuf::from("/b"), BuildConfig::default());

        assert_eq!(registry.try_claim().unwrap().id, first);
        assert_eq!(registry.try_claim().unwrap().id, second);
        assert!(registry.try_claim().is_none());
    }

    #[tokio::test]
    async fn claim_passes_the_wakeup_on_while_jobs_remain_queued() {
        use std::time::Duration;
        use tokio::time::timeout;

        let registry = registry();
        registry.submit(PathBuf::from("/a"), BuildConfig::default());
        registry.submit(PathBuf::from("/b"), BuildConfig::default());

        // Two submissions with no waiter leave only one stored permit;
        // absorb it the way a waking worker would
        registry.queue_ready.notified().await;

        // Claiming /a with /b still queued must re-signal, or the second
        // job would sit behind the first worker's build while another
        // worker sleeps
        registry.try_claim().unwrap();
        timeout(Duration::from_millis(100), registry.queue_ready.notified())
            .await
            .expect("claim with a non-empty queue left no wakeup permit");

        // Draining the queue leaves no further permit
        registry.try_claim().unwrap();
        assert!(
            timeout(Duration::from_millis(100), registry.queue_ready.notified())
                .await
                .is_err()
        );
    }

    #[test]
    fn transitions_are_monotonic() {
        let registry = registry();
        let id = registry.submit(PathBuf::from("/tmp/repo"), BuildConfig::default());

        registry.mark_running(&id);
        assert_eq!(registry.status(&id).unwrap().status, JobStatus::Running);

        registry.finalize(&id, JobStatus::Completed, 0, "done".to_string());
        let result = registry.result(&id).unwrap();
        assert_eq!(result.status, "completed");
        assert_eq!(result.exit_code, 0);

        // A terminal job never re-enters Running and keeps its outcome
        registry.mark_running(&id);
        registry.finalize(&id, JobStatus::Failed, 2, "late".to_string());
        let result = registry.result(&id).unwrap();
        assert_eq!(result.status, "completed");
        assert_eq!(result.output, "done");
    }

    #[test]
    fn cancel_sets_flag_once_and_not_after_terminal() {
        let registry = registry();
        let id = registry.submit(PathBuf::from("/tmp/repo"), BuildConfig::default());
        let claim = registry.try_claim().unwrap();

        assert!(registry.cancel(&id));
        assert!(claim.cancelled.load(Ordering::SeqCst));
        // Second cancel is not newly set
        assert!(!registry.cancel(&id));

        registry.finalize(&id, JobStatus::Cancelled, -1, String::new());
        assert!(!registry.cancel(&id));
        assert_eq!(registry.result(&id).unwrap().status, "cancelled");
    }

    #[test]
    fn sweep_removes_only_stale_terminal_jobs() {
        let registry = registry();
        let done = registry.submit(PathBuf::from("/a"), BuildConfig::default());
        let pending = registry.submit(PathBuf::from("/b"), BuildConfig::default());
        registry.finalize(&done, JobStatus::Completed, 0, String::new());

        registry.sweep_expired(3600);
        assert!(registry.status(&done).is_some());

        // completed_at is "now"; a negative age threshold is impossible, so
        // wait out a one-second boundary instead
        std::thread::sleep(std::time::Duration::from_millis(1100));
        registry.sweep_expired(0);
        assert!(registry.status(&done).is_none());
        assert!(registry.status(&pending).is_some());
    }
}
