//! Job scheduling for dispatchd.
//!
//! A [`Scheduler`] owns the job registry and a fixed pool of worker tasks
//! that pull pending jobs from a FIFO queue and run them through the build
//! executor, one job per worker at a time.

pub mod executor;
pub mod registry;
pub mod worker;

pub use registry::JobRegistry;

use dispatchd_core::{BuildConfig, JobResultInfo, JobStatusInfo};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// Handle to the job registry and its worker pool.
///
/// Submitting never blocks on execution; concurrency across jobs equals the
/// pool size, not the queue depth.
pub struct Scheduler {
    registry: Arc<JobRegistry>,
    workers: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Scheduler {
    /// Create the registry and spawn `pool_size` workers. Must be called
    /// from within a tokio runtime.
    pub fn new(build_root: impl Into<PathBuf>, pool_size: usize) -> std::io::Result<Self> {
        let build_root = build_root.into();
        std::fs::create_dir_all(&build_root)?;

        let registry = Arc::new(JobRegistry::new(build_root));
        let workers = (0..pool_size)
            .map(|worker_id| tokio::spawn(worker::run(registry.clone(), worker_id)))
            .collect();

        info!(pool_size, "Scheduler started");
        Ok(Self {
            registry,
            workers: std::sync::Mutex::new(workers),
        })
    }

    /// Allocate a Pending job for an already-resolved working directory and
    /// wake one idle worker. Returns the new job id.
    pub fn submit(&self, repo_path: impl Into<PathBuf>, config: BuildConfig) -> String {
        self.registry.submit(repo_path.into(), config)
    }

    pub fn status(&self, job_id: &str) -> Option<JobStatusInfo> {
        self.registry.status(job_id)
    }

    pub fn result(&self, job_id: &str) -> Option<JobResultInfo> {
        self.registry.result(job_id)
    }

    /// Set the cancellation flag on a non-terminal job. Returns whether the
    /// flag was newly set.
    pub fn cancel(&self, job_id: &str) -> bool {
        self.registry.cancel(job_id)
    }

    /// Remove terminal jobs completed longer ago than the threshold,
    /// deleting their build directories.
    pub fn sweep_expired(&self, max_age_seconds: u64) {
        self.registry.sweep_expired(max_age_seconds)
    }

    /// Stop the worker pool. In-flight builds finish naturally; queued jobs
    /// that no worker has claimed stay Pending.
    pub async fn shutdown(&self) {
        self.registry.request_shutdown();
        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for handle in workers {
            let _ = handle.await;
        }
        info!("Scheduler stopped");
    }
}
