//! Worker loop: one task per pool slot, each processing one job at a time.

use crate::executor;
use crate::registry::JobRegistry;
use std::sync::Arc;
use tracing::info;

pub(crate) async fn run(registry: Arc<JobRegistry>, worker_id: usize) {
    info!(worker_id, "Starting worker");

    while let Some(job) = registry.next_job().await {
        info!(worker_id, job_id = %job.id, "Claimed job");
        executor::execute(&registry, job).await;
    }

    info!(worker_id, "Worker stopped");
}
