//! Application state.

use dispatchd_config::ServerConfig;
use dispatchd_git::RepoCache;
use dispatchd_scheduler::Scheduler;
use std::sync::Arc;

/// Shared application state. The cache and scheduler share no internal
/// state; they are composed only through the resolved local path.
#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<RepoCache>,
    pub scheduler: Arc<Scheduler>,
}

impl AppState {
    /// Build the repository cache and scheduler from the loaded server
    /// configuration. Must be called from within a tokio runtime.
    pub fn new(config: &ServerConfig) -> anyhow::Result<Self> {
        let cache = Arc::new(RepoCache::new(&config.git.repo_path)?);
        let scheduler = Arc::new(Scheduler::new(
            &config.compilation.build_root_path,
            config.compilation.max_concurrent_jobs,
        )?);
        Ok(Self { cache, scheduler })
    }
}
