//! Repository cache manager.
//!
//! Maps a remote source URL to a local working copy under a cache root,
//! cloning on first use and fetch+resetting on subsequent resolves. A single
//! cache-wide mutex serializes every resolve from path derivation through
//! last-used bookkeeping: concurrent writers interleaving reset and checkout
//! in the same working directory would corrupt it. This trades throughput
//! for simplicity; sharding the lock per derived path is the known upgrade.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tokio::sync::Mutex;
use tracing::{info, warn};

/// Git operation errors.
#[derive(Debug, thiserror::Error)]
pub enum GitError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid repository URL: {0}")]
    InvalidUrl(String),

    #[error("clone failed: {0}")]
    CloneFailed(String),

    #[error("update failed: {0}")]
    UpdateFailed(String),

    #[error("checkout failed: {0}")]
    CheckoutFailed(String),
}

/// Cache of repository working copies keyed by their derived local path.
pub struct RepoCache {
    root: PathBuf,
    /// Last-used time per working copy. The mutex also serializes all git
    /// filesystem operations; it is never held while a build executes.
    last_used: Mutex<HashMap<PathBuf, DateTime<Utc>>>,
}

impl RepoCache {
    /// Create a cache rooted at `root`, creating the directory if missing.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, GitError> {
        let root = root.into();
        std::fs::create_dir_all(&root)?;
        Ok(Self {
            root,
            last_used: Mutex::new(HashMap::new()),
        })
    }

    /// Derive the local working-copy path for a repository URL: the last
    /// path segment with a trailing `.git` stripped, under the cache root.
    /// Pure in the URL, so every resolve of the same URL shares one copy.
    pub fn repo_path(&self, repo_url: &str) -> Result<PathBuf, GitError> {
        let name = repo_url
            .trim_end_matches('/')
            .rsplit('/')
            .next()
            .map(|s| s.strip_suffix(".git").unwrap_or(s))
            .filter(|s| !s.is_empty())
            .ok_or_else(|| GitError::InvalidUrl(repo_url.to_string()))?;
        Ok(self.root.join(name))
    }

    /// Resolve `repo_url` at `branch` to a ready-to-build local path,
    /// cloning if absent or fetch+hard-resetting if present, then checking
    /// out `commit` if given. On an update failure the existing copy is
    /// deleted and cloned fresh once before giving up.
    pub async fn resolve(
        &self,
        repo_url: &str,
        branch: &str,
        commit: Option<&str>,
    ) -> Result<PathBuf, GitError> {
        let commit = commit.filter(|c| !c.is_empty());
        let mut last_used = self.last_used.lock().await;
        let path = self.repo_path(repo_url)?;

        match self.make_ready(repo_url, branch, commit, &path).await {
            Ok(()) => {
                last_used.insert(path.clone(), Utc::now());
                Ok(path)
            }
            Err(e) => {
                // The entry must never outlive a working copy we failed to
                // produce.
                last_used.remove(&path);
                Err(e)
            }
        }
    }

    async fn make_ready(
        &self,
        repo_url: &str,
        branch: &str,
        commit: Option<&str>,
        path: &Path,
    ) -> Result<(), GitError> {
        if path.exists() {
            info!(repo_url = %repo_url, "Updating cached repo");
            if let Err(e) = self.update(path, branch, commit).await {
                // A corrupted or divergent copy is indistinguishable from a
                // transient failure here; recover by recloning.
                warn!(repo_url = %repo_url, error = %e, "Update failed, recloning");
                tokio::fs::remove_dir_all(path).await?;
                self.clone_repo(repo_url, branch, path).await?;
                if let Some(commit) = commit {
                    self.checkout_commit(path, commit).await?;
                }
            }
        } else {
            info!(repo_url = %repo_url, "Cloning new repo");
            self.clone_repo(repo_url, branch, path).await?;
            if let Some(commit) = commit {
                self.checkout_commit(path, commit).await?;
            }
        }
        Ok(())
    }

    /// Last-used time recorded for a working copy, if it is cached.
    pub async fn last_used(&self, path: &Path) -> Option<DateTime<Utc>> {
        self.last_used.lock().await.get(path).copied()
    }

    /// Remove every working copy idle for longer than `max_age_seconds`,
    /// deleting its directory tree.
    pub async fn evict_idle(&self, max_age_seconds: u64) {
        let mut last_used = self.last_used.lock().await;
        let now = Utc::now();

        let expired: Vec<PathBuf> = last_used
            .iter()
            .filter(|(_, used)| (now - **used).num_seconds() > max_age_seconds as i64)
            .map(|(path, _)| path.clone())
            .collect();

        for path in expired {
            info!(path = %path.display(), "Evicting idle repo");
            if let Err(e) = tokio::fs::remove_dir_all(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove repo directory");
                }
            }
            last_used.remove(&path);
        }
    }

    async fn clone_repo(
        &self,
        repo_url: &str,
        branch: &str,
        path: &Path,
    ) -> Result<(), GitError> {
        // A half-created directory from an earlier failure would confuse
        // git; start clean.
        if path.exists() {
            tokio::fs::remove_dir_all(path).await?;
        }

        let path_str = path.to_string_lossy();
        run_git(
            &["clone", "--branch", branch, repo_url, &path_str],
            None,
            GitError::CloneFailed,
        )
        .await
    }

    async fn update(
        &self,
        path: &Path,
        branch: &str,
        commit: Option<&str>,
    ) -> Result<(), GitError> {
        run_git(
            &["fetch", "origin"],
            Some(path),
            GitError::UpdateFailed,
        )
        .await?;

        // The cache does not preserve local edits between uses.
        let target = format!("origin/{branch}");
        run_git(
            &["reset", "--hard", &target],
            Some(path),
            GitError::UpdateFailed,
        )
        .await?;

        if let Some(commit) = commit {
            self.checkout_commit(path, commit).await?;
        }
        Ok(())
    }

    async fn checkout_commit(&self, path: &Path, commit: &str) -> Result<(), GitError> {
        run_git(
            &["checkout", "--force", commit],
            Some(path),
            GitError::CheckoutFailed,
        )
        .await
    }
}

async fn run_git(
    args: &[&str],
    cwd: Option<&Path>,
    wrap: fn(String) -> GitError,
) -> Result<(), GitError> {
    let mut cmd = Command::new("git");
    cmd.args(args).stdout(Stdio::piped()).stderr(Stdio::piped());
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }

    let output = cmd.output().await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(wrap(format!("git {}: {}", args[0], stderr)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::process::Command;

    fn git(dir: &Path, args: &[&str]) {
        let output = Command::new("git")
            .args(args)
            .current_dir(dir)
            .output()
            .unwrap();
        assert!(
            output.status.success(),
            "git {:?} failed: {}",
            args,
            String::from_utf8_lossy(&output.stderr)
        );
    }

    fn rev_parse_head(dir: &Path) -> String {
        let output = Command::new("git")
            .args(["rev-parse", "HEAD"])
            .current_dir(dir)
            .output()
            .unwrap();
        String::from_utf8_lossy(&output.stdout).trim().to_string()
    }

    /// Create a local origin repository on branch `main` with one commit.
    fn init_origin(root: &Path) -> PathBuf {
        let origin = root.join("origin.git");
        std::fs::create_dir_all(&origin).unwrap();
        git(&origin, &["init"]);
        git(&origin, &["symbolic-ref", "HEAD", "refs/heads/main"]);
        git(&origin, &["config", "user.email", "test@example.com"]);
        git(&origin, &["config", "user.name", "Test"]);
        commit_file(&origin, "README", "v1");
        origin
    }

    fn commit_file(origin: &Path, name: &str, content: &str) -> String {
        std::fs::write(origin.join(name), content).unwrap();
        git(origin, &["add", "."]);
        git(origin, &["commit", "-m", content]);
        rev_parse_head(origin)
    }

    #[test]
    fn derives_path_from_last_url_segment() {
        let cache = RepoCache::new(std::env::temp_dir().join("dispatchd-derive")).unwrap();
        let path = cache.repo_path("https://example.com/group/project.git").unwrap();
        assert_eq!(path.file_name().unwrap(), "project");
        let path = cache.repo_path("https://example.com/other/project").unwrap();
        assert_eq!(path.file_name().unwrap(), "project");
    }

    #[test]
    fn rejects_urls_without_a_name() {
        let cache = RepoCache::new(std::env::temp_dir().join("dispatchd-derive")).unwrap();
        assert!(matches!(
            cache.repo_path(""),
            Err(GitError::InvalidUrl(_))
        ));
    }

    #[tokio::test]
    async fn resolve_clones_then_reuses_one_working_copy() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let url = origin.to_string_lossy().to_string();

        let first = cache.resolve(&url, "main", None).await.unwrap();
        assert!(first.join("README").exists());

        let second = cache.resolve(&url, "main", None).await.unwrap();
        assert_eq!(first, second);

        let copies = std::fs::read_dir(dir.path().join("cache")).unwrap().count();
        assert_eq!(copies, 1);
    }

    #[tokio::test]
    async fn resolve_picks_up_new_commits() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let url = origin.to_string_lossy().to_string();

        let path = cache.resolve(&url, "main", None).await.unwrap();
        assert_eq!(std::fs::read_to_string(path.join("README")).unwrap(), "v1");

        commit_file(&origin, "README", "v2");
        let path = cache.resolve(&url, "main", None).await.unwrap();
        assert_eq!(std::fs::read_to_string(path.join("README")).unwrap(), "v2");
    }

    #[tokio::test]
    async fn sequential_commit_checkouts_do_not_leak_state() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let first_commit = rev_parse_head(&origin);
        let second_commit = commit_file(&origin, "README", "v2");
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let url = origin.to_string_lossy().to_string();

        let path = cache.resolve(&url, "main", Some(&first_commit)).await.unwrap();
        assert_eq!(std::fs::read_to_string(path.join("README")).unwrap(), "v1");

        let same = cache.resolve(&url, "main", Some(&second_commit)).await.unwrap();
        assert_eq!(same, path);
        assert_eq!(std::fs::read_to_string(path.join("README")).unwrap(), "v2");
    }

    #[tokio::test]
    async fn empty_commit_hash_means_branch_tip() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let url = origin.to_string_lossy().to_string();

        let path = cache.resolve(&url, "main", Some("")).await.unwrap();
        assert!(path.join("README").exists());
    }

    #[tokio::test]
    async fn corrupted_copy_is_recloned() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let url = origin.to_string_lossy().to_string();

        let path = cache.resolve(&url, "main", None).await.unwrap();
        // Destroying the .git directory makes the next fetch fail
        std::fs::remove_dir_all(path.join(".git")).unwrap();

        let recovered = cache.resolve(&url, "main", None).await.unwrap();
        assert_eq!(recovered, path);
        assert!(recovered.join("README").exists());
    }

    #[tokio::test]
    async fn clone_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let missing = dir.path().join("nonexistent.git");

        let err = cache
            .resolve(&missing.to_string_lossy(), "main", None)
            .await
            .unwrap_err();
        assert!(matches!(err, GitError::CloneFailed(_)));
    }

    #[tokio::test]
    async fn evict_idle_removes_stale_entries_and_directories() {
        let dir = tempfile::tempdir().unwrap();
        let origin = init_origin(dir.path());
        let cache = RepoCache::new(dir.path().join("cache")).unwrap();
        let url = origin.to_string_lossy().to_string();

        let path = cache.resolve(&url, "main", None).await.unwrap();
        assert!(cache.last_used(&path).await.is_some());

        // Far-future threshold keeps the entry
        cache.evict_idle(3600).await;
        assert!(path.exists());
        assert!(cache.last_used(&path).await.is_some());

        // Zero-second threshold evicts anything not used this instant
        tokio::time::sleep(std::time::Duration::from_millis(1100)).await;
        cache.evict_idle(0).await;
        assert!(!path.exists());
        assert!(cache.last_used(&path).await.is_none());
    }
}
