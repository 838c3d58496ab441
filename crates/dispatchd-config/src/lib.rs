//! YAML server configuration for dispatchd.
//!
//! Loaded once at startup. A missing file falls back to defaults; a present
//! but malformed file is an error. Validation creates the repository cache
//! and build root directories if they do not exist.

pub mod error;

pub use error::{ConfigError, ConfigResult};

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{info, warn};

/// Top-level server configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default)]
    pub server: HttpConfig,
    #[serde(default)]
    pub git: GitConfig,
    #[serde(default)]
    pub compilation: CompilationConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitConfig {
    /// Root directory for cached repository working copies.
    #[serde(default = "default_repo_path")]
    pub repo_path: String,
    /// Idle age after which a cached working copy is evicted.
    #[serde(default = "default_repo_cache_expiration")]
    pub cache_expiration_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompilationConfig {
    /// Root directory for per-job build directories.
    #[serde(default = "default_build_root")]
    pub build_root_path: String,
    /// Worker pool size; also the maximum number of concurrently running jobs.
    #[serde(default = "default_max_concurrent_jobs")]
    pub max_concurrent_jobs: usize,
    /// Age after which terminal jobs are swept from the registry.
    #[serde(default = "default_job_expiration")]
    pub job_expiration_seconds: u64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_repo_path() -> String {
    "./repos".to_string()
}
fn default_repo_cache_expiration() -> u64 {
    86400
}
fn default_build_root() -> String {
    "./builds".to_string()
}
fn default_max_concurrent_jobs() -> usize {
    4
}
fn default_job_expiration() -> u64 {
    3600
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            repo_path: default_repo_path(),
            cache_expiration_seconds: default_repo_cache_expiration(),
        }
    }
}

impl Default for CompilationConfig {
    fn default() -> Self {
        Self {
            build_root_path: default_build_root(),
            max_concurrent_jobs: default_max_concurrent_jobs(),
            job_expiration_seconds: default_job_expiration(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a YAML file, falling back to defaults if the
    /// file does not exist. Validates before returning.
    pub fn load(path: impl AsRef<Path>) -> ConfigResult<Self> {
        let path = path.as_ref();
        let config = if path.exists() {
            let text = std::fs::read_to_string(path)?;
            Self::parse(&text)?
        } else {
            warn!(path = %path.display(), "Config file not found, using default configuration");
            Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from YAML text without validating.
    pub fn parse(text: &str) -> ConfigResult<Self> {
        Ok(serde_yaml::from_str(text)?)
    }

    /// Check invariants and create the working directories if missing.
    pub fn validate(&self) -> ConfigResult<()> {
        if self.server.port == 0 {
            return Err(ConfigError::InvalidValue {
                field: "server.port".to_string(),
                message: "port must be non-zero".to_string(),
            });
        }

        if self.compilation.max_concurrent_jobs == 0 {
            return Err(ConfigError::InvalidValue {
                field: "compilation.max_concurrent_jobs".to_string(),
                message: "worker pool size must be greater than 0".to_string(),
            });
        }

        for dir in [&self.git.repo_path, &self.compilation.build_root_path] {
            if !Path::new(dir).exists() {
                info!(dir = %dir, "Creating working directory");
                std::fs::create_dir_all(dir)?;
            }
        }

        if self.compilation.job_expiration_seconds < 60 {
            warn!("Job expiration time is shorter than 60 seconds");
        }
        if self.git.cache_expiration_seconds < 300 {
            warn!("Repo cache expiration time is shorter than 300 seconds");
        }

        Ok(())
    }
}
