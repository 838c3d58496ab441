//! Structured build configuration submitted with a job.

use serde::{Deserialize, Serialize};

/// One environment variable to export for the build command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: String,
}

/// Build configuration carried by a submit request.
///
/// Every field is optional; an empty config runs the default build command
/// in the repository root.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BuildConfig {
    /// Environment variables prefixed to the build command.
    #[serde(default)]
    pub environment: Vec<EnvVar>,
    /// Build command to run; defaults to `make` with a parallelism hint.
    #[serde(default)]
    pub command: Option<String>,
    /// Directory to build in, relative to the repository root.
    #[serde(default)]
    pub working_dir: Option<String>,
}
