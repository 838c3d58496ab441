//! Build executor: constructs the shell command for a claimed job, runs it
//! as a child process and maps the exit status to a terminal job state.
//!
//! Output is captured after the process exits by reading the redirected log
//! file, so status polls during a build only see the coarse progress value,
//! never partial output.

use crate::registry::{ClaimedJob, JobRegistry};
use dispatchd_core::{BuildConfig, JobStatus};
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info, warn};

/// Captured output is capped at 1 MiB.
const MAX_OUTPUT_BYTES: usize = 1024 * 1024;
const TRUNCATION_MARKER: &str = "\n[Output truncated]";

/// Interval at which a running build re-checks its cancellation flag.
const CANCEL_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Run one claimed job to a terminal state. Never returns an error: setup
/// failures are recorded on the job itself so a broken job cannot take its
/// worker down.
pub(crate) async fn execute(registry: &JobRegistry, job: ClaimedJob) {
    if job.cancelled.load(Ordering::SeqCst) {
        info!(job_id = %job.id, "Job cancelled before execution");
        registry.finalize(&job.id, JobStatus::Cancelled, -1, String::new());
        return;
    }

    match run_build(registry, &job).await {
        Ok((status, exit_code, output)) => {
            info!(job_id = %job.id, status = %status, exit_code, "Build finished");
            registry.finalize(&job.id, status, exit_code, output);
        }
        Err(e) => {
            error!(job_id = %job.id, error = %e, "Build setup failed");
            registry.finalize(
                &job.id,
                JobStatus::Failed,
                -1,
                format!("Build error: {e}"),
            );
        }
    }
}

async fn run_build(
    registry: &JobRegistry,
    job: &ClaimedJob,
) -> std::io::Result<(JobStatus, i32, String)> {
    let build_dir = registry.build_dir(&job.id);
    tokio::fs::create_dir_all(&build_dir).await?;
    let log_path = build_dir.join("build.log");

    let workdir = match job.config.working_dir.as_deref() {
        Some(rel) => job.repo_path.join(rel),
        None => job.repo_path.clone(),
    };
    let command = compile_command(&workdir, &job.config, &log_path);
    info!(job_id = %job.id, command = %command, "Executing build command");

    registry.mark_running(&job.id);

    let mut child = Command::new("sh")
        .arg("-c")
        .arg(&command)
        .stdin(Stdio::null())
        .spawn()?;

    let mut poll = tokio::time::interval(CANCEL_POLL_INTERVAL);
    let exit_status = loop {
        tokio::select! {
            status = child.wait() => break status?,
            _ = poll.tick() => {
                if job.cancelled.load(Ordering::SeqCst) {
                    info!(job_id = %job.id, "Cancel observed, terminating build process");
                    if let Err(e) = child.kill().await {
                        warn!(job_id = %job.id, error = %e, "Failed to kill build process");
                    }
                    break child.wait().await?;
                }
            }
        }
    };

    let output = read_log_capped(&log_path).await;

    if job.cancelled.load(Ordering::SeqCst) {
        return Ok((JobStatus::Cancelled, -1, output));
    }
    match exit_status.code() {
        Some(0) => Ok((JobStatus::Completed, 0, output)),
        Some(code) => Ok((JobStatus::Failed, code, output)),
        // Killed by a signal without our cancel flag set
        None => Ok((JobStatus::Failed, -1, output)),
    }
}

/// Build the shell command line: a cd into the working directory, env
/// assignments prefixed to the configured (or default) build command, with
/// combined output redirected to the job's log file. The subshell makes the
/// redirection cover compound build commands, and the assignments come
/// after the `&&` so they scope to the build command, not to `cd`.
fn compile_command(workdir: &Path, config: &BuildConfig, log_path: &Path) -> String {
    let mut cmd = String::new();

    cmd.push_str(&format!("(cd \"{}\" && ", workdir.display()));

    for var in &config.environment {
        cmd.push_str(&format!("{}=\"{}\" ", var.name, var.value));
    }

    match config.command.as_deref() {
        Some(command) => cmd.push_str(command),
        None => cmd.push_str(&format!("make -j{}", default_parallelism())),
    }

    cmd.push_str(&format!(") > \"{}\" 2>&1", log_path.display()));
    cmd
}

fn default_parallelism() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

/// Read the build log, capping it at [`MAX_OUTPUT_BYTES`]. A missing log
/// (the command failed before the shell set up redirection) reads as empty.
async fn read_log_capped(log_path: &Path) -> String {
    match tokio::fs::read(log_path).await {
        Ok(bytes) => cap_output(bytes),
        Err(_) => String::new(),
    }
}

fn cap_output(bytes: Vec<u8>) -> String {
    if bytes.len() > MAX_OUTPUT_BYTES {
        let mut output = String::from_utf8_lossy(&bytes[..MAX_OUTPUT_BYTES]).into_owned();
        output.push_str(TRUNCATION_MARKER);
        output
    } else {
        String::from_utf8_lossy(&bytes).into_owned()
    }
}
