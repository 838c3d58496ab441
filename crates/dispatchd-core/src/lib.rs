//! Core domain types for the dispatchd remote build server.
//!
//! This crate contains:
//! - Job identifiers and status types
//! - The structured build configuration submitted with each job
//! - Status/result snapshot views returned to API callers

pub mod config;
pub mod job;

pub use config::{BuildConfig, EnvVar};
pub use job::{JobResultInfo, JobStatus, JobStatusInfo, generate_job_id};
