//! Job configuration loading and schema definitions.

pub mod schema;

pub use schema::*;

use std::path::Path;

use anyhow::{Context, Result};

/// Load a job description from a TOML file.
pub fn load_job(path: &Path) -> Result<JobConfig> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file: {}", path.display()))?;

    let job: JobConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse job file: {}", path.display()))?;

    Ok(job)
}

/// Load a job description from a string.
pub fn load_job_str(content: &str) -> Result<JobConfig> {
    let job: JobConfig = toml::from_str(content).context("Failed to parse job")?;

    Ok(job)
}
