//! Typed failures for the pipeline.
//!
//! Operations return `anyhow::Result` and attach context as they go. The
//! variants here sit at the bottom of the chain so callers (and tests) can
//! recover the failure class with `downcast_ref::<PipelineError>()`.

use std::process::ExitStatus;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("missing required packages: {} (install with: apt-get install {})", .packages.join(", "), .packages.join(" "))]
    MissingPrerequisites { packages: Vec<String> },

    #[error("{what} not found: {detail}")]
    NotFound { what: &'static str, detail: String },

    #[error("{what} '{name}' already exists")]
    AlreadyExists { what: &'static str, name: String },

    #[error("{message} (`{program}` exited with {status}){}", format_stderr(.stderr))]
    CommandFailed {
        program: String,
        message: String,
        status: ExitStatus,
        stderr: String,
    },

    #[error("timed out after {}s waiting for {what}", .waited.as_secs())]
    Timeout { what: String, waited: Duration },
}

impl PipelineError {
    pub fn not_found(what: &'static str, detail: impl Into<String>) -> Self {
        Self::NotFound {
            what,
            detail: detail.into(),
        }
    }

    pub fn already_exists(what: &'static str, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            what,
            name: name.into(),
        }
    }
}

fn format_stderr(stderr: &str) -> String {
    let trimmed = stderr.trim();
    if trimmed.is_empty() {
        String::new()
    } else {
        format!("\n{trimmed}")
    }
}

/// Find a [`PipelineError`] anywhere in an `anyhow` chain.
pub fn classify(err: &anyhow::Error) -> Option<&PipelineError> {
    err.chain().find_map(|cause| cause.downcast_ref::<PipelineError>())
}
