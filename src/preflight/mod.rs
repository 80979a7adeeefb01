//! Preflight checks run at the top of every operation.
//!
//! Package checks query `dpkg -s`, so they only mean something on
//! Debian-derived hosts. Set `KERNEL_CI_SKIP_PREREQS=1` (or pass
//! `--skip-prereqs`) elsewhere.
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_ci::preflight::{require_packages, CLONE_PACKAGES};
//!
//! require_packages(CLONE_PACKAGES)?;
//! ```

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::error::PipelineError;
use crate::process::Cmd;

/// Environment variable that disables package checks.
pub const SKIP_ENV: &str = "KERNEL_CI_SKIP_PREREQS";

pub const CLONE_PACKAGES: &[&str] = &["git"];

pub const PATCH_PACKAGES: &[&str] = &["patch"];

pub const BUILD_PACKAGES: &[&str] = &[
    "git",
    "gcc",
    "make",
    "flex",
    "bison",
    "fakeroot",
    "bc",
    "dpkg-dev",
    "rsync",
    "libelf-dev",
    "libssl-dev",
];

pub const VM_PACKAGES: &[&str] = &[
    "qemu-system-x86",
    "libvirt-clients",
    "bridge-utils",
    "libvirt-daemon-system",
    "virtinst",
];

pub const SSH_PACKAGES: &[&str] = &["openssh-client"];

/// Needed only for password authentication.
pub const SSHPASS_PACKAGES: &[&str] = &["sshpass"];

static SKIP: AtomicBool = AtomicBool::new(false);

/// Disable package checks for the rest of the process.
pub fn skip_package_checks() {
    SKIP.store(true, Ordering::Relaxed);
}

fn checks_skipped() -> bool {
    SKIP.load(Ordering::Relaxed)
        || std::env::var(SKIP_ENV)
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false)
}

/// Check if a command exists on the host system.
pub fn command_exists(cmd: &str) -> bool {
    which::which(cmd).is_ok()
}

/// Check whether a Debian package is installed.
pub fn package_installed(package: &str) -> Result<bool> {
    let output = Cmd::new("dpkg").args(["-s", package]).output()?;
    if !output.success() {
        return Ok(false);
    }
    // `dpkg -s` also succeeds for removed-but-not-purged packages.
    Ok(output
        .stdout
        .lines()
        .find_map(|line| line.strip_prefix("Status:"))
        .map(|status| status.trim().ends_with("installed") && !status.contains("not-installed"))
        .unwrap_or(true))
}

/// Names from `packages` that are not installed, in input order.
pub fn missing_packages(packages: &[&str]) -> Result<Vec<String>> {
    if !command_exists("dpkg") {
        return Err(PipelineError::not_found(
            "program",
            format!("'dpkg' is needed to check packages; set {SKIP_ENV}=1 on non-Debian hosts"),
        )
        .into());
    }

    let mut missing = Vec::new();
    for package in packages {
        if !package_installed(package)? {
            missing.push(package.to_string());
        }
    }
    Ok(missing)
}

/// Fail with [`PipelineError::MissingPrerequisites`] unless every package in
/// `packages` is installed.
pub fn require_packages(packages: &[&str]) -> Result<()> {
    if checks_skipped() {
        tracing::debug!(?packages, "package checks skipped");
        return Ok(());
    }

    let missing = missing_packages(packages)?;
    if !missing.is_empty() {
        return Err(PipelineError::MissingPrerequisites { packages: missing }.into());
    }

    tracing::debug!(?packages, "prerequisites satisfied");
    Ok(())
}
