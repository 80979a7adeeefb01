//! Optional TOML settings for build parallelism, SSH transport and wait
//! tolerances.
//!
//! Every field has a default, so a missing file or an empty table is fine.
//!
//! ```toml
//! [build]
//! jobs = 8
//!
//! [ssh]
//! port = 22
//! connect_timeout_secs = 10
//!
//! [timeouts]
//! boot_secs = 300
//! reboot_secs = 300
//! shutdown_secs = 120
//! poll_initial_ms = 1000
//! poll_max_ms = 15000
//! ```

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::build::kernel::DEFAULT_JOBS;
use crate::error::PipelineError;
use crate::wait::Backoff;

/// Environment variable naming a settings file.
pub const SETTINGS_ENV: &str = "KERNEL_CI_SETTINGS";

#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Settings {
    pub build: BuildSettings,
    pub ssh: SshSettings,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct BuildSettings {
    pub jobs: u32,
}

impl Default for BuildSettings {
    fn default() -> Self {
        Self { jobs: DEFAULT_JOBS }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct SshSettings {
    pub port: u16,
    pub connect_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            port: 22,
            connect_timeout_secs: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct Timeouts {
    /// Upper bound for start → running → leased → SSH reachable.
    pub boot_secs: u64,
    /// Upper bound for the guest to come back after `reboot`.
    pub reboot_secs: u64,
    /// Upper bound for a graceful shutdown to reach "shut off".
    pub shutdown_secs: u64,
    pub poll_initial_ms: u64,
    pub poll_max_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            boot_secs: 300,
            reboot_secs: 300,
            shutdown_secs: 120,
            poll_initial_ms: 1000,
            poll_max_ms: 15_000,
        }
    }
}

impl Timeouts {
    /// Poll intervals are at least 1 ms, so a zero in the file cannot turn
    /// a wait into a busy loop.
    fn backoff(&self, secs: u64) -> Backoff {
        let initial = self.poll_initial_ms.max(1);
        Backoff {
            initial: Duration::from_millis(initial),
            max: Duration::from_millis(self.poll_max_ms.max(initial)),
            timeout: Duration::from_secs(secs),
        }
    }

    pub fn boot(&self) -> Backoff {
        self.backoff(self.boot_secs)
    }

    pub fn reboot(&self) -> Backoff {
        self.backoff(self.reboot_secs)
    }

    pub fn shutdown(&self) -> Backoff {
        self.backoff(self.shutdown_secs)
    }
}

impl Settings {
    pub fn from_toml(content: &str) -> Result<Self> {
        let settings: Settings = toml::from_str(content)?;
        Ok(settings)
    }

    /// Load from `path`, or return defaults when `path` is `None`.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Settings::default());
        };
        if !path.is_file() {
            return Err(
                PipelineError::not_found("settings file", path.display().to_string()).into(),
            );
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading settings '{}'", path.display()))?;
        let settings = Self::from_toml(&content)
            .with_context(|| format!("parsing settings '{}'", path.display()))?;
        tracing::debug!(path = %path.display(), ?settings, "settings loaded");
        Ok(settings)
    }
}
