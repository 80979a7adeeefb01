//! Kernel building.
//!
//! # Usage
//!
//! ```rust,ignore
//! use kernel_ci::build::kernel::{build_kernel, BuildOptions, KernelConfig};
//!
//! // Plain build with the architecture default configuration
//! build_kernel(&kernel_source, &BuildOptions::new(KernelConfig::Defconfig))?;
//!
//! // Debian packages from a seed config
//! let opts = BuildOptions::new(KernelConfig::Debconfig).config_path("config-5.10");
//! build_kernel(&kernel_source, &opts)?;
//! ```

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use anyhow::{bail, Context, Result};

use crate::error::PipelineError;
use crate::preflight;
use crate::process::Cmd;

/// Parallel jobs handed to `make -j`.
pub const DEFAULT_JOBS: u32 = 8;

/// Which kind of build to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelConfig {
    /// `make defconfig` and a plain build.
    Defconfig,
    /// Supplied config normalised with `olddefconfig`, then `bindeb-pkg`.
    Debconfig,
}

impl KernelConfig {
    pub fn as_str(&self) -> &'static str {
        match self {
            KernelConfig::Defconfig => "defconfig",
            KernelConfig::Debconfig => "debconfig",
        }
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for KernelConfig {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "defconfig" => Ok(KernelConfig::Defconfig),
            "debconfig" => Ok(KernelConfig::Debconfig),
            other => bail!(
                "unsupported kernel config '{}'; expected 'defconfig' or 'debconfig'",
                other
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct BuildOptions {
    pub config: KernelConfig,
    /// Seed `.config` for [`KernelConfig::Debconfig`].
    pub config_path: Option<PathBuf>,
    pub jobs: u32,
}

impl BuildOptions {
    pub fn new(config: KernelConfig) -> Self {
        Self {
            config,
            config_path: None,
            jobs: DEFAULT_JOBS,
        }
    }

    pub fn config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    pub fn jobs(mut self, jobs: u32) -> Self {
        self.jobs = jobs.max(1);
        self
    }
}

/// One `make` invocation of a build.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MakeStep {
    pub targets: Vec<String>,
    pub error_msg: &'static str,
    /// Copy the seed config into the tree before running this step.
    pub needs_seed: bool,
}

/// The `make` steps for `opts`, in order.
pub fn make_steps(opts: &BuildOptions) -> Vec<MakeStep> {
    let jobs = opts.jobs.to_string();
    let jobs = jobs.as_str();
    let step = |targets: &[&str], error_msg| MakeStep {
        targets: targets.iter().map(|t| t.to_string()).collect(),
        error_msg,
        needs_seed: false,
    };

    let mut steps = vec![step(&["clean"], "make clean failed")];
    match opts.config {
        KernelConfig::Defconfig => {
            steps.push(step(&["defconfig"], "make defconfig failed"));
            steps.push(step(&["-j", jobs], "Kernel build failed"));
        }
        KernelConfig::Debconfig => {
            steps.push(MakeStep {
                needs_seed: true,
                ..step(&["olddefconfig"], "make olddefconfig failed")
            });
            steps.push(step(&["-j", jobs, "bindeb-pkg"], "Kernel package build failed"));
        }
    }
    steps
}

/// Build the kernel at `kernel_source`.
///
/// `make` output goes to stderr. A failed step aborts the build and leaves
/// the tree as it is.
pub fn build_kernel(kernel_source: &Path, opts: &BuildOptions) -> Result<()> {
    preflight::require_packages(preflight::BUILD_PACKAGES)?;

    if !kernel_source.join("Makefile").is_file() {
        return Err(PipelineError::not_found(
            "kernel tree",
            format!("{} (no Makefile)", kernel_source.display()),
        )
        .into());
    }

    let seed = match opts.config {
        KernelConfig::Debconfig => {
            let Some(path) = opts.config_path.as_deref() else {
                bail!("--config-path is required for a debconfig build");
            };
            if !path.is_file() {
                return Err(PipelineError::not_found(
                    "kernel config",
                    path.display().to_string(),
                )
                .into());
            }
            Some(path)
        }
        KernelConfig::Defconfig => None,
    };

    println!(
        "Building kernel from {} ({}, {} jobs)...",
        kernel_source.display(),
        opts.config,
        opts.jobs
    );

    for step in make_steps(opts) {
        if step.needs_seed {
            if let Some(seed) = seed {
                install_seed_config(seed, kernel_source)?;
            }
        }

        println!("  make {}", step.targets.join(" "));
        Cmd::new("make")
            .arg("-C")
            .arg(kernel_source)
            .args(&step.targets)
            .error_msg(step.error_msg)
            .stdout_to_stderr()
            .run_interactive()?;
    }

    if opts.config == KernelConfig::Debconfig {
        if let Some(parent) = kernel_source.canonicalize()?.parent() {
            println!("  Packages written to {}", parent.display());
        }
    }

    Ok(())
}

/// Copy the seed config to `<kernel>/.config`.
pub fn install_seed_config(seed: &Path, kernel_source: &Path) -> Result<()> {
    let dest = kernel_source.join(".config");
    println!("  Using config {}", seed.display());
    fs::copy(seed, &dest).with_context(|| {
        format!(
            "copying kernel config '{}' to '{}'",
            seed.display(),
            dest.display()
        )
    })?;
    Ok(())
}
