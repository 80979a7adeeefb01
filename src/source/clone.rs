//! Fetching a tagged kernel tree with git.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::PipelineError;
use crate::preflight;
use crate::process::Cmd;

/// Inputs for [`clone_kernel`].
#[derive(Debug, Clone)]
pub struct CloneOptions {
    pub url: String,
    /// Version without the `v` prefix, e.g. `5.10`.
    pub version: String,
    /// Parent directory for the checkout.
    pub dir: PathBuf,
    /// Shallow clone depth; `None` clones full history.
    pub depth: Option<u32>,
}

/// Where `version` gets checked out under `dir`.
pub fn clone_target_dir(dir: &Path, version: &str) -> PathBuf {
    dir.join(format!("linux-kernel-v{version}"))
}

/// Clone tag `v<version>` of `url` into `<dir>/linux-kernel-v<version>`.
///
/// Returns the checkout path.
pub fn clone_kernel(opts: &CloneOptions) -> Result<PathBuf> {
    preflight::require_packages(preflight::CLONE_PACKAGES)?;

    let tag = format!("v{}", opts.version.trim_start_matches('v'));
    let target = clone_target_dir(&opts.dir, opts.version.trim_start_matches('v'));

    if target.exists() && !dir_is_empty(&target)? {
        return Err(PipelineError::already_exists("directory", target.display().to_string()).into());
    }

    fs::create_dir_all(&opts.dir)
        .with_context(|| format!("creating clone parent directory '{}'", opts.dir.display()))?;

    println!("Cloning {} ({}) into {}...", opts.url, tag, target.display());

    let depth = opts.depth.map(|d| d.to_string());
    let mut cmd = Cmd::new("git").args(["clone", "--branch", &tag]);
    if let Some(depth) = &depth {
        cmd = cmd.args(["--depth", depth]);
    }
    cmd.arg(&opts.url)
        .arg(&target)
        .error_msg(format!(
            "git clone of tag '{tag}' from '{}' failed (does the tag exist?)",
            opts.url
        ))
        .stdout_to_stderr()
        .run_interactive()?;

    Ok(target)
}

fn dir_is_empty(dir: &Path) -> Result<bool> {
    let mut entries =
        fs::read_dir(dir).with_context(|| format!("reading directory '{}'", dir.display()))?;
    Ok(entries.next().is_none())
}
