//! Patch tree application.
//!
//! A patch tree is a directory of `*.patch` files and nested patch trees.
//! An optional `.config` manifest in any directory lists the entries to use,
//! one per line, in order; entries may omit the `.patch` suffix. Without a
//! manifest every non-hidden entry is used in lexicographic order.
//!
//! The tree is resolved into a flat [`PatchPlan`] before anything touches the
//! kernel, so a manifest naming a missing file fails up front. Patches that
//! were applied before a rejection are left in place.
//!
//! A dry run applies the whole plan for real to a scratch copy of the files
//! the patches touch, so patches that build on earlier ones are checked
//! against the tree they will actually meet.

use std::fs;
use std::path::{Component, Path, PathBuf};

use anyhow::{Context, Result};

use crate::error::PipelineError;
use crate::preflight;
use crate::process::Cmd;

/// Name of the per-directory ordering manifest.
pub const MANIFEST_NAME: &str = ".config";

const PATCH_SUFFIX: &str = ".patch";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PatchDirection {
    #[default]
    Apply,
    Reverse,
}

#[derive(Debug, Clone, Default)]
pub struct PatchOptions {
    pub direction: PatchDirection,
    /// Ask `patch` to only report what it would do.
    pub dry_run: bool,
}

/// Patch files in application order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    pub patches: Vec<PathBuf>,
}

impl PatchPlan {
    pub fn len(&self) -> usize {
        self.patches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.patches.is_empty()
    }

    /// Order for `direction`: reversal undoes the last patch first.
    pub fn ordered(&self, direction: PatchDirection) -> Vec<&Path> {
        let iter = self.patches.iter().map(PathBuf::as_path);
        match direction {
            PatchDirection::Apply => iter.collect(),
            PatchDirection::Reverse => iter.rev().collect(),
        }
    }
}

/// Walk `patches` and collect every patch file in order.
pub fn resolve_patch_plan(patches: &Path) -> Result<PatchPlan> {
    if !patches.is_dir() {
        return Err(PipelineError::not_found(
            "patch directory",
            patches.display().to_string(),
        )
        .into());
    }
    let mut plan = PatchPlan::default();
    collect(patches, &mut plan.patches)?;
    Ok(plan)
}

fn collect(dir: &Path, out: &mut Vec<PathBuf>) -> Result<()> {
    for target in ordered_entries(dir)? {
        let path = dir.join(&target);
        if path.is_dir() {
            collect(&path, out)?;
            continue;
        }

        let patch = with_patch_suffix(path);
        if !patch.is_file() {
            return Err(PipelineError::not_found("patch", patch.display().to_string()).into());
        }
        out.push(patch);
    }
    Ok(())
}

fn with_patch_suffix(path: PathBuf) -> PathBuf {
    if path.to_string_lossy().ends_with(PATCH_SUFFIX) {
        path
    } else {
        let mut raw = path.into_os_string();
        raw.push(PATCH_SUFFIX);
        PathBuf::from(raw)
    }
}

/// Entry names of `dir` in the order they should be processed.
fn ordered_entries(dir: &Path) -> Result<Vec<String>> {
    let manifest = dir.join(MANIFEST_NAME);
    if manifest.is_file() {
        let content = fs::read_to_string(&manifest)
            .with_context(|| format!("reading patch manifest '{}'", manifest.display()))?;
        return Ok(parse_manifest(&content));
    }

    let mut names = Vec::new();
    for entry in
        fs::read_dir(dir).with_context(|| format!("reading patch directory '{}'", dir.display()))?
    {
        let entry = entry
            .with_context(|| format!("iterating patch directory '{}'", dir.display()))?;
        let Some(name) = entry.file_name().to_str().map(str::to_string) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }
        names.push(name);
    }
    names.sort();
    Ok(names)
}

/// Manifest entries, trimmed, without blanks or `#` comments.
pub fn parse_manifest(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(str::to_string)
        .collect()
}

/// Apply (or revert) every patch under `patches` to the tree at `kernel`.
///
/// Returns the plan that was processed.
pub fn apply_patch_tree(kernel: &Path, patches: &Path, opts: &PatchOptions) -> Result<PatchPlan> {
    preflight::require_packages(preflight::PATCH_PACKAGES)?;

    if !kernel.is_dir() {
        return Err(PipelineError::not_found("kernel tree", kernel.display().to_string()).into());
    }

    let plan = resolve_patch_plan(patches)?;
    let verb = match opts.direction {
        PatchDirection::Apply => "Applying",
        PatchDirection::Reverse => "Reverting",
    };
    println!(
        "{} {} patch(es) from {} to {}{}",
        verb,
        plan.len(),
        patches.display(),
        kernel.display(),
        if opts.dry_run { " (dry run)" } else { "" }
    );

    if opts.dry_run {
        rehearse(kernel, &plan, opts.direction)?;
        return Ok(plan);
    }

    for patch in plan.ordered(opts.direction) {
        eprintln!("  {}", patch.display());
        run_patch(kernel, patch, opts.direction)?;
    }

    Ok(plan)
}

/// Apply `plan` to a scratch copy of the files it touches.
fn rehearse(kernel: &Path, plan: &PatchPlan, direction: PatchDirection) -> Result<()> {
    let scratch = tempfile::Builder::new()
        .prefix("kernel-ci-dry-run")
        .tempdir()
        .context("creating dry-run directory")?;

    let mut copied = 0usize;
    for patch in &plan.patches {
        for rel in touched_files(patch)? {
            let src = kernel.join(&rel);
            let dest = scratch.path().join(&rel);
            if !src.is_file() || dest.exists() {
                continue;
            }
            if let Some(parent) = dest.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating '{}'", parent.display()))?;
            }
            fs::copy(&src, &dest)
                .with_context(|| format!("copying '{}' for dry run", src.display()))?;
            copied += 1;
        }
    }
    tracing::debug!(copied, scratch = %scratch.path().display(), "dry-run tree prepared");

    for patch in plan.ordered(direction) {
        eprintln!("  {} (dry run)", patch.display());
        run_patch(scratch.path(), patch, direction)?;
    }
    Ok(())
}

/// Tree-relative paths named in the `---`/`+++` headers of `patch`, with the
/// first component stripped as `-p1` does.
pub fn touched_files(patch: &Path) -> Result<Vec<PathBuf>> {
    let bytes =
        fs::read(patch).with_context(|| format!("reading patch '{}'", patch.display()))?;
    let content = String::from_utf8_lossy(&bytes);

    let mut files: Vec<PathBuf> = Vec::new();
    for line in content.lines() {
        let Some(name) = line
            .strip_prefix("--- ")
            .or_else(|| line.strip_prefix("+++ "))
        else {
            continue;
        };
        let name = name.split('\t').next().unwrap_or(name).trim();
        if name == "/dev/null" {
            continue;
        }
        let rel: PathBuf = Path::new(name).components().skip(1).collect();
        let normal = rel.components().all(|c| matches!(c, Component::Normal(_)));
        if normal && rel.components().next().is_some() && !files.contains(&rel) {
            files.push(rel);
        }
    }
    Ok(files)
}

fn run_patch(kernel: &Path, patch: &Path, direction: PatchDirection) -> Result<()> {
    // `-d` changes directory before `-i` is opened.
    let input = patch
        .canonicalize()
        .with_context(|| format!("resolving patch '{}'", patch.display()))?;
    Cmd::new("patch")
        .arg("-d")
        .arg(kernel)
        .args(["-p1", "-F0", "--force"])
        .arg_if(direction == PatchDirection::Reverse, "-R")
        .arg("-i")
        .arg(&input)
        .error_msg(format!("patch '{}' was rejected", patch.display()))
        .stdout_to_stderr()
        .run_interactive()
}
