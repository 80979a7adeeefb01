//! Kernel source tree management.
//!
//! - [`clone`] - fetch a tagged kernel tree with git
//! - [`patch`] - apply or revert a patch tree
//! - [`version`] - read the kernel version from the top-level Makefile

pub mod clone;
pub mod patch;
pub mod version;

pub use clone::{clone_kernel, clone_target_dir, CloneOptions};
pub use patch::{apply_patch_tree, resolve_patch_plan, PatchDirection, PatchOptions, PatchPlan};
pub use version::{kernel_version, parse_makefile_version, KernelVersion};
