//! Kernel build driver.
//!
//! - [`kernel`] - `make` sequences for plain and Debian-package builds

pub mod kernel;

pub use kernel::{build_kernel, BuildOptions, KernelConfig};
