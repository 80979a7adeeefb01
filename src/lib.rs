//! Kernel CI pipeline: fetch, patch, build and boot-test Linux kernels.
//!
//! Every stage drives host tools (`git`, `patch`, `make`, `virsh`,
//! `virt-install`, `ssh`) and is usable on its own:
//!
//! - **Source** - clone a tagged tree, apply or revert patch trees, read the
//!   version
//! - **Build** - `make` sequences for plain and Debian-package builds
//! - **VM** - create, start, stop and destroy libvirt guests, resolve their
//!   addresses
//! - **Boot test** - install packages into a guest, reboot into them and
//!   count kernel errors
//!
//! # Architecture
//!
//! ```text
//! kernel-ci (bin)
//!     │
//!     ├── source ──── clone, patch, version
//!     ├── build  ──── make clean → defconfig | olddefconfig → make [bindeb-pkg]
//!     └── vm
//!          ├── Hypervisor trait ── Virsh
//!          └── boot_test ───────── remote::Connector ── SshConnector
//!
//! shared: preflight (host packages), process (Cmd), wait (poll_until),
//!         settings (TOML), error (PipelineError)
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_ci::source::{clone_kernel, CloneOptions};
//! use kernel_ci::build::{build_kernel, BuildOptions, KernelConfig};
//!
//! let tree = clone_kernel(&CloneOptions {
//!     url: "https://git.kernel.org/pub/scm/linux/kernel/git/stable/linux.git".into(),
//!     version: "5.10".into(),
//!     dir: ".".into(),
//!     depth: Some(1),
//! })?;
//! build_kernel(&tree, &BuildOptions::new(KernelConfig::Defconfig))?;
//! ```

pub mod build;
pub mod error;
pub mod logging;
pub mod preflight;
pub mod process;
pub mod remote;
pub mod settings;
pub mod source;
pub mod vm;
pub mod wait;

pub use error::{classify, PipelineError};
pub use settings::Settings;
