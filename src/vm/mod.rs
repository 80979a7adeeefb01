//! Virtual machine lifecycle on top of a libvirt-style hypervisor.
//!
//! ```text
//!   absent ──create──► stopped ──start──► running
//!      ▲                  ▲                  │
//!      │                  └────shutdown──────┘
//!      └──────destroy───── stopped | running
//! ```
//!
//! State is never cached: every operation asks the hypervisor. All
//! operations except [`create_vm`] fail with `NotFound` when the domain does
//! not exist.

pub mod boot_test;
pub mod virsh;

use std::fmt;
use std::net::IpAddr;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::error::PipelineError;
use crate::wait::{poll_until, Backoff};

pub use boot_test::{test_kernel_boot, BootTestOptions, KernelPackages, TestOutcome};
pub use virsh::Virsh;

pub const DEFAULT_URI: &str = "qemu:///system";
pub const DEFAULT_NAME: &str = "debian10";
pub const DEFAULT_NETWORK: &str = "default";
pub const DEFAULT_HOSTNAME: &str = "debian";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Absent,
    /// Defined but not running ("shut off").
    Stopped,
    Running,
    /// Any other libvirt state (paused, crashed, in shutdown, ...).
    Other(String),
}

impl fmt::Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VmState::Absent => f.write_str("absent"),
            VmState::Stopped => f.write_str("shut off"),
            VmState::Running => f.write_str("running"),
            VmState::Other(state) => f.write_str(state),
        }
    }
}

/// One row of a virtual network's DHCP lease table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhcpLease {
    pub mac: String,
    pub ip: IpAddr,
    pub hostname: Option<String>,
}

/// Parameters for defining a new VM from an existing disk image.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    pub name: String,
    pub image: PathBuf,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub os_variant: String,
    pub network: String,
}

impl CreateOptions {
    pub fn new(name: impl Into<String>, image: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            image: image.into(),
            vcpus: 1,
            memory_mb: 2048,
            os_variant: "debian10".to_string(),
            network: DEFAULT_NETWORK.to_string(),
        }
    }
}

/// Hypervisor control plane.
///
/// Implementations perform exactly one hypervisor call per method; the
/// existence guards and waits live in the free functions of this module.
pub trait Hypervisor {
    /// Names of all defined domains, running or not.
    fn domains(&self) -> Result<Vec<String>>;

    fn state(&self, name: &str) -> Result<VmState>;

    /// Define a new domain from `opts` without booting it.
    fn define(&self, opts: &CreateOptions) -> Result<()>;

    fn start(&self, name: &str) -> Result<()>;

    /// Ask the guest OS to power down.
    fn shutdown(&self, name: &str) -> Result<()>;

    /// Pull the plug.
    fn power_off(&self, name: &str) -> Result<()>;

    /// Undefine the domain and delete its storage, snapshots, checkpoints and
    /// NVRAM.
    fn undefine(&self, name: &str) -> Result<()>;

    fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>>;
}

pub fn vm_exists<H: Hypervisor + ?Sized>(hv: &H, name: &str) -> Result<bool> {
    Ok(hv.domains()?.iter().filter(|d| d.as_str() == name).count() == 1)
}

/// Fail with `NotFound` unless `name` is defined.
pub fn require_exists<H: Hypervisor + ?Sized>(hv: &H, name: &str) -> Result<()> {
    if vm_exists(hv, name)? {
        Ok(())
    } else {
        Err(PipelineError::not_found("virtual machine", name.to_string()).into())
    }
}

/// Define a VM from `opts.image`.
pub fn create_vm<H: Hypervisor + ?Sized>(hv: &H, opts: &CreateOptions) -> Result<()> {
    if vm_exists(hv, &opts.name)? {
        return Err(PipelineError::already_exists("virtual machine", opts.name.clone()).into());
    }
    if !opts.image.is_file() {
        return Err(
            PipelineError::not_found("disk image", opts.image.display().to_string()).into(),
        );
    }

    println!(
        "Creating VM {} ({} vCPU, {} MiB) from {}",
        opts.name,
        opts.vcpus,
        opts.memory_mb,
        opts.image.display()
    );
    hv.define(opts)
        .with_context(|| format!("defining VM '{}'", opts.name))
}

pub fn start_vm<H: Hypervisor + ?Sized>(hv: &H, name: &str) -> Result<()> {
    require_exists(hv, name)?;
    println!("Starting VM {name}");
    hv.start(name)
        .with_context(|| format!("starting VM '{name}'"))
}

/// Gracefully shut `name` down and wait until it is off.
pub fn shutdown_vm<H: Hypervisor + ?Sized>(hv: &H, name: &str, backoff: Backoff) -> Result<()> {
    require_exists(hv, name)?;
    let state = hv.state(name)?;
    if state == VmState::Stopped {
        println!("VM {name} is already shut off");
        return Ok(());
    }

    println!("Shutting down VM {name}");
    hv.shutdown(name)
        .with_context(|| format!("shutting down VM '{name}'"))?;
    wait_for_state(hv, name, VmState::Stopped, backoff)
}

/// Remove `name` and all of its storage. A running VM is powered off first.
pub fn destroy_vm<H: Hypervisor + ?Sized>(hv: &H, name: &str) -> Result<()> {
    require_exists(hv, name)?;
    if hv.state(name)? == VmState::Running {
        println!("Powering off VM {name}");
        hv.power_off(name)
            .with_context(|| format!("powering off VM '{name}'"))?;
    }

    println!("Destroying VM {name} and its storage");
    hv.undefine(name)
        .with_context(|| format!("undefining VM '{name}'"))
}

/// Address leased to `hostname` on `network`.
///
/// The first matching lease wins.
pub fn vm_ip<H: Hypervisor + ?Sized>(
    hv: &H,
    name: &str,
    hostname: &str,
    network: &str,
) -> Result<IpAddr> {
    require_exists(hv, name)?;
    lookup_lease(hv, hostname, network)?.ok_or_else(|| {
        PipelineError::not_found(
            "DHCP lease",
            format!(
                "no lease for hostname '{hostname}' on network '{network}'; \
                 make sure the network is started and VM '{name}' is running"
            ),
        )
        .into()
    })
}

fn lookup_lease<H: Hypervisor + ?Sized>(
    hv: &H,
    hostname: &str,
    network: &str,
) -> Result<Option<IpAddr>> {
    let leases = hv
        .dhcp_leases(network)
        .with_context(|| format!("reading DHCP leases of network '{network}'"))?;
    Ok(leases
        .into_iter()
        .find(|lease| lease.hostname.as_deref() == Some(hostname))
        .map(|lease| lease.ip))
}

/// Poll until `name` reports `target`.
pub fn wait_for_state<H: Hypervisor + ?Sized>(
    hv: &H,
    name: &str,
    target: VmState,
    backoff: Backoff,
) -> Result<()> {
    let what = format!("VM '{name}' to be {target}");
    poll_until(&what, backoff, || {
        let state = hv.state(name)?;
        tracing::debug!(vm = name, %state, "polled state");
        Ok((state == target).then_some(()))
    })
}

/// Poll the lease table until `hostname` has an address.
pub fn wait_for_ip<H: Hypervisor + ?Sized>(
    hv: &H,
    name: &str,
    hostname: &str,
    network: &str,
    backoff: Backoff,
) -> Result<IpAddr> {
    require_exists(hv, name)?;
    let what = format!("a DHCP lease for '{hostname}' on network '{network}'");
    poll_until(&what, backoff, || lookup_lease(hv, hostname, network))
}
