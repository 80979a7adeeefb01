//! [`Hypervisor`] backed by the libvirt command line tools.

use std::net::IpAddr;
use std::path::Path;

use anyhow::{Context, Result};

use super::{CreateOptions, DhcpLease, Hypervisor, VmState};
use crate::preflight;
use crate::process::{ensure_exists, Cmd};

/// `virsh`/`virt-install` against one libvirt connection URI.
#[derive(Debug, Clone)]
pub struct Virsh {
    uri: String,
}

impl Virsh {
    /// Check the virtualization packages are installed and bind to `uri`.
    pub fn connect(uri: impl Into<String>) -> Result<Self> {
        preflight::require_packages(preflight::VM_PACKAGES)?;
        for program in ["virsh", "virt-install"] {
            ensure_exists(program)?;
        }
        Ok(Self { uri: uri.into() })
    }

    fn virsh(&self) -> Cmd {
        Cmd::new("virsh").args(["--connect", self.uri.as_str()])
    }

    fn install_command(&self, opts: &CreateOptions) -> Cmd {
        Cmd::new("virt-install")
            .args(["--connect", self.uri.as_str()])
            .arg("--name")
            .arg(&opts.name)
            .arg("--vcpus")
            .arg(opts.vcpus.to_string())
            .arg("--memory")
            .arg(opts.memory_mb.to_string())
            .arg("--disk")
            .arg(format!(
                "path={},format={}",
                opts.image.display(),
                disk_format(&opts.image)
            ))
            .arg("--os-variant")
            .arg(&opts.os_variant)
            .arg("--network")
            .arg(format!("network={}", opts.network))
            .args(["--import", "--noautoconsole", "--noreboot"])
            .error_msg(format!("virt-install of '{}' failed", opts.name))
    }
}

impl Hypervisor for Virsh {
    fn domains(&self) -> Result<Vec<String>> {
        let output = self
            .virsh()
            .args(["list", "--all", "--name"])
            .error_msg("listing libvirt domains failed")
            .run()?;
        Ok(parse_domain_list(&output.stdout))
    }

    fn state(&self, name: &str) -> Result<VmState> {
        if !self.domains()?.iter().any(|d| d == name) {
            return Ok(VmState::Absent);
        }
        let output = self
            .virsh()
            .args(["domstate", name])
            .error_msg(format!("querying state of '{name}' failed"))
            .run()?;
        Ok(parse_domstate(&output.stdout))
    }

    fn define(&self, opts: &CreateOptions) -> Result<()> {
        self.install_command(opts).stdout_to_stderr().run_interactive()
    }

    fn start(&self, name: &str) -> Result<()> {
        self.virsh()
            .args(["start", name])
            .error_msg(format!("virsh start '{name}' failed"))
            .stdout_to_stderr()
            .run_interactive()
    }

    fn shutdown(&self, name: &str) -> Result<()> {
        self.virsh()
            .args(["shutdown", name])
            .error_msg(format!("virsh shutdown '{name}' failed"))
            .stdout_to_stderr()
            .run_interactive()
    }

    fn power_off(&self, name: &str) -> Result<()> {
        self.virsh()
            .args(["destroy", name])
            .error_msg(format!("virsh destroy '{name}' failed"))
            .stdout_to_stderr()
            .run_interactive()
    }

    fn undefine(&self, name: &str) -> Result<()> {
        self.virsh()
            .args([
                "undefine",
                name,
                "--managed-save",
                "--snapshots-metadata",
                "--checkpoints-metadata",
                "--nvram",
                "--remove-all-storage",
            ])
            .error_msg(format!("virsh undefine '{name}' failed"))
            .stdout_to_stderr()
            .run_interactive()
    }

    fn dhcp_leases(&self, network: &str) -> Result<Vec<DhcpLease>> {
        let output = self
            .virsh()
            .args(["net-dhcp-leases", network])
            .error_msg(format!("reading leases of network '{network}' failed"))
            .run()?;
        parse_dhcp_leases(&output.stdout)
            .with_context(|| format!("parsing `virsh net-dhcp-leases {network}`"))
    }
}

/// `virsh list --name` prints one domain per line and a trailing blank.
pub fn parse_domain_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

pub fn parse_domstate(output: &str) -> VmState {
    match output.trim() {
        "running" => VmState::Running,
        "shut off" => VmState::Stopped,
        other => VmState::Other(other.to_string()),
    }
}

/// Parse the `net-dhcp-leases` table.
///
/// ```text
///  Expiry Time           MAC address         Protocol   IP address           Hostname   Client ID or DUID
/// -----------------------------------------------------------------------------------------------------------
///  2024-05-02 11:42:10   52:54:00:6b:3c:1d   ipv4       192.168.122.45/24    debian     ff:...
/// ```
pub fn parse_dhcp_leases(output: &str) -> Result<Vec<DhcpLease>> {
    let mut leases = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with("Expiry") || line.starts_with('-') {
            continue;
        }

        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 {
            tracing::debug!(line, "skipping short lease row");
            continue;
        }

        let address = fields[4];
        let ip = address.split('/').next().unwrap_or(address);
        let ip: IpAddr = ip
            .parse()
            .with_context(|| format!("invalid lease address '{address}'"))?;
        let hostname = fields
            .get(5)
            .filter(|h| **h != "-")
            .map(|h| h.to_string());

        leases.push(DhcpLease {
            mac: fields[2].to_string(),
            ip,
            hostname,
        });
    }
    Ok(leases)
}

/// `format=` value for `--disk`, from the image extension.
pub fn disk_format(image: &Path) -> String {
    let ext = image
        .extension()
        .map(|e| e.to_string_lossy().to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "" | "img" | "raw" => "raw".to_string(),
        other => other.to_string(),
    }
}
