//! Install a freshly built kernel into a guest, reboot into it and inspect
//! the boot log.
//!
//! Every wait is a bounded poll against an observable condition: the domain
//! state, the DHCP lease table, the SSH port and the guest's boot id. A
//! failure before the kernel log is collected aborts the run and leaves the
//! VM as it is for inspection.

use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

use super::{require_exists, shutdown_vm, start_vm, wait_for_ip, wait_for_state, Hypervisor, VmState};
use crate::error::PipelineError;
use crate::remote::{remote_home, shell_quote, Connector, RemoteOutput, RemoteShell};
use crate::settings::Timeouts;
use crate::source::{kernel_version, KernelVersion};
use crate::wait::{poll_until, Backoff};

const BOOT_ID_CMD: &str = "cat /proc/sys/kernel/random/boot_id";
const DMESG_CMD: &str = "dmesg --ctime --level=emerg,alert,crit,err";

#[derive(Debug, Clone)]
pub struct BootTestOptions {
    /// Kernel source tree the packages were built from.
    pub kernel: PathBuf,
    /// Directory holding the `bindeb-pkg` output.
    pub debpkg: PathBuf,
    pub name: String,
    pub hostname: String,
    pub network: String,
    pub login: String,
    pub timeouts: Timeouts,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TestOutcome {
    /// No error-level kernel messages; the VM has been shut down.
    Passed,
    /// The kernel logged errors; the VM is left running.
    BootErrors { count: usize, lines: Vec<String> },
}

/// The header and image packages for one kernel version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelPackages {
    pub headers: PathBuf,
    pub image: PathBuf,
}

impl KernelPackages {
    /// Upload order: image first, then headers.
    fn files(&self) -> [&Path; 2] {
        [self.image.as_path(), self.headers.as_path()]
    }
}

/// Locate `linux-headers-<version>*.deb` and `linux-image-<version>_*.deb`
/// in `dir`.
///
/// Candidates are sorted and the first one wins.
pub fn find_kernel_packages(dir: &Path, version: &KernelVersion) -> Result<KernelPackages> {
    if !dir.is_dir() {
        return Err(PipelineError::not_found("package directory", dir.display().to_string()).into());
    }

    let mut debs: Vec<String> = fs::read_dir(dir)
        .with_context(|| format!("reading package directory '{}'", dir.display()))?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.ends_with(".deb"))
        .collect();
    debs.sort();

    let headers = pick(dir, &debs, &format!("linux-headers-{version}"), "kernel headers package")?;
    let image = pick(dir, &debs, &format!("linux-image-{version}_"), "kernel image package")?;
    Ok(KernelPackages { headers, image })
}

fn pick(dir: &Path, debs: &[String], prefix: &str, what: &'static str) -> Result<PathBuf> {
    let matches: Vec<&String> = debs.iter().filter(|d| d.starts_with(prefix)).collect();
    let Some(first) = matches.first() else {
        return Err(PipelineError::not_found(
            what,
            format!("no {}*.deb in {}", prefix, dir.display()),
        )
        .into());
    };
    if matches.len() > 1 {
        eprintln!(
            "  [WARN] {} candidates for {}*.deb, using {}",
            matches.len(),
            prefix,
            first
        );
    }
    Ok(dir.join(first.as_str()))
}

/// Non-empty lines of a kernel log excerpt.
pub fn boot_error_lines(log: &str) -> Vec<String> {
    log.lines()
        .filter(|line| !line.trim().is_empty())
        .map(str::to_string)
        .collect()
}

/// Run the whole install, reboot and inspect cycle against VM `opts.name`.
pub fn test_kernel_boot<H, C>(hv: &H, connector: &C, opts: &BootTestOptions) -> Result<TestOutcome>
where
    H: Hypervisor + ?Sized,
    C: Connector,
{
    let name = opts.name.as_str();
    require_exists(hv, name)?;

    let version = kernel_version(&opts.kernel)?;
    let packages = find_kernel_packages(&opts.debpkg, &version)?;
    println!(
        "Found packages {} and {}",
        file_name(&packages.image),
        file_name(&packages.headers)
    );

    if hv.state(name)? == VmState::Running {
        println!("VM {name} is already running");
    } else {
        start_vm(hv, name)?;
    }
    let boot = opts.timeouts.boot();
    wait_for_state(hv, name, VmState::Running, boot)?;

    let ip = wait_for_ip(hv, name, &opts.hostname, &opts.network, boot)?;
    println!("Obtained VM IP {ip}");
    poll_until(&format!("SSH on {ip}"), boot, || {
        Ok(connector.reachable(ip).then_some(()))
    })?;

    let mut session = connector.connect(ip)?;
    let home = remote_home(&opts.login);
    for file in packages.files() {
        println!("Uploading {} to {}", file_name(file), home);
        session.upload(file, &home)?;
    }
    let sync = session.exec("sync")?;
    if !sync.success() {
        eprintln!("  [WARN] remote sync failed: {}", sync.stderr.trim());
    }
    println!("Uploaded kernel packages");

    let install = session.exec(&install_command(&home, &packages))?;
    echo(&install);
    if !install.success() {
        eprintln!(
            "  [WARN] dpkg -i exited with {}",
            describe_exit(install.exit_code)
        );
    }

    let old_boot = read_boot_id(&mut session)?;
    println!("Rebooting VM {name}");
    let reboot = session.exec("reboot")?;
    tracing::debug!(exit_code = ?reboot.exit_code, "reboot issued");
    drop(session);

    let mut session = wait_for_reboot(connector, ip, &old_boot, opts.timeouts.reboot())?;

    let release = session.exec("uname -r")?;
    println!("Running kernel {}", release.stdout.trim());
    tracing::info!(release = release.stdout.trim(), expected = %version, "guest rebooted");

    let dmesg = session.exec(DMESG_CMD)?;
    if !dmesg.success() {
        bail!(
            "reading the guest kernel log failed ({}): {}",
            describe_exit(dmesg.exit_code),
            dmesg.stderr.trim()
        );
    }
    echo(&dmesg);
    drop(session);

    let lines = boot_error_lines(&dmesg.stdout);
    if !lines.is_empty() {
        let count = lines.len();
        eprintln!("WARN: there are {count} boot errors");
        return Ok(TestOutcome::BootErrors { count, lines });
    }

    shutdown_vm(hv, name, opts.timeouts.shutdown())?;
    println!("Kernel {version} booted without errors");
    Ok(TestOutcome::Passed)
}

/// `dpkg -i` of both packages as uploaded into `home`, headers first.
fn install_command(home: &str, packages: &KernelPackages) -> String {
    let remote = |path: &Path| shell_quote(&format!("{}/{}", home, file_name(path)));
    format!(
        "dpkg -i {} {}",
        remote(&packages.headers),
        remote(&packages.image)
    )
}

fn read_boot_id<S: RemoteShell + ?Sized>(session: &mut S) -> Result<String> {
    let output = session.exec(BOOT_ID_CMD)?;
    let id = output.stdout.trim();
    if !output.success() || id.is_empty() {
        bail!(
            "reading the guest boot id failed ({}): {}",
            describe_exit(output.exit_code),
            output.stderr.trim()
        );
    }
    Ok(id.to_string())
}

/// Poll fresh sessions until the guest reports a boot id other than `old`.
fn wait_for_reboot<C: Connector>(
    connector: &C,
    ip: IpAddr,
    old: &str,
    backoff: Backoff,
) -> Result<C::Session> {
    poll_until("the VM to come back from reboot", backoff, || {
        if !connector.reachable(ip) {
            return Ok(None);
        }
        let mut session = match connector.connect(ip) {
            Ok(session) => session,
            Err(err) => {
                tracing::debug!(error = %err, "guest not accepting logins yet");
                return Ok(None);
            }
        };
        match read_boot_id(&mut session) {
            Ok(id) if id != old => Ok(Some(session)),
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::debug!(error = %err, "boot id not readable yet");
                Ok(None)
            }
        }
    })
}

fn echo(output: &RemoteOutput) {
    if !output.stdout.trim().is_empty() {
        println!("{}", output.stdout.trim_end());
    }
    if !output.stderr.trim().is_empty() {
        eprintln!("{}", output.stderr.trim_end());
    }
}

fn describe_exit(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {code}"),
        None => "no exit status".to_string(),
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::classify;
    use crate::vm::fake::FakeHypervisor;
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Default)]
    struct Guest {
        uploads: Vec<(PathBuf, String)>,
        commands: Vec<String>,
        boot: u32,
        dmesg: String,
        dpkg_exit: i32,
    }

    struct FakeConnector {
        guest: Rc<RefCell<Guest>>,
        /// `reachable` reports false this many times first.
        unreachable: Cell<u32>,
    }

    impl FakeConnector {
        fn new(dmesg: &str) -> Self {
            let guest = Guest {
                dmesg: dmesg.to_string(),
                ..Guest::default()
            };
            Self {
                guest: Rc::new(RefCell::new(guest)),
                unreachable: Cell::new(2),
            }
        }
    }

    struct FakeSession {
        guest: Rc<RefCell<Guest>>,
    }

    impl Connector for FakeConnector {
        type Session = FakeSession;

        fn reachable(&self, _host: IpAddr) -> bool {
            let left = self.unreachable.get();
            if left > 0 {
                self.unreachable.set(left - 1);
                return false;
            }
            true
        }

        fn connect(&self, _host: IpAddr) -> Result<FakeSession> {
            Ok(FakeSession {
                guest: Rc::clone(&self.guest),
            })
        }
    }

    impl RemoteShell for FakeSession {
        fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<()> {
            self.guest
                .borrow_mut()
                .uploads
                .push((local.to_path_buf(), remote_dir.to_string()));
            Ok(())
        }

        fn exec(&mut self, command: &str) -> Result<RemoteOutput> {
            let mut guest = self.guest.borrow_mut();
            guest.commands.push(command.to_string());
            let ok = |stdout: String| RemoteOutput {
                exit_code: Some(0),
                stdout,
                stderr: String::new(),
            };
            Ok(match command {
                "reboot" => {
                    guest.boot += 1;
                    RemoteOutput::default()
                }
                BOOT_ID_CMD => ok(format!("boot-{}\n", guest.boot)),
                "uname -r" => ok("5.10.0\n".to_string()),
                DMESG_CMD => ok(guest.dmesg.clone()),
                cmd if cmd.starts_with("dpkg -i") => RemoteOutput {
                    exit_code: Some(guest.dpkg_exit),
                    stdout: "Setting up linux-image-5.10.0 ...\n".to_string(),
                    stderr: String::new(),
                },
                _ => ok(String::new()),
            })
        }
    }

    struct Fixture {
        _temp: tempfile::TempDir,
        opts: BootTestOptions,
    }

    fn fixture(debs: &[&str]) -> Fixture {
        let temp = tempfile::tempdir().unwrap();
        let kernel = temp.path().join("linux-kernel-v5.10");
        let debpkg = temp.path().to_path_buf();
        fs::create_dir_all(&kernel).unwrap();
        fs::write(
            kernel.join("Makefile"),
            "# SPDX-License-Identifier: GPL-2.0\nVERSION = 5\nPATCHLEVEL = 10\nSUBLEVEL = 0\n",
        )
        .unwrap();
        for deb in debs {
            fs::write(debpkg.join(deb), "").unwrap();
        }

        let opts = BootTestOptions {
            kernel,
            debpkg,
            name: "debian10".into(),
            hostname: "debian".into(),
            network: "default".into(),
            login: "root".into(),
            timeouts: Timeouts {
                boot_secs: 2,
                reboot_secs: 2,
                shutdown_secs: 2,
                poll_initial_ms: 1,
                poll_max_ms: 5,
            },
        };
        Fixture { _temp: temp, opts }
    }

    const HEADERS: &str = "linux-headers-5.10.0_5.10.0-1_amd64.deb";
    const IMAGE: &str = "linux-image-5.10.0_5.10.0-1_amd64.deb";

    fn stopped_vm() -> FakeHypervisor {
        let hv = FakeHypervisor::with_vm("debian10", VmState::Stopped);
        hv.lease("debian", "192.168.122.45");
        hv
    }

    #[test]
    fn clean_boot_passes_and_shuts_down() {
        let fx = fixture(&[HEADERS, IMAGE, "linux-libc-dev_5.10.0-1_amd64.deb"]);
        let hv = stopped_vm();
        let connector = FakeConnector::new("");

        let outcome = test_kernel_boot(&hv, &connector, &fx.opts).unwrap();

        assert_eq!(outcome, TestOutcome::Passed);
        assert_eq!(hv.calls(), ["start debian10", "shutdown debian10"]);
        assert_eq!(hv.state("debian10").unwrap(), VmState::Stopped);

        let guest = connector.guest.borrow();
        let uploaded: Vec<String> = guest
            .uploads
            .iter()
            .map(|(path, dir)| format!("{}:{}", file_name(path), dir))
            .collect();
        assert_eq!(uploaded, [format!("{IMAGE}:/root"), format!("{HEADERS}:/root")]);
        assert!(guest
            .commands
            .contains(&format!("dpkg -i '/root/{HEADERS}' '/root/{IMAGE}'")));
        assert!(guest.commands.contains(&"reboot".to_string()));
        assert_eq!(guest.boot, 1);
    }

    #[test]
    fn boot_errors_are_counted_and_vm_left_running() {
        let fx = fixture(&[HEADERS, IMAGE]);
        let hv = stopped_vm();
        let dmesg = "[Thu May  2 11:42:10 2024] ACPI Error: AE_NOT_FOUND\n\n\
                     [Thu May  2 11:42:10 2024] i8042: No controller found\n\
                     [Thu May  2 11:42:11 2024] piix4_smbus: SMBus base address uninitialized\n";
        let connector = FakeConnector::new(dmesg);

        let outcome = test_kernel_boot(&hv, &connector, &fx.opts).unwrap();

        match outcome {
            TestOutcome::BootErrors { count, lines } => {
                assert_eq!(count, 3);
                assert!(lines[1].contains("i8042"));
            }
            other => panic!("expected boot errors, got {other:?}"),
        }
        assert_eq!(hv.calls(), ["start debian10"]);
        assert_eq!(hv.state("debian10").unwrap(), VmState::Running);
    }

    #[test]
    fn missing_headers_fail_before_vm_start() {
        let fx = fixture(&[IMAGE]);
        let hv = stopped_vm();
        let connector = FakeConnector::new("");

        let err = test_kernel_boot(&hv, &connector, &fx.opts).unwrap_err();

        assert!(matches!(
            classify(&err),
            Some(PipelineError::NotFound { what: "kernel headers package", .. })
        ));
        assert!(hv.calls().is_empty());
        assert!(connector.guest.borrow().commands.is_empty());
    }

    #[test]
    fn absent_vm_is_not_found() {
        let fx = fixture(&[HEADERS, IMAGE]);
        let hv = FakeHypervisor::default();
        let err = test_kernel_boot(&hv, &FakeConnector::new(""), &fx.opts).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(PipelineError::NotFound { what: "virtual machine", .. })
        ));
    }

    #[test]
    fn running_vm_is_not_started_again() {
        let fx = fixture(&[HEADERS, IMAGE]);
        let hv = FakeHypervisor::with_vm("debian10", VmState::Running);
        hv.lease("debian", "192.168.122.45");

        let outcome = test_kernel_boot(&hv, &FakeConnector::new(""), &fx.opts).unwrap();
        assert_eq!(outcome, TestOutcome::Passed);
        assert_eq!(hv.calls(), ["shutdown debian10"]);
    }

    #[test]
    fn failed_dpkg_only_warns() {
        let fx = fixture(&[HEADERS, IMAGE]);
        let hv = stopped_vm();
        let connector = FakeConnector::new("");
        connector.guest.borrow_mut().dpkg_exit = 1;

        let outcome = test_kernel_boot(&hv, &connector, &fx.opts).unwrap();
        assert_eq!(outcome, TestOutcome::Passed);
    }

    #[test]
    fn non_root_login_uploads_to_home() {
        let mut fx = fixture(&[HEADERS, IMAGE]);
        fx.opts.login = "ci".into();
        let hv = stopped_vm();
        let connector = FakeConnector::new("");

        test_kernel_boot(&hv, &connector, &fx.opts).unwrap();
        let guest = connector.guest.borrow();
        assert!(guest.uploads.iter().all(|(_, dir)| dir == "/home/ci"));
        assert_eq!(guest.uploads.len(), 2);
    }

    #[test]
    fn install_command_quotes_remote_paths() {
        let packages = KernelPackages {
            headers: PathBuf::from("/debs/linux-headers-5.10.0_1 (rebuild).deb"),
            image: PathBuf::from("/debs/linux-image-5.10.0_1.deb"),
        };
        assert_eq!(
            install_command("/home/o'neil", &packages),
            "dpkg -i '/home/o'\\''neil/linux-headers-5.10.0_1 (rebuild).deb' \
             '/home/o'\\''neil/linux-image-5.10.0_1.deb'"
        );
    }

    #[test]
    fn missing_lease_times_out_after_start() {
        let fx = fixture(&[HEADERS, IMAGE]);
        let hv = FakeHypervisor::with_vm("debian10", VmState::Stopped);

        let err = test_kernel_boot(&hv, &FakeConnector::new(""), &fx.opts).unwrap_err();
        assert!(matches!(classify(&err), Some(PipelineError::Timeout { .. })));
        assert_eq!(hv.calls(), ["start debian10"]);
    }

    #[test]
    fn package_lookup_takes_first_sorted_candidate() {
        let temp = tempfile::tempdir().unwrap();
        for deb in [
            "linux-image-5.10.0_5.10.0-2_amd64.deb",
            "linux-image-5.10.0_5.10.0-1_amd64.deb",
            "linux-image-5.10.0-dbg_5.10.0-1_amd64.deb",
            "linux-headers-5.10.0_5.10.0-1_amd64.deb",
            "linux-headers-5.10.0_5.10.0-1_amd64.changes",
        ] {
            fs::write(temp.path().join(deb), "").unwrap();
        }
        let version = KernelVersion {
            major: 5,
            patchlevel: 10,
            sublevel: 0,
        };

        let packages = find_kernel_packages(temp.path(), &version).unwrap();
        assert_eq!(
            file_name(&packages.image),
            "linux-image-5.10.0_5.10.0-1_amd64.deb"
        );
        assert_eq!(
            file_name(&packages.headers),
            "linux-headers-5.10.0_5.10.0-1_amd64.deb"
        );
    }

    #[test]
    fn missing_package_directory_is_not_found() {
        let version = KernelVersion {
            major: 6,
            patchlevel: 1,
            sublevel: 0,
        };
        let err = find_kernel_packages(Path::new("/nonexistent/debs"), &version).unwrap_err();
        assert!(matches!(
            classify(&err),
            Some(PipelineError::NotFound { what: "package directory", .. })
        ));
    }

    #[test]
    fn error_lines_skip_blanks() {
        assert!(boot_error_lines("\n  \n").is_empty());
        assert_eq!(boot_error_lines("a\n\nb\n").len(), 2);
    }
}
