use std::path::PathBuf;

use anyhow::Result;
use clap::{ArgAction, Parser, Subcommand};

use kernel_ci::build::{build_kernel, BuildOptions, KernelConfig};
use kernel_ci::remote::{SshAuth, SshConnector};
use kernel_ci::settings::{Settings, SETTINGS_ENV};
use kernel_ci::source::{apply_patch_tree, clone_kernel, kernel_version, CloneOptions, PatchDirection, PatchOptions};
use kernel_ci::vm::{
    self, BootTestOptions, CreateOptions, TestOutcome, Virsh, DEFAULT_HOSTNAME, DEFAULT_NAME,
    DEFAULT_NETWORK, DEFAULT_URI,
};
use kernel_ci::{logging, preflight};

#[derive(Parser, Debug)]
#[command(
    name = "kernel-ci",
    version,
    about = "Clone, patch, build and boot-test Linux kernels in libvirt VMs"
)]
struct Cli {
    /// Do not check for required host packages.
    #[arg(long, global = true)]
    skip_prereqs: bool,

    /// TOML settings file.
    #[arg(long, global = true, env = SETTINGS_ENV)]
    settings: Option<PathBuf>,

    /// Raise log verbosity (-v info, -vv debug). RUST_LOG takes precedence.
    #[arg(long, global = true, action = ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Clone tag v<VERSION> into <DIR>/linux-kernel-v<VERSION>
    Clone {
        #[arg(short, long)]
        url: String,
        /// Kernel version without the leading "v", e.g. 5.10
        #[arg(short, long)]
        version: String,
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        /// Shallow clone depth
        #[arg(long)]
        depth: Option<u32>,
    },

    /// Apply (or revert) a tree of patches
    Patch {
        #[arg(short, long)]
        kernel: PathBuf,
        #[arg(long)]
        patches: PathBuf,
        #[arg(long)]
        reverse: bool,
        #[arg(long)]
        dry_run: bool,
    },

    /// Print the kernel version of a source tree
    Version {
        #[arg(short, long)]
        kernel: PathBuf,
    },

    /// Build the kernel
    Make {
        #[arg(short, long)]
        kernel: PathBuf,
        /// defconfig or debconfig
        #[arg(short, long)]
        config: KernelConfig,
        /// Seed .config for debconfig builds
        #[arg(long)]
        config_path: Option<PathBuf>,
        #[arg(short, long)]
        jobs: Option<u32>,
    },

    /// Define a VM from an existing disk image
    VmCreate {
        #[arg(short, long)]
        img: PathBuf,
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,
        #[arg(short, long, default_value = DEFAULT_NAME)]
        name: String,
        #[arg(short = 'c', long, default_value_t = 1)]
        vcpus: u32,
        /// RAM in MiB
        #[arg(short, long, default_value_t = 2048)]
        memory: u32,
        /// See `virt-install --os-variant list`
        #[arg(short, long, default_value = "debian10")]
        os_variant: String,
        #[arg(long, default_value = DEFAULT_NETWORK)]
        network: String,
    },

    /// Remove a VM and all of its storage
    VmDestroy {
        #[arg(short, long, default_value = DEFAULT_NAME)]
        name: String,
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,
    },

    /// Start a VM
    VmStart {
        #[arg(short, long, default_value = DEFAULT_NAME)]
        name: String,
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,
    },

    /// Gracefully shut a VM down and wait until it is off
    VmShutdown {
        #[arg(short, long, default_value = DEFAULT_NAME)]
        name: String,
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,
    },

    /// Print the address leased to a VM
    VmIp {
        #[arg(short, long, default_value = DEFAULT_NAME)]
        name: String,
        #[arg(short = 'H', long, default_value = DEFAULT_HOSTNAME)]
        hostname: String,
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,
        #[arg(long, default_value = DEFAULT_NETWORK)]
        network: String,
    },

    /// Install built kernel packages into a VM, reboot and check the boot log
    VmTest {
        /// Kernel source tree the packages were built from
        #[arg(short, long)]
        kernel: PathBuf,
        /// Directory with the linux-image and linux-headers packages
        #[arg(short, long)]
        debpkg: PathBuf,
        #[arg(short, long, default_value = DEFAULT_NAME)]
        name: String,
        #[arg(short = 'H', long, default_value = DEFAULT_HOSTNAME)]
        hostname: String,
        #[arg(short, long, default_value = "root")]
        login: String,
        #[arg(
            short,
            long,
            default_value = "debian",
            env = "KERNEL_CI_SSH_PASSWORD",
            hide_env_values = true
        )]
        password: String,
        /// Private key to log in with instead of the password
        #[arg(short, long)]
        identity: Option<PathBuf>,
        #[arg(short, long, default_value = DEFAULT_URI)]
        uri: String,
        #[arg(long, default_value = DEFAULT_NETWORK)]
        network: String,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    logging::init(cli.verbose);

    if cli.skip_prereqs {
        preflight::skip_package_checks();
    }
    let settings = Settings::load(cli.settings.as_deref())?;

    run(cli.command, &settings)
}

fn run(command: Command, settings: &Settings) -> Result<()> {
    match command {
        Command::Clone {
            url,
            version,
            dir,
            depth,
        } => {
            let target = clone_kernel(&CloneOptions {
                url,
                version,
                dir,
                depth,
            })?;
            println!("{}", target.display());
        }

        Command::Patch {
            kernel,
            patches,
            reverse,
            dry_run,
        } => {
            let direction = if reverse {
                PatchDirection::Reverse
            } else {
                PatchDirection::Apply
            };
            let plan = apply_patch_tree(&kernel, &patches, &PatchOptions { direction, dry_run })?;
            println!("Processed {} patch(es)", plan.len());
        }

        Command::Version { kernel } => {
            println!("{}", kernel_version(&kernel)?);
        }

        Command::Make {
            kernel,
            config,
            config_path,
            jobs,
        } => {
            let mut opts = BuildOptions::new(config).jobs(jobs.unwrap_or(settings.build.jobs));
            if let Some(path) = config_path {
                opts = opts.config_path(path);
            }
            build_kernel(&kernel, &opts)?;
        }

        Command::VmCreate {
            img,
            uri,
            name,
            vcpus,
            memory,
            os_variant,
            network,
        } => {
            let hv = Virsh::connect(uri)?;
            let opts = CreateOptions {
                vcpus,
                memory_mb: memory,
                os_variant,
                network,
                ..CreateOptions::new(name, img)
            };
            vm::create_vm(&hv, &opts)?;
        }

        Command::VmDestroy { name, uri } => {
            vm::destroy_vm(&Virsh::connect(uri)?, &name)?;
        }

        Command::VmStart { name, uri } => {
            vm::start_vm(&Virsh::connect(uri)?, &name)?;
        }

        Command::VmShutdown { name, uri } => {
            vm::shutdown_vm(&Virsh::connect(uri)?, &name, settings.timeouts.shutdown())?;
        }

        Command::VmIp {
            name,
            hostname,
            uri,
            network,
        } => {
            let ip = vm::vm_ip(&Virsh::connect(uri)?, &name, &hostname, &network)?;
            println!("{ip}");
        }

        Command::VmTest {
            kernel,
            debpkg,
            name,
            hostname,
            login,
            password,
            identity,
            uri,
            network,
        } => {
            let hv = Virsh::connect(uri)?;
            let auth = match identity {
                Some(path) => SshAuth::Identity(path),
                None => SshAuth::Password(password),
            };
            let connector = SshConnector::new(login.clone(), auth, &settings.ssh)?;
            let opts = BootTestOptions {
                kernel,
                debpkg,
                name,
                hostname,
                network,
                login,
                timeouts: settings.timeouts.clone(),
            };

            match vm::test_kernel_boot(&hv, &connector, &opts)? {
                TestOutcome::Passed => println!("Boot test passed"),
                TestOutcome::BootErrors { count, .. } => {
                    println!("Boot test finished with {count} error line(s); VM left running")
                }
            }
        }
    }

    Ok(())
}
