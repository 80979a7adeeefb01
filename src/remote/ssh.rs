//! [`RemoteShell`] over the OpenSSH client.
//!
//! A session authenticates once and starts a multiplexing master on a
//! private control socket; every later `ssh`/`scp` rides that master and
//! never authenticates again. Password logins go through `sshpass -e` so the
//! password only ever travels in the child's environment.

use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;

use super::{Connector, RemoteOutput, RemoteShell};
use crate::preflight;
use crate::process::{ensure_exists, Cmd};
use crate::settings::SshSettings;
use crate::wait::port_open;

/// Guests are recreated freely, so their host keys are never pinned.
const SSH_OPTS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
];

#[derive(Clone)]
pub enum SshAuth {
    Password(String),
    Identity(PathBuf),
}

impl fmt::Debug for SshAuth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SshAuth::Password(_) => f.write_str("Password(<redacted>)"),
            SshAuth::Identity(path) => f.debug_tuple("Identity").field(path).finish(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshConnector {
    login: String,
    auth: SshAuth,
    port: u16,
    connect_timeout: Duration,
}

impl SshConnector {
    /// Check the client tools are installed and build a connector.
    pub fn new(login: impl Into<String>, auth: SshAuth, settings: &SshSettings) -> Result<Self> {
        preflight::require_packages(preflight::SSH_PACKAGES)?;
        ensure_exists("ssh")?;
        ensure_exists("scp")?;
        if matches!(auth, SshAuth::Password(_)) {
            preflight::require_packages(preflight::SSHPASS_PACKAGES)?;
            ensure_exists("sshpass")?;
        }
        Ok(Self::unchecked(login, auth, settings))
    }

    fn unchecked(login: impl Into<String>, auth: SshAuth, settings: &SshSettings) -> Self {
        Self {
            login: login.into(),
            auth,
            port: settings.port,
            connect_timeout: Duration::from_secs(settings.connect_timeout_secs),
        }
    }

    fn destination(&self, host: IpAddr) -> String {
        format!("{}@{}", self.login, host)
    }

    /// Options shared by every `ssh`/`scp` invocation.
    fn common_options(&self) -> Vec<String> {
        let mut opts: Vec<String> = SSH_OPTS.iter().map(|s| s.to_string()).collect();
        opts.extend([
            "-o".to_string(),
            format!("Port={}", self.port),
            "-o".to_string(),
            format!("ConnectTimeout={}", self.connect_timeout.as_secs().max(1)),
        ]);
        opts
    }

    /// The command that authenticates and leaves a master on `control_path`.
    fn master_command(&self, host: IpAddr, control_path: &Path) -> Cmd {
        let cmd = match &self.auth {
            SshAuth::Password(password) => Cmd::new("sshpass")
                .args(["-e", "ssh"])
                .env("SSHPASS", password)
                .args(["-o", "PubkeyAuthentication=no"]),
            SshAuth::Identity(identity) => Cmd::new("ssh")
                .arg("-i")
                .arg(identity)
                .args(["-o", "IdentitiesOnly=yes", "-o", "BatchMode=yes"]),
        };
        cmd.args(self.common_options())
            .args(["-o", "ControlMaster=yes", "-o", "ControlPersist=yes"])
            .arg("-o")
            .arg(format!("ControlPath={}", control_path.display()))
            .arg(self.destination(host))
            .arg("true")
            .error_msg(format!(
                "SSH login as {} failed",
                self.destination(host)
            ))
    }
}

impl Connector for SshConnector {
    type Session = SshSession;

    fn reachable(&self, host: IpAddr) -> bool {
        port_open(SocketAddr::new(host, self.port), self.connect_timeout)
    }

    fn connect(&self, host: IpAddr) -> Result<SshSession> {
        let control_dir = tempfile::Builder::new()
            .prefix("kernel-ci-ssh")
            .tempdir()
            .context("creating SSH control directory")?;
        let control_path = control_dir.path().join("master");

        self.master_command(host, &control_path).run()?;
        tracing::debug!(destination = %self.destination(host), "SSH master started");

        let mut mux_options = self.common_options();
        mux_options.extend([
            "-o".to_string(),
            "ControlMaster=no".to_string(),
            "-o".to_string(),
            format!("ControlPath={}", control_path.display()),
            "-o".to_string(),
            "BatchMode=yes".to_string(),
        ]);

        Ok(SshSession {
            destination: self.destination(host),
            mux_options,
            control_path,
            _control_dir: control_dir,
        })
    }
}

/// An authenticated connection to one guest.
///
/// Dropping the session stops its master connection.
#[derive(Debug)]
pub struct SshSession {
    destination: String,
    mux_options: Vec<String>,
    control_path: PathBuf,
    _control_dir: TempDir,
}

impl SshSession {
    fn exec_command(&self, command: &str) -> Cmd {
        Cmd::new("ssh")
            .args(&self.mux_options)
            .arg(&self.destination)
            .arg("--")
            .arg(command)
    }

    fn upload_command(&self, local: &Path, remote_dir: &str) -> Cmd {
        Cmd::new("scp")
            .args(&self.mux_options)
            .arg(local)
            .arg(format!("{}:{}/", self.destination, remote_dir.trim_end_matches('/')))
            .error_msg(format!(
                "copying {} to {}:{} failed",
                local.display(),
                self.destination,
                remote_dir
            ))
    }
}

impl RemoteShell for SshSession {
    /// scp inherits the terminal so its progress meter is shown.
    fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<()> {
        self.upload_command(local, remote_dir).run_interactive()
    }

    fn exec(&mut self, command: &str) -> Result<RemoteOutput> {
        let output = self.exec_command(command).output()?;
        Ok(RemoteOutput {
            exit_code: output.status.code(),
            stdout: output.stdout,
            stderr: output.stderr,
        })
    }
}

impl Drop for SshSession {
    fn drop(&mut self) {
        let result = Cmd::new("ssh")
            .arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .args(["-O", "exit"])
            .arg(&self.destination)
            .output();
        if let Err(err) = result {
            tracing::debug!(error = %err, "stopping SSH master");
        }
    }
}
