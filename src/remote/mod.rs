//! Remote command execution and file transfer on a guest.
//!
//! The boot test only needs two things from a guest: run a command and
//! collect its output, and copy a file into a directory. [`RemoteShell`] is
//! that surface; [`Connector`] opens shells. The production implementation
//! drives the OpenSSH client binaries, see [`ssh`].

pub mod ssh;

use std::net::IpAddr;
use std::path::Path;

use anyhow::Result;

pub use ssh::{SshAuth, SshConnector, SshSession};

/// Captured result of a remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteOutput {
    /// `None` when the transport died before an exit code was reported.
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl RemoteOutput {
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// An open shell on a guest.
pub trait RemoteShell {
    /// Copy `local` into the remote directory `remote_dir`, keeping its file
    /// name.
    fn upload(&mut self, local: &Path, remote_dir: &str) -> Result<()>;

    /// Run `command` through the remote login shell.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    fn exec(&mut self, command: &str) -> Result<RemoteOutput>;
}

/// Opens [`RemoteShell`]s to guests by address.
pub trait Connector {
    type Session: RemoteShell;

    /// Whether the shell service on `host` accepts TCP connections.
    fn reachable(&self, host: IpAddr) -> bool;

    fn connect(&self, host: IpAddr) -> Result<Self::Session>;
}

/// Home directory of `login` on a stock Debian guest.
pub fn remote_home(login: &str) -> String {
    if login == "root" {
        "/root".to_string()
    } else {
        format!("/home/{login}")
    }
}

/// Quote `word` for a POSIX shell.
pub fn shell_quote(word: &str) -> String {
    format!("'{}'", word.replace('\'', r"'\''"))
}
