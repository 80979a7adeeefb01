//! Thin wrapper over `std::process::Command` for the external tools the
//! pipeline drives.
//!
//! # Example
//!
//! ```rust,ignore
//! use kernel_ci::process::Cmd;
//!
//! Cmd::new("make")
//!     .args(["-C", "linux", "defconfig"])
//!     .error_msg("make defconfig failed")
//!     .run_interactive()?;
//! ```

use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};

use crate::error::PipelineError;

/// Captured result of a finished command.
#[derive(Debug, Clone)]
pub struct CmdOutput {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CmdOutput {
    pub fn success(&self) -> bool {
        self.status.success()
    }
}

/// Where a streamed command's stdout goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StdoutSink {
    /// Inherit our stdout.
    #[default]
    Inherit,
    /// Redirect to our stderr, keeping stdout for machine-readable output.
    Stderr,
}

/// Builder for one external command invocation.
#[derive(Debug)]
pub struct Cmd {
    program: OsString,
    args: Vec<OsString>,
    envs: Vec<(OsString, OsString)>,
    current_dir: Option<PathBuf>,
    error_msg: Option<String>,
    sink: StdoutSink,
}

impl Cmd {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        Self {
            program: program.as_ref().to_os_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            error_msg: None,
            sink: StdoutSink::default(),
        }
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|a| a.as_ref().to_os_string()));
        self
    }

    /// Add an argument only when `cond` holds.
    pub fn arg_if(self, cond: bool, arg: impl AsRef<OsStr>) -> Self {
        if cond {
            self.arg(arg)
        } else {
            self
        }
    }

    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.envs
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn current_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.current_dir = Some(dir.as_ref().to_path_buf());
        self
    }

    /// Message used when the command exits non-zero.
    pub fn error_msg(mut self, msg: impl Into<String>) -> Self {
        self.error_msg = Some(msg.into());
        self
    }

    pub fn stdout_to_stderr(mut self) -> Self {
        self.sink = StdoutSink::Stderr;
        self
    }

    pub fn program(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        std::iter::once(&self.program)
            .chain(self.args.iter())
            .map(|part| part.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join(" ")
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (key, value) in &self.envs {
            cmd.env(key, value);
        }
        if let Some(dir) = &self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn failure(&self, status: ExitStatus, stderr: String) -> PipelineError {
        PipelineError::CommandFailed {
            program: self.program(),
            message: self
                .error_msg
                .clone()
                .unwrap_or_else(|| format!("`{}` failed", self.display())),
            status,
            stderr,
        }
    }

    fn capture(&self) -> Result<CmdOutput> {
        tracing::debug!(command = %self.display(), "running (captured)");
        let output = self
            .command()
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("spawning `{}`", self.program()))?;
        Ok(CmdOutput {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run with captured output and return it whatever the exit status.
    pub fn output(self) -> Result<CmdOutput> {
        self.capture()
    }

    /// Run with captured output, failing on a non-zero exit.
    pub fn run(self) -> Result<CmdOutput> {
        let output = self.capture()?;
        if !output.success() {
            return Err(self.failure(output.status, output.stderr).into());
        }
        Ok(output)
    }

    /// Run with output streamed to the terminal, failing on a non-zero exit.
    pub fn run_interactive(self) -> Result<()> {
        tracing::debug!(command = %self.display(), "running (streamed)");
        let mut cmd = self.command();
        if self.sink == StdoutSink::Stderr {
            cmd.stdout(Stdio::from(std::io::stderr()));
        }
        let status = cmd
            .status()
            .with_context(|| format!("spawning `{}`", self.program()))?;
        if !status.success() {
            return Err(self.failure(status, String::new()).into());
        }
        Ok(())
    }
}

/// Fail unless `program` can be found on PATH.
pub fn ensure_exists(program: &str) -> Result<PathBuf> {
    which::which(program).map_err(|_| {
        PipelineError::not_found("program", format!("'{program}' is not on PATH")).into()
    })
}
