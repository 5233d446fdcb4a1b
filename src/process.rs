//! Centralized command execution with consistent error handling.
//!
//! Every external tool the builder drives (apk, mksquashfs, xorriso, cpio,
//! mount) goes through [`Cmd`], so failures always carry the tool's stderr.
//! A tool that is not installed at all surfaces as
//! [`BuildError::Resource`](crate::error::BuildError::Resource).

use anyhow::{bail, Context, Result};
use std::ffi::OsString;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};

use crate::error::BuildError;

/// Result of a command execution.
#[derive(Debug, Clone)]
pub struct CommandResult {
    pub status: ExitStatus,
    pub stdout: String,
    pub stderr: String,
}

impl CommandResult {
    pub fn success(&self) -> bool {
        self.status.success()
    }

    /// Exit code, or -1 if terminated by signal.
    pub fn code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stderr_trimmed(&self) -> &str {
        self.stderr.trim()
    }
}

/// Builder for configuring command execution.
#[derive(Debug, Clone)]
pub struct Cmd {
    program: String,
    args: Vec<OsString>,
    envs: Vec<(String, String)>,
    current_dir: Option<PathBuf>,
    error_prefix: Option<String>,
}

impl Cmd {
    pub fn new(program: impl AsRef<str>) -> Self {
        Self {
            program: program.as_ref().to_string(),
            args: Vec::new(),
            envs: Vec::new(),
            current_dir: None,
            error_prefix: None,
        }
    }

    pub fn arg(mut self, arg: impl AsRef<str>) -> Self {
        self.args.push(arg.as_ref().into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().into()));
        self
    }

    /// Add a path as an argument (kept as an OS string, no lossy conversion).
    pub fn arg_path(mut self, path: &Path) -> Self {
        self.args.push(path.as_os_str().to_owned());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn dir(mut self, dir: &Path) -> Self {
        self.current_dir = Some(dir.to_path_buf());
        self
    }

    /// Set a custom error message prefix.
    pub fn error_msg(mut self, msg: impl AsRef<str>) -> Self {
        self.error_prefix = Some(msg.as_ref().to_string());
        self
    }

    /// Human-readable command line, for logs.
    pub fn display(&self) -> String {
        let mut line = self.program.clone();
        for arg in &self.args {
            line.push(' ');
            line.push_str(&arg.to_string_lossy());
        }
        line
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        for (k, v) in &self.envs {
            cmd.env(k, v);
        }
        if let Some(ref dir) = self.current_dir {
            cmd.current_dir(dir);
        }
        cmd
    }

    fn spawn_error(&self, e: std::io::Error) -> anyhow::Error {
        if e.kind() == ErrorKind::NotFound {
            BuildError::resource(format!("'{}' is not installed or not in PATH", self.program))
                .into()
        } else {
            anyhow::Error::new(e).context(format!("Failed to execute '{}'", self.program))
        }
    }

    fn failure_prefix(&self) -> String {
        self.error_prefix
            .clone()
            .unwrap_or_else(|| format!("'{}' failed", self.program))
    }

    /// Run the command and capture output.
    pub fn run(self) -> Result<CommandResult> {
        tracing::debug!("exec: {}", self.display());

        let output = self
            .command()
            .output()
            .map_err(|e| self.spawn_error(e))?;

        let result = CommandResult {
            status: output.status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };

        if !result.success() {
            let prefix = self.failure_prefix();
            let stderr = result.stderr_trimmed();
            if stderr.is_empty() {
                bail!("{} (exit code {})", prefix, result.code());
            } else {
                bail!("{} (exit code {}):\n{}", prefix, result.code(), stderr);
            }
        }

        Ok(result)
    }

    /// Run the command with inherited stdio (streaming).
    ///
    /// Used for long-running tools (apk, mksquashfs) where the operator
    /// should see progress.
    pub fn run_interactive(self) -> Result<ExitStatus> {
        tracing::debug!("exec (interactive): {}", self.display());

        let mut cmd = self.command();
        cmd.stdin(Stdio::inherit());
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());

        let status = cmd.status().map_err(|e| self.spawn_error(e))?;

        if !status.success() {
            bail!(
                "{} (exit code {})",
                self.failure_prefix(),
                status.code().unwrap_or(-1)
            );
        }

        Ok(status)
    }
}

/// Run a shell command via `sh -c` in a directory.
pub fn shell_in(command: &str, dir: &Path) -> Result<CommandResult> {
    Cmd::new("sh").args(["-c", command]).dir(dir).run()
}

/// Run a command inside a chroot.
pub fn chroot(root: &Path, program: &str) -> Cmd {
    Cmd::new("chroot").arg_path(root).arg(program)
}

/// Full path of a program in PATH, if any.
pub fn which(program: &str) -> Option<PathBuf> {
    which::which(program).ok()
}

pub fn exists(program: &str) -> bool {
    which(program).is_some()
}

/// Fail with a `ResourceError` unless every tool is present.
pub fn require_tools(tools: &[&str]) -> Result<()> {
    let missing: Vec<&str> = tools.iter().copied().filter(|t| !exists(t)).collect();
    if !missing.is_empty() {
        return Err(BuildError::resource(format!(
            "missing host tool(s): {}. Run 'monoboot preflight' for install hints.",
            missing.join(", ")
        )))
        .context("Checking host tools");
    }
    Ok(())
}
