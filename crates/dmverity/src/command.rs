//! Running the external tools that do the actual disk work.
//!
//! Formatting, verifying and resizing are delegated to `veritysetup`,
//! `sfdisk` and friends.  All invocations go through the [`CommandRunner`]
//! trait so that callers (and tests) can substitute their own process
//! execution, and all of them honour the cancellation flag carried by a
//! [`BuildContext`].

use std::{
    ffi::{OsStr, OsString},
    fmt,
    io::{self, Write},
    process::{Command, Stdio},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use log::debug;
use thiserror::Error;

/// Creates, formats and verifies verity hash partitions.
pub const VERITYSETUP: &str = "veritysetup";
/// Rewrites partition table entries.
pub const SFDISK: &str = "sfdisk";
/// Serializes partition table writes with udev and other tools.
pub const FLOCK: &str = "flock";
/// Waits for device node events to be processed.
pub const UDEVADM: &str = "udevadm";
/// Lists the kernel's view of a disk's partitions.
pub const LSBLK: &str = "lsblk";

/// Shared state for one provisioning run.
///
/// Cloning is cheap and all clones observe the same cancellation flag, so a
/// clone can be handed to a signal handler or another thread.
#[derive(Debug, Clone, Default)]
pub struct BuildContext {
    cancelled: Arc<AtomicBool>,
}

impl BuildContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.  Child processes which are already running are
    /// left alone; no new ones will be started.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Fails with [`CommandError::Cancelled`] once cancellation was requested.
    pub fn check(&self) -> Result<(), CommandError> {
        match self.is_cancelled() {
            true => Err(CommandError::Cancelled),
            false => Ok(()),
        }
    }
}

/// An external tool invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolCommand {
    pub program: String,
    pub args: Vec<OsString>,
    /// Written to the child's stdin, which is then closed.
    pub stdin: Option<String>,
}

impl ToolCommand {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: vec![],
            stdin: None,
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

    pub fn stdin(mut self, input: impl Into<String>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

impl fmt::Display for ToolCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// The captured result of a finished tool.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ToolOutput {
    /// Exit code, `None` if the process was killed by a signal.
    pub status: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ToolOutput {
    pub fn success(&self) -> bool {
        self.status == Some(0)
    }

    /// The last non-empty line the tool wrote to stderr.
    ///
    /// Tools like `veritysetup` put the actual reason for a failure there.
    pub fn last_stderr_line(&self) -> &str {
        self.stderr
            .lines()
            .rev()
            .map(str::trim)
            .find(|line| !line.is_empty())
            .unwrap_or("")
    }
}

/// An external tool could not be run, or reported failure.
#[derive(Error, Debug)]
pub enum CommandError {
    #[error("operation cancelled")]
    Cancelled,
    #[error("failed to run {program}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },
    #[error("{program} failed ({}): {stderr}", status_text(.status))]
    NonZeroExit {
        program: String,
        status: Option<i32>,
        stderr: String,
    },
}

fn status_text(status: &Option<i32>) -> String {
    match status {
        Some(code) => format!("exit status {code}"),
        None => "killed by signal".to_string(),
    }
}

/// Something that can execute a [`ToolCommand`] and capture its output.
///
/// Implementations only report whether the process could be run at all; the
/// exit status is interpreted by [`run`].
pub trait CommandRunner {
    fn output(&self, command: &ToolCommand) -> io::Result<ToolOutput>;
}

/// Runs tools as real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemCommandRunner;

impl CommandRunner for SystemCommandRunner {
    fn output(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let output = match &command.stdin {
            Some(input) => {
                let mut child = cmd.stdin(Stdio::piped()).spawn()?;
                // dropping the handle closes the pipe
                if let Some(mut stdin) = child.stdin.take() {
                    stdin.write_all(input.as_bytes())?;
                }
                child.wait_with_output()?
            }
            None => cmd.stdin(Stdio::null()).output()?,
        };

        Ok(ToolOutput {
            status: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

impl<T: CommandRunner + ?Sized> CommandRunner for &T {
    fn output(&self, command: &ToolCommand) -> io::Result<ToolOutput> {
        (**self).output(command)
    }
}

/// Runs `command` to completion, requiring it to succeed.
///
/// Nothing is started if `ctx` has been cancelled.
pub fn run(
    ctx: &BuildContext,
    runner: &(impl CommandRunner + ?Sized),
    command: &ToolCommand,
) -> Result<ToolOutput, CommandError> {
    ctx.check()?;

    debug!("running: {command}");
    let output = runner
        .output(command)
        .map_err(|source| CommandError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    if !output.stdout.is_empty() {
        debug!("{} stdout:\n{}", command.program, output.stdout.trim_end());
    }
    if !output.stderr.is_empty() {
        debug!("{} stderr:\n{}", command.program, output.stderr.trim_end());
    }

    if !output.success() {
        return Err(CommandError::NonZeroExit {
            program: command.program.clone(),
            status: output.status,
            stderr: output.last_stderr_line().to_string(),
        });
    }

    Ok(output)
}
