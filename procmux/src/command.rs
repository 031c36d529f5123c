//! Command templates and the process capability they manufacture.
//!
//! A [`Command`] is a reusable template; each call to [`Command::process`]
//! yields an independent, not-yet-running [`Process`]. [`SystemCommand`] backs
//! processes with real OS children, while [`TestCommand`] replays canned data.
//!
//! [`TestCommand`]: crate::testing::TestCommand

use std::collections::BTreeMap;
use std::io::Read;
use std::path::PathBuf;

use async_trait::async_trait;

use crate::broadcast::Sink;
use crate::error::Result;
use crate::process::SystemProcess;

/// One instance of a command.
///
/// A process is not running until [`start`](Process::start) is called, and it
/// is single use: once started it is never started again.
#[async_trait]
pub trait Process: Send + Sync {
    /// Append instance specific arguments after the command's base arguments.
    ///
    /// Only meaningful before `start`.
    fn append_args(&mut self, args: &[&str]);

    /// Use `source` as the process's standard input. The last call wins.
    fn set_stdin(&mut self, source: Box<dyn Read + Send>);

    /// Add a destination for everything the process writes to stdout.
    fn register_stdout(&self, sink: Sink);

    /// Add a destination for everything the process writes to stderr.
    fn register_stderr(&self, sink: Sink);

    /// Start the process and return without waiting for it to finish.
    async fn start(&mut self) -> Result<()>;

    /// Wait until the process has exited, on its own or by being killed.
    ///
    /// Output still buffered in the pipes may reach the sinks after this
    /// returns; use [`wait_drained`](Process::wait_drained) when every byte
    /// must have been delivered.
    async fn wait(&self) -> Result<()>;

    /// Wait for exit and for both output streams to be fully delivered and closed.
    async fn wait_drained(&self) -> Result<()>;

    /// Best-effort termination of the process.
    async fn kill(&self) -> Result<()>;
}

/// A command to be run in the future.
pub trait Command: Send + Sync {
    /// Path to the executable, the equivalent of `argv[0]`.
    fn path(&self) -> &str;

    /// Replace the executable path. Not validated; a bad path surfaces on start.
    fn set_path(&mut self, path: String);

    /// Manufacture a new, not yet started process.
    fn process(&self) -> Box<dyn Process>;
}

/// Template for processes backed by real OS children.
///
/// Base arguments and environment set here are given to every process built
/// from the template. Each process may add its own arguments with
/// [`Process::append_args`].
///
/// ```rust,no_run
/// use procmux::{Command, Process, SharedBuffer, Sink, SystemCommand};
///
/// # async fn run() -> procmux::Result<()> {
/// let cmd = SystemCommand::new("git", ["status"]);
/// let mut proc = cmd.process();
/// proc.append_args(&["--short"]);
///
/// let out = SharedBuffer::new();
/// proc.register_stdout(Sink::writer(out.clone()));
///
/// proc.start().await?;
/// proc.wait_drained().await?;
/// println!("{} bytes of status", out.contents().len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct SystemCommand {
    /// Executable path, looked up on `PATH` when it has no separator.
    pub(crate) program: String,
    /// Base arguments, placed before any per-process arguments.
    pub(crate) args: Vec<String>,
    /// Variables set in the child, on top of the inherited environment.
    pub(crate) env: BTreeMap<String, String>,
    /// Inherited variables removed from the child's environment.
    pub(crate) env_remove: Vec<String>,
    /// Start from an empty environment instead of inheriting the parent's.
    pub(crate) env_clear: bool,
    /// Working directory (`None` = the parent's).
    pub(crate) working_dir: Option<PathBuf>,
}

impl SystemCommand {
    /// Create a command for `path` with base arguments given to every process.
    pub fn new<I, S>(path: impl Into<String>, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: path.into(),
            args: args.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Base arguments, fixed at construction.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Set an environment variable for every manufactured process.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set multiple environment variables.
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    /// Remove an inherited environment variable.
    pub fn env_remove(mut self, key: impl Into<String>) -> Self {
        self.env_remove.push(key.into());
        self
    }

    /// Start processes from an empty environment.
    pub fn env_clear(mut self) -> Self {
        self.env_clear = true;
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Manufacture a process, keeping its concrete type.
    pub fn new_process(&self) -> SystemProcess {
        SystemProcess::new(self.clone())
    }

    /// Build the OS command for one spawn.
    pub(crate) fn to_os_command(&self, extra_args: &[String]) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).args(extra_args);

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        if self.env_clear {
            cmd.env_clear();
        }

        for key in &self.env_remove {
            cmd.env_remove(key);
        }

        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

impl Command for SystemCommand {
    fn path(&self) -> &str {
        &self.program
    }

    fn set_path(&mut self, path: String) {
        self.program = path;
    }

    fn process(&self) -> Box<dyn Process> {
        Box::new(self.new_process())
    }
}
