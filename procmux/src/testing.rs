//! A command double for unit testing code that runs processes.
//!
//! [`TestCommand`] implements [`Command`] without touching the OS. Its
//! processes replay canned stdout/stderr bytes into whatever sinks were
//! registered and return the configured errors from `start`, `wait` and
//! `kill`.
//!
//! Unlike a [`SystemProcess`](crate::SystemProcess), `wait` on a test process
//! does not return until both streams have been written and closed.

use std::io::Read;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::broadcast::{Broadcaster, Sink};
use crate::command::{Command, Process};
use crate::error::{Error, Result};

/// Canned behavior for every process the command manufactures.
///
/// Fields are read when [`Command::process`] is called; changing them later
/// only affects processes made afterwards.
#[derive(Debug, Clone, Default)]
pub struct TestCommand {
    /// Written to every stdout sink.
    pub stdout: Vec<u8>,
    /// Written to every stderr sink.
    pub stderr: Vec<u8>,
    /// Returned by `start`; when set nothing is written.
    pub start_error: Option<Error>,
    /// Returned by `wait` once both streams are done.
    pub wait_error: Option<Error>,
    /// Returned by `kill`, whatever state the process is in.
    pub kill_error: Option<Error>,
}

impl TestCommand {
    /// A command whose processes print `stdout` and `stderr` and succeed.
    ///
    /// Set the error fields afterwards to script failures.
    pub fn new(stdout: impl Into<Vec<u8>>, stderr: impl Into<Vec<u8>>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: stderr.into(),
            ..Self::default()
        }
    }

    /// Manufacture a process, keeping its concrete type.
    pub fn new_process(&self) -> TestProcess {
        TestProcess {
            config: self.clone(),
            stdin: Mutex::new(None),
            stdout: Broadcaster::new(),
            stderr: Broadcaster::new(),
            replayed: watch::channel(true).1,
        }
    }
}

impl Command for TestCommand {
    /// Always empty; a double has no executable.
    fn path(&self) -> &str {
        ""
    }

    fn set_path(&mut self, _path: String) {}

    fn process(&self) -> Box<dyn Process> {
        Box::new(self.new_process())
    }
}

/// Process manufactured by a [`TestCommand`].
pub struct TestProcess {
    config: TestCommand,
    stdin: Mutex<Option<Box<dyn Read + Send>>>,
    stdout: Broadcaster,
    stderr: Broadcaster,
    /// `false` while the canned output is being written.
    replayed: watch::Receiver<bool>,
}

impl TestProcess {
    /// Take the stdin source handed to [`Process::set_stdin`], if any.
    pub fn take_stdin(&mut self) -> Option<Box<dyn Read + Send>> {
        self.stdin
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

#[async_trait]
impl Process for TestProcess {
    /// Arguments are irrelevant to a double.
    fn append_args(&mut self, _args: &[&str]) {}

    fn set_stdin(&mut self, source: Box<dyn Read + Send>) {
        *self.stdin.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(source);
    }

    fn register_stdout(&self, sink: Sink) {
        self.stdout.register(sink);
    }

    fn register_stderr(&self, sink: Sink) {
        self.stderr.register(sink);
    }

    async fn start(&mut self) -> Result<()> {
        if let Some(err) = &self.config.start_error {
            return Err(err.clone());
        }

        let replays = [
            replay(self.config.stdout.clone(), self.stdout.clone()),
            replay(self.config.stderr.clone(), self.stderr.clone()),
        ];
        let (tx, rx) = watch::channel(false);
        self.replayed = rx;
        tokio::spawn(async move {
            for handle in replays {
                if let Err(e) = handle.await {
                    warn!(target: "procmux::testing", "replay task failed: {e}");
                }
            }
            tx.send_replace(true);
        });
        Ok(())
    }

    async fn wait(&self) -> Result<()> {
        let mut replayed = self.replayed.clone();
        if replayed.wait_for(|done| *done).await.is_err() {
            warn!(target: "procmux::testing", "replay tasks stopped before finishing");
        }

        match &self.config.wait_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    async fn wait_drained(&self) -> Result<()> {
        self.wait().await
    }

    async fn kill(&self) -> Result<()> {
        match &self.config.kill_error {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for TestProcess {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestProcess")
            .field("config", &self.config)
            .field("stdout_sinks", &self.stdout.len())
            .field("stderr_sinks", &self.stderr.len())
            .finish_non_exhaustive()
    }
}

/// Write `data` (if any) into `target` and close it.
fn replay(data: Vec<u8>, target: Broadcaster) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        if !data.is_empty() {
            if let Err(e) = target.write(&data) {
                warn!(target: "procmux::testing", "replay write failed: {e}");
            }
        }
        if let Err(e) = target.close() {
            warn!(target: "procmux::testing", "replay close failed: {e}");
        }
    })
}
