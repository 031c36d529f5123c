//! Processes backed by real OS children.
//!
//! Starting a [`SystemProcess`] creates a pipe per output stream, launches one
//! blocking drain task per pipe that copies into the stream's [`Broadcaster`],
//! and spawns the child. The child itself is owned by a supervisor task which
//! waits for exit and serves kill requests, so `kill` and `wait` can be called
//! concurrently from different tasks.

use std::fmt;
use std::io::{self, PipeReader, PipeWriter, Read};
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, Mutex, PoisonError};

use async_trait::async_trait;
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::broadcast::{Broadcaster, Sink};
use crate::command::{Process, SystemCommand};
use crate::error::{shared, Error, Result};

/// Exit outcome published by the supervisor; `None` while the child runs.
type ExitState = Option<Result<ExitStatus, Arc<io::Error>>>;

/// A kill request carries the channel its outcome is reported on.
type KillRequest = oneshot::Sender<io::Result<()>>;

type DrainHandle = JoinHandle<Result<()>>;

/// Combined outcome of the drain tasks; `None` while any is still copying.
type DrainState = Option<Result<()>>;

/// Which standard stream a pipe is created for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdin,
    Stdout,
    Stderr,
}

/// A process instance built from a [`SystemCommand`].
pub struct SystemProcess {
    command: SystemCommand,
    extra_args: Vec<String>,
    stdin: Mutex<Option<Box<dyn Read + Send>>>,
    stdout: Broadcaster,
    stderr: Broadcaster,
    running: Option<Running>,
}

/// Handles to a spawned child.
struct Running {
    pid: Option<u32>,
    kill_tx: mpsc::Sender<KillRequest>,
    exit: watch::Receiver<ExitState>,
    drained: watch::Receiver<DrainState>,
}

impl SystemProcess {
    pub(crate) fn new(command: SystemCommand) -> Self {
        Self {
            command,
            extra_args: Vec::new(),
            stdin: Mutex::new(None),
            stdout: Broadcaster::new(),
            stderr: Broadcaster::new(),
            running: None,
        }
    }

    /// The argument list handed to the OS: base arguments, then appended ones.
    pub fn args(&self) -> Vec<String> {
        self.command
            .args
            .iter()
            .chain(&self.extra_args)
            .cloned()
            .collect()
    }

    /// OS process id, once started.
    pub fn id(&self) -> Option<u32> {
        self.running.as_ref().and_then(|r| r.pid)
    }

    fn running(&self) -> Result<&Running> {
        self.running.as_ref().ok_or(Error::NotStarted)
    }

    /// Start the child, creating each pipe with `open_pipe`.
    fn start_with<F>(&mut self, open_pipe: F) -> Result<()>
    where
        F: Fn(Stream) -> io::Result<(PipeReader, PipeWriter)>,
    {
        if self.running.is_some() {
            return Err(Error::AlreadyStarted);
        }

        let mut cmd = self.command.to_os_command(&self.extra_args);
        let mut drains = Vec::with_capacity(2);

        // Without a stderr pipe the process is not spawned at all.
        let (err_reader, err_writer) =
            open_pipe(Stream::Stderr).map_err(|e| Error::Pipe(shared(e)))?;
        cmd.stderr(err_writer);
        drains.push(drain(err_reader, self.stderr.clone()));

        // A missing stdout pipe only costs the output drain; the process still runs.
        match open_pipe(Stream::Stdout) {
            Ok((out_reader, out_writer)) => {
                cmd.stdout(out_writer);
                drains.push(drain(out_reader, self.stdout.clone()));
            }
            Err(e) => {
                warn!(
                    target: "procmux::process",
                    program = %self.command.program,
                    "no stdout pipe, output is discarded: {e}"
                );
                cmd.stdout(Stdio::null());
            }
        }
        let drained = collect_drains(drains);

        let source = self
            .stdin
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let feeder = match source {
            Some(source) => {
                let (in_reader, in_writer) =
                    open_pipe(Stream::Stdin).map_err(|e| Error::Pipe(shared(e)))?;
                cmd.stdin(in_reader);
                Some((source, in_writer))
            }
            None => {
                cmd.stdin(Stdio::null());
                None
            }
        };

        let spawned = cmd.spawn();
        // The command holds the child's ends of the pipes; the drains only
        // see end of stream once these are closed.
        drop(cmd);
        let child = spawned.map_err(|e| Error::Spawn {
            program: self.command.program.clone(),
            source: shared(e),
        })?;

        let pid = child.id();
        debug!(
            target: "procmux::process",
            pid = ?pid,
            program = %self.command.program,
            args = ?self.args(),
            "spawned process"
        );

        if let Some((source, pipe)) = feeder {
            tokio::task::spawn_blocking(move || feed_stdin(source, pipe));
        }

        let (kill_tx, kill_rx) = mpsc::channel(1);
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(supervise(child, kill_rx, exit_tx));

        self.running = Some(Running {
            pid,
            kill_tx,
            exit: exit_rx,
            drained,
        });
        Ok(())
    }
}

#[async_trait]
impl Process for SystemProcess {
    fn append_args(&mut self, args: &[&str]) {
        self.extra_args.extend(args.iter().copied().map(String::from));
    }

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
        self.start_with(|_| io::pipe())
    }

    async fn wait(&self) -> Result<()> {
        let mut exit = self.running()?.exit.clone();
        let state = exit
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Wait(shared(io::Error::other("process supervisor stopped"))))?
            .clone();

        match state {
            Some(Ok(status)) if status.success() => Ok(()),
            Some(Ok(status)) => Err(Error::Exit(status)),
            Some(Err(e)) => Err(Error::Wait(e)),
            None => Err(Error::NotStarted),
        }
    }

    async fn wait_drained(&self) -> Result<()> {
        let mut drained = self.running()?.drained.clone();
        let exited = self.wait().await;

        let state = drained
            .wait_for(Option::is_some)
            .await
            .map_err(|_| Error::Drain("drain tasks stopped".to_string()))?
            .clone();

        exited.and(state.unwrap_or(Ok(())))
    }

    async fn kill(&self) -> Result<()> {
        let running = self.running()?;
        let (reply_tx, reply_rx) = oneshot::channel();
        if running.kill_tx.send(reply_tx).await.is_err() {
            return Err(already_finished());
        }
        match reply_rx.await {
            Ok(result) => result.map_err(|e| Error::Kill(shared(e))),
            Err(_) => Err(already_finished()),
        }
    }
}

impl fmt::Display for SystemProcess {
    /// The command line, with arguments containing whitespace quoted.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let argv = std::iter::once(&self.command.program)
            .chain(&self.command.args)
            .chain(&self.extra_args);
        for (i, arg) in argv.enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            if arg.contains([' ', '\t', '\n', '\r']) {
                write!(f, "{arg:?}")?;
            } else {
                f.write_str(arg)?;
            }
        }
        Ok(())
    }
}

impl fmt::Debug for SystemProcess {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SystemProcess")
            .field("command", &self.to_string())
            .field("pid", &self.id())
            .field("stdout_sinks", &self.stdout.len())
            .field("stderr_sinks", &self.stderr.len())
            .finish_non_exhaustive()
    }
}

fn already_finished() -> Error {
    Error::Kill(shared(io::Error::other("process already finished")))
}

/// Copy one pipe into its broadcaster on the blocking pool.
fn drain(source: PipeReader, target: Broadcaster) -> DrainHandle {
    tokio::task::spawn_blocking(move || target.copy(source))
}

/// Publish the first drain error, or success, once every drain has finished.
fn collect_drains(drains: Vec<DrainHandle>) -> watch::Receiver<DrainState> {
    let (tx, rx) = watch::channel(None);
    tokio::spawn(async move {
        let mut drained = Ok(());
        for handle in drains {
            let result = match handle.await {
                Ok(result) => result,
                Err(e) => Err(Error::Drain(e.to_string())),
            };
            if drained.is_ok() {
                drained = result;
            }
        }
        tx.send_replace(Some(drained));
    });
    rx
}

fn feed_stdin(mut source: Box<dyn Read + Send>, mut pipe: PipeWriter) {
    match io::copy(&mut source, &mut pipe) {
        Ok(_) => {}
        // The child exited or closed stdin without reading everything.
        Err(e) if e.kind() == io::ErrorKind::BrokenPipe => {}
        Err(e) => warn!(target: "procmux::process", "failed to feed stdin: {e}"),
    }
}

/// Own the child until it exits, killing it on request.
async fn supervise(
    mut child: Child,
    mut kills: mpsc::Receiver<KillRequest>,
    exit: watch::Sender<ExitState>,
) {
    let status = loop {
        tokio::select! {
            status = child.wait() => break status,
            Some(reply) = kills.recv() => {
                debug!(target: "procmux::process", pid = ?child.id(), "kill requested");
                let _ = reply.send(child.start_kill());
            }
        }
    };

    match &status {
        Ok(status) => debug!(target: "procmux::process", "process exited: {status}"),
        Err(e) => warn!(target: "procmux::process", "failed to wait for process: {e}"),
    }
    exit.send_replace(Some(status.map_err(shared)));
}
