//! Errors returned by commands, processes and broadcasters.

use std::io;
use std::process::ExitStatus;
use std::sync::Arc;
use thiserror::Error;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Everything that can go wrong while running a process or fanning out its output.
///
/// I/O causes are reference counted so the error is `Clone`; a [`TestCommand`]
/// hands each manufactured process its own copy of an injected error.
///
/// [`TestCommand`]: crate::testing::TestCommand
#[derive(Debug, Clone, Error)]
pub enum Error {
    #[error("failed to create pipe: {0}")]
    Pipe(#[source] Arc<io::Error>),

    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: Arc<io::Error>,
    },

    #[error("process already started")]
    AlreadyStarted,

    #[error("process not started")]
    NotStarted,

    #[error("failed to wait for process: {0}")]
    Wait(#[source] Arc<io::Error>),

    #[error("process exited unsuccessfully ({0})")]
    Exit(ExitStatus),

    #[error("failed to kill process: {0}")]
    Kill(#[source] Arc<io::Error>),

    #[error("sink write failed: {0}")]
    Sink(#[source] Arc<io::Error>),

    #[error("sink close failed: {0}")]
    Close(#[source] Arc<io::Error>),

    #[error("short write: sink accepted {written} of {expected} bytes")]
    ShortWrite { written: usize, expected: usize },

    #[error("failed to read process output: {0}")]
    Read(#[source] Arc<io::Error>),

    #[error("drain task failed: {0}")]
    Drain(String),
}

impl Error {
    /// Exit code of the process, if this is an exit failure that carries one.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            Self::Exit(status) => status.code(),
            _ => None,
        }
    }

    /// The underlying I/O error kind, when there is one.
    pub fn io_kind(&self) -> Option<io::ErrorKind> {
        match self {
            Self::Pipe(e)
            | Self::Spawn { source: e, .. }
            | Self::Wait(e)
            | Self::Kill(e)
            | Self::Sink(e)
            | Self::Close(e)
            | Self::Read(e) => Some(e.kind()),
            _ => None,
        }
    }
}

/// Wrap an `io::Error` for storage in an [`Error`] variant.
pub(crate) fn shared(err: io::Error) -> Arc<io::Error> {
    Arc::new(err)
}
