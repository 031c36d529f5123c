//! procmux - mockable external-process execution with output fan-out.
//!
//! Build a [`SystemCommand`] once, manufacture [`Process`]es from it, register
//! any number of sinks for each output stream, then start and wait:
//!
//! - [`Broadcaster`] replicates one byte stream to every registered [`Sink`].
//! - [`SystemProcess`] drains the child's stdout/stderr into two broadcasters
//!   on background tasks.
//! - [`TestCommand`] is a drop-in [`Command`] that replays canned output and
//!   errors, so code that runs processes can be unit tested without any.
//!
//! Code that should work with both takes a `&dyn Command` (or
//! `Box<dyn Process>`) rather than a concrete type.

pub mod broadcast;
pub mod command;
pub mod error;
pub mod process;
pub mod testing;

pub use broadcast::{Broadcaster, CloseWrite, SharedBuffer, Sink};
pub use command::{Command, Process, SystemCommand};
pub use error::{Error, Result};
pub use process::SystemProcess;
pub use testing::{TestCommand, TestProcess};
