//! Fan-out of one byte stream to many registered sinks.
//!
//! A [`Broadcaster`] holds an append-only, ordered list of [`Sink`]s behind a
//! lock. Every write is replicated to each sink in registration order and
//! closing the broadcaster closes every sink that knows how to be closed.

use std::io::{self, Read, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::warn;

use crate::error::{shared, Error, Result};

const COPY_BUFFER_SIZE: usize = 8 * 1024;

/// A writer that can also be closed once the stream it receives has ended.
pub trait CloseWrite: Write {
    /// Release the underlying resource. Called at most once per stream end.
    fn close(&mut self) -> io::Result<()>;
}

/// A registered output destination.
///
/// Each chunk of the stream reaches a sink as exactly one [`Write::write`]
/// call. A count smaller than the chunk is not retried; the broadcaster
/// reports it as [`Error::ShortWrite`] and the stream stops. Writers that may
/// legitimately accept part of a buffer, such as [`std::io::stdout`] or a
/// socket, should be wrapped so that `write` finishes the whole chunk:
///
/// ```
/// use std::io::{self, Write};
/// use procmux::{Broadcaster, Sink};
///
/// struct WholeChunks<W>(W);
///
/// impl<W: Write> Write for WholeChunks<W> {
///     fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
///         self.0.write_all(buf)?;
///         Ok(buf.len())
///     }
///
///     fn flush(&mut self) -> io::Result<()> {
///         self.0.flush()
///     }
/// }
///
/// let out = Broadcaster::new();
/// out.register(Sink::writer(WholeChunks(io::stdout())));
/// out.write(b"hello\n").unwrap();
/// ```
pub enum Sink {
    /// Receives writes; skipped when the stream is closed.
    Writer(Box<dyn Write + Send>),
    /// Receives writes and is closed when the stream ends.
    Closing(Box<dyn CloseWrite + Send>),
}

impl Sink {
    /// Register a plain writer.
    pub fn writer(writer: impl Write + Send + 'static) -> Self {
        Self::Writer(Box::new(writer))
    }

    /// Register a writer that is closed when the stream ends.
    pub fn closing(writer: impl CloseWrite + Send + 'static) -> Self {
        Self::Closing(Box::new(writer))
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Writer(w) => w.write(buf),
            Self::Closing(w) => w.write(buf),
        }
    }

    fn close(&mut self) -> Option<io::Result<()>> {
        match self {
            Self::Writer(_) => None,
            Self::Closing(w) => Some(w.close()),
        }
    }
}

impl std::fmt::Debug for Sink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Writer(_) => f.write_str("Sink::Writer"),
            Self::Closing(_) => f.write_str("Sink::Closing"),
        }
    }
}

/// Thread-safe fan-out writer.
///
/// Cloning yields another handle to the same sink list, which is how a drain
/// task and its owning process share one broadcaster.
#[derive(Debug, Clone, Default)]
pub struct Broadcaster {
    sinks: Arc<Mutex<Vec<Sink>>>,
}

impl Broadcaster {
    /// Create a broadcaster with no sinks.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Sink>> {
        self.sinks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Append a sink. It receives only data written after this call returns.
    pub fn register(&self, sink: Sink) {
        self.lock().push(sink);
    }

    /// Number of registered sinks.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether no sink has been registered yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Write `buf` to every sink in registration order.
    ///
    /// Every sink gets a single `write` call with all of `buf`. Stops at the
    /// first sink that fails; later sinks do not see `buf`. A sink that
    /// accepts fewer bytes than offered without an error yields
    /// [`Error::ShortWrite`]; see [`Sink`] for wrapping such writers.
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let mut sinks = self.lock();
        for sink in sinks.iter_mut() {
            let written = sink.write(buf).map_err(|e| Error::Sink(shared(e)))?;
            if written != buf.len() {
                return Err(Error::ShortWrite {
                    written,
                    expected: buf.len(),
                });
            }
        }
        Ok(buf.len())
    }

    /// Close every closable sink in registration order, stopping at the first error.
    pub fn close(&self) -> Result<()> {
        let mut sinks = self.lock();
        for sink in sinks.iter_mut() {
            if let Some(result) = sink.close() {
                result.map_err(|e| Error::Close(shared(e)))?;
            }
        }
        Ok(())
    }

    /// Forward everything readable from `source`, then close.
    ///
    /// The close always runs. A read or sink error ends the copy and is
    /// returned ahead of any close error.
    pub fn copy(&self, mut source: impl Read) -> Result<()> {
        let copied = self.forward(&mut source);
        let closed = self.close();
        if let Err(e) = &copied {
            warn!(target: "procmux::broadcast", "copy stopped early: {e}");
        }
        copied.and(closed)
    }

    fn forward(&self, source: &mut impl Read) -> Result<()> {
        let mut buf = [0u8; COPY_BUFFER_SIZE];
        loop {
            let n = match source.read(&mut buf) {
                Ok(0) => return Ok(()),
                Ok(n) => n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(Error::Read(shared(e))),
            };
            self.write(&buf[..n])?;
        }
    }
}

/// In-memory sink whose contents stay readable after it has been registered.
///
/// Clones share one buffer: register one clone and keep another to inspect.
#[derive(Debug, Clone, Default)]
pub struct SharedBuffer {
    buf: Arc<Mutex<Vec<u8>>>,
}

impl SharedBuffer {
    /// Create an empty buffer. Clones share its contents.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of everything written so far.
    pub fn contents(&self) -> Vec<u8> {
        self.buf.lock().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Contents decoded as UTF-8, lossily.
    pub fn to_string_lossy(&self) -> String {
        String::from_utf8_lossy(&self.contents()).into_owned()
    }
}

impl Write for SharedBuffer {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.buf
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl CloseWrite for std::fs::File {
    fn close(&mut self) -> io::Result<()> {
        self.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const HELLO: &[u8] = b"hello world!";

    struct ErrWriter;

    impl Write for ErrWriter {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::UnexpectedEof))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct ShortWriter;

    impl Write for ShortWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len() - 1)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Records the order in which it was closed into a shared counter.
    struct CloseWriter {
        fail: bool,
        clock: Arc<AtomicUsize>,
        closed_at: Arc<Mutex<Option<usize>>>,
    }

    impl CloseWriter {
        fn new(fail: bool, clock: &Arc<AtomicUsize>) -> (Self, Arc<Mutex<Option<usize>>>) {
            let closed_at = Arc::new(Mutex::new(None));
            let writer = Self {
                fail,
                clock: Arc::clone(clock),
                closed_at: Arc::clone(&closed_at),
            };
            (writer, closed_at)
        }
    }

    impl Write for CloseWriter {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl CloseWrite for CloseWriter {
        fn close(&mut self) -> io::Result<()> {
            *self.closed_at.lock().unwrap() = Some(self.clock.fetch_add(1, Ordering::SeqCst));
            if self.fail {
                Err(io::Error::from(io::ErrorKind::UnexpectedEof))
            } else {
                Ok(())
            }
        }
    }

    #[test]
    fn test_error_sink() {
        let bc = Broadcaster::new();
        bc.register(Sink::writer(ErrWriter));

        let err = bc.write(HELLO).unwrap_err();
        assert!(matches!(err, Error::Sink(_)));
        assert_eq!(err.io_kind(), Some(io::ErrorKind::UnexpectedEof));
        assert!(bc.close().is_ok());
    }

    #[test]
    fn test_short_sink() {
        let bc = Broadcaster::new();
        bc.register(Sink::writer(ShortWriter));

        let err = bc.write(HELLO).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortWrite {
                written: 11,
                expected: 12
            }
        ));
    }

    #[test]
    fn test_buffer_sink() {
        let bc = Broadcaster::new();
        let buf = SharedBuffer::new();
        bc.register(Sink::writer(buf.clone()));

        assert_eq!(bc.write(HELLO).unwrap(), HELLO.len());
        assert_eq!(buf.contents(), HELLO);
        assert!(bc.close().is_ok());
    }

    #[test]
    fn test_closing_sink_error() {
        let clock = Arc::new(AtomicUsize::new(0));
        let (writer, _) = CloseWriter::new(true, &clock);
        let bc = Broadcaster::new();
        bc.register(Sink::closing(writer));

        assert!(bc.write(HELLO).is_ok());
        let err = bc.close().unwrap_err();
        assert!(matches!(err, Error::Close(_)));
    }

    #[test]
    fn test_write_stops_at_failing_sink() {
        let bc = Broadcaster::new();
        let first = SharedBuffer::new();
        let second = SharedBuffer::new();
        let after = SharedBuffer::new();
        bc.register(Sink::writer(first.clone()));
        bc.register(Sink::writer(second.clone()));
        bc.register(Sink::writer(ErrWriter));
        bc.register(Sink::writer(after.clone()));

        assert!(matches!(bc.write(HELLO), Err(Error::Sink(_))));
        assert_eq!(first.contents(), HELLO);
        assert_eq!(second.contents(), HELLO);
        assert!(after.contents().is_empty());
    }

    #[test]
    fn test_close_skips_plain_writers_and_stops_at_error() {
        let clock = Arc::new(AtomicUsize::new(0));
        let (ok, ok_at) = CloseWriter::new(false, &clock);
        let (bad, bad_at) = CloseWriter::new(true, &clock);
        let (never, never_at) = CloseWriter::new(false, &clock);

        let bc = Broadcaster::new();
        bc.register(Sink::writer(SharedBuffer::new()));
        bc.register(Sink::closing(ok));
        bc.register(Sink::writer(SharedBuffer::new()));
        bc.register(Sink::closing(bad));
        bc.register(Sink::closing(never));

        assert!(matches!(bc.close(), Err(Error::Close(_))));
        assert_eq!(*ok_at.lock().unwrap(), Some(0));
        assert_eq!(*bad_at.lock().unwrap(), Some(1));
        assert_eq!(*never_at.lock().unwrap(), None);
    }

    #[test]
    fn test_late_registration_sees_only_later_writes() {
        let bc = Broadcaster::new();
        let early = SharedBuffer::new();
        let late = SharedBuffer::new();
        bc.register(Sink::writer(early.clone()));
        bc.write(b"one ").unwrap();
        bc.register(Sink::writer(late.clone()));
        bc.write(b"two").unwrap();

        assert_eq!(early.to_string_lossy(), "one two");
        assert_eq!(late.to_string_lossy(), "two");
        assert_eq!(bc.len(), 2);
    }

    #[test]
    fn test_copy_forwards_then_closes() {
        let clock = Arc::new(AtomicUsize::new(0));
        let (closer, closed_at) = CloseWriter::new(false, &clock);
        let buf = SharedBuffer::new();
        let bc = Broadcaster::new();
        bc.register(Sink::writer(buf.clone()));
        bc.register(Sink::closing(closer));

        let data = vec![b'x'; COPY_BUFFER_SIZE * 3 + 17];
        bc.copy(data.as_slice()).unwrap();

        assert_eq!(buf.contents(), data);
        assert!(closed_at.lock().unwrap().is_some());
    }

    #[test]
    fn test_copy_read_error_still_closes() {
        struct FailingReader;

        impl Read for FailingReader {
            fn read(&mut self, _: &mut [u8]) -> io::Result<usize> {
                Err(io::Error::from(io::ErrorKind::ConnectionReset))
            }
        }

        let clock = Arc::new(AtomicUsize::new(0));
        let (closer, closed_at) = CloseWriter::new(false, &clock);
        let bc = Broadcaster::new();
        bc.register(Sink::closing(closer));

        let err = bc.copy(FailingReader).unwrap_err();
        assert!(matches!(err, Error::Read(_)));
        assert!(closed_at.lock().unwrap().is_some());
    }

    #[test]
    fn test_copy_sink_error_preferred_over_close_error() {
        let clock = Arc::new(AtomicUsize::new(0));
        let (closer, closed_at) = CloseWriter::new(true, &clock);
        let bc = Broadcaster::new();
        bc.register(Sink::closing(closer));
        bc.register(Sink::writer(ShortWriter));

        let err = bc.copy(HELLO).unwrap_err();
        assert!(matches!(err, Error::ShortWrite { .. }));
        assert!(closed_at.lock().unwrap().is_some());
    }

    #[test]
    fn test_concurrent_writers_do_not_interleave() {
        let bc = Broadcaster::new();
        let buf = SharedBuffer::new();
        bc.register(Sink::writer(buf.clone()));

        let handles: Vec<_> = (0..4u8)
            .map(|i| {
                let bc = bc.clone();
                std::thread::spawn(move || {
                    for _ in 0..100 {
                        bc.write(&[b'a' + i; 8]).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }

        let contents = buf.contents();
        assert_eq!(contents.len(), 4 * 100 * 8);
        for chunk in contents.chunks(8) {
            assert!(chunk.iter().all(|b| *b == chunk[0]));
        }
    }

    /// Accepts at most four bytes per call, counting the calls.
    struct Trickle {
        buf: SharedBuffer,
        calls: Arc<AtomicUsize>,
    }

    impl Write for Trickle {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let n = data.len().min(4);
            self.buf.write(&data[..n])
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct WholeChunks<W>(W);

    impl<W: Write> Write for WholeChunks<W> {
        fn write(&mut self, data: &[u8]) -> io::Result<usize> {
            self.0.write_all(data)?;
            Ok(data.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            self.0.flush()
        }
    }

    #[test]
    fn test_partial_writer_gets_one_call() {
        let bc = Broadcaster::new();
        let buf = SharedBuffer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        bc.register(Sink::writer(Trickle {
            buf: buf.clone(),
            calls: Arc::clone(&calls),
        }));

        let err = bc.write(HELLO).unwrap_err();
        assert!(matches!(
            err,
            Error::ShortWrite {
                written: 4,
                expected: 12
            }
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(buf.contents(), &HELLO[..4]);
    }

    #[test]
    fn test_wrapped_partial_writer_receives_whole_chunk() {
        let bc = Broadcaster::new();
        let buf = SharedBuffer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        bc.register(Sink::writer(WholeChunks(Trickle {
            buf: buf.clone(),
            calls: Arc::clone(&calls),
        })));

        assert_eq!(bc.write(HELLO).unwrap(), HELLO.len());
        assert_eq!(buf.contents(), HELLO);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
