//! Relay worker
//!
//! Drains the pasted text from the controlling terminal and forwards it to
//! standard output. The kernel never signals the end of a paste, so a quiet
//! period after the first byte is taken as the end of the data.

use std::fs::File;
use std::io::{self, Read, Write};
use std::os::fd::AsFd;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tracing::{debug, trace};

use crate::error::{errno_of, Result, SnoopError};

/// Bytes moved per read; one atomic pipe write
pub const CHUNK_SIZE: usize = libc::PIPE_BUF;

/// Default end-of-paste quiet period
pub const DEFAULT_QUIESCENCE: Duration = Duration::from_secs(1);

/// Longest quiet period a single `poll` wait can express
pub const MAX_QUIESCENCE: Duration = Duration::from_millis(u16::MAX as u64);

/// What the relay moved
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RelayReport {
    pub bytes: usize,
    pub chunks: usize,
}

/// Copy chunks from `source` to `sink` until the source goes quiet or closes.
///
/// A failed write does not stop the loop: the source is still drained and the
/// failure is reported once reading is over. `EPIPE` comes back as
/// [`SnoopError::BrokenPipe`].
pub fn relay<W: Write>(
    source: &File,
    sink: &mut W,
    quiescence: Duration,
) -> Result<RelayReport> {
    let mut buf = [0u8; CHUNK_SIZE];
    let mut report = RelayReport::default();
    let mut write_error: Option<Errno> = None;
    let mut reader = source;

    loop {
        let mut fds = [PollFd::new(source.as_fd(), PollFlags::POLLIN)];
        let ready = poll(&mut fds, poll_timeout(quiescence))
            .map_err(|e| SnoopError::sys("poll()", e))?;
        if ready == 0 {
            if report.bytes == 0 {
                return Err(SnoopError::sys("poll()", Errno::ETIME));
            }
            debug!("Source quiet for {:?}, paste complete", quiescence);
            break;
        }

        let n = reader
            .read(&mut buf)
            .map_err(|e| SnoopError::io("read()", &e))?;
        if n == 0 {
            debug!("Source closed");
            break;
        }
        report.bytes += n;
        report.chunks += 1;
        trace!("Read {} bytes", n);

        if write_error.is_none() {
            match sink.write(&buf[..n]) {
                Ok(m) if m == n => {}
                Ok(m) => {
                    debug!("Short write: {} of {} bytes", m, n);
                    write_error = Some(Errno::EIO);
                }
                Err(e) => {
                    debug!("Write failed, draining source: {}", e);
                    write_error = Some(errno_of(&e));
                }
            }
        }
    }

    match write_error {
        None => Ok(report),
        Some(Errno::EPIPE) => Err(SnoopError::BrokenPipe),
        Some(errno) => Err(SnoopError::sys("write()", errno)),
    }
}

/// `quiescence` clamped to 1 ms ..= [`MAX_QUIESCENCE`]
fn poll_timeout(quiescence: Duration) -> PollTimeout {
    let ms = quiescence.as_millis().clamp(1, MAX_QUIESCENCE.as_millis());
    PollTimeout::from(ms as u16)
}

/// Relay running on its own thread
pub struct RelayHandle {
    handle: JoinHandle<Result<RelayReport>>,
}

impl RelayHandle {
    /// Wait for the relay to finish and collect its outcome
    pub fn join(self) -> Result<RelayReport> {
        self.handle.join().map_err(|_| SnoopError::WorkerPanicked)?
    }
}

/// Start the relay on a dedicated thread
pub fn spawn<W>(source: Arc<File>, mut sink: W, quiescence: Duration) -> Result<RelayHandle>
where
    W: Write + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("relay".to_string())
        .spawn(move || relay(&source, &mut sink, quiescence))
        .map_err(|e| SnoopError::io("pthread_create()", &e))?;
    Ok(RelayHandle { handle })
}

/// Unbuffered standard output.
///
/// `io::Stdout` is line buffered, which would hide short writes and merge
/// chunks.
pub struct StdoutSink;

impl Write for StdoutSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        nix::unistd::write(io::stdout(), buf).map_err(io::Error::from)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
