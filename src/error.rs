//! Error type shared by the snoop protocol.
//!
//! Every failure carries the name of the operation that failed so the binary
//! can print `vcsnoop: <operation>: <system error text>`.

use std::ffi::CStr;
use std::io;

use nix::errno::Errno;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SnoopError {
    /// A system call or ioctl failed.
    #[error("{op}: {}", strerror(.errno))]
    Sys { op: String, errno: Errno },

    /// Standard output was closed by the reader.
    #[error("write(): {}", strerror(&Errno::EPIPE))]
    BrokenPipe,

    #[error("pthread_join(): relay thread panicked")]
    WorkerPanicked,
}

pub type Result<T> = std::result::Result<T, SnoopError>;

impl SnoopError {
    pub fn sys(op: impl Into<String>, errno: Errno) -> Self {
        SnoopError::Sys {
            op: op.into(),
            errno,
        }
    }

    pub fn io(op: impl Into<String>, err: &io::Error) -> Self {
        Self::sys(op, errno_of(err))
    }
}

/// System error text for `errno`, as `perror` would print it
pub fn strerror(errno: &Errno) -> String {
    let mut buf = [0 as libc::c_char; 256];
    // SAFETY: buf is writable for its whole length
    let rc = unsafe { libc::strerror_r(*errno as libc::c_int, buf.as_mut_ptr(), buf.len()) };
    if rc != 0 {
        return errno.desc().to_string();
    }
    // SAFETY: strerror_r NUL-terminates on success
    unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned()
}

/// Map an `io::Error` onto an errno, falling back on its kind.
pub fn errno_of(err: &io::Error) -> Errno {
    match err.raw_os_error() {
        Some(code) => Errno::from_raw(code),
        None => match err.kind() {
            io::ErrorKind::BrokenPipe => Errno::EPIPE,
            io::ErrorKind::WriteZero => Errno::EIO,
            io::ErrorKind::TimedOut => Errno::ETIME,
            _ => Errno::EIO,
        },
    }
}
