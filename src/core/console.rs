//! Linux virtual console control
//!
//! Wraps the kernel console driver ioctls used by the snoop protocol:
//! VT switching (`VT_ACTIVATE`, `VT_WAITACTIVE`, `VT_GETSTATE`) and the
//! `TIOCLINUX` selection/paste subcodes. Also validates console device paths.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::os::fd::AsRawFd;
use std::os::unix::fs::{FileTypeExt, MetadataExt};
use std::path::Path;
use std::sync::Arc;

use nix::errno::Errno;
use nix::sys::stat::{major, minor};
use tracing::debug;

use crate::error::{Result, SnoopError};

/// Controlling terminal of the invoking process
pub const CONTROLLING_TTY: &str = "/dev/tty";

/// Major number of the kernel text consoles (`TTY_MAJOR`)
const TTY_MAJOR: u64 = 4;

// linux/vt.h
const VT_GETSTATE: libc::Ioctl = 0x5603;
const VT_ACTIVATE: libc::Ioctl = 0x5606;
const VT_WAITACTIVE: libc::Ioctl = 0x5607;

// asm-generic/ioctls.h
const TIOCLINUX: libc::Ioctl = 0x541C;

// linux/tiocl.h
const TIOCL_SETSEL: u8 = 2;
const TIOCL_PASTESEL: u8 = 3;
const TIOCL_SELLINE: u16 = 2;

/// Index of a kernel virtual console (the N in `/dev/ttyN`)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConsoleIndex(u16);

impl ConsoleIndex {
    /// `MIN_NR_CONSOLES`
    pub const MIN: u16 = 1;
    /// `MAX_NR_CONSOLES`
    pub const MAX: u16 = 63;

    /// Create an index, rejecting values outside the legal console range
    pub fn new(n: u64) -> Option<Self> {
        if n < Self::MIN as u64 || n > Self::MAX as u64 {
            return None;
        }
        Some(Self(n as u16))
    }

    /// Wrap an index reported by the kernel itself
    fn from_active(n: u16) -> Self {
        Self(n)
    }

    pub fn get(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ConsoleIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Text selection submitted to the console driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRegion {
    pub start_col: u16,
    pub start_row: u16,
    pub end_col: u16,
    pub end_row: u16,
    pub mode: u16,
}

impl SelectionRegion {
    /// Line selection spanning every addressable row and column.
    ///
    /// The kernel clamps coordinates to the real screen size, so this covers
    /// the whole visible buffer whatever the console dimensions are.
    pub fn full_screen() -> Self {
        Self {
            start_col: 1,
            start_row: 1,
            end_col: i16::MAX as u16,
            end_row: i16::MAX as u16,
            mode: TIOCL_SELLINE,
        }
    }
}

/// `TIOCLINUX` argument: the subcode byte directly followed by
/// `struct tiocl_selection`. The leading pad keeps the shorts aligned.
#[repr(C)]
struct SelectionRequest {
    _padding: u8,
    subcode: u8,
    xs: u16,
    ys: u16,
    xe: u16,
    ye: u16,
    sel_mode: u16,
}

impl SelectionRequest {
    fn new(region: &SelectionRegion) -> Self {
        Self {
            _padding: 0,
            subcode: TIOCL_SETSEL,
            xs: region.start_col,
            ys: region.start_row,
            xe: region.end_col,
            ye: region.end_row,
            sel_mode: region.mode,
        }
    }

    /// Pointer to the subcode byte, derived from the whole request so the
    /// selection that follows it stays in bounds
    fn as_ioctl_arg(&mut self) -> *mut u8 {
        (self as *mut Self).cast::<u8>().wrapping_add(1)
    }
}

/// `struct vt_stat`
#[repr(C)]
#[derive(Default)]
struct VtStat {
    v_active: u16,
    v_signal: u16,
    v_state: u16,
}

/// Console operations needed by the snoop protocol.
///
/// Every method is fatal on failure; there is no retry.
pub trait ConsoleControl {
    /// Switch to `console` and block until the switch has completed
    fn activate(&self, console: ConsoleIndex) -> Result<()>;

    /// Currently active console
    fn query_active(&self) -> Result<ConsoleIndex>;

    /// Program the kernel selection buffer from the active console
    fn set_selection(&self, region: &SelectionRegion) -> Result<()>;

    /// Inject the selection buffer as input on the controlling terminal
    fn trigger_paste(&self) -> Result<()>;
}

/// Console controller backed by the controlling terminal
pub struct VtConsole {
    tty: Arc<File>,
}

impl VtConsole {
    pub fn new(tty: Arc<File>) -> Self {
        Self { tty }
    }

    fn ioctl_arg(&self, op: &str, request: libc::Ioctl, arg: libc::c_ulong) -> Result<()> {
        // SAFETY: the request takes its argument by value
        let rc = unsafe { libc::ioctl(self.tty.as_raw_fd(), request, arg) };
        Errno::result(rc).map_err(|e| SnoopError::sys(op, e))?;
        Ok(())
    }

    fn tioclinux(&self, op: &str, subcode: *mut u8) -> Result<()> {
        // SAFETY: subcode points at a live request laid out as the kernel expects
        let rc = unsafe { libc::ioctl(self.tty.as_raw_fd(), TIOCLINUX, subcode) };
        Errno::result(rc).map_err(|e| SnoopError::sys(op, e))?;
        Ok(())
    }
}

impl ConsoleControl for VtConsole {
    fn activate(&self, console: ConsoleIndex) -> Result<()> {
        debug!("Activating console {}", console);
        let n = console.get() as libc::c_ulong;
        self.ioctl_arg("VT_ACTIVATE", VT_ACTIVATE, n)?;
        self.ioctl_arg("VT_WAITACTIVE", VT_WAITACTIVE, n)
    }

    fn query_active(&self) -> Result<ConsoleIndex> {
        let mut state = VtStat::default();
        // SAFETY: VT_GETSTATE fills a struct vt_stat
        let rc = unsafe {
            libc::ioctl(
                self.tty.as_raw_fd(),
                VT_GETSTATE,
                &mut state as *mut VtStat,
            )
        };
        Errno::result(rc).map_err(|e| SnoopError::sys("VT_GETSTATE", e))?;
        debug!(
            "VT state: active={} signal={:#x} state={:#x}",
            state.v_active, state.v_signal, state.v_state
        );
        Ok(ConsoleIndex::from_active(state.v_active))
    }

    fn set_selection(&self, region: &SelectionRegion) -> Result<()> {
        let mut request = SelectionRequest::new(region);
        self.tioclinux("TIOCL_SETSEL", request.as_ioctl_arg())
    }

    fn trigger_paste(&self) -> Result<()> {
        let mut subcode = TIOCL_PASTESEL;
        self.tioclinux("TIOCL_PASTESEL", &mut subcode)
    }
}

/// Open the controlling terminal read-write
pub fn open_controlling_tty() -> Result<Arc<File>> {
    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .open(CONTROLLING_TTY)
        .map_err(|e| SnoopError::io(CONTROLLING_TTY, &e))?;
    Ok(Arc::new(file))
}

/// Resolve a device path such as `/dev/tty3` to its console index
pub fn console_from_path(path: &Path) -> Result<ConsoleIndex> {
    let label = path.display().to_string();
    let meta = fs::metadata(path).map_err(|e| SnoopError::io(label.clone(), &e))?;
    console_from_device(meta.file_type().is_char_device(), meta.rdev())
        .ok_or_else(|| SnoopError::sys(label, Errno::ENOTTY))
}

/// Console index for a device number, if it names a virtual console
pub fn console_from_device(is_char_device: bool, rdev: u64) -> Option<ConsoleIndex> {
    if !is_char_device || major(rdev) != TTY_MAJOR {
        return None;
    }
    ConsoleIndex::new(minor(rdev))
}
