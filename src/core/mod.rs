//! Core console snooping components.
//!
//! - **console**: VT switching, console selection/paste, device validation
//! - **tty**: Echo suspension on the controlling terminal
//! - **relay**: Worker thread copying the pasted text to standard output
//!
//! # Architecture
//!
//! ```text
//! Snoop
//! ├── VtConsole     (ioctls on /dev/tty)
//! ├── TerminalGuard (termios on /dev/tty)
//! └── relay thread  (poll + read on /dev/tty, write to stdout)
//! ```

pub mod console;
pub mod relay;
pub mod tty;
