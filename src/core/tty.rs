//! Terminal mode guard
//!
//! Turns off echo on the controlling terminal while the paste is being
//! captured, so the kernel does not draw the injected text on screen, and
//! puts the original attributes back exactly once.

use std::fs::File;
use std::sync::Arc;

use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg, Termios};
use tracing::{debug, error};

use crate::error::{Result, SnoopError};

/// Terminal attribute access used by [`TerminalGuard`]
pub trait ModeControl {
    type Snapshot: Clone;

    /// Read the current attributes
    fn snapshot(&self) -> Result<Self::Snapshot>;

    /// Apply attributes, flushing pending input and output first
    fn apply(&self, mode: &Self::Snapshot) -> Result<()>;

    /// Copy of `mode` with echo turned off
    fn without_echo(mode: &Self::Snapshot) -> Self::Snapshot;
}

/// termios on a terminal descriptor
pub struct TtyModes {
    tty: Arc<File>,
}

impl TtyModes {
    pub fn new(tty: Arc<File>) -> Self {
        Self { tty }
    }
}

impl ModeControl for TtyModes {
    type Snapshot = Termios;

    fn snapshot(&self) -> Result<Termios> {
        tcgetattr(self.tty.as_ref()).map_err(|e| SnoopError::sys("tcgetattr()", e))
    }

    fn apply(&self, mode: &Termios) -> Result<()> {
        tcsetattr(self.tty.as_ref(), SetArg::TCSAFLUSH, mode)
            .map_err(|e| SnoopError::sys("tcsetattr()", e))
    }

    fn without_echo(mode: &Termios) -> Termios {
        let mut quiet = mode.clone();
        quiet.local_flags.remove(LocalFlags::ECHO);
        quiet
    }
}

/// Owns the saved terminal mode while echo is suspended.
///
/// Restores on [`TerminalGuard::restore`] and again on drop; whichever runs
/// first does the work.
pub struct TerminalGuard<M: ModeControl> {
    modes: M,
    saved: Option<M::Snapshot>,
}

impl<M: ModeControl> TerminalGuard<M> {
    pub fn new(modes: M) -> Self {
        Self { modes, saved: None }
    }

    /// Whether echo is currently suspended by this guard
    pub fn is_armed(&self) -> bool {
        self.saved.is_some()
    }

    /// Save the current mode and turn echo off
    pub fn suspend_echo(&mut self) -> Result<()> {
        if self.is_armed() {
            return Ok(());
        }
        let original = self.modes.snapshot()?;
        self.modes.apply(&M::without_echo(&original))?;
        self.saved = Some(original);
        debug!("Echo suspended");
        Ok(())
    }

    /// Put the saved mode back; no-op when nothing is suspended
    pub fn restore(&mut self) -> Result<()> {
        match self.saved.take() {
            Some(original) => {
                self.modes.apply(&original)?;
                debug!("Terminal mode restored");
                Ok(())
            }
            None => Ok(()),
        }
    }
}

impl<M: ModeControl> Drop for TerminalGuard<M> {
    fn drop(&mut self) {
        if let Err(e) = self.restore() {
            error!("Failed to restore terminal mode: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::pty::{openpty, Winsize};
    use std::cell::{Cell, RefCell};
    use std::rc::Rc;

    #[derive(Clone, Debug, PartialEq)]
    struct FakeMode {
        echo: bool,
    }

    #[derive(Default)]
    struct FakeState {
        current: RefCell<Option<FakeMode>>,
        applies: Cell<usize>,
        fail_apply: Cell<bool>,
    }

    struct FakeModes(Rc<FakeState>);

    impl ModeControl for FakeModes {
        type Snapshot = FakeMode;

        fn snapshot(&self) -> Result<FakeMode> {
            Ok(self.0.current.borrow().clone().unwrap_or(FakeMode { echo: true }))
        }

        fn apply(&self, mode: &FakeMode) -> Result<()> {
            if self.0.fail_apply.get() {
                return Err(SnoopError::sys("tcsetattr()", Errno::EIO));
            }
            self.0.applies.set(self.0.applies.get() + 1);
            *self.0.current.borrow_mut() = Some(mode.clone());
            Ok(())
        }

        fn without_echo(mode: &FakeMode) -> FakeMode {
            let mut quiet = mode.clone();
            quiet.echo = false;
            quiet
        }
    }

    #[test]
    fn test_restore_twice_applies_once() {
        let state = Rc::new(FakeState::default());
        let mut guard = TerminalGuard::new(FakeModes(state.clone()));

        guard.suspend_echo().unwrap();
        assert_eq!(state.applies.get(), 1);
        assert_eq!(*state.current.borrow(), Some(FakeMode { echo: false }));

        guard.restore().unwrap();
        guard.restore().unwrap();
        assert_eq!(state.applies.get(), 2);
        assert_eq!(*state.current.borrow(), Some(FakeMode { echo: true }));

        drop(guard);
        assert_eq!(state.applies.get(), 2);
    }

    #[test]
    fn test_restore_without_suspend_is_noop() {
        let state = Rc::new(FakeState::default());
        let mut guard = TerminalGuard::new(FakeModes(state.clone()));
        guard.restore().unwrap();
        drop(guard);
        assert_eq!(state.applies.get(), 0);
    }

    #[test]
    fn test_drop_restores_armed_guard() {
        let state = Rc::new(FakeState::default());
        {
            let mut guard = TerminalGuard::new(FakeModes(state.clone()));
            guard.suspend_echo().unwrap();
            assert!(guard.is_armed());
        }
        assert_eq!(state.applies.get(), 2);
        assert_eq!(*state.current.borrow(), Some(FakeMode { echo: true }));
    }

    #[test]
    fn test_second_suspend_keeps_original_snapshot() {
        let state = Rc::new(FakeState::default());
        let mut guard = TerminalGuard::new(FakeModes(state.clone()));
        guard.suspend_echo().unwrap();
        guard.suspend_echo().unwrap();
        assert_eq!(state.applies.get(), 1);

        guard.restore().unwrap();
        assert_eq!(*state.current.borrow(), Some(FakeMode { echo: true }));
    }

    #[test]
    fn test_failed_suspend_leaves_guard_disarmed() {
        let state = Rc::new(FakeState::default());
        state.fail_apply.set(true);
        let mut guard = TerminalGuard::new(FakeModes(state.clone()));

        let err = guard.suspend_echo().unwrap_err();
        assert_eq!(err.to_string(), "tcsetattr(): Input/output error");
        assert!(!guard.is_armed());
    }

    #[test]
    fn test_echo_round_trip_on_pty() {
        let winsize = Winsize {
            ws_row: 25,
            ws_col: 80,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(&winsize, None).unwrap();
        let slave = Arc::new(File::from(pty.slave));
        let echo_on = |fd: &File| {
            tcgetattr(fd)
                .unwrap()
                .local_flags
                .contains(LocalFlags::ECHO)
        };
        assert!(echo_on(slave.as_ref()));

        let mut guard = TerminalGuard::new(TtyModes::new(slave.clone()));
        guard.suspend_echo().unwrap();
        assert!(!echo_on(slave.as_ref()));

        guard.restore().unwrap();
        assert!(echo_on(slave.as_ref()));
        drop(pty.master);
    }
}
