//! Snoop protocol
//!
//! Sequences the console controller, terminal guard and relay worker:
//!
//! ```text
//! query active VT -> activate target -> select whole screen
//!   -> activate original -> block signals -> start relay
//!   -> echo off -> paste -> join relay -> echo on -> unblock signals
//! ```
//!
//! Every failure is fatal. The only cleanup on the error path is the
//! terminal guard and the signal mask, both restored when dropped. A failure
//! between activating the target and switching back leaves the target
//! console on screen.

use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use nix::sys::signal::{SigSet, SigmaskHow};
use tracing::{debug, error, info};

use crate::core::console::{
    open_controlling_tty, ConsoleControl, ConsoleIndex, SelectionRegion, VtConsole,
};
use crate::core::relay::{self, RelayReport};
use crate::core::tty::{ModeControl, TerminalGuard, TtyModes};
use crate::error::{Result, SnoopError};

/// Blocks every signal on the calling thread until dropped.
///
/// Threads spawned while the mask is held inherit it.
struct SignalMask {
    previous: SigSet,
}

impl SignalMask {
    fn block_all() -> Result<Self> {
        let previous = SigSet::all()
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .map_err(|e| SnoopError::sys("sigprocmask()", e))?;
        Ok(Self { previous })
    }
}

impl Drop for SignalMask {
    fn drop(&mut self) {
        if let Err(e) = self.previous.thread_set_mask() {
            error!("Failed to restore signal mask: {}", e);
        }
    }
}

/// One snoop run against the controlling terminal
pub struct Snoop<C: ConsoleControl, M: ModeControl> {
    console: C,
    guard: TerminalGuard<M>,
    tty: Arc<File>,
    quiescence: Duration,
}

impl Snoop<VtConsole, TtyModes> {
    /// Open `/dev/tty` and drive the real console
    pub fn open(quiescence: Duration) -> Result<Self> {
        let tty = open_controlling_tty()?;
        Ok(Self::new(
            VtConsole::new(tty.clone()),
            TtyModes::new(tty.clone()),
            tty,
            quiescence,
        ))
    }
}

impl<C: ConsoleControl, M: ModeControl> Snoop<C, M> {
    /// `tty` is the descriptor the paste arrives on
    pub fn new(console: C, modes: M, tty: Arc<File>, quiescence: Duration) -> Self {
        Self {
            console,
            guard: TerminalGuard::new(modes),
            tty,
            quiescence,
        }
    }

    /// Copy the screen of `target` to `sink`
    pub fn run<W>(mut self, target: ConsoleIndex, sink: W) -> Result<RelayReport>
    where
        W: Write + Send + 'static,
    {
        let original = self.console.query_active()?;
        info!("Snooping console {} from console {}", target, original);

        self.console.activate(target)?;
        self.console.set_selection(&SelectionRegion::full_screen())?;
        self.console.activate(original)?;
        debug!("Selection captured, back on console {}", original);

        let mask = SignalMask::block_all()?;
        let worker = relay::spawn(self.tty.clone(), sink, self.quiescence)?;
        self.guard.suspend_echo()?;
        self.console.trigger_paste()?;
        debug!("Paste triggered, waiting for relay");

        let outcome = worker.join();
        let restored = self.guard.restore();
        drop(mask);

        let report = outcome?;
        restored?;
        info!("Relayed {} bytes in {} chunks", report.bytes, report.chunks);
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::errno::Errno;
    use nix::unistd::pipe;
    use std::cell::{Cell, RefCell};
    use std::io;
    use std::rc::Rc;
    use std::sync::Mutex;

    type Log = Rc<RefCell<Vec<String>>>;

    const QUIET: Duration = Duration::from_millis(200);

    /// Console double: tracks the active VT and pastes into a pipe
    struct FakeConsole {
        log: Log,
        active: Cell<u16>,
        paste_into: RefCell<File>,
        payload: Vec<u8>,
        fail_on: Option<&'static str>,
    }

    impl FakeConsole {
        fn step(&self, entry: String, op: &'static str) -> Result<()> {
            self.log.borrow_mut().push(entry);
            if self.fail_on == Some(op) {
                return Err(SnoopError::sys(op, Errno::EINVAL));
            }
            Ok(())
        }
    }

    impl ConsoleControl for FakeConsole {
        fn activate(&self, console: ConsoleIndex) -> Result<()> {
            self.step(format!("activate {}", console), "VT_ACTIVATE")?;
            self.active.set(console.get());
            Ok(())
        }

        fn query_active(&self) -> Result<ConsoleIndex> {
            self.step("query".to_string(), "VT_GETSTATE")?;
            Ok(ConsoleIndex::new(self.active.get() as u64).unwrap())
        }

        fn set_selection(&self, region: &SelectionRegion) -> Result<()> {
            assert_eq!(*region, SelectionRegion::full_screen());
            self.step("select".to_string(), "TIOCL_SETSEL")
        }

        fn trigger_paste(&self) -> Result<()> {
            self.step("paste".to_string(), "TIOCL_PASTESEL")?;
            if !self.payload.is_empty() {
                self.paste_into.borrow_mut().write_all(&self.payload).unwrap();
            }
            Ok(())
        }
    }

    struct FakeModes {
        log: Log,
    }

    impl ModeControl for FakeModes {
        type Snapshot = bool;

        fn snapshot(&self) -> Result<bool> {
            Ok(true)
        }

        fn apply(&self, echo: &bool) -> Result<()> {
            let entry = if *echo { "echo on" } else { "echo off" };
            self.log.borrow_mut().push(entry.to_string());
            Ok(())
        }

        fn without_echo(_: &bool) -> bool {
            false
        }
    }

    #[derive(Clone, Default)]
    struct SharedSink {
        data: Arc<Mutex<Vec<u8>>>,
        broken: bool,
    }

    impl Write for SharedSink {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.broken {
                return Err(io::Error::from(Errno::EPIPE));
            }
            self.data.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    struct Fixture {
        log: Log,
        snoop: Snoop<FakeConsole, FakeModes>,
    }

    fn fixture(payload: &[u8], fail_on: Option<&'static str>) -> Fixture {
        let (reader, writer) = pipe().unwrap();
        let log: Log = Rc::default();
        let console = FakeConsole {
            log: log.clone(),
            active: Cell::new(1),
            paste_into: RefCell::new(File::from(writer)),
            payload: payload.to_vec(),
            fail_on,
        };
        let modes = FakeModes { log: log.clone() };
        let snoop = Snoop::new(console, modes, Arc::new(File::from(reader)), QUIET);
        Fixture { log, snoop }
    }

    fn target() -> ConsoleIndex {
        ConsoleIndex::new(3).unwrap()
    }

    fn entries(log: &Log) -> Vec<String> {
        log.borrow().clone()
    }

    fn last_entry(log: &Log) -> Option<String> {
        log.borrow().last().cloned()
    }

    #[test]
    fn test_full_protocol_order() {
        let Fixture { log, snoop } = fixture(b"login: \n", None);
        let sink = SharedSink::default();

        let report = snoop.run(target(), sink.clone()).unwrap();

        assert_eq!(
            entries(&log),
            vec!["query", "activate 3", "select", "activate 1", "echo off", "paste", "echo on"]
        );
        assert_eq!(report.bytes, 8);
        assert_eq!(sink.data.lock().unwrap().as_slice(), b"login: \n");
    }

    #[test]
    fn test_failed_paste_restores_echo_and_console() {
        let Fixture { log, snoop } = fixture(b"unused", Some("TIOCL_PASTESEL"));

        let err = snoop.run(target(), SharedSink::default()).unwrap_err();

        assert_eq!(err.to_string(), "TIOCL_PASTESEL: Invalid argument");
        assert_eq!(last_entry(&log).as_deref(), Some("echo on"));
        assert!(entries(&log).iter().any(|e| e == "activate 1"));
    }

    #[test]
    fn test_failed_selection_leaves_terminal_untouched() {
        let Fixture { log, snoop } = fixture(b"unused", Some("TIOCL_SETSEL"));

        let err = snoop.run(target(), SharedSink::default()).unwrap_err();

        assert_eq!(err.to_string(), "TIOCL_SETSEL: Invalid argument");
        // target stays on screen; no mode change was made
        assert_eq!(entries(&log), vec!["query", "activate 3", "select"]);
    }

    #[test]
    fn test_nothing_pasted_times_out() {
        let Fixture { log, snoop } = fixture(b"", None);

        let err = snoop.run(target(), SharedSink::default()).unwrap_err();

        assert_eq!(err.to_string(), "poll(): Timer expired");
        assert_eq!(last_entry(&log).as_deref(), Some("echo on"));
    }

    #[test]
    fn test_broken_pipe_is_distinguished() {
        let Fixture { log, snoop } = fixture(b"some screen text\n", None);
        let sink = SharedSink {
            broken: true,
            ..Default::default()
        };

        let outcome = snoop.run(target(), sink);

        assert!(matches!(outcome, Err(SnoopError::BrokenPipe)));
        assert_eq!(last_entry(&log).as_deref(), Some("echo on"));
    }

    #[test]
    fn test_signal_mask_restored_on_drop() {
        let before = SigSet::thread_get_mask().unwrap();
        {
            let _mask = SignalMask::block_all().unwrap();
            let blocked = SigSet::thread_get_mask().unwrap();
            assert!(blocked.contains(nix::sys::signal::Signal::SIGINT));
        }
        let after = SigSet::thread_get_mask().unwrap();
        assert_eq!(
            before.contains(nix::sys::signal::Signal::SIGINT),
            after.contains(nix::sys::signal::Signal::SIGINT)
        );
    }
}
