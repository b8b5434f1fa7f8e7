//! vcsnoop - read the screen of another Linux virtual console
//!
//! vcsnoop prints the text currently shown on a virtual console without
//! switching the user over to it. It uses the kernel console selection
//! mechanism: the whole screen of the target console is selected, and the
//! selection is pasted back into the invoking terminal where it is read and
//! copied to standard output.
//!
//! # Quick Start
//!
//! ```text
//! vcsnoop /dev/tty2          # print what tty2 is showing
//! vcsnoop /dev/tty2 | less   # page through it
//! ```
//!
//! The invoking terminal must itself be a virtual console, and the user needs
//! access to the target device.

mod config;
mod core;
mod error;
mod snoop;

use std::env;
use std::ffi::OsString;
use std::fs::OpenOptions;
use std::io::{self, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process;
use std::sync::Mutex;

use anyhow::Context;
use nix::sys::signal::{kill, signal, SigHandler, SigSet, Signal};
use nix::unistd::Pid;
use tracing::{debug, error, info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use crate::config::Config;
use crate::core::console::console_from_path;
use crate::core::relay::StdoutSink;
use crate::error::SnoopError;
use crate::snoop::Snoop;

const PROGRAM_NAME: &str = "vcsnoop";

/// Version string from Cargo.toml
const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Environment variable holding a tracing filter directive
const LOG_ENV: &str = "VCSNOOP_LOG";

/// What the command line asks for
#[derive(Debug, PartialEq)]
enum Command {
    Help,
    Version,
    Snoop(PathBuf),
}

/// Usage goes to stdout in full when asked for, and as a single line on
/// stderr after a usage error.
fn show_usage(out: &mut dyn Write, full: bool) {
    let _ = writeln!(out, "Usage: {} /dev/ttyN", PROGRAM_NAME);
    if !full {
        return;
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "Options:");
    let _ = writeln!(out, "  -h, --help     show this help message and exit");
    let _ = writeln!(out, "  -V, --version  show version and exit");
}

fn parse_args<I>(args: I) -> Result<Command, String>
where
    I: IntoIterator<Item = OsString>,
{
    let mut positional = Vec::new();
    let mut options_done = false;

    for arg in args {
        if options_done {
            positional.push(arg);
            continue;
        }
        let bytes = arg.as_bytes();
        match arg.to_str() {
            Some("--") => options_done = true,
            Some("--help") => return Ok(Command::Help),
            Some("--version") => return Ok(Command::Version),
            _ if bytes.starts_with(b"--") => {
                return Err(format!("unrecognized option '{}'", arg.to_string_lossy()));
            }
            _ if bytes.len() > 1 && bytes[0] == b'-' => {
                // only the first letter of a cluster matters: both options exit
                return match bytes[1] {
                    b'h' => Ok(Command::Help),
                    b'V' => Ok(Command::Version),
                    _ => Err(format!(
                        "invalid option -- '{}'",
                        String::from_utf8_lossy(&bytes[1..2])
                    )),
                };
            }
            _ => positional.push(arg),
        }
    }

    if positional.len() != 1 {
        return Err(format!(
            "expected one console device, got {} arguments",
            positional.len()
        ));
    }
    Ok(Command::Snoop(PathBuf::from(positional.remove(0))))
}

/// Install the tracing subscriber if logging was requested
fn init_logging(config: &Config) -> anyhow::Result<()> {
    let directive = match env::var(LOG_ENV).ok().or_else(|| config.log.level.clone()) {
        Some(directive) => directive,
        None => return Ok(()),
    };
    let filter = EnvFilter::try_new(&directive)
        .with_context(|| format!("Invalid log filter '{}'", directive))?;

    match &config.log.file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
        None => {
            let subscriber = FmtSubscriber::builder()
                .with_env_filter(filter)
                .with_writer(io::stderr)
                .finish();
            tracing::subscriber::set_global_default(subscriber)?;
        }
    }
    Ok(())
}

/// Terminate the way a pipeline expects when its reader has gone away
fn raise_broken_pipe() -> ! {
    // SAFETY: restores the default disposition, no handler is installed
    let _ = unsafe { signal(Signal::SIGPIPE, SigHandler::SigDfl) };
    let mut pipe = SigSet::empty();
    pipe.add(Signal::SIGPIPE);
    let _ = pipe.thread_unblock();
    let _ = kill(Pid::from_raw(0), Signal::SIGPIPE);
    process::exit(1)
}

fn snoop(path: &Path, config: &Config) -> Result<(), SnoopError> {
    let target = console_from_path(path)?;
    let report = Snoop::open(config.quiescence())?.run(target, StdoutSink)?;
    debug!("Done: {:?}", report);
    Ok(())
}

fn main() {
    let (config, config_error) = match Config::load() {
        Ok(config) => (config, None),
        Err(e) => (Config::default(), Some(e)),
    };
    if let Err(e) = init_logging(&config) {
        eprintln!("{}: warning: {:#}", PROGRAM_NAME, e);
    }
    if let Some(e) = config_error {
        warn!("Using default configuration: {:#}", e);
    }

    let code = match parse_args(env::args_os().skip(1)) {
        Ok(Command::Help) => {
            show_usage(&mut io::stdout(), true);
            0
        }
        Ok(Command::Version) => {
            println!("{} {}", PROGRAM_NAME, VERSION);
            0
        }
        Ok(Command::Snoop(path)) => {
            info!("vcsnoop {} starting on {}", VERSION, path.display());
            match snoop(&path, &config) {
                Ok(()) => 0,
                Err(SnoopError::BrokenPipe) => raise_broken_pipe(),
                Err(e) => {
                    error!("{}", e);
                    eprintln!("{}: {}", PROGRAM_NAME, e);
                    1
                }
            }
        }
        Err(msg) => {
            debug!("Usage error: {}", msg);
            show_usage(&mut io::stderr(), false);
            1
        }
    };
    process::exit(code);
}
