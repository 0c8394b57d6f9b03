#![allow(unsafe_code)]
//! Operator control channel.
//!
//! Control lines arrive on a named FIFO and, optionally, on standard input. Both are
//! polled together with a bounded timeout (one second by default). When both have
//! data, standard input wins. One line of at most [`MAX_LINE`] bytes is read per
//! cycle; the trailing newline is stripped and the remainder is matched
//! case-insensitively against `START`, `STOP` and `QUIT`. Everything else, including
//! a timeout or a failed read, is [`Command::Invalid`].
//!
//! The FIFO is opened read-write so the channel never sees end-of-file when the last
//! writer goes away.

use std::ffi::CString;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::{FileTypeExt, OpenOptionsExt};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, trace, warn};

/// Longest control line considered; extra bytes stay queued for the next cycle.
pub const MAX_LINE: usize = 64;

/// Default wait for a control line.
pub const DEFAULT_POLL_TIMEOUT: Duration = Duration::from_secs(1);

/// Control command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Command {
    /// Start the pipeline
    Start,
    /// Stop the pipeline
    Stop,
    /// Stop the pipeline and exit
    Quit,
    /// Nothing usable arrived this cycle
    Invalid,
}

impl Command {
    /// Wire token.
    pub fn as_str(&self) -> &'static str {
        match self {
            Command::Start => "START",
            Command::Stop => "STOP",
            Command::Quit => "QUIT",
            Command::Invalid => "INVALID",
        }
    }

    /// Interpret a raw control line.
    pub fn parse_line(line: &[u8]) -> Self {
        let line = &line[..line.len().min(MAX_LINE)];
        let end = line
            .iter()
            .rposition(|b| *b != b'\n' && *b != b'\r')
            .map_or(0, |p| p + 1);
        let token = &line[..end];
        if token.eq_ignore_ascii_case(b"START") {
            Command::Start
        } else if token.eq_ignore_ascii_case(b"STOP") {
            Command::Stop
        } else if token.eq_ignore_ascii_case(b"QUIT") {
            Command::Quit
        } else {
            Command::Invalid
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match Command::parse_line(s.as_bytes()) {
            Command::Invalid => Err(CommandError::Unknown(s.to_string())),
            cmd => Ok(cmd),
        }
    }
}

/// Errors raised while setting up or writing to the control channel.
#[derive(Error, Debug)]
pub enum CommandError {
    /// FIFO could not be created
    #[error("Failed to create command FIFO {path:?}: {source}")]
    Create {
        /// FIFO path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Path exists but is not a FIFO
    #[error("{0:?} exists and is not a FIFO")]
    NotAFifo(PathBuf),
    /// FIFO could not be opened
    #[error("Failed to open command FIFO {path:?}: {source}")]
    Open {
        /// FIFO path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Nobody is reading the FIFO
    #[error("No controller is listening on {0:?}")]
    NoReader(PathBuf),
    /// Writing the command failed
    #[error("Failed to write to command FIFO {path:?}: {source}")]
    Write {
        /// FIFO path
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Token is not a command
    #[error("Unknown command '{0}' (expected START, STOP or QUIT)")]
    Unknown(String),
}

/// Create a FIFO at `path` unless one is already there.
pub fn create_fifo(path: &Path) -> Result<(), CommandError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.file_type().is_fifo() => return Ok(()),
        Ok(_) => return Err(CommandError::NotAFifo(path.to_path_buf())),
        Err(e) if e.kind() == ErrorKind::NotFound => {}
        Err(source) => {
            return Err(CommandError::Create {
                path: path.to_path_buf(),
                source,
            })
        }
    }

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|e| CommandError::Create {
        path: path.to_path_buf(),
        source: std::io::Error::new(ErrorKind::InvalidInput, e),
    })?;
    // SAFETY: c_path is a valid NUL-terminated string for the duration of the call.
    let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o666) };
    if rc != 0 {
        let source = std::io::Error::last_os_error();
        // another process may have won the race
        if source.kind() != ErrorKind::AlreadyExists {
            return Err(CommandError::Create {
                path: path.to_path_buf(),
                source,
            });
        }
    }
    info!(?path, "Created command FIFO");
    Ok(())
}

/// Write `command` followed by a newline to the FIFO at `path`.
///
/// The FIFO is opened non-blocking, so this fails fast with
/// [`CommandError::NoReader`] when no controller is running.
pub fn send_command(path: &Path, command: Command) -> Result<(), CommandError> {
    let mut fifo = OpenOptions::new()
        .write(true)
        .custom_flags(libc::O_NONBLOCK)
        .open(path)
        .map_err(|source| match source.raw_os_error() {
            Some(libc::ENXIO) => CommandError::NoReader(path.to_path_buf()),
            _ => CommandError::Open {
                path: path.to_path_buf(),
                source,
            },
        })?;
    let line = format!("{command}\n");
    fifo.write_all(line.as_bytes())
        .map_err(|source| CommandError::Write {
            path: path.to_path_buf(),
            source,
        })?;
    debug!(?path, %command, "Sent command");
    Ok(())
}

/// Readiness of one descriptor after a poll.
fn readable(revents: libc::c_short) -> bool {
    revents & (libc::POLLIN | libc::POLLHUP) != 0
}

/// Poll `fds` for input for up to `timeout`; returns the raw poll result and revents.
fn poll_input(fds: &[RawFd], timeout: Duration) -> std::io::Result<Vec<libc::c_short>> {
    let mut pollfds: Vec<libc::pollfd> = fds
        .iter()
        .map(|&fd| libc::pollfd {
            fd,
            events: libc::POLLIN,
            revents: 0,
        })
        .collect();
    let timeout_ms = libc::c_int::try_from(timeout.as_millis()).unwrap_or(libc::c_int::MAX);
    // SAFETY: pollfds is a valid, exclusively borrowed array of pollfd of the given
    // length for the duration of the call.
    let rc = unsafe { libc::poll(pollfds.as_mut_ptr(), pollfds.len() as libc::nfds_t, timeout_ms) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(pollfds.iter().map(|p| p.revents).collect())
}

/// Outcome of reading one line.
struct Line {
    bytes: Vec<u8>,
    eof: bool,
}

/// Read one line of at most [`MAX_LINE`] bytes, a byte at a time, stopping at the
/// newline, at end-of-file, or when no more bytes are immediately available.
fn read_line(file: &File) -> std::io::Result<Line> {
    let mut bytes = Vec::with_capacity(MAX_LINE);
    let mut byte = [0u8; 1];
    let mut reader = file;
    while bytes.len() < MAX_LINE {
        match reader.read(&mut byte) {
            Ok(0) => return Ok(Line { bytes, eof: true }),
            Ok(_) => {
                if byte[0] == b'\n' {
                    break;
                }
                bytes.push(byte[0]);
                let more = poll_input(&[file.as_fd().as_raw_fd()], Duration::ZERO)?;
                if !more.first().copied().is_some_and(readable) {
                    break;
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(Line { bytes, eof: false })
}

/// Polled control channel over a FIFO and, optionally, standard input.
#[derive(Debug)]
pub struct CommandChannel {
    stdin: Option<File>,
    fifo: File,
    path: Option<PathBuf>,
    timeout: Duration,
}

impl CommandChannel {
    /// Open (creating if needed) the FIFO at `path`; when `with_stdin` is set,
    /// standard input is polled as well.
    pub fn open(path: &Path, with_stdin: bool) -> Result<Self, CommandError> {
        create_fifo(path)?;
        let fifo = OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)
            .map_err(|source| CommandError::Open {
                path: path.to_path_buf(),
                source,
            })?;
        let stdin = if with_stdin {
            let fd = std::io::stdin()
                .as_fd()
                .try_clone_to_owned()
                .map_err(|source| CommandError::Open {
                    path: PathBuf::from("<stdin>"),
                    source,
                })?;
            Some(fd)
        } else {
            None
        };
        let mut channel = Self::from_fds(stdin, fifo.into());
        channel.path = Some(path.to_path_buf());
        info!(?path, with_stdin, "Command channel open");
        Ok(channel)
    }

    /// Channel over already-open descriptors; `fifo` should be non-blocking.
    pub fn from_fds(stdin: Option<OwnedFd>, fifo: OwnedFd) -> Self {
        Self {
            stdin: stdin.map(File::from),
            fifo: File::from(fifo),
            path: None,
            timeout: DEFAULT_POLL_TIMEOUT,
        }
    }

    /// Change the per-cycle wait.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// FIFO path, when opened by path.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Wait up to the channel timeout for one control line.
    pub fn recv(&mut self) -> Command {
        let mut fds = vec![self.fifo.as_raw_fd()];
        if let Some(stdin) = &self.stdin {
            fds.push(stdin.as_raw_fd());
        }

        let revents = match poll_input(&fds, self.timeout) {
            Ok(revents) => revents,
            Err(e) if e.kind() == ErrorKind::Interrupted => {
                trace!("Command poll interrupted");
                return Command::Invalid;
            }
            Err(e) => {
                warn!(error = %e, "Command poll failed");
                return Command::Invalid;
            }
        };

        let stdin_ready = revents.get(1).copied().is_some_and(readable);
        let fifo_ready = revents.first().copied().is_some_and(readable);

        let (source, result) = match (&self.stdin, stdin_ready, fifo_ready) {
            (Some(stdin), true, _) => ("stdin", read_line(stdin)),
            (_, _, true) => ("fifo", read_line(&self.fifo)),
            _ => return Command::Invalid,
        };

        match result {
            Ok(line) => {
                if line.eof && line.bytes.is_empty() && source == "stdin" {
                    debug!("Standard input closed, polling FIFO only");
                    self.stdin = None;
                }
                let command = Command::parse_line(&line.bytes);
                debug!(source, %command, "Command received");
                command
            }
            Err(e) => {
                warn!(source, error = %e, "Command read failed");
                Command::Invalid
            }
        }
    }
}
