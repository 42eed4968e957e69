//! Child processes started on behalf of requests.
//!
//! Every child is recorded in a [`ProcessTable`] from spawn until it is reaped. All children share
//! one status pipe as their standard error; lines written to it are relayed to the log.

use std::collections::BTreeMap;
use std::fs::{self, File, Metadata};
use std::io::{self, Read};
use std::os::unix::fs::MetadataExt;
use std::os::unix::io::{AsRawFd, FromRawFd, RawFd};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::{ChildStdout, Command, Stdio};

use log::{debug, error, info, log, warn, Level};
use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, OFlag};
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{getegid, pipe2, Gid, Pid, Uid};
use thiserror::Error;

use crate::cgi::Invocation;
use crate::config::Config;
use crate::services::Directory;

const S_ISUID: u32 = 0o4000;
const S_IWGRP: u32 = 0o020;
const S_IWOTH: u32 = 0o002;

/// Longest status line kept while waiting for its newline.
const MAX_STATUS_LINE: usize = 1024;

#[derive(Debug, Error)]
pub enum ProcessError {
    #[error("Program \"{}\" not available: {}", .command.display(), .source)]
    Unavailable { command: PathBuf, source: io::Error },
    #[error("Program \"{}\" has insecure permissions ({}/0{:o})", .command.display(), .uid, .mode)]
    Insecure { command: PathBuf, uid: u32, mode: u32 },
    #[error("Program \"{}\" does not have execute permissions", .command.display())]
    NotExecutable { command: PathBuf },
    #[error("unable to execute \"{}\": {}", .command.display(), .source)]
    Spawn { command: PathBuf, source: io::Error },
    #[error("process table already holds pid {0}")]
    Corrupt(Pid),
}

impl ProcessError {
    /// The process table can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Corrupt(_))
    }
}

/// A running child.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProcessRecord {
    pub pid: Pid,
    /// Zero when the child does not belong to a job.
    pub job_id: u32,
    pub name: String,
}

/// The job a child works for, if any.
#[derive(Clone, Copy, Debug, Default)]
pub struct Job<'a> {
    pub id: u32,
    /// Printer that collects warnings about the program.
    pub printer: Option<&'a str>,
}

/// A freshly started child and the read end of its standard output.
#[derive(Debug)]
pub struct Spawned {
    pub pid: Pid,
    pub stdout: ChildStdout,
}

/// Who a child runs as: `None` keeps the server's own identity.
fn child_identity(config: &Config) -> (Option<Uid>, Option<Gid>) {
    if config.run_user.is_some() {
        (None, None)
    } else {
        (config.user, config.group)
    }
}

/// Owner and mode bits of a program file.
#[derive(Clone, Copy, Debug)]
struct FileMode {
    mode: u32,
    uid: u32,
    gid: u32,
}

impl From<&Metadata> for FileMode {
    fn from(metadata: &Metadata) -> Self {
        Self {
            mode: metadata.mode(),
            uid: metadata.uid(),
            gid: metadata.gid(),
        }
    }
}

/// Whether a root-run server may start `command` as `user`/`group`. `Ok(true)` means the program
/// may run but is group-writable.
fn check_permissions(
    command: &Path,
    file: FileMode,
    user: Uid,
    group: Gid,
) -> Result<bool, ProcessError> {
    if file.mode & (S_ISUID | S_IWOTH) != 0 || file.uid != 0 {
        return Err(ProcessError::Insecure {
            command: command.to_path_buf(),
            uid: file.uid,
            mode: file.mode & 0o7777,
        });
    }
    let group_writable = file.mode & S_IWGRP != 0;

    let by_user = file.uid == user.as_raw() && file.mode & 0o100 != 0;
    let by_group = file.gid == group.as_raw() && file.mode & 0o010 != 0;
    let by_other = file.mode & 0o001 != 0;
    if !by_user && !by_group && !by_other {
        return Err(ProcessError::NotExecutable {
            command: command.to_path_buf(),
        });
    }
    Ok(group_writable)
}

/// Map a status line's `LEVEL:` prefix to a log level.
fn status_level(line: &str) -> (Level, &str) {
    const PREFIXES: &[(&str, Level)] = &[
        ("EMERG:", Level::Error),
        ("ALERT:", Level::Error),
        ("CRIT:", Level::Error),
        ("ERROR:", Level::Error),
        ("WARNING:", Level::Warn),
        ("NOTICE:", Level::Info),
        ("INFO:", Level::Info),
        ("DEBUG2:", Level::Trace),
        ("DEBUG:", Level::Debug),
    ];
    PREFIXES
        .iter()
        .find_map(|(prefix, level)| {
            line.strip_prefix(prefix)
                .map(|message| (*level, message.trim_start()))
        })
        .unwrap_or((Level::Debug, line))
}

/// Read end of the pipe every child writes its standard error to.
#[derive(Debug)]
struct StatusPipe {
    reader: File,
    writer: File,
    pending: Vec<u8>,
}

impl StatusPipe {
    fn new() -> io::Result<Self> {
        let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(nix_to_io)?;
        // Both ends are fresh descriptors owned by nothing else.
        let (reader, writer) = unsafe { (File::from_raw_fd(read_fd), File::from_raw_fd(write_fd)) };
        set_nonblocking(reader.as_raw_fd())?;
        Ok(Self {
            reader,
            writer,
            pending: Vec::new(),
        })
    }

    fn relay(&mut self) {
        let mut buf = [0; 4096];
        loop {
            match self.reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => self.pending.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    error!("error reading from CGI error pipe: {}", e);
                    break;
                }
            }
        }
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line[..line.len() - 1]);
            let line = line.trim_end_matches('\r');
            if !line.is_empty() {
                let (level, message) = status_level(line);
                log!(level, "[CGI] {}", message);
            }
        }
        if self.pending.len() > MAX_STATUS_LINE {
            let line = String::from_utf8_lossy(&self.pending).into_owned();
            self.pending.clear();
            debug!("[CGI] {}", line);
        }
    }
}

fn nix_to_io(e: nix::Error) -> io::Error {
    io::Error::from_raw_os_error(e.as_errno().map_or(libc::EIO, |errno| errno as i32))
}

pub fn set_nonblocking(fd: RawFd) -> io::Result<()> {
    let flags = fcntl(fd, FcntlArg::F_GETFL).map_err(nix_to_io)?;
    let flags = OFlag::from_bits_truncate(flags) | OFlag::O_NONBLOCK;
    fcntl(fd, FcntlArg::F_SETFL(flags)).map_err(nix_to_io)?;
    Ok(())
}

/// Ask a child to stop. `force` kills it outright. Pid 0 means "no child" and is ignored.
pub fn end_process(pid: Pid, force: bool) {
    if pid.as_raw() <= 0 {
        return;
    }
    let signal = if force { Signal::SIGKILL } else { Signal::SIGTERM };
    match kill(pid, signal) {
        Ok(()) => debug!("sent {:?} to pid {}", signal, pid),
        Err(nix::Error::Sys(Errno::ESRCH)) => {}
        Err(e) => debug!("unable to signal pid {}: {}", pid, e),
    }
}

/// Children started by the server, keyed by pid.
#[derive(Debug)]
pub struct ProcessTable {
    records: BTreeMap<Pid, ProcessRecord>,
    status: StatusPipe,
}

impl ProcessTable {
    pub fn new() -> io::Result<Self> {
        Ok(Self {
            records: BTreeMap::new(),
            status: StatusPipe::new()?,
        })
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Descriptor to watch for status lines from children.
    pub fn status_fd(&self) -> RawFd {
        self.status.reader.as_raw_fd()
    }

    /// Log whatever children wrote to their standard error.
    pub fn relay_status(&mut self) {
        self.status.relay();
    }

    /// Start a program with `stdin` (or `/dev/null`) as its standard input and a pipe as its
    /// standard output.
    pub fn start(
        &mut self,
        invocation: &Invocation,
        stdin: Option<File>,
        config: &Config,
        job: Job<'_>,
        directory: &mut dyn Directory,
    ) -> Result<Spawned, ProcessError> {
        let command = &invocation.command;
        let (uid, gid) = child_identity(config);

        if config.run_user.is_none() {
            let metadata = match fs::metadata(command) {
                Ok(metadata) => metadata,
                Err(source) => {
                    if let Some(printer) = job.printer {
                        directory.add_printer_reason(printer, "cups-missing-filter-warning");
                    }
                    let e = ProcessError::Unavailable {
                        command: command.clone(),
                        source,
                    };
                    error!("{}", e);
                    return Err(e);
                }
            };
            let user = uid.unwrap_or_else(|| Uid::from_raw(0));
            let group = gid.unwrap_or_else(getegid);
            match check_permissions(command, FileMode::from(&metadata), user, group) {
                Ok(false) => {}
                Ok(true) => {
                    warn!(
                        "Program \"{}\" has insecure permissions (0{:o})",
                        command.display(),
                        metadata.mode() & 0o7777
                    );
                    if let Some(printer) = job.printer {
                        directory.add_printer_reason(printer, "cups-insecure-filter-warning");
                    }
                }
                Err(e) => {
                    if let (ProcessError::Insecure { .. }, Some(printer)) = (&e, job.printer) {
                        directory.add_printer_reason(printer, "cups-insecure-filter-warning");
                    }
                    error!("{}", e);
                    return Err(e);
                }
            }
        }

        let stderr = self
            .status
            .writer
            .try_clone()
            .map_err(|source| ProcessError::Spawn {
                command: command.clone(),
                source,
            })?;
        let mut child = Command::new(command);
        if let Some(arg0) = invocation.argv.first() {
            child.arg0(arg0);
        }
        child
            .args(invocation.argv.iter().skip(1))
            .env_clear()
            .envs(invocation.env.iter().map(|(name, value)| (name, value)))
            .stdin(stdin.map_or_else(Stdio::null, Stdio::from))
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr));
        if let Some(uid) = uid {
            child.uid(uid.as_raw());
        }
        if let Some(gid) = gid {
            child.gid(gid.as_raw());
        }

        let spawned = child.spawn().map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        });
        let mut spawned = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                error!("{}", e);
                return Err(e);
            }
        };
        let pid = Pid::from_raw(spawned.id() as i32);
        let stdout = match spawned.stdout.take() {
            Some(stdout) => stdout,
            None => {
                end_process(pid, true);
                return Err(ProcessError::Spawn {
                    command: command.clone(),
                    source: io::Error::new(io::ErrorKind::Other, "no output pipe"),
                });
            }
        };
        set_nonblocking(stdout.as_raw_fd()).map_err(|source| ProcessError::Spawn {
            command: command.clone(),
            source,
        })?;

        if self.records.contains_key(&pid) {
            error!("critical: process table already has an entry for pid {}", pid);
            return Err(ProcessError::Corrupt(pid));
        }
        let name = command
            .file_name()
            .map_or_else(|| command.display().to_string(), |name| {
                name.to_string_lossy().into_owned()
            });
        info!("Started \"{}\" (pid={})", command.display(), pid);
        self.records.insert(
            pid,
            ProcessRecord {
                pid,
                job_id: job.id,
                name,
            },
        );
        Ok(Spawned { pid, stdout })
    }

    /// Forget a child. Returns its program name and job, or `unknown` and 0.
    pub fn finish_process(&mut self, pid: Pid) -> (String, u32) {
        match self.records.remove(&pid) {
            Some(record) => (record.name, record.job_id),
            None => ("unknown".to_string(), 0),
        }
    }

    /// Collect children that have exited, without blocking.
    pub fn reap(&mut self) -> Vec<ProcessRecord> {
        let pids: Vec<Pid> = self.records.keys().copied().collect();
        let mut reaped = Vec::new();
        for pid in pids {
            let status = match waitpid(pid, Some(WaitPidFlag::WNOHANG)) {
                Ok(WaitStatus::StillAlive) => continue,
                Ok(status) => status,
                Err(nix::Error::Sys(Errno::ECHILD)) => WaitStatus::Exited(pid, 0),
                Err(e) => {
                    debug!("waitpid({}) failed: {}", pid, e);
                    continue;
                }
            };
            let exited = match status {
                WaitStatus::Exited(_, code) => Some(Ok(code)),
                WaitStatus::Signaled(_, signal, _) => Some(Err(signal)),
                _ => None,
            };
            let exited = match exited {
                Some(exited) => exited,
                None => continue,
            };
            let (name, job_id) = self.finish_process(pid);
            match exited {
                Ok(0) => debug!("PID {} ({}) exited with no errors.", pid, name),
                Ok(code) => info!("PID {} ({}) stopped with status {}.", pid, name, code),
                Err(Signal::SIGTERM) => debug!("PID {} ({}) was terminated.", pid, name),
                Err(signal) => warn!(
                    "PID {} ({}) crashed on signal {}.",
                    pid,
                    name,
                    signal as libc::c_int
                ),
            }
            reaped.push(ProcessRecord { pid, job_id, name });
        }
        reaped
    }
}
