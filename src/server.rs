//! The event loop: listeners, connections, CGI pipes and the shared child status pipe all go
//! through one `select()`.

use std::collections::BTreeSet;
use std::io;
use std::time::{Duration, SystemTime};

use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use thiserror::Error;

use crate::config::Config;
use crate::connection::Connection;
use crate::ipp::IppHandler;
use crate::process::{ProcessError, ProcessTable};
use crate::services::{Authorizer, Directory, MimeDatabase};
use crate::spool::Spooler;
use crate::transport::{ClientAddr, Listener, Transport};
use crate::util::LogSink;

/// Minimum time between two "too many clients from one host" warnings.
const HOST_WARNING_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("critical: process table is corrupt: {0}")]
    ProcessTable(#[source] ProcessError),
    #[error("select() failed: {0}")]
    Select(#[source] nix::Error),
}

/// State shared by every connection.
pub struct Context {
    pub config: Config,
    pub directory: Box<dyn Directory>,
    pub mime: Box<dyn MimeDatabase>,
    pub authorizer: Box<dyn Authorizer>,
    pub ipp: Box<dyn IppHandler>,
    pub processes: ProcessTable,
    pub spooler: Spooler,
    /// Connections between an accepted request line and the end of its response.
    pub active: BTreeSet<u64>,
    pub access_log: LogSink,
    /// A new configuration file was installed.
    pub need_reload: bool,
    /// Set when the process table can no longer be trusted.
    pub fatal: Option<ProcessError>,
}

impl Context {
    pub fn new(
        config: Config,
        directory: Box<dyn Directory>,
        mime: Box<dyn MimeDatabase>,
        authorizer: Box<dyn Authorizer>,
        ipp: Box<dyn IppHandler>,
        access_log: LogSink,
    ) -> io::Result<Self> {
        let spooler = Spooler::new(&config.request_root);
        Ok(Self {
            config,
            directory,
            mime,
            authorizer,
            ipp,
            processes: ProcessTable::new()?,
            spooler,
            active: BTreeSet::new(),
            access_log,
            need_reload: false,
            fatal: None,
        })
    }

    /// Busy while a request is in flight or a child is still running.
    pub fn is_busy(&self) -> bool {
        !self.active.is_empty() || !self.processes.is_empty()
    }
}

pub struct Server {
    pub ctx: Context,
    listeners: Vec<Listener>,
    connections: Vec<Connection>,
    next_number: u64,
    busy: bool,
    last_host_warning: Option<SystemTime>,
}

impl Server {
    pub fn new(ctx: Context, listeners: Vec<Listener>) -> Self {
        Self {
            ctx,
            listeners,
            connections: Vec::new(),
            next_number: 1,
            busy: false,
            last_host_warning: None,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Whether a configuration reload was requested since the last call.
    pub fn take_reload(&mut self) -> bool {
        std::mem::take(&mut self.ctx.need_reload)
    }

    fn is_accepting(&self) -> bool {
        self.connections.len() < self.ctx.config.max_clients
    }

    /// Start serving an already connected client. Returns its connection number.
    pub fn add_client(
        &mut self,
        transport: Box<dyn Transport>,
        peer: ClientAddr,
        server_name: String,
        server_port: u16,
    ) -> u64 {
        let now = SystemTime::now();
        let number = self.next_number;
        self.next_number += 1;
        debug!("[Client {}] Accepted from {}", number, peer);
        let mut conn = Connection::new(number, transport, peer, server_name, server_port, now);
        // Try to read straight away rather than going through another iteration of the select()
        // loop.
        conn.advance(&mut self.ctx, now);
        if !conn.is_closed() {
            self.connections.push(conn);
        }
        number
    }

    fn accept(&mut self, index: usize, now: SystemTime) {
        let accepted = match self.listeners[index].accept(&self.ctx.config.server_name) {
            Ok(accepted) => accepted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                warn!("accept() failed: {}", e);
                return;
            }
        };

        let from_host = self
            .connections
            .iter()
            .filter(|conn| conn.peer().ip() == accepted.peer.ip())
            .count();
        if from_host >= self.ctx.config.max_clients_per_host {
            let quiet = self.last_host_warning.map_or(false, |last| {
                now.duration_since(last)
                    .map_or(true, |elapsed| elapsed < HOST_WARNING_INTERVAL)
            });
            if !quiet {
                warn!(
                    "Possible DoS attack - more than {} clients connecting from {}.",
                    self.ctx.config.max_clients_per_host, accepted.peer
                );
                self.last_host_warning = Some(now);
            }
            return;
        }

        self.add_client(
            accepted.transport,
            accepted.peer,
            accepted.server_name,
            accepted.server_port,
        );
    }

    /// Wait up to `timeout` for something to do, then do it.
    pub fn poll(&mut self, timeout: Duration) -> Result<(), ServerError> {
        let mut recv_set = FdSet::new();
        let mut send_set = FdSet::new();

        let accepting = self.is_accepting();
        if accepting {
            for listener in &self.listeners {
                recv_set.insert(listener.raw_fd());
            }
        }
        recv_set.insert(self.ctx.processes.status_fd());
        for conn in &self.connections {
            let interest = conn.interest();
            for fd in interest.read.into_iter().chain(interest.pipe) {
                recv_set.insert(fd);
            }
            if let Some(fd) = interest.write {
                send_set.insert(fd);
            }
        }

        let mut timeval = TimeVal::from(libc::timeval {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        });
        match select(
            None,
            Some(&mut recv_set),
            Some(&mut send_set),
            None,
            Some(&mut timeval),
        ) {
            Ok(_) => {}
            Err(e) if e.as_errno() == Some(Errno::EINTR) => return Ok(()), // interrupted by signal
            Err(e) => return Err(ServerError::Select(e)),
        }

        // update time
        let now = SystemTime::now();

        if recv_set.contains(self.ctx.processes.status_fd()) {
            self.ctx.processes.relay_status();
        }
        if accepting {
            for index in 0..self.listeners.len() {
                if recv_set.contains(self.listeners[index].raw_fd()) {
                    self.accept(index, now);
                }
            }
        }

        let ctx = &mut self.ctx;
        for conn in self.connections.iter_mut() {
            let interest = conn.interest();
            let ready = interest
                .read
                .into_iter()
                .chain(interest.pipe)
                .any(|fd| recv_set.contains(fd))
                || interest.write.map_or(false, |fd| send_set.contains(fd));
            if ready {
                conn.advance(ctx, now);
            } else if conn.is_idle(now, ctx) {
                debug!("[Client {}] Closing on timeout ({:?}).", conn.number, conn.state());
                conn.close(ctx);
            }
        }
        self.connections.retain(|conn| !conn.is_closed());

        for record in self.ctx.processes.reap() {
            debug!("reaped {} (pid {})", record.name, record.pid);
        }

        if let Some(e) = self.ctx.fatal.take() {
            error!("critical: {}", e);
            return Err(ServerError::ProcessTable(e));
        }

        let busy = self.ctx.is_busy();
        if busy != self.busy {
            debug!(
                "Server is now {} ({} active requests, {} children)",
                if busy { "busy" } else { "idle" },
                self.ctx.active.len(),
                self.ctx.processes.len()
            );
            self.busy = busy;
        }
        Ok(())
    }

    /// Close every connection.
    pub fn shutdown(&mut self) {
        for conn in self.connections.iter_mut() {
            conn.close(&mut self.ctx);
        }
        self.connections.clear();
        info!("Closed all connections.");
    }
}
