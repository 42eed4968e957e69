//! One client connection: reading requests, choosing how to answer them, and streaming the
//! answer back.
//!
//! A connection moves `Waiting -> Fields -> [Recv ->] Send -> Waiting`. Everything a request
//! owns (spool file, IPP messages, the CGI child and its pipe, an open static file) lives in
//! [`Request`] and is released when the request is dropped, both on keep-alive reuse and on
//! close.

use std::fs::File;
use std::io::{self, Read};
use std::os::unix::io::{AsRawFd, RawFd};
use std::process::ChildStdout;
use std::time::SystemTime;

use log::{debug, error, info, warn};
use nix::unistd::Pid;

use crate::cgi::{cgi_lang, CgiError, CgiHead, CgiHeaderParser, CgiRequest, Invocation};
use crate::config::{Encryption, ADMIN_CONF_RESOURCE};
use crate::host::{valid_host, HostPolicy};
use crate::http::{
    parse_field_line, parse_request_line, BodyDecoder, Fields, HttpVersion, Method,
    RequestLineError, Status,
};
use crate::ipp::{IppContext, IppDecoder, IppError, IppMessage};
use crate::locale::Locale;
use crate::process::{end_process, Job};
use crate::resolver::{
    is_path_absolute, request_path, CgiProgram, Resolution, ResolvedFile, Resolver,
};
use crate::response::{self, Challenge, Framing, UPGRADE};
use crate::server::Context;
use crate::services::{AuthRequest, AuthType, MimeType};
use crate::spool::{install_config, SpoolFile};
use crate::transport::{ClientAddr, HttpStream, Transport};
use crate::util::{ClfDate, HttpDate, LogEncoded};

/// Stop producing response data while this much is waiting to go out.
const HIGH_WATER: usize = 64 * 1024;

const READ_SIZE: usize = 32 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum State {
    /// Between requests.
    Waiting,
    /// Reading header fields.
    Fields,
    /// Reading a request body.
    Recv,
    /// Writing a response.
    Send,
}

/// Whether the connection can make progress right now.
#[derive(Debug, PartialEq, Eq)]
enum Step {
    Again,
    Wait,
    Close,
}

enum Fill {
    Data,
    Blocked,
    Eof,
    Failed(io::Error),
}

/// What happens once the request body is in.
enum Target {
    Install,
    Ipp,
    Cgi(CgiProgram),
}

/// A request body being received.
struct Ingest {
    decoder: BodyDecoder,
    target: Target,
    spool: Option<SpoolFile>,
    /// Present until the IPP message has been decoded.
    ipp: Option<IppDecoder>,
    message: Option<IppMessage>,
    bytes: u64,
}

/// Program output being relayed to the client.
struct CgiPipe {
    pid: Pid,
    stdout: ChildStdout,
    /// Present until the program's header has been framed.
    parser: Option<CgiHeaderParser>,
    /// A redirect: the body is thrown away.
    discard: bool,
    /// The program's standard input.
    _spool: Option<SpoolFile>,
}

impl Drop for CgiPipe {
    fn drop(&mut self) {
        end_process(self.pid, false);
    }
}

enum Output {
    /// Everything is queued on the stream.
    Done,
    File { file: File, remaining: u64 },
    Cgi(CgiPipe),
}

/// Per-request state, reset for every request line.
struct Request {
    method: Method,
    uri: String,
    version: HttpVersion,
    fields: Fields,
    keep_alive: bool,
    locale: Locale,
    username: Option<String>,
    /// Status reported in the access log once a response is chosen.
    status: Option<Status>,
    bytes_at_start: u64,
    body: Option<Ingest>,
    output: Output,
}

impl Request {
    fn client_auth_type(&self) -> AuthType {
        match self.fields.authorization() {
            Some(value) if starts_with_ignore_case(value, "Negotiate") => AuthType::Negotiate,
            Some(value) if starts_with_ignore_case(value, "Digest") => AuthType::Digest,
            Some(_) => AuthType::Basic,
            None => AuthType::None,
        }
    }
}

fn starts_with_ignore_case(value: &str, prefix: &str) -> bool {
    value.len() >= prefix.len()
        && value.is_char_boundary(prefix.len())
        && value[..prefix.len()].eq_ignore_ascii_case(prefix)
}

/// Descriptors a connection is waiting on.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Interest {
    pub read: Option<RawFd>,
    pub write: Option<RawFd>,
    pub pipe: Option<RawFd>,
}

pub struct Connection {
    pub number: u64,
    stream: HttpStream,
    peer: ClientAddr,
    server_name: String,
    server_port: u16,
    last_active: SystemTime,
    now: SystemTime,
    state: State,
    tls_checked: bool,
    /// Flush what is queued, then close.
    closing: bool,
    closed: bool,
    request: Option<Request>,
}

impl Connection {
    pub fn new(
        number: u64,
        transport: Box<dyn Transport>,
        peer: ClientAddr,
        server_name: String,
        server_port: u16,
        now: SystemTime,
    ) -> Self {
        Self {
            number,
            stream: HttpStream::new(transport),
            peer,
            server_name,
            server_port,
            last_active: now,
            now,
            state: State::Waiting,
            tls_checked: false,
            closing: false,
            closed: false,
            request: None,
        }
    }

    pub fn peer(&self) -> &ClientAddr {
        &self.peer
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn raw_fd(&self) -> RawFd {
        self.stream.raw_fd()
    }

    pub fn interest(&self) -> Interest {
        if self.closed {
            return Interest::default();
        }
        let producing_file = matches!(
            self.request.as_ref().map(|request| &request.output),
            Some(Output::File { .. })
        );
        let pipe = match self.request.as_ref().map(|request| &request.output) {
            Some(Output::Cgi(pipe)) if self.stream.pending_output() < HIGH_WATER => {
                Some(pipe.stdout.as_raw_fd())
            }
            _ => None,
        };
        Interest {
            read: if !self.closing && self.state != State::Send && self.stream.wants_input() {
                Some(self.raw_fd())
            } else {
                None
            },
            write: if self.stream.has_pending_output() || producing_file {
                Some(self.raw_fd())
            } else {
                None
            },
            pipe,
        }
    }

    /// Idle long enough to be dropped: the keep-alive timeout between requests, the request
    /// timeout otherwise.
    pub fn is_idle(&self, now: SystemTime, ctx: &Context) -> bool {
        let limit = if self.state == State::Waiting && self.request.is_none() {
            ctx.config.keep_alive_timeout
        } else {
            ctx.config.timeout
        };
        now.duration_since(self.last_active)
            .map_or(false, |idle| idle >= limit)
    }

    /// Make as much progress as the socket, pipe and file allow.
    pub fn advance(&mut self, ctx: &mut Context, now: SystemTime) {
        self.now = now;
        while !self.closed {
            let step = if self.closing {
                self.drain()
            } else {
                match self.state {
                    State::Waiting => self.read_request_line(ctx),
                    State::Fields => self.read_fields(ctx),
                    State::Recv => self.read_body(ctx),
                    State::Send => self.send(ctx),
                }
            };
            match step {
                Step::Again => {}
                Step::Wait => break,
                Step::Close => self.close(ctx),
            }
        }
    }

    /// Release everything and shut the socket.
    pub fn close(&mut self, ctx: &mut Context) {
        if self.closed {
            return;
        }
        if let Some(request) = self.request.take() {
            if request.status.is_some() {
                self.log_request(ctx, &request);
            }
        }
        ctx.active.remove(&self.number);
        self.stream.flush().ok();
        self.stream.shutdown();
        self.closed = true;
        debug!("[Client {}] Closed", self.number);
    }

    fn drain(&mut self) -> Step {
        match self.stream.flush() {
            Ok(true) => Step::Close,
            Ok(false) => Step::Wait,
            Err(e) => {
                debug!("[Client {}] Closing for error: {}", self.number, e);
                Step::Close
            }
        }
    }

    fn fill(&mut self) -> Fill {
        match self.stream.fill() {
            Ok(0) => Fill::Eof,
            Ok(_) => {
                self.last_active = self.now;
                Fill::Data
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Fill::Blocked,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => Fill::Data,
            Err(e) => Fill::Failed(e),
        }
    }

    fn closing_on(&self, fill: Fill, what: &str) -> Step {
        match fill {
            Fill::Eof => debug!("[Client {}] {} Closing on EOF.", self.number, what),
            Fill::Failed(e) => debug!("[Client {}] {} Closing for error: {}", self.number, what, e),
            Fill::Data | Fill::Blocked => return Step::Again,
        }
        Step::Close
    }

    /// Start TLS when the first byte cannot begin an HTTP request.
    fn detect_tls(&mut self) -> Step {
        if !self.stream.transport().can_start_tls() {
            self.tls_checked = true;
            return Step::Again;
        }
        let mut byte = [0];
        match self.stream.transport().peek(&mut byte) {
            Ok(1) => {
                self.tls_checked = true;
                if byte[0] == 0 || !b"DGHOPT".contains(&byte[0]) {
                    info!(
                        "[Client {}] Saw first byte {:02X}, auto-negotiating TLS session.",
                        self.number, byte[0]
                    );
                    if let Err(e) = self.stream.transport_mut().start_tls() {
                        error!("[Client {}] Unable to encrypt connection: {}", self.number, e);
                        return Step::Close;
                    }
                }
                Step::Again
            }
            Ok(_) => {
                self.tls_checked = true;
                Step::Again
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Step::Wait,
            Err(e) => {
                debug!("[Client {}] Closing for error: {}", self.number, e);
                Step::Close
            }
        }
    }

    fn read_request_line(&mut self, ctx: &mut Context) -> Step {
        if !self.tls_checked && self.stream.buffered().is_empty() {
            match self.detect_tls() {
                Step::Again => {}
                step => return step,
            }
        }
        let line = loop {
            match self.stream.gets() {
                Ok(Some(line)) if line.is_empty() => continue,
                Ok(Some(line)) => break line,
                Ok(None) => {}
                Err(_) => {
                    error!("[Client {}] Request line too long.", self.number);
                    return self.reject_line(ctx, Status::BAD_REQUEST, "-");
                }
            }
            match self.fill() {
                Fill::Data => {}
                Fill::Blocked => return Step::Wait,
                fill => return self.closing_on(fill, "WAITING"),
            }
        };

        let parsed = match parse_request_line(&line) {
            Ok(parsed) => parsed,
            Err(RequestLineError::Malformed) => {
                error!("[Client {}] Bad request line \"{}\"", self.number, LogEncoded(&line));
                return self.reject_line(ctx, Status::BAD_REQUEST, &line);
            }
            Err(RequestLineError::UnsupportedVersion(version)) => {
                error!("[Client {}] Unsupported request version \"{}\"", self.number, version);
                return self.reject_line(ctx, Status::NOT_SUPPORTED, &line);
            }
        };
        let method = match Method::parse(parsed.method) {
            Some(method) => method,
            None => {
                error!("[Client {}] Bad operation \"{}\"", self.number, LogEncoded(parsed.method));
                return self.reject_line(ctx, Status::BAD_REQUEST, &line);
            }
        };
        let uri = match request_path(parsed.uri, &ctx.config.server_name) {
            Ok(uri) => uri,
            Err(status) => {
                error!(
                    "[Client {}] Bad URI \"{}\" in request.",
                    self.number,
                    LogEncoded(parsed.uri)
                );
                return self.reject_line(ctx, status, &line);
            }
        };
        let version = parsed.version;
        debug!("[Client {}] {} {} {}", self.number, method.as_str(), uri, version);

        ctx.active.insert(self.number);
        self.stream.chunked = false;
        self.request = Some(Request {
            method,
            uri,
            version,
            fields: Fields::default(),
            keep_alive: version >= HttpVersion::V1_1 && ctx.config.keep_alive,
            locale: Locale::parse(&ctx.config.default_locale),
            username: None,
            status: None,
            bytes_at_start: self.stream.bytes_out(),
            body: None,
            output: Output::Done,
        });
        if version == HttpVersion::V0_9 {
            self.process_request(ctx)
        } else {
            self.state = State::Fields;
            Step::Again
        }
    }

    /// Answer a request line we could not accept, then close.
    fn reject_line(&mut self, ctx: &mut Context, status: Status, line: &str) -> Step {
        let locale = Locale::parse(&ctx.config.default_locale);
        let framing = Framing {
            version: HttpVersion::V1_1,
            keep_alive: false,
            keep_alive_timeout: ctx.config.keep_alive_timeout,
            server_header: ctx.config.server_header.as_deref(),
            locale: &locale,
            now: self.now,
        };
        let page = response::error_page(&locale, status, None);
        let head = response::header(&framing, status, None, None);
        let before = self.stream.pending_output();
        self.stream.print(&head);
        self.stream.print(&format!(
            "Content-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
            page.len()
        ));
        self.stream.print(&page);
        let bytes = self.stream.pending_output() - before;
        let entry = format!(
            "{} - - {} \"{}\" {} {}\n",
            self.peer.hostname(),
            ClfDate(self.now),
            LogEncoded(line),
            status.wire_code(),
            bytes
        );
        if let Err(e) = ctx.access_log.log(&entry) {
            warn!("failed to write access log: {}", e);
        }
        self.closing = true;
        Step::Again
    }

    fn read_fields(&mut self, ctx: &mut Context) -> Step {
        loop {
            let line = match self.stream.gets() {
                Ok(Some(line)) => line,
                Ok(None) => match self.fill() {
                    Fill::Data => continue,
                    Fill::Blocked => return Step::Wait,
                    fill => return self.closing_on(fill, "HEADERS"),
                },
                Err(_) => {
                    error!("[Client {}] Header field too long.", self.number);
                    return self.fail(ctx, Status::BAD_REQUEST);
                }
            };
            if line.is_empty() {
                return self.process_request(ctx);
            }
            match parse_field_line(&line) {
                Some((name, value)) => {
                    if let Some(request) = self.request.as_mut() {
                        request.fields.set(name, value);
                    }
                }
                None => {
                    error!("[Client {}] Bad header field \"{}\"", self.number, LogEncoded(&line));
                    return self.fail(ctx, Status::BAD_REQUEST);
                }
            }
        }
    }

    /// The header is complete: validate it and pick a response.
    fn process_request(&mut self, ctx: &mut Context) -> Step {
        let loopback = self.peer.is_loopback();
        let encrypted = self.stream.transport().is_encrypted();
        let request = match self.request.as_mut() {
            Some(request) => request,
            None => return Step::Close,
        };

        request.locale = Locale::negotiate(
            request.fields.accept_language(),
            request.fields.content_type(),
            &ctx.config.default_locale,
        );
        request.username = ctx.authorizer.authenticate(request.fields.authorization());

        if let Some(connection) = request.fields.connection() {
            if starts_with_ignore_case(connection, "Keep-Alive") && ctx.config.keep_alive {
                request.keep_alive = true;
            } else if starts_with_ignore_case(connection, "close") {
                request.keep_alive = false;
            }
        }

        let policy = HostPolicy {
            server_name: &ctx.config.server_name,
            aliases: &ctx.config.server_aliases,
            interface_hostnames: &ctx.config.interface_hostnames,
            mdns: ctx.config.dnssd,
        };
        match request.fields.host().filter(|host| !host.is_empty()) {
            None if request.version >= HttpVersion::V1_1 => {
                error!("[Client {}] Missing Host: field in request.", self.number);
                return self.send_error(ctx, Status::BAD_REQUEST);
            }
            None => {}
            Some(host) if !valid_host(host, loopback, &policy) => {
                error!(
                    "[Client {}] Request from \"{}\" using invalid Host: field \"{}\".",
                    self.number,
                    self.peer.hostname(),
                    LogEncoded(host)
                );
                return self.send_error(ctx, Status::BAD_REQUEST);
            }
            Some(_) => {}
        }

        let wants_upgrade = request
            .fields
            .connection()
            .map_or(false, |connection| connection.eq_ignore_ascii_case("Upgrade"))
            && !encrypted;
        let method = request.method;

        if method == Method::Options {
            if wants_upgrade {
                if let Err(step) = self.upgrade(ctx) {
                    return step;
                }
            }
            let head = self.head(ctx, Status::OK, None);
            self.stream.print(&head);
            self.stream.print(&format!(
                "Allow: {}\r\nContent-Length: 0\r\n\r\n",
                response::ALLOW
            ));
            return self.respond(Status::OK, Output::Done);
        }

        let uri = request.uri.clone();
        if !is_path_absolute(&uri) {
            error!(
                "[Client {}] Request for non-absolute resource \"{}\".",
                self.number,
                LogEncoded(&uri)
            );
            return self.send_error(ctx, Status::FORBIDDEN);
        }

        if wants_upgrade {
            if let Err(step) = self.upgrade(ctx) {
                return step;
            }
        }

        let status = {
            let request = match self.request.as_ref() {
                Some(request) => request,
                None => return Step::Close,
            };
            let resource = uri.split('?').next().unwrap_or("");
            ctx.authorizer.is_authorized(&AuthRequest {
                resource,
                username: request.username.as_deref(),
                loopback,
            })
        };
        if status != Status::OK {
            return self.fail(ctx, status);
        }

        if matches!(method, Method::Post | Method::Put) {
            let expect = self
                .request
                .as_ref()
                .and_then(|request| request.fields.expect())
                .map(str::to_string);
            match expect {
                Some(expect) if expect.eq_ignore_ascii_case("100-continue") => {
                    let version = self.request.as_ref().map_or(HttpVersion::V1_1, |r| r.version);
                    self.stream.print(&response::continue_line(version));
                }
                Some(_) => {
                    if let Some(request) = self.request.as_mut() {
                        request.keep_alive = false;
                    }
                    let head = self.head(ctx, Status::EXPECTATION_FAILED, None);
                    self.stream.print(&head);
                    self.stream.print("Content-Length: 0\r\n\r\n");
                    return self.respond(Status::EXPECTATION_FAILED, Output::Done);
                }
                None => {}
            }
        }

        match method {
            Method::Get => self.process_get(ctx),
            Method::Head => self.process_head(ctx),
            Method::Post => self.process_post(ctx),
            Method::Put => self.process_put(ctx),
            Method::Delete | Method::Trace | Method::Options => {
                self.fail(ctx, Status::NOT_IMPLEMENTED)
            }
        }
    }

    /// Switch to TLS in the middle of a request (`Connection: Upgrade`).
    ///
    /// `Err` carries the step to return when the request is over, either
    /// because a 501 was queued or because the connection must close.
    fn upgrade(&mut self, ctx: &mut Context) -> Result<(), Step> {
        if !self.stream.transport().can_start_tls() {
            return Err(self.fail(ctx, Status::NOT_IMPLEMENTED));
        }
        let head = self.head(ctx, Status::SWITCHING_PROTOCOLS, None);
        self.stream.print(&head);
        self.stream.print(&format!(
            "Connection: Upgrade\r\nUpgrade: {}\r\nContent-Length: 0\r\n\r\n",
            UPGRADE
        ));
        match self.stream.flush() {
            Ok(true) => {}
            Ok(false) | Err(_) => {
                debug!("[Client {}] Unable to flush upgrade response.", self.number);
                return Err(Step::Close);
            }
        }
        if let Err(e) = self.stream.transport_mut().start_tls() {
            error!("[Client {}] Unable to encrypt connection: {}", self.number, e);
            return Err(Step::Close);
        }
        Ok(())
    }

    fn resolve_get(&mut self, ctx: &Context) -> Option<Resolution> {
        let request = self.request.as_mut()?;
        let resolver = Resolver {
            config: &ctx.config,
            directory: ctx.directory.as_ref(),
            mime: ctx.mime.as_ref(),
        };
        let if_modified_since = request.fields.if_modified_since().map(str::to_string);
        Some(resolver.resolve_get(
            &mut request.uri,
            &request.locale,
            if_modified_since.as_deref(),
        ))
    }

    fn process_get(&mut self, ctx: &mut Context) -> Step {
        match self.resolve_get(ctx) {
            None => Step::Close,
            Some(Resolution::Status(status)) => self.send_error(ctx, status),
            Some(Resolution::Cgi(program)) => {
                self.cgi_keep_alive();
                self.start_cgi(ctx, program, None)
            }
            Some(Resolution::File { file, mime_type }) => {
                self.send_file(ctx, file, mime_type.as_ref(), true)
            }
        }
    }

    fn process_head(&mut self, ctx: &mut Context) -> Step {
        match self.resolve_get(ctx) {
            None => Step::Close,
            Some(Resolution::Status(Status::NOT_FOUND)) => {
                let head = self.head(ctx, Status::NOT_FOUND, Some("text/html"));
                self.stream.print(&head);
                self.stream.print("\r\n");
                self.respond(Status::NOT_FOUND, Output::Done)
            }
            Some(Resolution::Status(Status::WEB_INTERFACE_DISABLED)) => {
                let head = self.head(ctx, Status::OK, None);
                self.stream.print(&head);
                self.stream.print("\r\n");
                self.respond(Status::OK, Output::Done)
            }
            Some(Resolution::Status(status)) => self.send_error(ctx, status),
            Some(Resolution::Cgi(_)) => {
                let head = self.head(ctx, Status::OK, Some("text/html"));
                self.stream.print(&head);
                self.stream.print("\r\n");
                self.respond(Status::OK, Output::Done)
            }
            Some(Resolution::File { file, mime_type }) => {
                self.send_file(ctx, file, mime_type.as_ref(), false)
            }
        }
    }

    /// Programs speaking to HTTP/1.0 clients end their output by closing.
    fn cgi_keep_alive(&mut self) {
        if let Some(request) = self.request.as_mut() {
            if request.version <= HttpVersion::V1_0 {
                request.keep_alive = false;
            }
        }
    }

    fn send_file(
        &mut self,
        ctx: &mut Context,
        file: ResolvedFile,
        mime_type: Option<&MimeType>,
        with_body: bool,
    ) -> Step {
        let content_type = mime_type.map_or_else(|| "text/plain".to_string(), |t| t.to_string());
        let opened = if with_body {
            match File::open(&file.path) {
                Ok(opened) => Some(opened),
                Err(e) => {
                    error!(
                        "[Client {}] Unable to open \"{}\": {}",
                        self.number,
                        file.path.display(),
                        e
                    );
                    return self.send_error(ctx, Status::NOT_FOUND);
                }
            }
        } else {
            None
        };
        let modified = file.metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        let head = self.head(ctx, Status::OK, Some(&content_type));
        self.stream.print(&head);
        self.stream.print(&format!(
            "Last-Modified: {}\r\nContent-Length: {}\r\n\r\n",
            HttpDate(modified),
            file.metadata.len()
        ));
        let output = match opened {
            Some(opened) => Output::File {
                file: opened,
                remaining: file.metadata.len(),
            },
            None => Output::Done,
        };
        self.respond(Status::OK, output)
    }

    /// Check a declared body length. `Err` carries the step after answering.
    fn check_length(&mut self, ctx: &mut Context, required: bool) -> Result<BodyDecoder, Step> {
        let (length, chunked) = match self.request.as_ref() {
            Some(request) => (request.fields.content_length(), request.fields.is_chunked()),
            None => return Err(Step::Close),
        };
        match length {
            Some(length) if length > 0 && ctx.config.exceeds_max_request_size(length as u64) => {
                error!("[Client {}] Request entity too large ({} bytes).", self.number, length);
                Err(self.send_error(ctx, Status::REQUEST_TOO_LARGE))
            }
            Some(length) if length < 0 => {
                error!("[Client {}] Negative content length {}.", self.number, length);
                Err(self.send_error(ctx, Status::BAD_REQUEST))
            }
            _ if chunked => Ok(BodyDecoder::chunked()),
            Some(length) => Ok(BodyDecoder::length(length as u64)),
            None if required => {
                error!("[Client {}] Missing Content-Length.", self.number);
                Err(self.send_error(ctx, Status::BAD_REQUEST))
            }
            None => Ok(BodyDecoder::length(0)),
        }
    }

    fn process_post(&mut self, ctx: &mut Context) -> Step {
        let decoder = match self.check_length(ctx, true) {
            Ok(decoder) => decoder,
            Err(step) => return step,
        };
        let request = match self.request.as_mut() {
            Some(request) => request,
            None => return Step::Close,
        };
        let target = if request.fields.content_type() == Some("application/ipp") {
            Target::Ipp
        } else {
            let resolver = Resolver {
                config: &ctx.config,
                directory: ctx.directory.as_ref(),
                mime: ctx.mime.as_ref(),
            };
            match resolver.resolve_post(&mut request.uri, &request.locale) {
                Resolution::Cgi(program) => Target::Cgi(program),
                Resolution::Status(status) => return self.send_error(ctx, status),
                Resolution::File { .. } => return self.send_error(ctx, Status::UNAUTHORIZED),
            }
        };
        if let Target::Cgi(_) = target {
            self.cgi_keep_alive();
        }
        let (spool, ipp) = match target {
            Target::Ipp => (None, Some(IppDecoder::default())),
            _ => match ctx.spooler.create() {
                Ok(spool) => (Some(spool), None),
                Err(e) => {
                    error!("[Client {}] Unable to create request file: {}", self.number, e);
                    return self.send_error(ctx, Status::REQUEST_TOO_LARGE);
                }
            },
        };
        self.begin_body(Ingest {
            decoder,
            target,
            spool,
            ipp,
            message: None,
            bytes: 0,
        })
    }

    fn process_put(&mut self, ctx: &mut Context) -> Step {
        let uri = self
            .request
            .as_ref()
            .map(|request| request.uri.clone())
            .unwrap_or_default();
        if uri != ADMIN_CONF_RESOURCE {
            error!("[Client {}] Disallowed PUT request for \"{}\".", self.number, LogEncoded(&uri));
            return self.send_error(ctx, Status::FORBIDDEN);
        }
        let decoder = match self.check_length(ctx, false) {
            Ok(decoder) => decoder,
            Err(step) => return step,
        };
        let spool = match ctx.spooler.create() {
            Ok(spool) => spool,
            Err(e) => {
                error!("[Client {}] Unable to create request file: {}", self.number, e);
                return self.send_error(ctx, Status::REQUEST_TOO_LARGE);
            }
        };
        self.begin_body(Ingest {
            decoder,
            target: Target::Install,
            spool: Some(spool),
            ipp: None,
            message: None,
            bytes: 0,
        })
    }

    fn begin_body(&mut self, ingest: Ingest) -> Step {
        if let Some(request) = self.request.as_mut() {
            request.body = Some(ingest);
        }
        self.state = State::Recv;
        Step::Again
    }

    fn read_body(&mut self, ctx: &mut Context) -> Step {
        // An interim "100 Continue" may still be queued.
        if self.stream.has_pending_output() {
            if let Err(e) = self.stream.flush() {
                debug!("[Client {}] Unable to write interim response: {}", self.number, e);
                return Step::Close;
            }
        }
        loop {
            let mut data = Vec::new();
            let done = {
                let stream = &mut self.stream;
                let ingest = match self.request.as_mut().and_then(|request| request.body.as_mut()) {
                    Some(ingest) => ingest,
                    None => return Step::Close,
                };
                match ingest.decoder.decode(stream.input(), &mut data) {
                    Ok(done) => done,
                    Err(e) => {
                        error!("[Client {}] Bad request body: {}", self.number, e);
                        return self.fail(ctx, Status::BAD_REQUEST);
                    }
                }
            };
            if !data.is_empty() {
                match self.consume_body(ctx, &data) {
                    Step::Again => {}
                    step => return step,
                }
            }
            if done {
                return self.body_complete(ctx);
            }
            match self.fill() {
                Fill::Data => {}
                Fill::Blocked => return Step::Wait,
                fill => return self.closing_on(fill, "BODY_RECV"),
            }
        }
    }

    fn consume_body(&mut self, ctx: &mut Context, data: &[u8]) -> Step {
        let number = self.number;
        let ingest = match self.request.as_mut().and_then(|request| request.body.as_mut()) {
            Some(ingest) => ingest,
            None => return Step::Close,
        };
        ingest.bytes += data.len() as u64;
        if ctx.config.exceeds_max_request_size(ingest.bytes) {
            error!("[Client {}] Request entity too large.", number);
            ingest.spool = None;
            ingest.message = None;
            return self.fail(ctx, Status::REQUEST_TOO_LARGE);
        }

        let document: Vec<u8> = match ingest.ipp.as_mut() {
            Some(decoder) => match decoder.push(data) {
                Ok(Some((message, rest))) => {
                    debug!(
                        "[Client {}] {}.{} operation 0x{:04x} request {}",
                        number, message.version.0, message.version.1, message.code, message.request_id
                    );
                    ingest.ipp = None;
                    ingest.message = Some(message);
                    rest
                }
                Ok(None) => return Step::Again,
                Err(e) => return self.ipp_error(ctx, e),
            },
            None => data.to_vec(),
        };
        if document.is_empty() {
            return Step::Again;
        }
        if ingest.spool.is_none() {
            match ctx.spooler.create() {
                Ok(spool) => ingest.spool = Some(spool),
                Err(e) => {
                    error!("[Client {}] Unable to create request file: {}", number, e);
                    ingest.message = None;
                    return self.fail(ctx, Status::REQUEST_TOO_LARGE);
                }
            }
        }
        if let Some(spool) = ingest.spool.as_mut() {
            if let Err(e) = spool.write_all(&document) {
                error!(
                    "[Client {}] Unable to write {} bytes to \"{}\": {}",
                    number,
                    document.len(),
                    spool.path().display(),
                    e
                );
                ingest.spool = None;
                ingest.message = None;
                return self.fail(ctx, Status::REQUEST_TOO_LARGE);
            }
        }
        Step::Again
    }

    fn ipp_error(&mut self, ctx: &mut Context, e: IppError) -> Step {
        error!("[Client {}] IPP read error: {}", self.number, e);
        self.fail(ctx, Status::BAD_REQUEST)
    }

    fn body_complete(&mut self, ctx: &mut Context) -> Step {
        let mut ingest = match self.request.as_mut().and_then(|request| request.body.take()) {
            Some(ingest) => ingest,
            None => return Step::Close,
        };
        if ingest.ipp.is_some() {
            error!("[Client {}] IPP read error: request ended early", self.number);
            return self.fail(ctx, Status::BAD_REQUEST);
        }
        if let Some(spool) = ingest.spool.as_mut() {
            spool.close();
            if ctx.config.exceeds_max_request_size(spool.len()) {
                error!("[Client {}] Request entity too large.", self.number);
                return self.send_error(ctx, Status::REQUEST_TOO_LARGE);
            }
            if spool.is_empty() {
                ingest.spool = None;
            }
        }

        match ingest.target {
            Target::Install => self.install(ctx, ingest.spool),
            Target::Ipp => match ingest.message {
                Some(message) => self.process_ipp(ctx, message, ingest.spool),
                None => self.fail(ctx, Status::BAD_REQUEST),
            },
            Target::Cgi(program) => self.start_cgi(ctx, program, ingest.spool),
        }
    }

    fn install(&mut self, ctx: &mut Context, spool: Option<SpoolFile>) -> Step {
        let spool = match spool {
            Some(spool) => spool,
            None => {
                error!("[Client {}] No configuration file data received.", self.number);
                return self.send_error(ctx, Status::SERVER_ERROR);
            }
        };
        match install_config(&spool, &ctx.config.config_file, ctx.config.config_file_perm) {
            Ok(()) => {
                ctx.need_reload = true;
                self.send_error(ctx, Status::CREATED)
            }
            Err(e) => {
                error!("[Client {}] {}", self.number, e);
                self.send_error(ctx, Status::SERVER_ERROR)
            }
        }
    }

    fn process_ipp(
        &mut self,
        ctx: &mut Context,
        message: IppMessage,
        mut document: Option<SpoolFile>,
    ) -> Step {
        let hostname = self.peer.hostname();
        let username = self.request.as_ref().and_then(|request| request.username.clone());
        let reply = ctx.ipp.process(
            &message,
            IppContext {
                document: &mut document,
                username: username.as_deref(),
                hostname: &hostname,
            },
        );
        drop(document);
        let body = reply.encode();
        let head = self.head(ctx, Status::OK, Some("application/ipp"));
        self.stream.print(&head);
        self.stream
            .print(&format!("Content-Length: {}\r\n\r\n", body.len()));
        self.stream.write_body(&body);
        self.respond(Status::OK, Output::Done)
    }

    fn start_cgi(
        &mut self,
        ctx: &mut Context,
        program: CgiProgram,
        spool: Option<SpoolFile>,
    ) -> Step {
        let request = match self.request.as_ref() {
            Some(request) => request,
            None => return Step::Close,
        };
        let lang = cgi_lang(&request.locale);
        let content_length = spool.as_ref().map_or(0, SpoolFile::len);
        let invocation = Invocation::new(
            &program,
            &CgiRequest {
                method: request.method,
                uri: &request.uri,
                version: request.version,
                fields: &request.fields,
                server_name: &self.server_name,
                server_port: self.server_port,
                peer: &self.peer,
                username: request.username.as_deref(),
                lang: &lang,
                content_length,
                encrypted: self.stream.transport().is_encrypted(),
            },
            &ctx.config,
        );
        let stdin = match spool.as_ref().map(SpoolFile::open).transpose() {
            Ok(stdin) => stdin,
            Err(e) => {
                error!("[Client {}] Unable to open request file for reading: {}", self.number, e);
                return self.send_error(ctx, Status::SERVER_ERROR);
            }
        };
        let spawned = ctx.processes.start(
            &invocation,
            stdin,
            &ctx.config,
            Job::default(),
            ctx.directory.as_mut(),
        );
        match spawned {
            Ok(spawned) => {
                debug!("[Client {}] Waiting for CGI data.", self.number);
                let pipe = CgiPipe {
                    pid: spawned.pid,
                    stdout: spawned.stdout,
                    parser: Some(CgiHeaderParser::default()),
                    discard: false,
                    _spool: spool,
                };
                if let Some(request) = self.request.as_mut() {
                    request.output = Output::Cgi(pipe);
                }
                self.state = State::Send;
                Step::Again
            }
            Err(e) => {
                if e.is_fatal() {
                    ctx.fatal = Some(e);
                }
                self.send_error(ctx, Status::SERVER_ERROR)
            }
        }
    }

    fn send(&mut self, ctx: &mut Context) -> Step {
        loop {
            let sent = self.stream.bytes_out();
            let flushed = match self.stream.flush() {
                Ok(flushed) => flushed,
                Err(e) => {
                    debug!("[Client {}] BODY_SEND Closing for error: {}", self.number, e);
                    return Step::Close;
                }
            };
            if self.stream.bytes_out() > sent {
                self.last_active = self.now;
            }
            if self.stream.pending_output() >= HIGH_WATER {
                return Step::Wait;
            }
            let progress = match self.request.as_mut().map(|request| &mut request.output) {
                None => return Step::Close,
                Some(Output::Done) => {
                    return if flushed {
                        self.finish_request(ctx)
                    } else {
                        Step::Wait
                    };
                }
                Some(Output::File { .. }) => self.send_file_data(),
                Some(Output::Cgi(_)) => self.relay_cgi(ctx),
            };
            if progress != Step::Again {
                return progress;
            }
        }
    }

    fn send_file_data(&mut self) -> Step {
        let stream = &mut self.stream;
        let output = match self.request.as_mut() {
            Some(request) => &mut request.output,
            None => return Step::Close,
        };
        if let Output::File { file, remaining } = output {
            let mut buf = vec![0; READ_SIZE.min(*remaining as usize)];
            let n = if buf.is_empty() {
                0
            } else {
                match file.read(&mut buf) {
                    Ok(n) => n,
                    Err(e) => {
                        error!("[Client {}] Unable to read file: {}", self.number, e);
                        return Step::Close;
                    }
                }
            };
            if n == 0 {
                *output = Output::Done;
            } else {
                stream.write_body(&buf[..n]);
                *remaining -= n as u64;
            }
        }
        Step::Again
    }

    fn relay_cgi(&mut self, ctx: &mut Context) -> Step {
        let mut buf = [0; READ_SIZE];
        let read = match self.request.as_mut().map(|request| &mut request.output) {
            Some(Output::Cgi(pipe)) => pipe.stdout.read(&mut buf),
            _ => return Step::Close,
        };
        let n = match read {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Step::Wait,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Step::Again,
            Err(e) => {
                error!("[Client {}] Error reading CGI output: {}", self.number, e);
                0
            }
        };
        self.last_active = self.now;

        let pipe = match self.request.as_mut().map(|request| &mut request.output) {
            Some(Output::Cgi(pipe)) => pipe,
            _ => return Step::Close,
        };
        if n == 0 {
            let framed = pipe.parser.is_none();
            if let Some(request) = self.request.as_mut() {
                // Dropping the pipe signals the child.
                request.output = Output::Done;
            }
            if !framed {
                error!("[Client {}] CGI program exited without a response header.", self.number);
                return self.send_error(ctx, Status::SERVER_ERROR);
            }
            self.stream.finish_chunks();
            debug!("[Client {}] CGI output complete.", self.number);
            return Step::Again;
        }

        let data = &buf[..n];
        let parser = match pipe.parser.as_mut() {
            Some(parser) => parser,
            None => {
                if !pipe.discard {
                    self.stream.write_body(data);
                }
                return Step::Again;
            }
        };
        match parser.push(data) {
            Ok(None) => Step::Again,
            Ok(Some((head, body))) => {
                pipe.parser = None;
                pipe.discard = head.redirect;
                self.frame_cgi(ctx, head, &body)
            }
            Err(CgiError::HeaderTooLong) => {
                error!("[Client {}] CGI response header too long.", self.number);
                if let Some(request) = self.request.as_mut() {
                    request.output = Output::Done;
                }
                self.send_error(ctx, Status::SERVER_ERROR)
            }
        }
    }

    fn frame_cgi(&mut self, ctx: &mut Context, script: CgiHead, body: &[u8]) -> Step {
        let chunked = match self.request.as_mut() {
            Some(request) => {
                if script.status.is_error() {
                    request.keep_alive = false;
                }
                let chunked = !script.redirect && request.version >= HttpVersion::V1_1;
                if !script.redirect && !chunked {
                    request.keep_alive = false;
                }
                request.status = Some(script.status);
                chunked
            }
            None => return Step::Close,
        };
        let mut text = self.head(ctx, script.status, None);
        for field in &script.fields {
            text.push_str(field);
            text.push_str("\r\n");
        }
        if script.redirect {
            text.push_str("Content-Length: 0\r\n");
        } else if chunked {
            text.push_str("Transfer-Encoding: chunked\r\n");
        }
        text.push_str("\r\n");
        self.stream.print(&text);
        self.stream.chunked = chunked;
        if !script.redirect {
            self.stream.write_body(body);
        }
        Step::Again
    }

    /// Status line and standard fields for the current request.
    fn head(&self, ctx: &Context, status: Status, content_type: Option<&str>) -> String {
        let default_locale;
        let (version, keep_alive, locale) = match self.request.as_ref() {
            Some(request) => (request.version, request.keep_alive, &request.locale),
            None => {
                default_locale = Locale::parse(&ctx.config.default_locale);
                (HttpVersion::V1_1, false, &default_locale)
            }
        };
        let framing = Framing {
            version,
            keep_alive,
            keep_alive_timeout: ctx.config.keep_alive_timeout,
            server_header: ctx.config.server_header.as_deref(),
            locale,
            now: self.now,
        };
        let hostname = self.peer.hostname();
        let challenge = if status == Status::UNAUTHORIZED {
            let location = self.request.as_ref().and_then(|request| {
                let path = request.uri.split('?').next().unwrap_or("");
                ctx.authorizer.location(path)
            });
            let auth_type = match &location {
                Some(location) if location.auth_type != AuthType::None => location.auth_type,
                _ => ctx.authorizer.default_auth_type(),
            };
            Some(Challenge {
                auth_type,
                trust: location.map_or(false, |location| location.system_group)
                    && hostname == "localhost",
                local_socket: self.peer == ClientAddr::Local,
            })
        } else {
            None
        };
        response::header(
            &framing,
            status,
            content_type,
            challenge.as_ref().map(|challenge| (challenge, hostname.as_str())),
        )
    }

    /// A response is queued; stream `output` after it.
    fn respond(&mut self, status: Status, output: Output) -> Step {
        if let Some(request) = self.request.as_mut() {
            request.status = Some(status);
            request.output = output;
        }
        self.state = State::Send;
        Step::Again
    }

    /// Answer with `status` and its generated page.
    fn send_error(&mut self, ctx: &mut Context, status: Status) -> Step {
        let mut status = status;
        if status == Status::UNAUTHORIZED
            && ctx.config.encryption == Encryption::Required
            && self.peer.hostname() != "localhost"
            && !self.stream.transport().is_encrypted()
        {
            status = Status::UPGRADE_REQUIRED;
        }
        let uri = match self.request.as_mut() {
            Some(request) => {
                if status.is_error() && request.client_auth_type() != AuthType::Negotiate {
                    request.keep_alive = false;
                }
                request.body = None;
                request.uri.clone()
            }
            None => "/".to_string(),
        };

        let mut text = self.head(ctx, status, None);
        if status == Status::UPGRADE_REQUIRED {
            text.push_str(&format!("Connection: Upgrade\r\nUpgrade: {}\r\n", UPGRADE));
        }
        if status.is_error() {
            let url = format!("https://{}:{}{}", self.server_name, self.server_port, uri);
            let locale = self
                .request
                .as_ref()
                .map(|request| request.locale.clone())
                .unwrap_or_else(|| Locale::parse(&ctx.config.default_locale));
            let page = response::error_page(&locale, status, Some(&url));
            text.push_str(&format!(
                "Content-Type: text/html; charset=utf-8\r\nContent-Length: {}\r\n\r\n",
                page.len()
            ));
            text.push_str(&page);
        } else if status == Status::NOT_MODIFIED {
            text.push_str("\r\n");
        } else {
            text.push_str("Content-Length: 0\r\n\r\n");
        }
        self.stream.print(&text);
        self.respond(status, Output::Done)
    }

    /// Answer with `status`, then close regardless of keep-alive.
    fn fail(&mut self, ctx: &mut Context, status: Status) -> Step {
        let step = self.send_error(ctx, status);
        if let Some(request) = self.request.as_mut() {
            request.keep_alive = false;
        }
        step
    }

    /// The response is out: log it and either wait for the next request or close.
    fn finish_request(&mut self, ctx: &mut Context) -> Step {
        let keep_alive = match self.request.take() {
            Some(request) => {
                self.log_request(ctx, &request);
                request.keep_alive
            }
            None => false,
        };
        ctx.active.remove(&self.number);
        self.stream.chunked = false;
        self.state = State::Waiting;
        if keep_alive {
            Step::Again
        } else {
            debug!("[Client {}] Closing because Keep-Alive is disabled.", self.number);
            self.closing = true;
            Step::Again
        }
    }

    fn log_request(&self, ctx: &mut Context, request: &Request) {
        let status = match request.status {
            Some(status) => status,
            None => return,
        };
        let bytes = self
            .stream
            .bytes_out()
            .saturating_sub(request.bytes_at_start);
        let entry = format!(
            "{} - {} {} \"{} {} {}\" {} {}\n",
            self.peer.hostname(),
            LogEncoded(request.username.as_deref().unwrap_or("-")),
            ClfDate(self.now),
            request.method.as_str(),
            LogEncoded(&request.uri),
            request.version,
            status.wire_code(),
            bytes
        );
        if let Err(e) = ctx.access_log.log(&entry) {
            warn!("failed to write access log: {}", e);
        }
    }
}
