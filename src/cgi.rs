//! The CGI/1.1 side of the process bridge: the argument and environment vectors a program is
//! started with, and splitting its output into response head and body.

use std::ffi::OsString;
use std::os::unix::ffi::OsStringExt;
use std::path::PathBuf;

use log::{debug, warn};
use thiserror::Error;

use crate::config::Config;
use crate::http::{Fields, HttpVersion, Method, Status};
use crate::locale::Locale;
use crate::resolver::CgiProgram;
use crate::transport::{ClientAddr, MAX_LINE};
use crate::util::hex_to_digit;

const MAX_ARGS: usize = 99;

/// Request details a program sees through its environment.
#[derive(Debug)]
pub struct CgiRequest<'a> {
    pub method: Method,
    /// Request URI, query included.
    pub uri: &'a str,
    pub version: HttpVersion,
    pub fields: &'a Fields,
    /// Name the connection was accepted under, used when there is no `Host:`.
    pub server_name: &'a str,
    pub server_port: u16,
    pub peer: &'a ClientAddr,
    pub username: Option<&'a str>,
    /// `LANG` value, see [`cgi_lang`].
    pub lang: &'a str,
    /// Bytes of request body handed to the program.
    pub content_length: u64,
    pub encrypted: bool,
}

/// Everything needed to start a program.
#[derive(Debug, PartialEq)]
pub struct Invocation {
    pub command: PathBuf,
    pub argv: Vec<OsString>,
    pub env: Vec<(String, String)>,
}

impl Invocation {
    pub fn new(program: &CgiProgram, request: &CgiRequest<'_>, config: &Config) -> Self {
        let args = split_options(program, request.method);
        let env = environment(request, config, &args);
        let mut argv = vec![program.command.clone().into_os_string()];
        if let Some(script) = &program.script {
            argv.push(script.clone().into_os_string());
        }
        argv.extend(args.argv);
        argv.truncate(MAX_ARGS);
        Self {
            command: program.command.clone(),
            argv,
            env,
        }
    }
}

#[derive(Debug, Default, PartialEq)]
struct Options {
    argv: Vec<OsString>,
    path_info: Option<String>,
    query_string: Option<String>,
}

/// Split a program's option string, `/path?arg+arg` or `?name=value&...` or `arg+arg`, into
/// `PATH_INFO`, `QUERY_STRING` and arguments.
fn split_options(program: &CgiProgram, method: Method) -> Options {
    let mut options = Options {
        query_string: program.query_string.clone(),
        ..Options::default()
    };
    let raw = program.options.as_deref().unwrap_or("");
    let raw = raw.strip_prefix(' ').unwrap_or(raw);

    let mut args = if raw.starts_with('/') {
        let end = raw.find('?').unwrap_or_else(|| raw.len());
        options.path_info = Some(raw[..end].to_string());
        &raw[end..]
    } else {
        raw.strip_prefix(' ').unwrap_or(raw)
    };
    if method == Method::Get && options.query_string.is_none() {
        if let Some(query) = args.strip_prefix('?') {
            options.query_string = Some(query.to_string());
            args = query;
        }
    }

    'split: for word in args.split(|c| c == ' ' || c == '+') {
        if word.is_empty() {
            continue;
        }
        let bytes = word.as_bytes();
        let mut arg = Vec::with_capacity(bytes.len());
        let mut i = 0;
        while i < bytes.len() {
            if bytes[i] == b'%'
                && i + 2 < bytes.len()
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit()
            {
                let c = hex_to_digit(bytes[i + 1]) * 16 + hex_to_digit(bytes[i + 2]);
                if c == 0 {
                    options.argv.push(OsString::from_vec(arg));
                    break 'split;
                }
                arg.push(c);
                i += 3;
            } else {
                arg.push(bytes[i]);
                i += 1;
            }
        }
        options.argv.push(OsString::from_vec(arg));
    }
    options
}

/// `LANG` for a program, from the locale negotiated for the request.
pub fn cgi_lang(locale: &Locale) -> String {
    if locale.is_posix() {
        "C".to_string()
    } else {
        format!("{}.UTF8", locale.language)
    }
}

fn environment(
    request: &CgiRequest<'_>,
    config: &Config,
    options: &Options,
) -> Vec<(String, String)> {
    let mut env = Vec::with_capacity(32);
    let mut set = |name: &str, value: String| env.push((name.to_string(), value));

    set("PATH", config.child_path.clone());
    set("TMPDIR", config.request_root.display().to_string());
    set(
        "SERVER_SOFTWARE",
        config
            .server_header
            .clone()
            .unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string()),
    );
    if request.username.is_some() {
        let scheme = request
            .fields
            .authorization()
            .and_then(|authorization| authorization.split(' ').next())
            .unwrap_or("");
        set("AUTH_TYPE", scheme.to_string());
    }
    set("LANG", request.lang.to_string());
    set("REDIRECT_STATUS", "1".to_string());
    set("GATEWAY_INTERFACE", "CGI/1.1".to_string());

    let server_name = match request.fields.host() {
        Some(host) => match host.rfind(':') {
            Some(colon) if !host[colon..].contains(']') => &host[..colon],
            _ => host,
        },
        None => request.server_name,
    };
    set("SERVER_NAME", server_name.to_string());
    set("SERVER_PORT", request.server_port.to_string());
    set("REMOTE_ADDR", request.peer.ip().to_string());
    set("REMOTE_HOST", request.peer.hostname());

    let script_name = request.uri.split('?').next().unwrap_or("");
    set("SCRIPT_NAME", script_name.to_string());
    set(
        "SCRIPT_FILENAME",
        format!("{}{}", config.document_root.display(), script_name),
    );
    if let Some(path_info) = &options.path_info {
        set("PATH_INFO", path_info.clone());
    }
    if let Some(username) = request.username {
        set("REMOTE_USER", username.to_string());
    }
    set(
        "SERVER_PROTOCOL",
        if request.version >= HttpVersion::V1_1 {
            HttpVersion::V1_1
        } else if request.version == HttpVersion::V1_0 {
            HttpVersion::V1_0
        } else {
            HttpVersion::V0_9
        }
        .to_string(),
    );

    for &(field, name) in &[
        ("Cookie", "HTTP_COOKIE"),
        ("User-Agent", "HTTP_USER_AGENT"),
        ("Referer", "HTTP_REFERER"),
    ] {
        if let Some(value) = request.fields.get(field).filter(|value| !value.is_empty()) {
            set(name, value.to_string());
        }
    }

    if request.method == Method::Get {
        set("REQUEST_METHOD", "GET".to_string());
        set(
            "QUERY_STRING",
            options.query_string.clone().unwrap_or_default(),
        );
    } else {
        set("REQUEST_METHOD", "POST".to_string());
        set("CONTENT_LENGTH", request.content_length.to_string());
        set(
            "CONTENT_TYPE",
            request.fields.content_type().unwrap_or("").to_string(),
        );
    }
    if request.encrypted {
        set("HTTPS", "ON".to_string());
    }
    env
}

#[derive(Debug, Error, PartialEq)]
pub enum CgiError {
    #[error("script header exceeds {} bytes", MAX_LINE)]
    HeaderTooLong,
}

/// The response head a program asked for.
#[derive(Debug, PartialEq)]
pub struct CgiHead {
    pub status: Status,
    /// A `Location:` was given; the response is a bodiless 303.
    pub redirect: bool,
    /// Header lines to forward, `Status:` excluded.
    pub fields: Vec<String>,
}

/// Collects program output until the blank line that ends its header.
#[derive(Debug, Default)]
pub struct CgiHeaderParser {
    buf: Vec<u8>,
    consumed: usize,
    status: Option<Status>,
    redirect: bool,
    fields: Vec<String>,
}

impl CgiHeaderParser {
    /// Feed output. Once the header is complete, returns it with the body bytes that followed.
    pub fn push(&mut self, data: &[u8]) -> Result<Option<(CgiHead, Vec<u8>)>, CgiError> {
        self.buf.extend_from_slice(data);
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let mut line: Vec<u8> = self.buf.drain(..=pos).collect();
            self.consumed += line.len();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            let line = String::from_utf8_lossy(&line).into_owned();
            debug!("Script header: {}", line);

            if line.is_empty() {
                let status = if self.redirect {
                    Status::SEE_OTHER
                } else {
                    self.status.unwrap_or(Status::OK)
                };
                let head = CgiHead {
                    status,
                    redirect: self.redirect,
                    fields: std::mem::take(&mut self.fields),
                };
                return Ok(Some((head, std::mem::take(&mut self.buf))));
            }
            if has_name(&line, "Status:") {
                self.status = Some(parse_status(&line[7..]));
                continue;
            }
            if has_name(&line, "Location:") {
                self.redirect = true;
            }
            self.fields.push(line);
        }
        if self.consumed + self.buf.len() > MAX_LINE {
            return Err(CgiError::HeaderTooLong);
        }
        Ok(None)
    }
}

fn has_name(line: &str, name: &str) -> bool {
    line.len() >= name.len()
        && line.is_char_boundary(name.len())
        && line[..name.len()].eq_ignore_ascii_case(name)
}

fn parse_status(value: &str) -> Status {
    match value
        .split_whitespace()
        .next()
        .and_then(|code| code.parse::<u16>().ok())
        .filter(|code| (100..1000).contains(code))
    {
        Some(code) => Status(code),
        None => {
            warn!("bad script Status: \"{}\"", value.trim());
            Status::SERVER_ERROR
        }
    }
}
