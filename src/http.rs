//! HTTP/1.x protocol vocabulary: versions, methods, status codes, header fields,
//! request-line parsing and request body decoding.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

/// Longest URI accepted on a request line.
pub const MAX_URI: usize = 1023;

/// Longest chunk-size or trailer line accepted in a chunked body.
const MAX_CHUNK_LINE: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HttpVersion {
    pub major: u8,
    pub minor: u8,
}

impl HttpVersion {
    pub const V0_9: Self = Self { major: 0, minor: 9 };
    pub const V1_0: Self = Self { major: 1, minor: 0 };
    pub const V1_1: Self = Self { major: 1, minor: 1 };
}

impl fmt::Display for HttpVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "HTTP/{}.{}", self.major, self.minor)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Method {
    Options,
    Get,
    Head,
    Post,
    Put,
    Delete,
    Trace,
}

impl Method {
    /// Methods are matched case-sensitively.
    pub fn parse(token: &str) -> Option<Self> {
        Some(match token {
            "OPTIONS" => Self::Options,
            "GET" => Self::Get,
            "HEAD" => Self::Head,
            "POST" => Self::Post,
            "PUT" => Self::Put,
            "DELETE" => Self::Delete,
            "TRACE" => Self::Trace,
            _ => return None,
        })
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Options => "OPTIONS",
            Self::Get => "GET",
            Self::Head => "HEAD",
            Self::Post => "POST",
            Self::Put => "PUT",
            Self::Delete => "DELETE",
            Self::Trace => "TRACE",
        }
    }
}

/// An HTTP status code.
///
/// Codes outside the table (for example those relayed from a CGI `Status:` line) are carried
/// through unchanged.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Status(pub u16);

impl Status {
    pub const CONTINUE: Self = Self(100);
    pub const SWITCHING_PROTOCOLS: Self = Self(101);
    pub const OK: Self = Self(200);
    pub const CREATED: Self = Self(201);
    pub const SEE_OTHER: Self = Self(303);
    pub const NOT_MODIFIED: Self = Self(304);
    pub const BAD_REQUEST: Self = Self(400);
    pub const UNAUTHORIZED: Self = Self(401);
    pub const FORBIDDEN: Self = Self(403);
    pub const NOT_FOUND: Self = Self(404);
    pub const METHOD_NOT_ALLOWED: Self = Self(405);
    pub const REQUEST_TOO_LARGE: Self = Self(413);
    pub const EXPECTATION_FAILED: Self = Self(417);
    pub const UPGRADE_REQUIRED: Self = Self(426);
    pub const SERVER_ERROR: Self = Self(500);
    pub const NOT_IMPLEMENTED: Self = Self(501);
    pub const NOT_SUPPORTED: Self = Self(505);
    /// Internal code for "the web interface is disabled"; goes out on the wire as 200.
    pub const WEB_INTERFACE_DISABLED: Self = Self(1000);

    /// The numeric code written on the status line.
    pub fn wire_code(self) -> u16 {
        if self == Self::WEB_INTERFACE_DISABLED {
            200
        } else {
            self.0
        }
    }

    pub fn is_error(self) -> bool {
        self.0 >= 400
    }

    pub fn reason(self) -> &'static str {
        match self.wire_code() {
            100 => "Continue",
            101 => "Switching Protocols",
            200 => "OK",
            201 => "Created",
            202 => "Accepted",
            204 => "No Content",
            301 => "Moved Permanently",
            302 => "Found",
            303 => "See Other",
            304 => "Not Modified",
            400 => "Bad Request",
            401 => "Unauthorized",
            403 => "Forbidden",
            404 => "Not Found",
            405 => "Method Not Allowed",
            413 => "Request Entity Too Large",
            415 => "Unsupported Media Type",
            417 => "Expectation Failed",
            426 => "Upgrade Required",
            500 => "Internal Server Error",
            501 => "Not Implemented",
            503 => "Service Unavailable",
            505 => "HTTP Version Not Supported",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.wire_code(), self.reason())
    }
}

/// Request header fields. Names are case-insensitive and the last value wins.
#[derive(Debug, Default)]
pub struct Fields {
    values: HashMap<String, String>,
}

impl Fields {
    pub fn set(&mut self, name: &str, value: &str) {
        self.values
            .insert(name.to_ascii_lowercase(), value.to_string());
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.values
            .get(&name.to_ascii_lowercase())
            .map(|value| value.as_str())
    }

    pub fn host(&self) -> Option<&str> {
        self.get("Host")
    }

    pub fn content_type(&self) -> Option<&str> {
        self.get("Content-Type")
    }

    pub fn connection(&self) -> Option<&str> {
        self.get("Connection")
    }

    pub fn accept_language(&self) -> Option<&str> {
        self.get("Accept-Language")
    }

    pub fn expect(&self) -> Option<&str> {
        self.get("Expect")
    }

    pub fn if_modified_since(&self) -> Option<&str> {
        self.get("If-Modified-Since")
    }

    pub fn authorization(&self) -> Option<&str> {
        self.get("Authorization")
    }

    /// `Content-Length` as a signed value; garbage reads as 0 and negative values are kept so
    /// that callers can reject them.
    pub fn content_length(&self) -> Option<i64> {
        self.get("Content-Length")
            .map(|value| value.trim().parse().unwrap_or(0))
    }

    pub fn is_chunked(&self) -> bool {
        self.get("Transfer-Encoding")
            .map_or(false, |value| value.trim().eq_ignore_ascii_case("chunked"))
    }
}

#[derive(Debug, Error, PartialEq)]
pub enum RequestLineError {
    #[error("bad request line")]
    Malformed,
    #[error("unsupported HTTP version {0}")]
    UnsupportedVersion(String),
}

/// A request line split into its method token, target and version.
#[derive(Debug, PartialEq)]
pub struct RequestLine<'a> {
    pub method: &'a str,
    pub uri: &'a str,
    pub version: HttpVersion,
}

/// Parse `METHOD URI [HTTP/x.y]`. Two tokens mean HTTP/0.9.
pub fn parse_request_line(line: &str) -> Result<RequestLine<'_>, RequestLineError> {
    let mut tokens = line.split_whitespace();
    let (method, uri) = match (tokens.next(), tokens.next()) {
        (Some(method), Some(uri)) => (method, uri),
        _ => return Err(RequestLineError::Malformed),
    };
    if uri.len() > MAX_URI {
        return Err(RequestLineError::Malformed);
    }
    let version = match tokens.next() {
        None => HttpVersion::V0_9,
        Some(token) => parse_version(token)?,
    };
    Ok(RequestLine {
        method,
        uri,
        version,
    })
}

fn parse_version(token: &str) -> Result<HttpVersion, RequestLineError> {
    let numbers = token
        .strip_prefix("HTTP/")
        .ok_or(RequestLineError::Malformed)?;
    let mut parts = numbers.splitn(2, '.');
    let major: u32 = parts
        .next()
        .and_then(|major| major.parse().ok())
        .ok_or(RequestLineError::Malformed)?;
    let minor: u32 = parts
        .next()
        .and_then(|minor| minor.parse().ok())
        .ok_or(RequestLineError::Malformed)?;
    if major >= 2 {
        return Err(RequestLineError::UnsupportedVersion(token.to_string()));
    }
    Ok(HttpVersion {
        major: major as u8,
        minor: minor.min(99) as u8,
    })
}

/// Split a `Name: value` header line.
pub fn parse_field_line(line: &str) -> Option<(&str, &str)> {
    let colon = line.find(':')?;
    let name = &line[..colon];
    if name.is_empty() || name.contains(|c: char| c.is_ascii_whitespace()) {
        return None;
    }
    Some((name, line[colon + 1..].trim()))
}

#[derive(Debug, Error, PartialEq)]
pub enum BodyError {
    #[error("invalid chunk size line")]
    BadChunkSize,
    #[error("chunk framing line too long")]
    LineTooLong,
}

#[derive(Debug, PartialEq)]
pub enum ChunkState {
    Size,
    Data(u64),
    DataEnd,
    Trailer,
    Done,
}

/// Incremental decoder for a request body, either length-delimited or chunked.
#[derive(Debug, PartialEq)]
pub enum BodyDecoder {
    Length(u64),
    Chunked(ChunkState),
}

impl BodyDecoder {
    pub fn length(remaining: u64) -> Self {
        Self::Length(remaining)
    }

    pub fn chunked() -> Self {
        Self::Chunked(ChunkState::Size)
    }

    pub fn is_done(&self) -> bool {
        matches!(self, Self::Length(0) | Self::Chunked(ChunkState::Done))
    }

    /// Move body bytes from `input` to `out`, consuming framing. Returns `true` once the body is
    /// complete; bytes past the end of the body stay in `input`.
    pub fn decode(&mut self, input: &mut Vec<u8>, out: &mut Vec<u8>) -> Result<bool, BodyError> {
        loop {
            match self {
                Self::Length(remaining) => {
                    let take = (*remaining).min(input.len() as u64) as usize;
                    out.extend(input.drain(..take));
                    *remaining -= take as u64;
                    return Ok(*remaining == 0);
                }
                Self::Chunked(state) => match state {
                    ChunkState::Size => {
                        let line = match take_line(input)? {
                            Some(line) => line,
                            None => return Ok(false),
                        };
                        let size = line.split(';').next().unwrap_or("").trim();
                        let size =
                            u64::from_str_radix(size, 16).map_err(|_| BodyError::BadChunkSize)?;
                        *state = if size == 0 {
                            ChunkState::Trailer
                        } else {
                            ChunkState::Data(size)
                        };
                    }
                    ChunkState::Data(remaining) => {
                        if input.is_empty() {
                            return Ok(false);
                        }
                        let take = (*remaining).min(input.len() as u64) as usize;
                        out.extend(input.drain(..take));
                        *remaining -= take as u64;
                        if *remaining == 0 {
                            *state = ChunkState::DataEnd;
                        }
                    }
                    ChunkState::DataEnd => match take_line(input)? {
                        Some(line) if line.is_empty() => *state = ChunkState::Size,
                        Some(_) => return Err(BodyError::BadChunkSize),
                        None => return Ok(false),
                    },
                    ChunkState::Trailer => match take_line(input)? {
                        Some(line) if line.is_empty() => *state = ChunkState::Done,
                        Some(_) => {}
                        None => return Ok(false),
                    },
                    ChunkState::Done => return Ok(true),
                },
            }
        }
    }
}

fn take_line(input: &mut Vec<u8>) -> Result<Option<String>, BodyError> {
    match input.iter().position(|&b| b == b'\n') {
        Some(pos) => {
            let mut line: Vec<u8> = input.drain(..=pos).collect();
            line.pop();
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            Ok(Some(String::from_utf8_lossy(&line).into_owned()))
        }
        None if input.len() > MAX_CHUNK_LINE => Err(BodyError::LineTooLong),
        None => Ok(None),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("GET / HTTP/1.1", "GET", "/", HttpVersion::V1_1 ; "http 1.1")]
    #[test_case("POST /ipp HTTP/1.0", "POST", "/ipp", HttpVersion::V1_0 ; "http 1.0")]
    #[test_case("GET /index.html", "GET", "/index.html", HttpVersion::V0_9 ; "two tokens")]
    #[test_case("GET  /a   HTTP/1.1  extra", "GET", "/a", HttpVersion::V1_1 ; "extra whitespace")]
    fn request_line_parses(line: &str, method: &str, uri: &str, version: HttpVersion) {
        assert_eq!(
            parse_request_line(line),
            Ok(RequestLine {
                method,
                uri,
                version
            })
        );
    }

    #[test_case("GET" ; "one token")]
    #[test_case("GET / HTTX/1.1" ; "bad protocol")]
    #[test_case("GET / HTTP/1" ; "missing minor")]
    fn malformed_request_line_is_rejected(line: &str) {
        assert_eq!(parse_request_line(line), Err(RequestLineError::Malformed));
    }

    #[test]
    fn http_2_is_unsupported() {
        assert_eq!(
            parse_request_line("GET / HTTP/2.0"),
            Err(RequestLineError::UnsupportedVersion("HTTP/2.0".to_string()))
        );
    }

    #[test]
    fn overlong_uri_is_rejected() {
        let line = format!("GET /{} HTTP/1.1", "a".repeat(MAX_URI));
        assert_eq!(parse_request_line(&line), Err(RequestLineError::Malformed));
    }

    #[test]
    fn fields_are_case_insensitive_and_last_wins() {
        let mut fields = Fields::default();
        fields.set("content-length", "10");
        fields.set("Content-Length", "12");
        fields.set("HOST", "localhost:631");
        assert_eq!(fields.content_length(), Some(12));
        assert_eq!(fields.host(), Some("localhost:631"));
        assert_eq!(fields.get("X-Unknown"), None);
    }

    #[test]
    fn negative_content_length_is_preserved() {
        let mut fields = Fields::default();
        fields.set("Content-Length", "-5");
        assert_eq!(fields.content_length(), Some(-5));
    }

    #[test]
    fn field_line_splits() {
        assert_eq!(
            parse_field_line("Content-Type:  application/ipp "),
            Some(("Content-Type", "application/ipp"))
        );
        assert_eq!(parse_field_line("no colon here"), None);
        assert_eq!(parse_field_line("Bad Name: x"), None);
    }

    #[test]
    fn status_reason_and_wire_code() {
        assert_eq!(Status::REQUEST_TOO_LARGE.to_string(), "413 Request Entity Too Large");
        assert_eq!(Status::WEB_INTERFACE_DISABLED.to_string(), "200 OK");
        assert!(Status::WEB_INTERFACE_DISABLED.is_error());
        assert_eq!(Status(299).to_string(), "299 Unknown");
    }

    #[test]
    fn length_body_leaves_pipelined_bytes() {
        let mut decoder = BodyDecoder::length(5);
        let mut input = b"helloGET / HTTP/1.1\r\n".to_vec();
        let mut out = Vec::new();
        assert_eq!(decoder.decode(&mut input, &mut out), Ok(true));
        assert_eq!(out, b"hello");
        assert_eq!(input, b"GET / HTTP/1.1\r\n");
    }

    #[test]
    fn chunked_body_decodes_across_reads() {
        let mut decoder = BodyDecoder::chunked();
        let mut out = Vec::new();
        let mut input = b"5\r\nhel".to_vec();
        assert_eq!(decoder.decode(&mut input, &mut out), Ok(false));
        input.extend(b"lo\r\n3;ext=1\r\n wo\r\n0\r\n");
        assert_eq!(decoder.decode(&mut input, &mut out), Ok(false));
        input.extend(b"X-Trailer: 1\r\n\r\nnext");
        assert_eq!(decoder.decode(&mut input, &mut out), Ok(true));
        assert_eq!(out, b"hello wo");
        assert_eq!(input, b"next");
        assert!(decoder.is_done());
    }

    #[test]
    fn chunked_body_rejects_bad_size() {
        let mut decoder = BodyDecoder::chunked();
        let mut input = b"zz\r\n".to_vec();
        assert_eq!(
            decoder.decode(&mut input, &mut Vec::new()),
            Err(BodyError::BadChunkSize)
        );
    }
}
