#![allow(dead_code)]

use std::collections::HashMap;
use std::fs::{create_dir_all, set_permissions, write, Permissions};
use std::io;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread::sleep;
use std::time::Duration;
use tempfile::{tempdir, TempDir};

#[macro_export]
macro_rules! map {
    ($($k:expr => $v:expr),* $(,)?) => {
        std::iter::Iterator::collect(std::array::IntoIter::new([$(($k, $v),)*]))
    };
}

fn get_unused_port() -> Option<u16> {
    TcpListener::bind(("localhost", 0))
        .ok()
        .map(|listener| listener.local_addr().unwrap().port())
}

fn wait_for_port(port: u16) -> bool {
    for _ in 0..1000 {
        if TcpStream::connect(("localhost", port)).is_ok() {
            return true;
        }
        sleep(Duration::from_millis(1));
    }
    false
}

struct ScopedChild(Child);

impl Drop for ScopedChild {
    fn drop(&mut self) {
        self.0.kill().ok();
        self.0.wait().ok();
    }
}

impl From<Child> for ScopedChild {
    fn from(child: Child) -> Self {
        ScopedChild(child)
    }
}

/// A running printd over a temporary tree:
///
/// ```text
/// www/            document root
/// spool/          request bodies
/// bin/cgi-bin/    web interface programs
/// etc/            server root, holds cupsd.conf
/// ```
pub struct Server {
    _child: ScopedChild,
    port: u16,
    root: TempDir,
}

impl Server {
    pub fn new() -> Self {
        Self::with_args(&[])
    }

    pub fn with_args(args: &[&str]) -> Self {
        Self::with_setup(|_| args.iter().map(|arg| arg.to_string()).collect())
    }

    /// Start the server after `setup` has populated the tree. `setup` returns extra flags.
    pub fn with_setup(setup: impl FnOnce(&Path) -> Vec<String>) -> Self {
        let root = tempdir().expect("failed to create tempdir");
        for dir in &["www", "spool", "bin/cgi-bin", "etc"] {
            create_dir_all(root.path().join(dir)).expect("failed to create directory");
        }
        let args = setup(root.path());

        // Get an unused port. Assumes the port won't be reused before we start printd.
        let port = get_unused_port().expect("failed to get unused port");
        let path = |relative: &str| {
            root.path()
                .join(relative)
                .to_str()
                .expect("path is not valid UTF-8")
                .to_string()
        };

        let child = Command::new(env!("CARGO_BIN_EXE_printd"))
            .args(&[
                path("www").as_str(),
                "--port",
                &format!("{}", port),
                "--addr",
                "127.0.0.1",
                "--server-name",
                "printsrv",
                "--request-root",
                &path("spool"),
                "--server-bin",
                &path("bin"),
                "--server-root",
                &path("etc"),
                "--conf",
                &path("etc/cupsd.conf"),
            ])
            .args(args)
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .expect("failed to spawn printd")
            .into();

        // Wait until the socket is open.
        assert!(wait_for_port(port), "failed to connect to printd");

        Self {
            _child: child,
            port,
            root,
        }
    }

    pub fn root(&self) -> &Path {
        self.root.path()
    }

    pub fn path(&self, relative: &str) -> PathBuf {
        self.root().join(relative)
    }

    pub fn stream(&self) -> TcpStream {
        let stream =
            TcpStream::connect(("localhost", self.port)).expect("failed to connect to printd");
        // Set timeouts to prevent tests from hanging
        stream
            .set_read_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
            .set_write_timeout(Some(Duration::from_secs(5)))
            .unwrap();
        stream
    }

    /// Send raw request bytes on a new connection and read one response.
    pub fn request(&self, request: &[u8]) -> Response {
        let mut stream = self.stream();
        stream.write_all(request).unwrap();
        Response::from_reader(&mut stream).expect("failed to read response")
    }

    pub fn send(&self, method: &str, path: &str, headers: HashMap<&str, &str>) -> Response {
        let mut request = format!("{} {} HTTP/1.1\r\nHost: localhost\r\n", method, path);
        for (header_name, header_value) in headers {
            request.push_str(&format!("{}: {}\r\n", header_name, header_value));
        }
        request.push_str("\r\n");
        self.request(request.as_bytes())
    }

    pub fn get(&self, path: &str, headers: HashMap<&str, &str>) -> Response {
        self.send("GET", path, headers)
    }

    /// A HEAD response: whatever the fields say, no body follows.
    pub fn head(&self, path: &str) -> Response {
        let mut stream = self.stream();
        write!(stream, "HEAD {} HTTP/1.1\r\nHost: localhost\r\n\r\n", path).unwrap();
        Response::head_from_reader(&mut stream).expect("failed to read response")
    }
}

/// Write an executable shell script into `bin/cgi-bin`.
pub fn write_script(root: &Path, name: &str, body: &str) {
    let path = root.join("bin/cgi-bin").join(name);
    write(&path, format!("#!/bin/sh\n{}", body)).expect("failed to write script");
    set_permissions(&path, Permissions::from_mode(0o755)).expect("failed to chmod script");
}

/// HTTP Response from printd.
pub struct Response {
    response_line: String,
    headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl Response {
    pub fn from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let mut response = Self::head_from_reader(reader)?;
        response.body = if response.header("Transfer-Encoding") == Some("chunked") {
            Self::read_chunks(reader)?
        } else if let Some(length) = response.header("Content-Length") {
            let length = length.parse::<usize>().expect("invalid content length");
            Self::read_body(reader, length)?
        } else {
            let mut body = Vec::new();
            reader.read_to_end(&mut body)?;
            body
        };
        Ok(response)
    }

    pub fn head_from_reader<R: Read>(reader: &mut R) -> io::Result<Self> {
        let response_line = Self::read_header(reader)?;
        let headers = Self::read_headers(reader)?;
        Ok(Self {
            response_line,
            headers,
            body: Vec::new(),
        })
    }

    fn read_headers<R: Read>(reader: &mut R) -> io::Result<HashMap<String, String>> {
        let mut headers = HashMap::new();
        loop {
            let header_line = Self::read_header(reader)?;
            if header_line.is_empty() {
                break;
            }
            let mut header = header_line.splitn(2, ": ");
            let key = header.next().expect("invalid header").to_string();
            let value = header.next().expect("invalid header").to_string();
            headers.insert(key, value);
        }
        Ok(headers)
    }

    fn read_header<R: Read>(reader: &mut R) -> io::Result<String> {
        read_until_slice(reader, b"\r\n")
            .map(|vec| String::from_utf8(vec).expect("response header is not valid UTF-8"))
    }

    fn read_body<R: Read>(reader: &mut R, content_length: usize) -> io::Result<Vec<u8>> {
        let mut body = vec![0; content_length];
        reader.read_exact(&mut body)?;
        Ok(body)
    }

    fn read_chunks<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
        let mut body = Vec::new();
        loop {
            let size = Self::read_header(reader)?;
            let size = usize::from_str_radix(size.trim(), 16).expect("invalid chunk size");
            if size == 0 {
                Self::read_header(reader)?;
                return Ok(body);
            }
            body.extend(Self::read_body(reader, size)?);
            Self::read_header(reader)?;
        }
    }

    pub fn status(&self) -> &str {
        self.response_line
            .splitn(2, ' ')
            .nth(1)
            .expect("invalid response line")
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(|name| name.as_str())
    }

    pub fn text(&self) -> &str {
        std::str::from_utf8(&self.body).expect("body is not valid UTF-8")
    }
}

fn read_until_slice<R: Read>(reader: &mut R, separator: &[u8]) -> io::Result<Vec<u8>> {
    let mut byte = [0; 1];
    let mut buf = Vec::new();
    loop {
        reader.read_exact(&mut byte)?;
        buf.push(byte[0]);
        if buf.as_slice().ends_with(separator) {
            buf.truncate(buf.len() - separator.len());
            return Ok(buf);
        }
    }
}
