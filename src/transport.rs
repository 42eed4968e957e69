//! Byte-stream transport: non-blocking sockets behind a small trait, plus the buffered HTTP
//! stream every connection reads requests from and writes responses to.

use std::io::{self, Read, Write};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};

use nix::sys::socket::{self, MsgFlags};

/// Longest request or header line kept in the input buffer.
pub const MAX_LINE: usize = 32 * 1024;

/// Stop reading from the socket once this much unconsumed input is buffered.
pub const MAX_BUFFERED: usize = 64 * 1024;

/// A connected, non-blocking socket.
///
/// TLS lives behind this trait; plain sockets report that they cannot start it.
pub trait Transport: Read + Write {
    fn raw_fd(&self) -> RawFd;

    /// Read without consuming.
    fn peek(&self, buf: &mut [u8]) -> io::Result<usize>;

    fn is_encrypted(&self) -> bool {
        false
    }

    fn can_start_tls(&self) -> bool {
        false
    }

    fn start_tls(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Other,
            "TLS is not available on this transport",
        ))
    }
}

impl Transport for TcpStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        TcpStream::peek(self, buf)
    }
}

impl Transport for UnixStream {
    fn raw_fd(&self) -> RawFd {
        self.as_raw_fd()
    }

    fn peek(&self, buf: &mut [u8]) -> io::Result<usize> {
        socket::recv(self.as_raw_fd(), buf, MsgFlags::MSG_PEEK)
            .map_err(|e| io::Error::from_raw_os_error(e.as_errno().map_or(libc::EIO, |e| e as i32)))
    }
}

/// Who is on the other end of a connection.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientAddr {
    Ip(SocketAddr),
    /// A local-domain socket; always treated as loopback.
    Local,
}

impl ClientAddr {
    pub fn is_loopback(&self) -> bool {
        match self {
            Self::Ip(addr) => match addr.ip() {
                IpAddr::V4(ip) => ip.is_loopback(),
                IpAddr::V6(ip) => {
                    ip.is_loopback() || ip.to_ipv4().map_or(false, |ip| ip.is_loopback())
                }
            },
            Self::Local => true,
        }
    }

    pub fn ip(&self) -> IpAddr {
        match self {
            Self::Ip(addr) => addr.ip(),
            Self::Local => IpAddr::V4(Ipv4Addr::LOCALHOST),
        }
    }

    pub fn port(&self) -> u16 {
        match self {
            Self::Ip(addr) => addr.port(),
            Self::Local => 0,
        }
    }

    /// Host name as used for logging and `REMOTE_HOST`; no lookups are done.
    pub fn hostname(&self) -> String {
        if self.is_loopback() {
            "localhost".to_string()
        } else {
            self.ip().to_string()
        }
    }
}

impl std::fmt::Display for ClientAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(addr) => write!(f, "{}", addr.ip()),
            Self::Local => write!(f, "localhost"),
        }
    }
}

/// A listening socket.
#[derive(Debug)]
pub enum Listener {
    Tcp(TcpListener),
    Local(UnixListener, PathBuf),
}

/// A freshly accepted connection.
pub struct Accepted {
    pub transport: Box<dyn Transport>,
    pub peer: ClientAddr,
    /// Name and port the client used to reach us.
    pub server_name: String,
    pub server_port: u16,
}

impl Listener {
    pub fn local(path: &Path) -> io::Result<Self> {
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        let listener = UnixListener::bind(path)?;
        listener.set_nonblocking(true)?;
        Ok(Self::Local(listener, path.to_path_buf()))
    }

    pub fn tcp(listener: TcpListener) -> io::Result<Self> {
        listener.set_nonblocking(true)?;
        Ok(Self::Tcp(listener))
    }

    pub fn raw_fd(&self) -> RawFd {
        match self {
            Self::Tcp(listener) => listener.as_raw_fd(),
            Self::Local(listener, _) => listener.as_raw_fd(),
        }
    }

    pub fn accept(&self, server_name: &str) -> io::Result<Accepted> {
        match self {
            Self::Tcp(listener) => {
                let (stream, addr) = listener.accept()?;
                stream.set_nonblocking(true)?;
                let local = stream.local_addr()?;
                let peer = ClientAddr::Ip(addr);
                let server_name = if peer.is_loopback() {
                    "localhost".to_string()
                } else {
                    server_name.to_string()
                };
                Ok(Accepted {
                    transport: Box::new(stream),
                    peer,
                    server_name,
                    server_port: local.port(),
                })
            }
            Self::Local(listener, _) => {
                let (stream, _) = listener.accept()?;
                stream.set_nonblocking(true)?;
                Ok(Accepted {
                    transport: Box::new(stream),
                    peer: ClientAddr::Local,
                    server_name: "localhost".to_string(),
                    server_port: 0,
                })
            }
        }
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if let Self::Local(_, path) = self {
            std::fs::remove_file(path).ok();
        }
    }
}

/// A transport with HTTP read/write buffering.
pub struct HttpStream {
    transport: Box<dyn Transport>,
    rbuf: Vec<u8>,
    wbuf: Vec<u8>,
    eof: bool,
    /// Body output is chunk-encoded.
    pub chunked: bool,
    bytes_out: u64,
}

impl HttpStream {
    pub fn new(transport: Box<dyn Transport>) -> Self {
        Self {
            transport,
            rbuf: Vec::new(),
            wbuf: Vec::new(),
            eof: false,
            chunked: false,
            bytes_out: 0,
        }
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn transport_mut(&mut self) -> &mut dyn Transport {
        self.transport.as_mut()
    }

    pub fn raw_fd(&self) -> RawFd {
        self.transport.raw_fd()
    }

    pub fn wants_input(&self) -> bool {
        !self.eof && self.rbuf.len() < MAX_BUFFERED
    }

    pub fn buffered(&self) -> &[u8] {
        &self.rbuf
    }

    pub fn input(&mut self) -> &mut Vec<u8> {
        &mut self.rbuf
    }

    /// Read whatever the socket has into the input buffer. Returns the number of bytes read;
    /// zero means the peer closed its side.
    pub fn fill(&mut self) -> io::Result<usize> {
        let mut buf = [0; 1 << 15];
        match self.transport.read(&mut buf) {
            Ok(0) => {
                self.eof = true;
                Ok(0)
            }
            Ok(n) => {
                self.rbuf.extend_from_slice(&buf[..n]);
                Ok(n)
            }
            Err(e) => Err(e),
        }
    }

    /// Take one line from the input buffer, without its CR/LF.
    ///
    /// Returns `Ok(None)` until a full line is buffered, and an error if the line is longer than
    /// [`MAX_LINE`].
    pub fn gets(&mut self) -> io::Result<Option<String>> {
        match self.rbuf.iter().position(|&b| b == b'\n') {
            Some(pos) if pos <= MAX_LINE => {
                let mut line: Vec<u8> = self.rbuf.drain(..=pos).collect();
                line.pop();
                if line.last() == Some(&b'\r') {
                    line.pop();
                }
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None if self.rbuf.len() <= MAX_LINE => Ok(None),
            _ => Err(io::Error::new(io::ErrorKind::InvalidData, "line too long")),
        }
    }

    /// Queue header text.
    pub fn print(&mut self, text: &str) {
        self.wbuf.extend_from_slice(text.as_bytes());
    }

    /// Queue body bytes, chunk-encoded if enabled.
    pub fn write_body(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if self.chunked {
            self.wbuf
                .extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
            self.wbuf.extend_from_slice(data);
            self.wbuf.extend_from_slice(b"\r\n");
        } else {
            self.wbuf.extend_from_slice(data);
        }
    }

    /// Queue the terminating zero-length chunk.
    pub fn finish_chunks(&mut self) {
        if self.chunked {
            self.wbuf.extend_from_slice(b"0\r\n\r\n");
            self.chunked = false;
        }
    }

    pub fn has_pending_output(&self) -> bool {
        !self.wbuf.is_empty()
    }

    pub fn pending_output(&self) -> usize {
        self.wbuf.len()
    }

    pub fn bytes_out(&self) -> u64 {
        self.bytes_out
    }

    /// Write as much queued output as the socket takes. Returns `true` once everything is out.
    pub fn flush(&mut self) -> io::Result<bool> {
        while !self.wbuf.is_empty() {
            match self.transport.write(&self.wbuf) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => {
                    self.wbuf.drain(..n);
                    self.bytes_out += n as u64;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(false),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(true)
    }

    pub fn shutdown(&mut self) {
        self.rbuf.clear();
        self.wbuf.clear();
        self.transport.flush().ok();
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn pair() -> (HttpStream, UnixStream) {
        let (ours, theirs) = UnixStream::pair().unwrap();
        ours.set_nonblocking(true).unwrap();
        (HttpStream::new(Box::new(ours)), theirs)
    }

    #[test]
    fn gets_waits_for_complete_lines() {
        let (mut stream, mut peer) = pair();
        peer.write_all(b"GET / HTTP/1.1\r\nHo").unwrap();
        stream.fill().unwrap();
        assert_eq!(stream.gets().unwrap().as_deref(), Some("GET / HTTP/1.1"));
        assert_eq!(stream.gets().unwrap(), None);
        peer.write_all(b"st: x\n").unwrap();
        stream.fill().unwrap();
        assert_eq!(stream.gets().unwrap().as_deref(), Some("Host: x"));
    }

    #[test]
    fn fill_reports_would_block_and_eof() {
        let (mut stream, peer) = pair();
        let err = stream.fill().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
        drop(peer);
        assert_eq!(stream.fill().unwrap(), 0);
        assert!(!stream.wants_input());
    }

    #[test]
    fn chunked_body_is_framed() {
        let (mut stream, mut peer) = pair();
        stream.chunked = true;
        stream.write_body(b"hello");
        stream.write_body(b"");
        stream.finish_chunks();
        assert!(stream.flush().unwrap());
        drop(stream);
        let mut out = Vec::new();
        peer.read_to_end(&mut out).unwrap();
        assert_eq!(out, b"5\r\nhello\r\n0\r\n\r\n");
    }

    #[test]
    fn local_peers_are_loopback() {
        assert!(ClientAddr::Local.is_loopback());
        assert!(ClientAddr::Ip("[::1]:631".parse().unwrap()).is_loopback());
        assert!(!ClientAddr::Ip("192.168.1.20:5000".parse().unwrap()).is_loopback());
        assert_eq!(ClientAddr::Ip("10.0.0.1:1".parse().unwrap()).hostname(), "10.0.0.1");
    }
}
