//! Request core of a print server: HTTP/1.x connections carrying web pages, IPP requests and
//! CGI programs, driven by a single-threaded `select()` loop.

pub mod cgi;
pub mod config;
pub mod connection;
pub mod host;
pub mod http;
pub mod ipp;
pub mod locale;
pub mod process;
pub mod resolver;
pub mod response;
pub mod server;
pub mod services;
pub mod spool;
pub mod transport;
pub mod util;
