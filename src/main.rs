use std::net::{AddrParseError, IpAddr, Ipv4Addr, SocketAddr, TcpListener};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context as _, Result};
use log::info;
use nix::sys::signal::{signal, SigHandler, Signal};

use printd::config::{CommandLine, Config};
use printd::ipp::NotSupported;
use printd::server::{Context, Server};
use printd::transport::Listener;

/// Longest a `select()` waits, so idle connections and exited children are noticed.
const TICK: Duration = Duration::from_secs(1);

static RUNNING: AtomicBool = AtomicBool::new(true);

extern "C" fn stop_running(_signal: libc::c_int) {
    RUNNING.store(false, Ordering::Relaxed);
}

fn is_running() -> bool {
    RUNNING.load(Ordering::Relaxed)
}

fn main() -> Result<()> {
    println!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION"));

    let command_line = CommandLine::from_command_line()?;
    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(command_line.log_level.as_str()),
    )
    .init();

    let CommandLine {
        config,
        directory,
        mime_map,
        authorizer,
        log_sink,
        ..
    } = command_line;

    let listeners = create_listeners(&config)?;

    // set signal handlers
    unsafe { signal(Signal::SIGPIPE, SigHandler::SigIgn) }
        .context("failed to set SIGPIPE handler")?;
    unsafe { signal(Signal::SIGINT, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGINT handler")?;
    unsafe { signal(Signal::SIGTERM, SigHandler::Handler(stop_running)) }
        .context("failed to set SIGTERM handler")?;

    let ctx = Context::new(
        config,
        Box::new(directory),
        Box::new(mime_map),
        Box::new(authorizer),
        Box::new(NotSupported),
        log_sink,
    )
    .context("failed to create child status pipe")?;
    let mut server = Server::new(ctx, listeners);

    // main loop
    while is_running() {
        if let Err(e) = server.poll(TICK) {
            server.shutdown();
            return Err(e).context("stopping server");
        }
        if server.take_reload() {
            info!("Configuration file was replaced, scheduling reload.");
        }
    }

    server.shutdown();
    Ok(())
}

fn socket_addr(config: &Config) -> Result<SocketAddr, AddrParseError> {
    let ip = match config.addr.as_deref() {
        Some(addr) => IpAddr::from_str(addr)?,
        None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
    };
    Ok(SocketAddr::new(ip, config.port))
}

/// The TCP listener, plus the local-domain socket when one is configured.
fn create_listeners(config: &Config) -> Result<Vec<Listener>> {
    let socket_addr = socket_addr(config).context("malformed --addr argument")?;
    // Sets `SO_REUSEADDR` implicitly.
    let tcp = TcpListener::bind(socket_addr)
        .with_context(|| format!("failed to create listening socket for {}", socket_addr))?;
    let local_addr = tcp.local_addr().context("failed to get listening address")?;
    let mut listeners = vec![Listener::tcp(tcp).context("failed to configure listener")?];
    println!("listening on: http://{}/", local_addr);

    if let Some(path) = &config.listen_socket {
        listeners.push(
            Listener::local(path)
                .with_context(|| format!("failed to listen on {}", path.display()))?,
        );
        println!("listening on: {}", path.display());
    }
    Ok(listeners)
}
