use std::fs::OpenOptions;
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use nix::unistd::{getuid, Gid, Group, Uid, User};

use crate::services::{AuthType, MimeMap, PolicyAuthorizer, StaticDirectory};
use crate::util::LogSink;

/// Resource a client PUTs to replace the server configuration file.
pub const ADMIN_CONF_RESOURCE: &str = "/admin/conf/cupsd.conf";

const DEFAULT_PORT: u16 = 631;
const DEFAULT_MAX_CLIENTS: usize = 100;
const DEFAULT_KEEP_ALIVE_TIMEOUT: u64 = 30;
const DEFAULT_TIMEOUT: u64 = 300;

/// When connections must be encrypted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encryption {
    Never,
    IfRequested,
    Required,
}

/// Interpreters for script types served through the CGI bridge.
#[derive(Clone, Debug, Default)]
pub struct Interpreters {
    pub java: Option<PathBuf>,
    pub perl: Option<PathBuf>,
    pub php: Option<PathBuf>,
    pub python: Option<PathBuf>,
}

impl Interpreters {
    /// Interpreter for an `application/x-httpd-*` subtype.
    pub fn for_type(&self, type_name: &str) -> Option<&Path> {
        match type_name {
            "x-httpd-java" => self.java.as_deref(),
            "x-httpd-perl" => self.perl.as_deref(),
            "x-httpd-php" => self.php.as_deref(),
            "x-httpd-python" => self.python.as_deref(),
            _ => None,
        }
    }

    /// Index file extensions handled by the configured interpreters, in probing order.
    fn index_extensions(&self) -> Vec<&'static str> {
        let mut extensions = Vec::new();
        if self.java.is_some() {
            extensions.push("class");
        }
        if self.perl.is_some() {
            extensions.push("pl");
        }
        if self.php.is_some() {
            extensions.push("php");
        }
        if self.python.is_some() {
            extensions.push("pyc");
            extensions.push("py");
        }
        extensions
    }
}

/// Server settings consulted by the request core.
#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub addr: Option<String>,
    pub listen_socket: Option<PathBuf>,
    pub server_name: String,
    pub server_aliases: Vec<String>,
    pub interface_hostnames: Vec<String>,
    pub dnssd: bool,
    pub document_root: PathBuf,
    pub server_root: PathBuf,
    pub server_bin: PathBuf,
    pub request_root: PathBuf,
    pub cache_dir: PathBuf,
    pub config_file: PathBuf,
    pub config_file_perm: u32,
    pub access_log: Option<PathBuf>,
    pub error_log: Option<PathBuf>,
    pub page_log: Option<PathBuf>,
    pub max_clients: usize,
    pub max_clients_per_host: usize,
    /// Zero means unlimited.
    pub max_request_size: u64,
    pub keep_alive: bool,
    pub keep_alive_timeout: Duration,
    pub timeout: Duration,
    pub server_header: Option<String>,
    pub default_locale: String,
    pub web_interface: bool,
    pub interpreters: Interpreters,
    /// Explicit index probing order; `None` derives it from the interpreters.
    pub index_order: Option<Vec<String>>,
    pub encryption: Encryption,
    pub auth_type: AuthType,
    /// Identity CGI children run as when the server runs as root.
    pub user: Option<Uid>,
    pub group: Option<Gid>,
    /// Set when the server itself runs unprivileged; relaxes executable ownership checks.
    pub run_user: Option<Uid>,
    /// `PATH` handed to CGI children.
    pub child_path: String,
}

impl Config {
    pub fn new(document_root: &Path) -> Self {
        let uid = getuid();
        Self {
            port: DEFAULT_PORT,
            addr: None,
            listen_socket: None,
            server_name: local_hostname(),
            server_aliases: Vec::new(),
            interface_hostnames: Vec::new(),
            dnssd: false,
            document_root: document_root.to_path_buf(),
            server_root: PathBuf::from("/etc/cups"),
            server_bin: PathBuf::from("/usr/lib/cups"),
            request_root: std::env::temp_dir(),
            cache_dir: PathBuf::from("/var/cache/cups"),
            config_file: PathBuf::from("/etc/cups/cupsd.conf"),
            config_file_perm: 0o640,
            access_log: None,
            error_log: None,
            page_log: None,
            max_clients: DEFAULT_MAX_CLIENTS,
            max_clients_per_host: DEFAULT_MAX_CLIENTS,
            max_request_size: 0,
            keep_alive: true,
            keep_alive_timeout: Duration::from_secs(DEFAULT_KEEP_ALIVE_TIMEOUT),
            timeout: Duration::from_secs(DEFAULT_TIMEOUT),
            server_header: Some(format!(
                "{}/{}",
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION")
            )),
            default_locale: "C".to_string(),
            web_interface: true,
            interpreters: Interpreters::default(),
            index_order: None,
            encryption: Encryption::IfRequested,
            auth_type: AuthType::Basic,
            user: None,
            group: None,
            run_user: if uid.is_root() { None } else { Some(uid) },
            child_path: "/usr/bin:/bin".to_string(),
        }
    }

    /// Index file names to probe in a directory, in order.
    pub fn index_names(&self) -> Vec<String> {
        match &self.index_order {
            Some(order) => order
                .iter()
                .map(|extension| format!("index.{}", extension))
                .collect(),
            None => std::iter::once("html")
                .chain(self.interpreters.index_extensions())
                .map(|extension| format!("index.{}", extension))
                .collect(),
        }
    }

    pub fn exceeds_max_request_size(&self, size: u64) -> bool {
        self.max_request_size > 0 && size > self.max_request_size
    }
}

/// Everything the command line configures.
pub struct CommandLine {
    pub config: Config,
    pub directory: StaticDirectory,
    pub mime_map: MimeMap,
    pub authorizer: PolicyAuthorizer,
    pub log_sink: LogSink,
    pub log_level: String,
}

impl CommandLine {
    pub fn from_command_line() -> Result<Self> {
        let mut args = std::env::args();
        let name = args.next().unwrap_or_else(|| env!("CARGO_PKG_NAME").to_string());
        Self::parse(&name, args)
    }

    pub fn parse<I: Iterator<Item = String>>(name: &str, mut args: I) -> Result<Self> {
        let document_root = match args.next().as_deref() {
            None | Some("--help") => {
                usage(name); // no document root given
                std::process::exit(0);
            }
            Some(root) => PathBuf::from(root.trim_end_matches('/')),
        };
        let mut config = Config::new(&document_root);
        let mut directory = StaticDirectory::default();
        let mut mime_map = MimeMap::default();
        let mut credentials = None;
        let mut protected = Vec::new();
        let mut system_group = Vec::new();
        let mut log_sink = LogSink::Stdout;
        let mut log_level = "info".to_string();

        while let Some(arg) = args.next() {
            let mut value = |what: &str| {
                args.next()
                    .with_context(|| format!("missing {} after {}", what, arg))
            };
            match arg.as_str() {
                "--port" => config.port = parse_number(&value("number")?, "port")?,
                "--addr" => config.addr = Some(value("ip")?),
                "--listen-socket" => config.listen_socket = Some(value("path")?.into()),
                "--server-name" => config.server_name = value("name")?,
                "--server-alias" => config.server_aliases.push(value("name")?),
                "--interface-hostname" => config.interface_hostnames.push(value("name")?),
                "--dnssd" => config.dnssd = true,
                "--server-root" => config.server_root = value("directory")?.into(),
                "--server-bin" => config.server_bin = value("directory")?.into(),
                "--request-root" => config.request_root = value("directory")?.into(),
                "--cache-dir" => config.cache_dir = value("directory")?.into(),
                "--conf" => config.config_file = value("filename")?.into(),
                "--access-log" => config.access_log = Some(value("filename")?.into()),
                "--error-log" => config.error_log = Some(value("filename")?.into()),
                "--page-log" => config.page_log = Some(value("filename")?.into()),
                "--maxclients" => {
                    config.max_clients = parse_number(&value("number")?, "maxclients")?
                }
                "--maxclients-per-host" => {
                    config.max_clients_per_host =
                        parse_number(&value("number")?, "maxclients-per-host")?
                }
                "--max-request-size" => {
                    config.max_request_size =
                        parse_number(&value("number")?, "max-request-size")?
                }
                "--no-keepalive" => config.keep_alive = false,
                "--keepalive-timeout" => {
                    config.keep_alive_timeout = Duration::from_secs(parse_number(
                        &value("number")?,
                        "keepalive-timeout",
                    )?)
                }
                "--timeout" => {
                    config.timeout =
                        Duration::from_secs(parse_number(&value("number")?, "timeout")?)
                }
                "--no-server-id" => config.server_header = None,
                "--default-locale" => config.default_locale = value("locale")?,
                "--no-web-interface" => config.web_interface = false,
                "--java" => config.interpreters.java = Some(value("path")?.into()),
                "--perl" => config.interpreters.perl = Some(value("path")?.into()),
                "--php" => config.interpreters.php = Some(value("path")?.into()),
                "--python" => config.interpreters.python = Some(value("path")?.into()),
                "--index-order" => {
                    config.index_order = Some(
                        value("list")?
                            .split(',')
                            .map(str::trim)
                            .filter(|extension| !extension.is_empty())
                            .map(str::to_string)
                            .collect(),
                    )
                }
                "--auth" => {
                    let user_pass = value("user:pass")?;
                    if !user_pass.contains(':') {
                        return Err(anyhow!("expected user:pass after --auth"));
                    }
                    credentials = Some(user_pass);
                }
                "--auth-type" => {
                    let scheme = value("scheme")?;
                    config.auth_type = AuthType::parse(&scheme)
                        .with_context(|| format!("unknown auth type `{}'", scheme))?;
                }
                "--protect" => protected.push(value("prefix")?),
                "--system-group-prefix" => system_group.push(value("prefix")?),
                "--encryption" => {
                    config.encryption = match value("mode")?.as_str() {
                        "never" => Encryption::Never,
                        "if-requested" => Encryption::IfRequested,
                        "required" => Encryption::Required,
                        other => return Err(anyhow!("unknown encryption mode `{}'", other)),
                    }
                }
                "--printer" => directory.add_printer(&value("name")?),
                "--class" => {
                    let spec = value("name:members")?;
                    let mut parts = spec.splitn(2, ':');
                    let class = parts.next().unwrap_or("");
                    let members: Vec<&str> = parts
                        .next()
                        .map(|members| members.split(',').collect())
                        .unwrap_or_default();
                    directory.add_class(class, &members);
                }
                "--mimetypes" => mime_map.parse_extension_map_file(Path::new(&value("filename")?))?,
                "--default-mimetype" => mime_map.default_mimetype = Some(value("string")?),
                "--user" => config.user = Some(lookup_user(&value("uid")?)?),
                "--group" => config.group = Some(lookup_group(&value("gid")?)?),
                "--log" => {
                    let filename = value("filename")?;
                    log_sink = LogSink::File(BufWriter::new(
                        OpenOptions::new()
                            .append(true)
                            .create(true)
                            .open(&filename)
                            .with_context(|| format!("failed to open log file {}", filename))?,
                    ))
                }
                "--syslog" => log_sink = LogSink::Syslog,
                "--log-level" => log_level = value("level")?,
                _ => {
                    return Err(anyhow!("unknown argument `{}'", arg));
                }
            }
        }

        let mut authorizer = PolicyAuthorizer::new(config.auth_type);
        if let Some(user_pass) = credentials {
            authorizer.set_credentials(&user_pass);
        }
        for prefix in &protected {
            authorizer.protect(prefix);
        }
        for prefix in &system_group {
            authorizer.restrict_to_system_group(prefix);
        }

        Ok(Self {
            config,
            directory,
            mime_map,
            authorizer,
            log_sink,
            log_level,
        })
    }
}

fn parse_number<T: std::str::FromStr>(number: &str, what: &str) -> Result<T> {
    number
        .parse()
        .map_err(|_| anyhow!("{} number {} is invalid", what, number))
}

fn lookup_user(uid: &str) -> Result<Uid> {
    let user1 = User::from_name(uid).context("getpwnam failed")?;
    let user2 = uid
        .parse()
        .ok()
        .and_then(|uid| User::from_uid(Uid::from_raw(uid)).transpose())
        .transpose()
        .context("getpwuid failed")?;
    let user = user1
        .or(user2)
        .with_context(|| format!("no such uid: `{}'", uid))?;
    Ok(user.uid)
}

fn lookup_group(gid: &str) -> Result<Gid> {
    let group1 = Group::from_name(gid).context("getgrnam failed")?;
    let group2 = gid
        .parse()
        .ok()
        .and_then(|gid| Group::from_gid(Gid::from_raw(gid)).transpose())
        .transpose()
        .context("getgrgid failed")?;
    let group = group1
        .or(group2)
        .with_context(|| format!("no such gid: `{}'", gid))?;
    Ok(group.gid)
}

fn local_hostname() -> String {
    let mut buf = [0u8; 256];
    nix::unistd::gethostname(&mut buf)
        .ok()
        .and_then(|name| name.to_str().ok())
        .filter(|name| !name.is_empty())
        .unwrap_or("localhost")
        .to_string()
}

fn usage(argv0: &str) {
    print!(
        "usage:\t{} /path/to/docroot [flags]\n\n\
        flags:\t--port number (default: {})\n\
        \t\tTCP port to listen on. Pass 0 to let the system choose.\n\n\
        \t--addr ip (default: all)\n\
        \t\tAddress to bind the listening port to.\n\n\
        \t--listen-socket path (optional)\n\
        \t\tAlso listen on a local domain socket.\n\n\
        \t--server-name name, --server-alias name, --interface-hostname name\n\
        \t\tNames clients may use in the Host: field. An alias of * accepts any.\n\n\
        \t--dnssd\n\
        \t\tAccept .local host names.\n\n\
        \t--server-root dir, --server-bin dir, --request-root dir, --cache-dir dir\n\
        \t\tConfiguration, program, spool and cache directories.\n\n\
        \t--conf filename\n\
        \t\tConfiguration file replaced by PUT {}.\n\n\
        \t--access-log file, --error-log file, --page-log file\n\
        \t\tLog files published under /admin/log/.\n\n\
        \t--maxclients number (default: {}), --maxclients-per-host number\n\
        \t\tLimits on simultaneous connections.\n\n\
        \t--max-request-size bytes (default: unlimited)\n\
        \t\tLargest request body accepted.\n\n\
        \t--no-keepalive, --keepalive-timeout secs (default: {}), --timeout secs (default: {})\n\
        \t\tConnection reuse and idle limits.\n\n\
        \t--no-server-id\n\
        \t\tDon't identify the server type in headers.\n\n\
        \t--default-locale locale (default: C), --no-web-interface\n\n\
        \t--java path, --perl path, --php path, --python path\n\
        \t\tInterpreters for script files.\n\n\
        \t--index-order ext,ext,...\n\
        \t\tIndex file extensions to try in a directory.\n\n\
        \t--auth user:pass, --auth-type basic|digest|negotiate, --protect prefix,\n\
        \t--system-group-prefix prefix\n\
        \t\tAuthentication for protected resources.\n\n\
        \t--encryption never|if-requested|required\n\n\
        \t--printer name, --class name:member,member\n\
        \t\tQueues served under /printers and /classes.\n\n\
        \t--mimetypes filename, --default-mimetype string\n\
        \t\tExtension to MIME type associations.\n\n\
        \t--user uid/uname, --group gid/gname\n\
        \t\tIdentity for CGI programs when running as root.\n\n\
        \t--log filename, --syslog\n\
        \t\tWhere to write the access log (default: stdout).\n\n\
        \t--log-level level (default: info)\n\n",
        argv0,
        DEFAULT_PORT,
        ADMIN_CONF_RESOURCE,
        DEFAULT_MAX_CLIENTS,
        DEFAULT_KEEP_ALIVE_TIMEOUT,
        DEFAULT_TIMEOUT,
    );
}
