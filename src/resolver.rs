//! Mapping request targets onto the served directories and the CGI programs behind the web
//! interface.

use std::ffi::OsString;
use std::fs::{self, Metadata};
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use log::{debug, error};

use crate::config::Config;
use crate::http::Status;
use crate::locale::Locale;
use crate::services::{Directory, MimeDatabase, MimeType};
use crate::util::{parse_http_date, url_decode};

/// A program to run for a request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CgiProgram {
    pub command: PathBuf,
    /// Script handed to an interpreter as its first argument.
    pub script: Option<PathBuf>,
    /// Trailing path and arguments taken from the URI.
    pub options: Option<String>,
    /// Query of a script URI, passed on as `QUERY_STRING`.
    pub query_string: Option<String>,
}

/// A file found under one of the served directories.
#[derive(Debug)]
pub struct ResolvedFile {
    pub path: PathBuf,
    pub metadata: Metadata,
}

/// What a request target turned out to be.
#[derive(Debug)]
pub enum Resolution {
    File {
        file: ResolvedFile,
        mime_type: Option<MimeType>,
    },
    Cgi(CgiProgram),
    /// Answer with this status and no content.
    Status(Status),
}

/// Reduce an absolute-URI request target to its resource path.
///
/// Only our own name, `localhost` and literal addresses are accepted as hosts; anything else
/// would make us a proxy and gets 405.
pub fn request_path(target: &str, server_name: &str) -> Result<String, Status> {
    if target == "*" || target.starts_with('/') {
        return Ok(target.to_string());
    }
    let colon = target.find(':').ok_or(Status::METHOD_NOT_ALLOWED)?;
    let scheme = &target[..colon];
    let rest = &target[colon + 1..];
    let (authority, resource) = match rest.strip_prefix("//") {
        Some(rest) => match rest.find(|c| c == '/' || c == '?') {
            Some(slash) => (&rest[..slash], &rest[slash..]),
            None => (rest, "/"),
        },
        None => ("", rest),
    };
    let host_port = authority.rsplit('@').next().unwrap_or("");
    let host = if host_port.starts_with('[') {
        host_port.find(']').map_or(host_port, |end| &host_port[..=end])
    } else {
        host_port.split(':').next().unwrap_or("")
    };

    let allowed = scheme.eq_ignore_ascii_case("file")
        || host.eq_ignore_ascii_case(server_name)
        || host.eq_ignore_ascii_case("localhost")
        || host.starts_with(|c: char| c.is_ascii_digit())
        || host.starts_with('[');
    if !allowed {
        return Err(Status::METHOD_NOT_ALLOWED);
    }
    if resource.starts_with('/') {
        Ok(resource.to_string())
    } else {
        Ok(format!("/{}", resource))
    }
}

/// A resource path must start with `/` and may not climb with `..`. Escapes in the path are
/// decoded first so `%2e%2e` counts too.
pub fn is_path_absolute(uri: &str) -> bool {
    let path = uri.split('?').next().unwrap_or("");
    let decoded = url_decode(path);
    let path = String::from_utf8_lossy(&decoded);
    if !path.starts_with('/') {
        return false;
    }
    let mut rest: &str = &path;
    while let Some(index) = rest.find("/..") {
        let after = &rest[index + 3..];
        if after.is_empty() || after.starts_with('/') {
            return false;
        }
        rest = &rest[index + 1..];
    }
    true
}

/// `/admin/conf/` and `/admin/log/` only serve files directly inside them.
fn is_restricted_subdirectory(uri: &str) -> bool {
    ["/admin/conf/", "/admin/log/"].iter().any(|prefix| {
        uri.strip_prefix(prefix)
            .map_or(false, |name| name.is_empty() || name.contains('/'))
    })
}

/// Whether the file changed relative to an `If-Modified-Since: date[; length=N]` value.
pub fn is_modified(if_modified_since: Option<&str>, metadata: &Metadata) -> bool {
    let value = match if_modified_since {
        Some(value) if !value.trim().is_empty() => value,
        _ => return true,
    };
    let mut size = 0u64;
    let mut date = 0i64;
    for part in value.split(';').map(str::trim) {
        if part.len() >= 7 && part[..7].eq_ignore_ascii_case("length=") {
            let digits: String = part[7..].chars().take_while(char::is_ascii_digit).collect();
            size = digits.parse().unwrap_or(0);
        } else if part.starts_with(|c: char| c.is_ascii_alphabetic()) {
            date = parse_http_date(part)
                .and_then(|time| time.duration_since(UNIX_EPOCH).ok())
                .map_or(0, |since| since.as_secs() as i64);
        }
    }
    (size != 0 && size != metadata.len())
        || (date != 0 && date < metadata.mtime())
        || (size == 0 && date == 0)
}

/// Concatenate a URI path onto a directory without `Path::join` discarding the root.
fn under(root: &Path, uri_path: &str) -> PathBuf {
    let mut path = OsString::from(root.as_os_str());
    path.push(uri_path);
    PathBuf::from(path)
}

fn strip_query(uri: &str) -> &str {
    uri.split('?').next().unwrap_or("")
}

/// Resolves request targets against the configuration and collaborators.
pub struct Resolver<'a> {
    pub config: &'a Config,
    pub directory: &'a dyn Directory,
    pub mime: &'a dyn MimeDatabase,
}

impl<'a> Resolver<'a> {
    /// Resolve a GET or HEAD target. `uri` is rewritten in place for queue PPDs and icons, and
    /// gains a trailing `/` when it names a directory.
    pub fn resolve_get(
        &self,
        uri: &mut String,
        locale: &Locale,
        if_modified_since: Option<&str>,
    ) -> Resolution {
        match self.rewrite_queue_file(uri) {
            Some(Ok(rewritten)) => {
                debug!("rewrote {} to {}", uri, rewritten);
                *uri = rewritten;
            }
            Some(Err(status)) => return Resolution::Status(status),
            None if !self.config.web_interface => {
                return Resolution::Status(Status::WEB_INTERFACE_DISABLED)
            }
            None => {}
        }

        if let Some(program) = self.cgi_for_prefix(uri) {
            return Resolution::Cgi(program);
        }
        if is_restricted_subdirectory(uri) {
            error!("Request for subdirectory \"{}\"", uri);
            return Resolution::Status(Status::FORBIDDEN);
        }

        let file = match self.get_file(uri, locale) {
            Some(file) => file,
            None => return Resolution::Status(Status::NOT_FOUND),
        };
        let mime_type = self.mime.classify(&file.path);
        if let Some(program) = self.as_cgi(uri, &file, mime_type.as_ref()) {
            return Resolution::Cgi(program);
        }
        if !is_modified(if_modified_since, &file.metadata) {
            return Resolution::Status(Status::NOT_MODIFIED);
        }
        Resolution::File { file, mime_type }
    }

    /// Resolve the target of a POST that is not an IPP request. Only programs accept posts;
    /// plain files answer 401.
    pub fn resolve_post(&self, uri: &mut String, locale: &Locale) -> Resolution {
        if !self.config.web_interface {
            return Resolution::Status(Status::WEB_INTERFACE_DISABLED);
        }
        if let Some(program) = self.cgi_for_prefix(uri) {
            return Resolution::Cgi(program);
        }
        let file = match self.get_file(uri, locale) {
            Some(file) => file,
            None => return Resolution::Status(Status::NOT_FOUND),
        };
        let mime_type = self.mime.classify(&file.path);
        match self.as_cgi(uri, &file, mime_type.as_ref()) {
            Some(program) => Resolution::Cgi(program),
            None => Resolution::Status(Status::UNAUTHORIZED),
        }
    }

    /// `/printers/NAME.ppd`, `/classes/NAME.png` and friends name queues case-insensitively;
    /// map them onto the canonical `/ppd/` or `/icons/` file. `None` if `uri` is not such a
    /// request.
    fn rewrite_queue_file(&self, uri: &str) -> Option<Result<String, Status>> {
        let (canonical, extension) = if uri.ends_with(".ppd") {
            ("/ppd/", ".ppd")
        } else if uri.ends_with(".png") {
            ("/icons/", ".png")
        } else {
            return None;
        };
        let stem = &uri[..uri.len() - extension.len()];
        let name = if let Some(name) = stem.strip_prefix(canonical) {
            self.directory.find_printer(name).map(|printer| printer.name)
        } else if let Some(name) = stem.strip_prefix("/printers/") {
            self.directory.find_printer(name).map(|printer| printer.name)
        } else if let Some(name) = stem.strip_prefix("/classes/") {
            self.class_member_with_ppd(name)
        } else {
            return None;
        };
        Some(
            name.map(|name| format!("{}{}{}", canonical, name, extension))
                .ok_or(Status::NOT_FOUND),
        )
    }

    /// A class is represented by its first plain printer that has a PPD installed.
    fn class_member_with_ppd(&self, class: &str) -> Option<String> {
        let ppd_dir = self.config.server_root.join("ppd");
        self.directory
            .find_class(class)?
            .members
            .into_iter()
            .filter(|member| !member.is_class)
            .find(|member| ppd_dir.join(format!("{}.ppd", member.name)).exists())
            .map(|member| member.name)
    }

    /// The web interface programs under `ServerBin/cgi-bin`.
    fn cgi_for_prefix(&self, uri: &str) -> Option<CgiProgram> {
        fn trailing(rest: &str) -> Option<String> {
            if rest.len() >= 2 {
                Some(rest.to_string())
            } else {
                None
            }
        }

        let (program, options) = if uri.starts_with("/admin")
            && !uri.starts_with("/admin/conf/")
            && !uri.starts_with("/admin/log/")
        {
            ("admin.cgi", uri[6..].find('?').map(|q| uri[6 + q..].to_string()))
        } else if let Some(rest) = uri.strip_prefix("/printers") {
            ("printers.cgi", trailing(rest))
        } else if let Some(rest) = uri.strip_prefix("/classes") {
            ("classes.cgi", trailing(rest))
        } else if let Some(rest) = uri.strip_prefix("/jobs") {
            ("jobs.cgi", trailing(rest))
        } else if let Some(rest) = uri.strip_prefix("/help") {
            ("help.cgi", trailing(rest))
        } else {
            return None;
        };
        Some(CgiProgram {
            command: self.config.server_bin.join("cgi-bin").join(program),
            script: None,
            options,
            query_string: None,
        })
    }

    /// Find the file behind `uri`.
    pub fn get_file(&self, uri: &mut String, locale: &Locale) -> Option<ResolvedFile> {
        let config = self.config;
        let path = strip_query(uri);

        let special = if let Some(name) = path.strip_prefix("/ppd/").filter(|n| !n.contains('/')) {
            Some(under(&config.server_root, &format!("/ppd/{}", name)))
        } else if let Some(name) = path.strip_prefix("/icons/").filter(|n| !n.contains('/')) {
            let icon = config.cache_dir.join(name);
            Some(if icon.exists() {
                icon
            } else {
                config.document_root.join("images/generic.png")
            })
        } else if let Some(name) = path.strip_prefix("/rss/").filter(|n| !n.contains('/')) {
            Some(config.cache_dir.join("rss").join(name))
        } else if path.starts_with("/admin/conf/") {
            Some(under(&config.server_root, &path[11..]))
        } else if let Some(name) = path.strip_prefix("/admin/log/") {
            let configured = if name.starts_with("access_log") {
                &config.access_log
            } else if name.starts_with("error_log") {
                &config.error_log
            } else if name.starts_with("page_log") {
                &config.page_log
            } else {
                return None;
            };
            Some(configured.as_ref().filter(|path| path.is_absolute())?.clone())
        } else {
            None
        };
        if let Some(path) = special {
            let metadata = fs::metadata(&path).ok()?;
            if metadata.is_dir() {
                return None;
            }
            return Some(ResolvedFile { path, metadata });
        }

        let levels: Vec<String> = locale
            .search_dirs()
            .into_iter()
            .map(|dir| format!("/{}", dir))
            .chain(std::iter::once(String::new()))
            .collect();
        let (level, path, metadata) = levels.iter().enumerate().find_map(|(level, dir)| {
            let candidate = under(&config.document_root, &format!("{}{}", dir, path));
            fs::metadata(&candidate)
                .ok()
                .map(|metadata| (level, candidate, metadata))
        })?;
        if !metadata.is_dir() {
            return Some(ResolvedFile { path, metadata });
        }

        if !strip_query(uri).ends_with('/') {
            match uri.find('?') {
                Some(q) => uri.insert(q, '/'),
                None => uri.push('/'),
            }
        }
        let directory = strip_query(uri).to_string();
        let index_names = config.index_names();
        levels[level..].iter().find_map(|dir| {
            let base = under(&config.document_root, &format!("{}{}", dir, directory));
            index_names.iter().find_map(|name| {
                let candidate = base.join(name);
                fs::metadata(&candidate)
                    .ok()
                    .filter(|metadata| !metadata.is_dir())
                    .map(|metadata| ResolvedFile {
                        path: candidate,
                        metadata,
                    })
            })
        })
    }

    /// A static file is run instead of sent when it is an executable CGI program, or a script
    /// whose interpreter is configured.
    fn as_cgi(
        &self,
        uri: &str,
        file: &ResolvedFile,
        mime_type: Option<&MimeType>,
    ) -> Option<CgiProgram> {
        let query = uri.find('?').map(|q| uri[q + 1..].to_string());
        let mime_type = mime_type.filter(|mime_type| mime_type.super_type == "application")?;
        if mime_type.type_name == "x-httpd-cgi" {
            if file.metadata.permissions().mode() & 0o111 == 0 {
                return None;
            }
            return Some(CgiProgram {
                command: file.path.clone(),
                script: None,
                options: query.clone(),
                query_string: query,
            });
        }
        let interpreter = self.config.interpreters.for_type(&mime_type.type_name)?;
        Some(CgiProgram {
            command: interpreter.to_path_buf(),
            script: Some(file.path.clone()),
            options: query.clone(),
            query_string: query,
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use std::fs::File;
    use std::io::Write;

    use tempfile::TempDir;
    use test_case::test_case;

    use crate::services::{MimeMap, StaticDirectory};

    struct Fixture {
        _root: TempDir,
        config: Config,
        directory: StaticDirectory,
        mime: MimeMap,
    }

    impl Fixture {
        fn new() -> Self {
            let root = tempfile::tempdir().unwrap();
            let docroot = root.path().join("doc");
            fs::create_dir(&docroot).unwrap();
            let mut config = Config::new(&docroot);
            config.server_root = root.path().join("etc");
            config.server_bin = root.path().join("bin");
            config.cache_dir = root.path().join("cache");
            fs::create_dir_all(config.server_root.join("ppd")).unwrap();
            fs::create_dir_all(&config.cache_dir).unwrap();
            Self {
                _root: root,
                config,
                directory: StaticDirectory::default(),
                mime: MimeMap::default(),
            }
        }

        fn resolver(&self) -> Resolver<'_> {
            Resolver {
                config: &self.config,
                directory: &self.directory,
                mime: &self.mime,
            }
        }

        fn doc(&self, relative: &str, contents: &str) -> PathBuf {
            let path = self.config.document_root.join(relative);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            File::create(&path)
                .unwrap()
                .write_all(contents.as_bytes())
                .unwrap();
            path
        }

        fn get(&self, uri: &str, locale: &str) -> (String, Resolution) {
            let mut uri = uri.to_string();
            let resolution = self
                .resolver()
                .resolve_get(&mut uri, &Locale::parse(locale), None);
            (uri, resolution)
        }
    }

    fn served_path(resolution: Resolution) -> PathBuf {
        match resolution {
            Resolution::File { file, .. } => file.path,
            other => panic!("expected a file, got {:?}", other),
        }
    }

    fn status(resolution: Resolution) -> Status {
        match resolution {
            Resolution::Status(status) => status,
            other => panic!("expected a status, got {:?}", other),
        }
    }

    fn program(resolution: Resolution) -> CgiProgram {
        match resolution {
            Resolution::Cgi(program) => program,
            other => panic!("expected a program, got {:?}", other),
        }
    }

    #[test_case("/index.html", true ; "plain")]
    #[test_case("/admin/../../etc/passwd", false ; "climbs")]
    #[test_case("/admin/..", false ; "trailing dotdot")]
    #[test_case("/%2e%2e/etc/passwd", false ; "escaped dotdot")]
    #[test_case("/a/..b/c", true ; "dotdot prefix of a name")]
    #[test_case("/help?topic=/..", true ; "dotdot in query")]
    #[test_case("index.html", false ; "relative")]
    #[test_case("*", false ; "asterisk")]
    fn path_safety(uri: &str, safe: bool) {
        assert_eq!(is_path_absolute(uri), safe);
    }

    #[test_case("/jobs?which=all", Ok("/jobs?which=all") ; "origin form")]
    #[test_case("http://printsrv:631/printers/laser", Ok("/printers/laser") ; "own name")]
    #[test_case("ipp://LOCALHOST/ipp/print", Ok("/ipp/print") ; "localhost")]
    #[test_case("http://10.0.0.2:631", Ok("/") ; "address without path")]
    #[test_case("http://user@[::1]:631/admin", Ok("/admin") ; "ipv6 with user")]
    #[test_case("file:/etc/hosts", Ok("/etc/hosts") ; "file scheme")]
    #[test_case("http://evil.example/", Err(Status::METHOD_NOT_ALLOWED) ; "proxy request")]
    #[test_case("nonsense", Err(Status::METHOD_NOT_ALLOWED) ; "no scheme")]
    fn absolute_uris(target: &str, expected: Result<&str, Status>) {
        assert_eq!(
            request_path(target, "printsrv"),
            expected.map(str::to_string)
        );
    }

    #[test]
    fn language_fallback_order() {
        let fixture = Fixture::new();
        assert_eq!(status(fixture.get("/index.html", "fr").1), Status::NOT_FOUND);

        let plain = fixture.doc("index.html", "plain");
        assert_eq!(served_path(fixture.get("/index.html", "fr").1), plain);
        let language = fixture.doc("fr/index.html", "fr");
        assert_eq!(served_path(fixture.get("/index.html", "fr").1), language);
        let country = fixture.doc("fr_FR/index.html", "fr_FR");
        assert_eq!(served_path(fixture.get("/index.html", "fr").1), country);
        assert_eq!(served_path(fixture.get("/index.html", "C").1), plain);
    }

    #[test]
    fn directories_probe_index_files() {
        let mut fixture = Fixture::new();
        fs::create_dir(fixture.config.document_root.join("docs")).unwrap();
        let (uri, resolution) = fixture.get("/docs?x=1", "C");
        assert_eq!(uri, "/docs/?x=1");
        assert_eq!(status(resolution), Status::NOT_FOUND);

        fixture.config.interpreters.php = Some("/usr/bin/php-cgi".into());
        let script = fixture.doc("docs/index.php", "<?php ?>");
        let cgi = program(fixture.get("/docs/", "C").1);
        assert_eq!(cgi.command, PathBuf::from("/usr/bin/php-cgi"));
        assert_eq!(cgi.script, Some(script));

        let index = fixture.doc("docs/index.html", "hi");
        assert_eq!(served_path(fixture.get("/docs", "C").1), index);
    }

    #[test]
    fn web_interface_prefixes_map_to_programs() {
        let fixture = Fixture::new();
        let cgi_bin = fixture.config.server_bin.join("cgi-bin");

        let admin = program(fixture.get("/admin?op=add-printer", "C").1);
        assert_eq!(admin.command, cgi_bin.join("admin.cgi"));
        assert_eq!(admin.options.as_deref(), Some("?op=add-printer"));

        let printers = program(fixture.get("/printers/laser?which=all", "C").1);
        assert_eq!(printers.command, cgi_bin.join("printers.cgi"));
        assert_eq!(printers.options.as_deref(), Some("/laser?which=all"));

        assert_eq!(program(fixture.get("/printers/", "C").1).options, None);
        assert_eq!(
            program(fixture.get("/help/man", "C").1).command,
            cgi_bin.join("help.cgi")
        );
        assert_eq!(
            program(fixture.get("/jobs", "C").1).command,
            cgi_bin.join("jobs.cgi")
        );
    }

    #[test]
    fn web_interface_can_be_disabled() {
        let mut fixture = Fixture::new();
        fixture.config.web_interface = false;
        assert_eq!(
            status(fixture.get("/printers/", "C").1),
            Status::WEB_INTERFACE_DISABLED
        );
        let mut uri = "/admin".to_string();
        assert_eq!(
            status(fixture.resolver().resolve_post(&mut uri, &Locale::parse("C"))),
            Status::WEB_INTERFACE_DISABLED
        );
    }

    #[test]
    fn queue_files_are_canonicalized() {
        let mut fixture = Fixture::new();
        fixture.directory.add_printer("Laser");
        fixture.directory.add_printer("inkjet");
        fixture.directory.add_class("office", &["laser2", "inkjet"]);
        let ppd = fixture.config.server_root.join("ppd/Laser.ppd");
        File::create(&ppd).unwrap();
        File::create(fixture.config.server_root.join("ppd/inkjet.ppd")).unwrap();

        let (uri, resolution) = fixture.get("/printers/laser.ppd", "C");
        assert_eq!(uri, "/ppd/Laser.ppd");
        assert_eq!(served_path(resolution), ppd);

        let (uri, _) = fixture.get("/classes/office.ppd", "C");
        assert_eq!(uri, "/ppd/inkjet.ppd");

        assert_eq!(
            status(fixture.get("/printers/missing.ppd", "C").1),
            Status::NOT_FOUND
        );

        let generic = fixture.doc("images/generic.png", "png");
        let (uri, resolution) = fixture.get("/printers/inkjet.png", "C");
        assert_eq!(uri, "/icons/inkjet.png");
        assert_eq!(served_path(resolution), generic);
    }

    #[test]
    fn admin_files_are_direct_children_only() {
        let mut fixture = Fixture::new();
        let conf = fixture.config.server_root.join("cupsd.conf");
        File::create(&conf).unwrap();
        assert_eq!(served_path(fixture.get("/admin/conf/cupsd.conf", "C").1), conf);
        assert_eq!(status(fixture.get("/admin/conf/", "C").1), Status::FORBIDDEN);
        assert_eq!(
            status(fixture.get("/admin/conf/ssl/server.key", "C").1),
            Status::FORBIDDEN
        );

        let log = fixture.config.server_root.join("access_log");
        File::create(&log).unwrap();
        assert_eq!(status(fixture.get("/admin/log/access_log", "C").1), Status::NOT_FOUND);
        fixture.config.access_log = Some(log.clone());
        assert_eq!(served_path(fixture.get("/admin/log/access_log", "C").1), log);
        fixture.config.access_log = Some("access_log".into());
        assert_eq!(status(fixture.get("/admin/log/access_log", "C").1), Status::NOT_FOUND);
    }

    #[test]
    fn executable_cgi_files_run() {
        let fixture = Fixture::new();
        let script = fixture.doc("hello.cgi", "#!/bin/sh\n");
        assert!(matches!(fixture.get("/hello.cgi", "C").1, Resolution::File { .. }));

        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        let cgi = program(fixture.get("/hello.cgi?a+b", "C").1);
        assert_eq!(cgi.command, script);
        assert_eq!(cgi.query_string.as_deref(), Some("a+b"));

        let mut uri = "/hello.cgi".to_string();
        assert!(matches!(
            fixture.resolver().resolve_post(&mut uri, &Locale::parse("C")),
            Resolution::Cgi(_)
        ));
    }

    #[test]
    fn posting_to_plain_files_is_unauthorized() {
        let fixture = Fixture::new();
        fixture.doc("form.html", "<form>");
        let mut uri = "/form.html".to_string();
        assert_eq!(
            status(fixture.resolver().resolve_post(&mut uri, &Locale::parse("C"))),
            Status::UNAUTHORIZED
        );
    }

    #[test]
    fn if_modified_since() {
        let fixture = Fixture::new();
        let path = fixture.doc("index.html", "12345");
        let metadata = fs::metadata(&path).unwrap();

        assert!(is_modified(None, &metadata));
        assert!(!is_modified(Some("Fri, 01 Jan 2100 00:00:00 GMT"), &metadata));
        assert!(is_modified(Some("Thu, 01 Jan 1998 00:00:00 GMT"), &metadata));
        assert!(!is_modified(
            Some("Fri, 01 Jan 2100 00:00:00 GMT; length=5"),
            &metadata
        ));
        assert!(is_modified(
            Some("Fri, 01 Jan 2100 00:00:00 GMT; length=4"),
            &metadata
        ));
        assert!(!is_modified(Some("length=5"), &metadata));
        assert!(is_modified(Some("garbage"), &metadata));
    }
}
