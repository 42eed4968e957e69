//! Collaborators the request core consults: printer directory, MIME typing and authorization.
//!
//! Each is a trait so the scheduler proper can plug in its own; the implementations here are the
//! simple ones the stand-alone daemon runs with.

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::Path;

use anyhow::{Context, Result};
use log::warn;

use crate::http::Status;
use crate::util::Base64Encoded;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Printer {
    pub name: String,
    pub is_class: bool,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PrinterClass {
    pub name: String,
    pub members: Vec<Printer>,
}

/// Printer and class lookup.
pub trait Directory {
    fn find_printer(&self, name: &str) -> Option<Printer>;
    fn find_class(&self, name: &str) -> Option<PrinterClass>;
    /// Attach a state reason (for example a `-warning` keyword) to a printer.
    fn add_printer_reason(&mut self, printer: &str, reason: &str);
}

/// A fixed set of printers and classes.
#[derive(Debug, Default)]
pub struct StaticDirectory {
    printers: Vec<String>,
    classes: Vec<(String, Vec<String>)>,
    reasons: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn add_printer(&mut self, name: &str) {
        self.printers.push(name.to_string());
    }

    pub fn add_class(&mut self, name: &str, members: &[&str]) {
        self.classes.push((
            name.to_string(),
            members.iter().map(|member| member.to_string()).collect(),
        ));
    }

    pub fn reasons(&self, printer: &str) -> &[String] {
        self.reasons
            .get(printer)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }
}

impl Directory for StaticDirectory {
    fn find_printer(&self, name: &str) -> Option<Printer> {
        self.printers
            .iter()
            .find(|printer| printer.eq_ignore_ascii_case(name))
            .map(|printer| Printer {
                name: printer.clone(),
                is_class: false,
            })
    }

    fn find_class(&self, name: &str) -> Option<PrinterClass> {
        self.classes
            .iter()
            .find(|(class, _)| class.eq_ignore_ascii_case(name))
            .map(|(class, members)| PrinterClass {
                name: class.clone(),
                members: members
                    .iter()
                    .map(|member| Printer {
                        name: member.clone(),
                        is_class: self.classes.iter().any(|(c, _)| c == member),
                    })
                    .collect(),
            })
    }

    fn add_printer_reason(&mut self, printer: &str, reason: &str) {
        warn!("[Printer {}] state reason added: {}", printer, reason);
        let reasons = self.reasons.entry(printer.to_string()).or_default();
        if !reasons.iter().any(|r| r == reason) {
            reasons.push(reason.to_string());
        }
    }
}

/// A `super/type` MIME type.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MimeType {
    pub super_type: String,
    pub type_name: String,
}

impl MimeType {
    pub fn parse(mimetype: &str) -> Option<Self> {
        let mut parts = mimetype.splitn(2, '/');
        match (parts.next(), parts.next()) {
            (Some(super_type), Some(type_name)) if !super_type.is_empty() => Some(Self {
                super_type: super_type.to_ascii_lowercase(),
                type_name: type_name.to_ascii_lowercase(),
            }),
            _ => None,
        }
    }
}

impl std::fmt::Display for MimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.super_type, self.type_name)
    }
}

/// File type detection.
pub trait MimeDatabase {
    fn classify(&self, path: &Path) -> Option<MimeType>;
}

const DEFAULT_EXTENSIONS_MAP: &[&str] = &[
    "application/ipp                 ipp",
    "application/pdf                 pdf",
    "application/postscript          ps eps ai",
    "application/vnd.cups-ppd        ppd",
    "application/x-httpd-cgi         cgi",
    "application/x-httpd-java        class",
    "application/x-httpd-perl        pl",
    "application/x-httpd-php         php",
    "application/x-httpd-python      py pyc",
    "application/xml                 xml",
    "image/gif                       gif",
    "image/jpeg                      jpeg jpe jpg",
    "image/png                       png",
    "image/svg+xml                   svg",
    "text/css                        css",
    "text/html                       html htm",
    "text/javascript                 js",
    "text/plain                      txt asc conf",
];

/// Extension-based MIME typing.
#[derive(Debug)]
pub struct MimeMap {
    mimetypes: HashMap<String, String>,
    pub default_mimetype: Option<String>,
}

impl MimeMap {
    /// Add extension map from a file.
    pub fn parse_extension_map_file(&mut self, filename: &Path) -> Result<()> {
        let file = File::open(filename)
            .with_context(|| format!("failed to open {}", filename.display()))?;
        for line in BufReader::new(file).lines() {
            let line = line.with_context(|| format!("failed to read {}", filename.display()))?;
            self.add_mimetype_line(&line);
        }
        Ok(())
    }

    /// Add line from an extension map.
    fn add_mimetype_line(&mut self, line: &str) {
        let mut fields = line
            .split(|c| matches!(c, ' ' | '\t'))
            .filter(|field| !field.is_empty());
        let mimetype = match fields.next() {
            Some(mimetype) => mimetype,
            None => return, // empty line
        };
        if mimetype.starts_with('#') {
            return; // comment
        }
        for extension in fields {
            self.mimetypes
                .insert(extension.to_ascii_lowercase(), mimetype.to_string());
        }
    }
}

impl MimeDatabase for MimeMap {
    fn classify(&self, path: &Path) -> Option<MimeType> {
        path.extension()
            .and_then(|extension| extension.to_str())
            .and_then(|extension| self.mimetypes.get(&extension.to_ascii_lowercase()))
            .or_else(|| self.default_mimetype.as_ref())
            .and_then(|mimetype| MimeType::parse(mimetype))
    }
}

impl Default for MimeMap {
    /// Create MimeMap using the default extension map.
    fn default() -> Self {
        let mut mime_map = Self {
            mimetypes: HashMap::new(),
            default_mimetype: None,
        };
        for line in DEFAULT_EXTENSIONS_MAP {
            mime_map.add_mimetype_line(line);
        }
        mime_map
    }
}

/// Challenge scheme offered in `WWW-Authenticate`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AuthType {
    None,
    Basic,
    Digest,
    Negotiate,
}

impl AuthType {
    pub fn parse(name: &str) -> Option<Self> {
        Some(match name.to_ascii_lowercase().as_str() {
            "none" => Self::None,
            "basic" => Self::Basic,
            "digest" => Self::Digest,
            "negotiate" => Self::Negotiate,
            _ => return None,
        })
    }
}

/// Authentication requirements of the location best matching a resource.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AuthLocation {
    pub auth_type: AuthType,
    /// Access is limited to the privileged system group.
    pub system_group: bool,
}

/// What an authorization decision is based on.
#[derive(Debug)]
pub struct AuthRequest<'a> {
    pub resource: &'a str,
    pub username: Option<&'a str>,
    pub loopback: bool,
}

/// Authentication and authorization.
pub trait Authorizer {
    /// Identify the user from an `Authorization` header.
    fn authenticate(&self, authorization: Option<&str>) -> Option<String>;
    /// The location policy governing a resource, if any.
    fn location(&self, resource: &str) -> Option<AuthLocation>;
    fn is_authorized(&self, request: &AuthRequest<'_>) -> Status;
    fn default_auth_type(&self) -> AuthType;
}

/// Basic credentials guarding a list of resource prefixes.
#[derive(Debug)]
pub struct PolicyAuthorizer {
    credentials: Option<(String, String)>,
    protected: Vec<String>,
    system_group: Vec<String>,
    auth_type: AuthType,
}

impl PolicyAuthorizer {
    pub fn new(auth_type: AuthType) -> Self {
        Self {
            credentials: None,
            protected: Vec::new(),
            system_group: Vec::new(),
            auth_type,
        }
    }

    /// Accept `user:pass`.
    pub fn set_credentials(&mut self, user_pass: &str) {
        let username = user_pass.splitn(2, ':').next().unwrap_or("").to_string();
        self.credentials = Some((
            username,
            format!("Basic {}", Base64Encoded(user_pass.as_bytes())),
        ));
    }

    pub fn protect(&mut self, prefix: &str) {
        self.protected.push(prefix.to_string());
    }

    pub fn restrict_to_system_group(&mut self, prefix: &str) {
        self.system_group.push(prefix.to_string());
    }
}

impl Authorizer for PolicyAuthorizer {
    fn authenticate(&self, authorization: Option<&str>) -> Option<String> {
        match (&self.credentials, authorization) {
            (Some((username, key)), Some(authorization)) if authorization.trim() == key => {
                Some(username.clone())
            }
            _ => None,
        }
    }

    fn location(&self, resource: &str) -> Option<AuthLocation> {
        self.protected
            .iter()
            .filter(|prefix| resource.starts_with(prefix.as_str()))
            .max_by_key(|prefix| prefix.len())
            .map(|prefix| AuthLocation {
                auth_type: self.auth_type,
                system_group: self
                    .system_group
                    .iter()
                    .any(|group_prefix| prefix.starts_with(group_prefix.as_str())),
            })
    }

    fn is_authorized(&self, request: &AuthRequest<'_>) -> Status {
        match self.location(request.resource) {
            Some(location) if location.auth_type != AuthType::None => {
                if request.username.is_some() {
                    Status::OK
                } else {
                    Status::UNAUTHORIZED
                }
            }
            _ => Status::OK,
        }
    }

    fn default_auth_type(&self) -> AuthType {
        self.auth_type
    }
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("index.html", Some("text/html") ; "html")]
    #[test_case("admin.cgi", Some("application/x-httpd-cgi") ; "cgi")]
    #[test_case("LOGO.PNG", Some("image/png") ; "upper case extension")]
    #[test_case("script.pyc", Some("application/x-httpd-python") ; "compiled python")]
    #[test_case("unknown.xyz", None ; "unknown")]
    fn mime_map_classifies(name: &str, expected: Option<&str>) {
        let mime = MimeMap::default();
        assert_eq!(
            mime.classify(Path::new(name)).map(|t| t.to_string()),
            expected.map(str::to_string)
        );
    }

    #[test]
    fn default_mimetype_applies_to_unknown_files() {
        let mut mime = MimeMap::default();
        mime.default_mimetype = Some("application/octet-stream".to_string());
        assert_eq!(
            mime.classify(Path::new("blob")).unwrap().to_string(),
            "application/octet-stream"
        );
    }

    #[test]
    fn static_directory_resolves_class_members() {
        let mut directory = StaticDirectory::default();
        directory.add_printer("laser");
        directory.add_class("office", &["laser", "floor2"]);
        directory.add_class("floor2", &["inkjet"]);
        let class = directory.find_class("Office").unwrap();
        assert!(!class.members[0].is_class);
        assert!(class.members[1].is_class);
        assert!(directory.find_printer("LASER").is_some());
        assert!(directory.find_printer("office").is_none());

        directory.add_printer_reason("laser", "cups-insecure-filter-warning");
        directory.add_printer_reason("laser", "cups-insecure-filter-warning");
        assert_eq!(directory.reasons("laser").len(), 1);
    }

    #[test]
    fn policy_protects_prefixes() {
        let mut auth = PolicyAuthorizer::new(AuthType::Basic);
        auth.set_credentials("admin:secret");
        auth.protect("/admin");
        auth.restrict_to_system_group("/admin");

        let user = auth.authenticate(Some("Basic YWRtaW46c2VjcmV0"));
        assert_eq!(user.as_deref(), Some("admin"));
        assert_eq!(auth.authenticate(Some("Basic bm9wZQ==")), None);

        let denied = AuthRequest {
            resource: "/admin/conf/cupsd.conf",
            username: None,
            loopback: true,
        };
        assert_eq!(auth.is_authorized(&denied), Status::UNAUTHORIZED);
        let allowed = AuthRequest {
            username: user.as_deref(),
            ..denied
        };
        assert_eq!(auth.is_authorized(&allowed), Status::OK);
        assert_eq!(
            auth.location("/admin").map(|l| l.system_group),
            Some(true)
        );
        assert_eq!(auth.location("/printers/laser"), None);
    }
}
