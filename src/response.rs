//! Response heads and the generated error pages.

use std::fmt::Write;
use std::time::{Duration, SystemTime};

use crate::http::{HttpVersion, Status};
use crate::locale::{localize, Locale, Message};
use crate::services::AuthType;
use crate::util::{HtmlEscaped, HttpDate};

pub const ALLOW: &str = "GET, HEAD, OPTIONS, POST, PUT";
pub const UPGRADE: &str = "TLS/1.2,TLS/1.1,TLS/1.0";

/// What every response head depends on besides its status.
#[derive(Debug)]
pub struct Framing<'a> {
    pub version: HttpVersion,
    pub keep_alive: bool,
    pub keep_alive_timeout: Duration,
    pub server_header: Option<&'a str>,
    pub locale: &'a Locale,
    pub now: SystemTime,
}

/// The `WWW-Authenticate` challenge for a 401.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Challenge {
    pub auth_type: AuthType,
    /// Local client asking for a system-group resource: offer `trc="y"`.
    pub trust: bool,
    /// Peer is on a local-domain socket.
    pub local_socket: bool,
}

impl Challenge {
    fn value(&self, hostname: &str) -> Option<String> {
        let mut value = match self.auth_type {
            AuthType::None => return None,
            AuthType::Basic => "Basic realm=\"printd\"".to_string(),
            AuthType::Digest => format!("Digest realm=\"printd\", nonce=\"{}\"", hostname),
            AuthType::Negotiate if self.local_socket => "Basic realm=\"printd\"".to_string(),
            AuthType::Negotiate => "Negotiate".to_string(),
        };
        if self.trust && self.auth_type != AuthType::Negotiate {
            value.push_str(", trc=\"y\"");
        }
        Some(value)
    }
}

/// Version written on status lines: requests older than 1.0 are answered as 1.0.
fn reply_version(version: HttpVersion) -> HttpVersion {
    version.max(HttpVersion::V1_0).min(HttpVersion::V1_1)
}

/// `HTTP/x.y 100 Continue` and the blank line; nothing else goes with it.
pub fn continue_line(version: HttpVersion) -> String {
    format!("{} {}\r\n\r\n", reply_version(version), Status::CONTINUE)
}

/// Status line and standard fields, without the blank line that ends the head.
pub fn header(
    framing: &Framing<'_>,
    status: Status,
    content_type: Option<&str>,
    challenge: Option<(&Challenge, &str)>,
) -> String {
    let mut head = String::with_capacity(256);
    // Writing into a String cannot fail.
    let _ = write!(
        head,
        "{} {}\r\nDate: {}\r\n",
        reply_version(framing.version),
        status,
        HttpDate(framing.now)
    );
    if let Some(server) = framing.server_header {
        let _ = write!(head, "Server: {}\r\n", server);
    }
    if framing.keep_alive && framing.version >= HttpVersion::V1_0 {
        let _ = write!(
            head,
            "Connection: Keep-Alive\r\nKeep-Alive: timeout={}\r\n",
            framing.keep_alive_timeout.as_secs()
        );
    } else {
        head.push_str("Connection: close\r\n");
    }
    if status == Status::METHOD_NOT_ALLOWED {
        let _ = write!(head, "Allow: {}\r\n", ALLOW);
    }
    if status == Status::UNAUTHORIZED {
        if let Some(value) = challenge.and_then(|(challenge, host)| challenge.value(host)) {
            let _ = write!(head, "WWW-Authenticate: {}\r\n", value);
        }
    }
    if !framing.locale.is_posix() {
        let _ = write!(
            head,
            "Content-Language: {}\r\n",
            framing.locale.language.replace('_', "-")
        );
    }
    match content_type {
        Some("text/html") => head.push_str("Content-Type: text/html; charset=utf-8\r\n"),
        Some(content_type) => {
            let _ = write!(head, "Content-Type: {}\r\n", content_type);
        }
        None => {}
    }
    head
}

/// Human-readable page sent with error statuses. `upgrade_url` is the `https://` location for
/// a 426.
pub fn error_page(locale: &Locale, status: Status, upgrade_url: Option<&str>) -> String {
    let mut redirect = String::new();
    let text = if status == Status::UNAUTHORIZED {
        HtmlEscaped(localize(locale, Message::EnterUsername)).to_string()
    } else if status == Status::UPGRADE_REQUIRED {
        let url = upgrade_url.unwrap_or("https://localhost/");
        redirect = format!(
            "<META HTTP-EQUIV=\"Refresh\" CONTENT=\"3;URL={}\">\n",
            HtmlEscaped(url)
        );
        format!(
            "{} <A HREF=\"{}\">{}</A>.",
            HtmlEscaped(localize(locale, Message::UpgradeToHttps)),
            HtmlEscaped(url),
            HtmlEscaped(url)
        )
    } else if status == Status::WEB_INTERFACE_DISABLED {
        HtmlEscaped(localize(locale, Message::WebInterfaceDisabled)).to_string()
    } else {
        String::new()
    };
    let title = status.to_string();
    format!(
        "<!DOCTYPE HTML>\n\
        <HTML>\n\
        <HEAD>\n\
        \t<META HTTP-EQUIV=\"Content-Type\" CONTENT=\"text/html; charset=utf-8\">\n\
        \t<TITLE>{} - {}</TITLE>\n\
        {}\
        </HEAD>\n\
        <BODY>\n\
        <H1>{}</H1>\n\
        <P>{}</P>\n\
        </BODY>\n\
        </HTML>\n",
        title,
        env!("CARGO_PKG_NAME"),
        redirect,
        title,
        text
    )
}
