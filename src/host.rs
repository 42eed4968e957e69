//! `Host:` header validation.

use std::net::IpAddr;

/// The names this server answers to.
#[derive(Debug, Default)]
pub struct HostPolicy<'a> {
    pub server_name: &'a str,
    /// Extra names; `*` accepts anything.
    pub aliases: &'a [String],
    /// Host names of directly attached network interfaces.
    pub interface_hostnames: &'a [String],
    /// Accept `.local` names.
    pub mdns: bool,
}

/// Check a `Host:` value against the names the client may legitimately use to reach us.
///
/// Loopback clients must say `localhost` or a loopback address. Other clients may use a literal
/// IP address, a `.local` name (when mDNS is on), a configured alias, or an interface host name.
/// Name matches are case-insensitive prefix matches that must end the value, optionally followed
/// by a single trailing dot.
pub fn valid_host(host: &str, loopback: bool, policy: &HostPolicy<'_>) -> bool {
    let name = strip_port(host);

    if loopback {
        return name.eq_ignore_ascii_case("localhost")
            || name.eq_ignore_ascii_case("localhost.")
            || (cfg!(target_os = "linux") && name.eq_ignore_ascii_case("localhost.localdomain"))
            || name == "127.0.0.1"
            || name == "[::1]";
    }

    if policy.mdns && is_local_domain(name) {
        return true;
    }

    if name.starts_with(|c: char| c.is_ascii_digit()) || name.starts_with('[') {
        let literal = name.trim_start_matches('[').trim_end_matches(']');
        if literal.parse::<IpAddr>().is_ok() {
            return true;
        }
    }

    if policy.aliases.iter().any(|alias| alias == "*") {
        return true;
    }

    std::iter::once(policy.server_name)
        .chain(policy.aliases.iter().map(String::as_str))
        .chain(policy.interface_hostnames.iter().map(String::as_str))
        .filter(|candidate| !candidate.is_empty())
        .any(|candidate| matches_name(name, candidate))
}

/// Drop a trailing `:port`, leaving bracketed IPv6 literals intact.
fn strip_port(host: &str) -> &str {
    match host.rfind(':') {
        Some(colon) if !host[colon..].contains(']') => &host[..colon],
        _ => host,
    }
}

fn is_local_domain(name: &str) -> bool {
    let trimmed = name.strip_suffix('.').unwrap_or(name);
    match trimmed.rfind('.') {
        Some(dot) if dot > 0 => trimmed[dot..].eq_ignore_ascii_case(".local"),
        _ => false,
    }
}

fn matches_name(name: &str, candidate: &str) -> bool {
    if name.len() < candidate.len()
        || !name.is_char_boundary(candidate.len())
        || !name[..candidate.len()].eq_ignore_ascii_case(candidate)
    {
        return false;
    }
    let rest = &name[candidate.len()..];
    rest.is_empty() || rest == "."
}

#[cfg(test)]
mod test {
    use super::*;

    use test_case::test_case;

    #[test_case("localhost", true ; "localhost")]
    #[test_case("LOCALHOST:631", true ; "localhost with port")]
    #[test_case("localhost.", true ; "trailing dot")]
    #[test_case("127.0.0.1:631", true ; "ipv4 loopback")]
    #[test_case("[::1]:631", true ; "ipv6 loopback")]
    #[test_case("[::1]", true ; "ipv6 loopback without port")]
    #[test_case("evil.example", false ; "foreign name")]
    #[test_case("10.0.0.1", false ; "non loopback address")]
    fn loopback_clients(host: &str, valid: bool) {
        assert_eq!(valid_host(host, true, &HostPolicy::default()), valid);
    }

    #[test_case("printsrv.local", true ; "interface hostname")]
    #[test_case("PRINTSRV.LOCAL:631", true ; "case and port")]
    #[test_case("printsrv.local.", true ; "single trailing dot")]
    #[test_case("printsrv.local.evil.com", false ; "suffix after boundary")]
    #[test_case("printsrv.localx", false ; "longer label")]
    #[test_case("192.168.1.5:631", true ; "ipv4 literal")]
    #[test_case("[fe80::1]:631", true ; "ipv6 literal")]
    #[test_case("1nvalid", false ; "digit but not an address")]
    #[test_case("cups.example.com", true ; "alias")]
    #[test_case("other.example.com", false ; "unknown")]
    fn remote_clients(host: &str, valid: bool) {
        let aliases = vec!["cups.example.com".to_string()];
        let interfaces = vec!["printsrv.local".to_string()];
        let policy = HostPolicy {
            server_name: "printsrv",
            aliases: &aliases,
            interface_hostnames: &interfaces,
            mdns: false,
        };
        assert_eq!(valid_host(host, false, &policy), valid);
    }

    #[test]
    fn mdns_accepts_local_names_only() {
        let policy = HostPolicy {
            mdns: true,
            ..Default::default()
        };
        assert!(valid_host("anything.local", false, &policy));
        assert!(valid_host("anything.local.", false, &policy));
        assert!(!valid_host("anything.local.evil.com", false, &policy));
        assert!(!valid_host(".local", false, &policy));
    }

    #[test]
    fn wildcard_alias_accepts_anything() {
        let aliases = vec!["*".to_string()];
        let policy = HostPolicy {
            aliases: &aliases,
            ..Default::default()
        };
        assert!(valid_host("whatever.example", false, &policy));
    }
}
