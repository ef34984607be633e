//! Request-target and URL handling
//!
//! Only the parts of a URL an HTTP/1.x engine needs are modelled: scheme,
//! authority (`host[:port]`), path and raw query. Paths and queries are kept
//! in their escaped wire form.

use super::{Error, Method, Result};
use std::fmt;

/// A parsed absolute or origin-form URL
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Url {
    /// Lower-cased scheme, empty for origin-form targets
    pub scheme: String,
    /// `host[:port]`; an IPv6 zone appears unescaped (`[fe80::1%en0]`)
    pub host: String,
    /// Escaped path, `*` for the asterisk form
    pub path: String,
    /// Query without the leading `?`
    pub raw_query: String,
}

impl Url {
    /// Parse an absolute URL. Input without `://` that does not start with
    /// `/` is taken to be `http://` + input.
    pub fn parse(input: &str) -> Result<Url> {
        if input.is_empty() {
            return Err(Error::InvalidUrl("empty url".to_string()));
        }
        if input.bytes().any(|b| b < 0x21 || b == 0x7f) {
            return Err(Error::InvalidUrl(format!("invalid character in {:?}", input)));
        }
        let input = input.split('#').next().unwrap_or("");
        if input.starts_with('/') {
            return Ok(origin_form(input));
        }

        let (scheme, rest) = match input.find("://") {
            Some(idx) => {
                let scheme = &input[..idx];
                if !valid_scheme(scheme) {
                    return Err(Error::InvalidUrl(format!("invalid scheme in {:?}", input)));
                }
                (scheme.to_ascii_lowercase(), &input[idx + 3..])
            }
            None => ("http".to_string(), input),
        };

        let end = rest.find(['/', '?']).unwrap_or(rest.len());
        let (authority, tail) = rest.split_at(end);
        let host = parse_authority(authority)?;
        let tail = origin_form(tail);

        Ok(Url {
            scheme,
            host,
            path: tail.path,
            raw_query: tail.raw_query,
        })
    }

    /// Path and query as sent on the request line
    pub fn request_uri(&self) -> String {
        let mut uri = if self.path.is_empty() {
            "/".to_string()
        } else {
            self.path.clone()
        };
        if !self.raw_query.is_empty() {
            uri.push('?');
            uri.push_str(&self.raw_query);
        }
        uri
    }

    /// Host without the port
    pub fn hostname(&self) -> &str {
        strip_host_port(&self.host)
    }

    /// Port part of the authority, if any
    pub fn port(&self) -> Option<&str> {
        let (_, port) = split_host_port(&self.host);
        port
    }

    pub fn is_absolute(&self) -> bool {
        !self.scheme.is_empty()
    }
}

impl fmt::Display for Url {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.scheme.is_empty() {
            write!(f, "{}://{}", self.scheme, self.host)?;
        }
        if self.path == "*" {
            return write!(f, "*");
        }
        write!(f, "{}", self.request_uri())
    }
}

/// Resolve the request-target of a request line.
///
/// Handles the four RFC 7230 forms: origin (`/p?q`), absolute
/// (`http://h/p`), authority (`h:443`, CONNECT only) and asterisk (`*`).
pub fn parse_request_target(method: &Method, target: &str) -> Result<Url> {
    if target == "*" {
        return Ok(Url {
            path: "*".to_string(),
            ..Url::default()
        });
    }
    if *method == Method::Connect && !target.starts_with('/') {
        let mut url = Url::parse(&format!("http://{}", target))?;
        url.scheme.clear();
        return Ok(url);
    }
    if target.starts_with('/') {
        if target.bytes().any(|b| b < 0x21 || b == 0x7f) {
            return Err(Error::InvalidUrl(format!("invalid character in {:?}", target)));
        }
        return Ok(origin_form(target));
    }
    if !target.contains("://") {
        return Err(Error::InvalidUrl(format!("invalid request target {:?}", target)));
    }
    Url::parse(target)
}

fn origin_form(target: &str) -> Url {
    let target = target.split('#').next().unwrap_or("");
    let (path, query) = target.split_once('?').unwrap_or((target, ""));
    Url {
        path: path.to_string(),
        raw_query: query.to_string(),
        ..Url::default()
    }
}

fn valid_scheme(scheme: &str) -> bool {
    let mut bytes = scheme.bytes();
    match bytes.next() {
        Some(b) if b.is_ascii_alphabetic() => {}
        _ => return false,
    }
    bytes.all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'-' || b == b'.')
}

/// Normalize `[userinfo@]host[:port]` into `host[:port]`.
fn parse_authority(authority: &str) -> Result<String> {
    let hostport = match authority.rfind('@') {
        Some(idx) => &authority[idx + 1..],
        None => authority,
    };

    let (host, port) = if hostport.starts_with('[') {
        let close = hostport
            .find(']')
            .ok_or_else(|| Error::InvalidUrl(format!("missing ']' in host {:?}", hostport)))?;
        let after = &hostport[close + 1..];
        let port = match after.strip_prefix(':') {
            Some(port) => Some(port),
            None if after.is_empty() => None,
            None => {
                return Err(Error::InvalidUrl(format!("invalid port {:?} after host", after)))
            }
        };
        (unescape_zone(&hostport[..=close])?, port)
    } else {
        match hostport.rsplit_once(':') {
            Some((host, port)) => (host.to_string(), Some(port)),
            None => (hostport.to_string(), None),
        }
    };

    match port {
        // "host:" is the same authority as "host"
        Some("") | None => Ok(host),
        Some(port) if port.bytes().all(|b| b.is_ascii_digit()) => Ok(format!("{}:{}", host, port)),
        Some(port) => Err(Error::InvalidUrl(format!("invalid port {:?}", port))),
    }
}

/// `[fe80::1%25en0]` becomes `[fe80::1%en0]`
fn unescape_zone(bracketed: &str) -> Result<String> {
    let Some(pct) = bracketed.find('%') else {
        return Ok(bracketed.to_string());
    };
    let zone = &bracketed[pct..];
    let zone = zone
        .strip_prefix("%25")
        .map(|z| format!("%{}", z))
        .unwrap_or_else(|| zone.to_string());
    let decoded = urlencoding::decode(&zone[1..])
        .map_err(|_| Error::InvalidUrl(format!("invalid zone in {:?}", bracketed)))?;
    Ok(format!("{}%{}", &bracketed[..pct], decoded))
}

/// Whether `host` only holds bytes allowed in a Host header
pub fn valid_host_header(host: &str) -> bool {
    host.bytes().all(|b| {
        b.is_ascii_alphanumeric() || b"!$%&'()*+,-.:;=[]_~".contains(&b)
    })
}

/// Drop an IPv6 zone identifier: `[fe80::1%en0]:80` becomes `[fe80::1]:80`.
pub fn remove_zone(host: &str) -> String {
    if !host.starts_with('[') {
        return host.to_string();
    }
    let Some(close) = host.rfind(']') else {
        return host.to_string();
    };
    match host[..close].rfind('%') {
        Some(pct) => format!("{}{}", &host[..pct], &host[close..]),
        None => host.to_string(),
    }
}

fn split_host_port(hostport: &str) -> (&str, Option<&str>) {
    if hostport.starts_with('[') {
        if let Some(close) = hostport.rfind(']') {
            let port = hostport[close + 1..].strip_prefix(':');
            return (&hostport[..=close], port);
        }
        return (hostport, None);
    }
    match hostport.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => (host, Some(port)),
        _ => (hostport, None),
    }
}

/// `host:port` without the port; brackets of an IPv6 literal are kept
pub fn strip_host_port(hostport: &str) -> &str {
    split_host_port(hostport).0
}
