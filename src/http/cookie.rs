//! Cookie and Set-Cookie handling
//!
//! Parsing follows RFC 6265 with the usual browser leniency: attributes are
//! matched case-insensitively and anything not understood is kept in
//! [`Cookie::unparsed`]. Serialization sanitizes values instead of failing,
//! logging what was dropped.

use super::headers::is_token;
use super::{Error, Headers, Result, TIME_FORMAT};
use chrono::{DateTime, Datelike, NaiveDateTime, TimeZone, Utc};
use log::warn;
use std::fmt;
use std::net::IpAddr;

/// The SameSite attribute
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SameSite {
    /// Attribute absent or not recognized
    #[default]
    Default,
    Lax,
    Strict,
    None,
}

/// An HTTP cookie, as sent in a Set-Cookie header or one `name=value` pair
/// of a Cookie header.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Cookie {
    pub name: String,
    pub value: String,
    /// The value was (or should be) sent wrapped in double quotes
    pub quoted: bool,

    pub path: String,
    pub domain: String,
    pub expires: Option<DateTime<Utc>>,
    /// Expires as received, also when it could not be parsed
    pub raw_expires: String,

    /// 0 means no Max-Age attribute, a negative value means "delete now"
    /// (`Max-Age=0` on the wire), a positive value is seconds.
    pub max_age: i64,
    pub secure: bool,
    pub http_only: bool,
    pub same_site: SameSite,

    /// The full Set-Cookie line this cookie was parsed from
    pub raw: String,
    /// Attribute-value pairs that were not understood
    pub unparsed: Vec<String>,
}

impl Cookie {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Cookie {
            name: name.into(),
            value: value.into(),
            ..Cookie::default()
        }
    }

    /// Parse one Set-Cookie header value. Returns `None` when the leading
    /// `name=value` pair is unusable.
    pub fn parse_set_cookie(line: &str) -> Option<Cookie> {
        let mut parts = line.trim().split(';');
        let first = parts.next()?.trim();
        let (name, value) = first.split_once('=')?;
        let name = name.trim();
        if !is_token(name) {
            return None;
        }
        let (value, quoted) = parse_cookie_value(value, true)?;

        let mut cookie = Cookie {
            name: name.to_string(),
            value: value.to_string(),
            quoted,
            raw: line.to_string(),
            ..Cookie::default()
        };

        for part in parts {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if !cookie.apply_attribute(part) {
                cookie.unparsed.push(part.to_string());
            }
        }
        Some(cookie)
    }

    /// Returns false when the attribute goes to `unparsed`.
    fn apply_attribute(&mut self, part: &str) -> bool {
        let (attr, val) = part.split_once('=').unwrap_or((part, ""));
        if !attr.is_ascii() {
            return true;
        }
        let Some((val, _)) = parse_cookie_value(val, false) else {
            return false;
        };
        match attr.to_ascii_lowercase().as_str() {
            "samesite" => {
                self.same_site = match val.to_ascii_lowercase().as_str() {
                    "lax" => SameSite::Lax,
                    "strict" => SameSite::Strict,
                    "none" => SameSite::None,
                    _ => SameSite::Default,
                };
                true
            }
            "secure" => {
                self.secure = true;
                true
            }
            "httponly" => {
                self.http_only = true;
                true
            }
            "domain" => {
                self.domain = val.to_string();
                true
            }
            "max-age" => match val.parse::<i64>() {
                Ok(secs) if secs == 0 || !val.starts_with('0') => {
                    self.max_age = if secs <= 0 { -1 } else { secs };
                    true
                }
                _ => false,
            },
            "expires" => {
                self.raw_expires = val.to_string();
                let parsed = parse_cookie_time(val);
                self.expires = parsed.filter(valid_cookie_expires);
                parsed.is_some()
            }
            "path" => {
                self.path = val.to_string();
                true
            }
            _ => false,
        }
    }

    /// Check the cookie for attributes that cannot be serialized faithfully.
    pub fn valid(&self) -> Result<()> {
        if !is_token(&self.name) {
            return Err(Error::InvalidCookie(format!("invalid cookie name {:?}", self.name)));
        }
        if let Some(expires) = self.expires {
            if !valid_cookie_expires(&expires) {
                return Err(Error::InvalidCookie("invalid cookie expiry".to_string()));
            }
        }
        if let Some(b) = self.value.bytes().find(|b| !valid_cookie_value_byte(*b)) {
            return Err(Error::InvalidCookie(format!(
                "invalid byte {:?} in cookie value",
                b as char
            )));
        }
        if let Some(b) = self.path.bytes().find(|b| !valid_cookie_path_byte(*b)) {
            return Err(Error::InvalidCookie(format!(
                "invalid byte {:?} in cookie path",
                b as char
            )));
        }
        if !self.domain.is_empty() && !valid_cookie_domain(&self.domain) {
            return Err(Error::InvalidCookie(format!("invalid cookie domain {:?}", self.domain)));
        }
        Ok(())
    }

    /// `name=value` as sent in a request Cookie header
    pub(crate) fn request_pair(&self) -> String {
        let name = self.name.replace(['\r', '\n'], "-");
        format!("{}={}", name, sanitize_cookie_value(&self.value, self.quoted))
    }
}

/// Serialized for a Set-Cookie header. A cookie with an invalid name
/// serializes to the empty string.
impl fmt::Display for Cookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !is_token(&self.name) {
            return Ok(());
        }
        write!(f, "{}={}", self.name, sanitize_cookie_value(&self.value, self.quoted))?;
        if !self.path.is_empty() {
            write!(f, "; Path={}", sanitize_or_warn("Cookie.Path", valid_cookie_path_byte, &self.path))?;
        }
        if !self.domain.is_empty() {
            if valid_cookie_domain(&self.domain) {
                let domain = self.domain.strip_prefix('.').unwrap_or(&self.domain);
                write!(f, "; Domain={}", domain)?;
            } else {
                warn!("invalid Cookie.Domain {:?}; dropping domain attribute", self.domain);
            }
        }
        if let Some(expires) = self.expires {
            if valid_cookie_expires(&expires) {
                write!(f, "; Expires={}", expires.format(TIME_FORMAT))?;
            }
        }
        if self.max_age > 0 {
            write!(f, "; Max-Age={}", self.max_age)?;
        } else if self.max_age < 0 {
            write!(f, "; Max-Age=0")?;
        }
        match self.same_site {
            SameSite::Default => {}
            SameSite::Lax => write!(f, "; SameSite=Lax")?,
            SameSite::Strict => write!(f, "; SameSite=Strict")?,
            SameSite::None => write!(f, "; SameSite=None")?,
        }
        if self.secure {
            write!(f, "; Secure")?;
        }
        if self.http_only {
            write!(f, "; HttpOnly")?;
        }
        Ok(())
    }
}

/// Every cookie from the Set-Cookie headers of a response
pub fn read_set_cookies(headers: &Headers) -> Vec<Cookie> {
    headers
        .values("Set-Cookie")
        .iter()
        .filter_map(|line| Cookie::parse_set_cookie(line))
        .collect()
}

/// Cookies from the Cookie headers of a request, optionally only those
/// named `filter`.
pub fn read_cookies(headers: &Headers, filter: Option<&str>) -> Vec<Cookie> {
    headers
        .values("Cookie")
        .iter()
        .flat_map(|line| parse_cookie_header(line, filter))
        .collect()
}

/// Parse a Cookie header value: `name1=value1; name2=value2`
pub fn parse_cookie_header(line: &str, filter: Option<&str>) -> Vec<Cookie> {
    let mut cookies = Vec::new();
    for part in line.trim().split(';') {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        let (name, value) = part.split_once('=').unwrap_or((part, ""));
        let name = name.trim();
        if !is_token(name) {
            continue;
        }
        if filter.is_some_and(|f| f != name) {
            continue;
        }
        let Some((value, quoted)) = parse_cookie_value(value, true) else {
            continue;
        };
        cookies.push(Cookie {
            name: name.to_string(),
            value: value.to_string(),
            quoted,
            ..Cookie::default()
        });
    }
    cookies
}

fn parse_cookie_value(raw: &str, allow_double_quote: bool) -> Option<(&str, bool)> {
    let mut raw = raw;
    let mut quoted = false;
    if allow_double_quote && raw.len() > 1 && raw.starts_with('"') && raw.ends_with('"') {
        raw = &raw[1..raw.len() - 1];
        quoted = true;
    }
    if raw.bytes().all(valid_cookie_value_byte) {
        Some((raw, quoted))
    } else {
        None
    }
}

/// `Wed, 23-Nov-2011 01:05:03 GMT` and the RFC 1123 form. The weekday is
/// checked for syntax only; any alphabetic zone is read as UTC.
fn parse_cookie_time(value: &str) -> Option<DateTime<Utc>> {
    let (weekday, rest) = value.split_once(", ")?;
    if weekday.is_empty() || !weekday.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    let (stamp, zone) = rest.rsplit_once(' ')?;
    if zone.is_empty() || !zone.bytes().all(|b| b.is_ascii_alphabetic()) {
        return None;
    }
    ["%d %b %Y %H:%M:%S", "%d-%b-%Y %H:%M:%S"]
        .iter()
        .find_map(|layout| NaiveDateTime::parse_from_str(stamp, layout).ok())
        .map(|t| Utc.from_utc_datetime(&t))
}

fn valid_cookie_expires(t: &DateTime<Utc>) -> bool {
    // IETF RFC 6265 Section 5.1.1.5, the year must not be less than 1601
    t.year() >= 1601
}

fn valid_cookie_value_byte(b: u8) -> bool {
    (0x20..0x7f).contains(&b) && b != b'"' && b != b';' && b != b'\\'
}

fn valid_cookie_path_byte(b: u8) -> bool {
    (0x20..0x7f).contains(&b) && b != b';'
}

fn sanitize_cookie_value(value: &str, quoted: bool) -> String {
    let value = sanitize_or_warn("Cookie.Value", valid_cookie_value_byte, value);
    if value.is_empty() {
        return value;
    }
    if quoted || value.contains([' ', ',']) {
        return format!("\"{}\"", value);
    }
    value
}

fn sanitize_or_warn(field: &str, valid: fn(u8) -> bool, value: &str) -> String {
    if value.bytes().all(valid) {
        return value.to_string();
    }
    let mut out = String::with_capacity(value.len());
    for b in value.bytes() {
        if valid(b) {
            out.push(b as char);
        } else {
            warn!("invalid byte {:?} in {}; dropping invalid bytes", b as char, field);
        }
    }
    out
}

/// A domain attribute is either a host name (optionally with a leading dot)
/// or an IP address without a port.
fn valid_cookie_domain(domain: &str) -> bool {
    if is_cookie_domain_name(domain) {
        return true;
    }
    domain.parse::<IpAddr>().is_ok() && !domain.contains(':')
}

fn is_cookie_domain_name(s: &str) -> bool {
    if s.is_empty() || s.len() > 255 {
        return false;
    }
    let s = s.strip_prefix('.').unwrap_or(s);
    let mut last = b'.';
    let mut ok = false;
    let mut part_len = 0;
    for c in s.bytes() {
        match c {
            b'a'..=b'z' | b'A'..=b'Z' => {
                ok = true;
                part_len += 1;
            }
            b'0'..=b'9' => part_len += 1,
            b'-' => {
                if last == b'.' {
                    return false;
                }
                part_len += 1;
            }
            b'.' => {
                if last == b'.' || last == b'-' {
                    return false;
                }
                if part_len > 63 || part_len == 0 {
                    return false;
                }
                part_len = 0;
            }
            _ => return false,
        }
        last = c;
    }
    if last == b'-' || part_len > 63 {
        return false;
    }
    ok
}
