//! HTTP headers handling
//!
//! This module provides a type for managing HTTP headers with canonical,
//! case-insensitive field names and an ordered list of values per name.

use super::parser::read_line;
use super::{Error, Result, CRLF};
use std::fmt;
use std::io::{self, BufRead, Write};

/// HTTP headers collection
///
/// Field names are stored in canonical form (`content-type` becomes
/// `Content-Type`). Keys keep their first-insertion order and every key keeps
/// the order its values were added in.
#[derive(Debug, Clone, Default)]
pub struct Headers {
    entries: Vec<(String, Vec<String>)>,
}

impl Headers {
    /// Create a new empty headers collection
    pub fn new() -> Self {
        Headers {
            entries: Vec::new(),
        }
    }

    fn position(&self, name: &str) -> Option<usize> {
        self.entries
            .iter()
            .position(|(n, _)| n.eq_ignore_ascii_case(name))
    }

    /// Replace every value of `name` with `value`
    pub fn set(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let value = value.into();
        match self.position(name.as_ref()) {
            Some(idx) => self.entries[idx].1 = vec![value],
            None => self
                .entries
                .push((canonical_name(name.as_ref()), vec![value])),
        }
    }

    /// Append `value` to the values of `name`
    pub fn add(&mut self, name: impl AsRef<str>, value: impl Into<String>) {
        let value = value.into();
        match self.position(name.as_ref()) {
            Some(idx) => self.entries[idx].1.push(value),
            None => self
                .entries
                .push((canonical_name(name.as_ref()), vec![value])),
        }
    }

    /// Get the first value for a header (case-insensitive)
    pub fn get(&self, name: &str) -> Option<&str> {
        self.position(name)
            .and_then(|idx| self.entries[idx].1.first())
            .map(String::as_str)
    }

    /// Get all values for a header, in insertion order
    pub fn values(&self, name: &str) -> &[String] {
        match self.position(name) {
            Some(idx) => &self.entries[idx].1,
            None => &[],
        }
    }

    /// Check if a header exists
    pub fn contains(&self, name: &str) -> bool {
        self.position(name).is_some()
    }

    /// Remove a header and return its values
    pub fn remove(&mut self, name: &str) -> Vec<String> {
        match self.position(name) {
            Some(idx) => self.entries.remove(idx).1,
            None => Vec::new(),
        }
    }

    /// Whether any comma-separated element of any `name` value equals
    /// `token`, ignoring ASCII case.
    pub fn has_token(&self, name: &str, token: &str) -> bool {
        self.values(name).iter().any(|v| {
            v.split(',')
                .any(|t| t.trim().eq_ignore_ascii_case(token))
        })
    }

    /// Number of distinct field names
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Check if there are no headers
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Clear all headers
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Iterate over field names
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(n, _)| n.as_str())
    }

    /// Iterate over every (name, value) pair, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(n, vs)| vs.iter().map(move |v| (n.as_str(), v.as_str())))
    }

    /// Serialize every key not in `exclude` as `Name: value\r\n` lines.
    ///
    /// Line breaks inside values are replaced by spaces so a value can never
    /// inject extra header lines.
    pub fn write_to(&self, sink: &mut dyn Write, exclude: &[&str]) -> io::Result<()> {
        for (name, values) in &self.entries {
            if exclude.iter().any(|e| e.eq_ignore_ascii_case(name)) {
                continue;
            }
            for value in values {
                let value = value.replace(['\r', '\n'], " ");
                write!(sink, "{}: {}{}", name, value.trim_matches([' ', '\t']), CRLF)?;
            }
        }
        Ok(())
    }

    /// Read a header block up to and including the terminating blank line.
    ///
    /// `budget` is decremented by the bytes consumed; running out fails with
    /// `HeaderTooLarge`.
    pub fn read_from(reader: &mut dyn BufRead, budget: &mut usize) -> Result<Headers> {
        let mut headers = Headers::new();
        let mut last: Option<String> = None;

        loop {
            let line = match read_line(reader, budget)? {
                Some(line) => line,
                None => return Err(Error::UnexpectedEof),
            };
            if line.is_empty() {
                return Ok(headers);
            }
            if line[0] == b' ' || line[0] == b'\t' {
                // obs-fold: continuation of the previous field value
                let name = last
                    .as_ref()
                    .ok_or_else(|| Error::InvalidHeader("continuation before first header".into()))?;
                let text = header_text(line)?;
                let idx = headers
                    .position(name)
                    .ok_or_else(|| Error::InvalidHeader("continuation before first header".into()))?;
                if let Some(prev) = headers.entries[idx].1.last_mut() {
                    prev.push(' ');
                    prev.push_str(text.trim_matches([' ', '\t']));
                }
                continue;
            }
            let text = header_text(line)?;
            let (name, value) = Headers::parse_header_line(&text)?;
            headers.add(&name, value);
            last = Some(name);
        }
    }

    /// Parse a header line into name and value
    pub fn parse_header_line(line: &str) -> Result<(String, String)> {
        let Some(colon_pos) = line.find(':') else {
            return Err(Error::InvalidHeader(format!("no colon in {:?}", line)));
        };
        let name = &line[..colon_pos];
        let value = line[colon_pos + 1..].trim_matches([' ', '\t']);

        if name.is_empty() {
            return Err(Error::InvalidHeader("empty header name".to_string()));
        }
        if !name.bytes().all(is_token_byte) {
            return Err(Error::InvalidHeader(format!("invalid header name {:?}", name)));
        }
        if !valid_field_value(value) {
            return Err(Error::InvalidHeader(format!("invalid value for {}", name)));
        }

        Ok((name.to_string(), value.to_string()))
    }
}

/// Headers are equal when they hold the same field names and, per name, the
/// same values regardless of order.
impl PartialEq for Headers {
    fn eq(&self, other: &Self) -> bool {
        if self.entries.len() != other.entries.len() {
            return false;
        }
        self.entries.iter().all(|(name, values)| {
            let theirs = other.values(name);
            if theirs.len() != values.len() {
                return false;
            }
            let mut a: Vec<&String> = values.iter().collect();
            let mut b: Vec<&String> = theirs.iter().collect();
            a.sort();
            b.sort();
            a == b
        })
    }
}

impl Eq for Headers {}

impl fmt::Display for Headers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (name, value) in self.iter() {
            write!(f, "{}: {}{}", name, value, CRLF)?;
        }
        Ok(())
    }
}

impl<N: AsRef<str>, V: Into<String>> FromIterator<(N, V)> for Headers {
    fn from_iter<T: IntoIterator<Item = (N, V)>>(iter: T) -> Self {
        let mut headers = Headers::new();
        for (name, value) in iter {
            headers.add(name, value);
        }
        headers
    }
}

/// Canonical form of a header field name: the first letter and every letter
/// after a hyphen upper-cased, the rest lower-cased. Names containing bytes
/// outside the token grammar are returned unchanged.
pub fn canonical_name(name: &str) -> String {
    if !name.bytes().all(is_token_byte) {
        return name.to_string();
    }
    let mut upper = true;
    name.chars()
        .map(|c| {
            let out = if upper {
                c.to_ascii_uppercase()
            } else {
                c.to_ascii_lowercase()
            };
            upper = c == '-';
            out
        })
        .collect()
}

/// RFC 7230 `tchar`
pub fn is_token_byte(b: u8) -> bool {
    b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b)
}

/// Whether `s` is a non-empty RFC 7230 token
pub fn is_token(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(is_token_byte)
}

/// Header lines must be UTF-8; other bytes cannot be stored without loss.
fn header_text(line: Vec<u8>) -> Result<String> {
    String::from_utf8(line).map_err(|e| {
        Error::InvalidHeader(format!(
            "non-UTF-8 header line {:?}",
            String::from_utf8_lossy(e.as_bytes())
        ))
    })
}

fn valid_field_value(value: &str) -> bool {
    value
        .bytes()
        .all(|b| b == b'\t' || (b >= 0x20 && b != 0x7f))
}
