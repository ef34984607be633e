//! HTTP start-line and line parsing
//!
//! This module reads CRLF-terminated lines from a buffered stream under a byte
//! budget and parses request and status lines.

use super::{Error, Method, Result, Status, Version};
use std::io::{BufRead, Read};

/// Read one line, stripping the trailing `\r\n` (a bare `\n` is accepted).
///
/// At most `*budget` bytes are consumed and the budget is decremented by the
/// amount read. Returns `Ok(None)` on a clean EOF before any byte.
pub fn read_line(reader: &mut dyn BufRead, budget: &mut usize) -> Result<Option<Vec<u8>>> {
    let mut line = Vec::new();
    let limit = *budget as u64;
    let n = Read::take(&mut *reader, limit).read_until(b'\n', &mut line)?;
    *budget -= n;

    if n == 0 {
        if limit == 0 {
            return Err(Error::HeaderTooLarge);
        }
        return Ok(None);
    }
    if line.last() != Some(&b'\n') {
        if n as u64 == limit {
            return Err(Error::HeaderTooLarge);
        }
        return Err(Error::UnexpectedEof);
    }
    line.pop();
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    Ok(Some(line))
}

/// Parse HTTP request line
///
/// Format: METHOD SP request-target SP VERSION
/// Example: GET /index.html HTTP/1.1
pub fn parse_request_line(line: &str) -> Result<(Method, String, Version)> {
    let parts: Vec<&str> = line.split(' ').collect();

    if parts.len() != 3 || parts.iter().any(|p| p.is_empty()) {
        return Err(Error::MalformedRequestLine(line.to_string()));
    }

    let method = Method::from_str(parts[0])?;
    let target = parts[1].to_string();
    let version = Version::from_str(parts[2])?;

    Ok((method, target, version))
}

/// Parse HTTP response status line
///
/// Format: VERSION SP STATUS [SP REASON]
/// Example: HTTP/1.1 200 OK
pub fn parse_status_line(line: &str) -> Result<(Version, Status, String)> {
    let Some((proto, rest)) = line.split_once(' ') else {
        return Err(Error::MalformedStatusLine(line.to_string()));
    };

    let version = Version::from_str(proto)?;
    let rest = rest.trim_start_matches(' ');
    let (code, reason) = rest.split_once(' ').unwrap_or((rest, ""));
    let status = Status::from_str(code)?;
    let reason = if reason.is_empty() {
        status.reason_phrase().to_string()
    } else {
        reason.to_string()
    };

    Ok((version, status, reason))
}
