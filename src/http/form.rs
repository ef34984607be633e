//! URL-encoded form values
//!
//! `Values` is the ordered multi-map behind query strings and
//! `application/x-www-form-urlencoded` bodies.

use super::{Error, Result};
use std::borrow::Cow;

/// Form or query values: each key maps to its values in arrival order.
/// Keys are case-sensitive.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Values {
    entries: Vec<(String, Vec<String>)>,
}

impl Values {
    pub fn new() -> Self {
        Values::default()
    }

    fn position(&self, key: &str) -> Option<usize> {
        self.entries.iter().position(|(k, _)| k == key)
    }

    /// First value for `key`
    pub fn get(&self, key: &str) -> Option<&str> {
        self.get_all(key).first().map(String::as_str)
    }

    pub fn get_all(&self, key: &str) -> &[String] {
        match self.position(key) {
            Some(idx) => &self.entries[idx].1,
            None => &[],
        }
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx].1 = vec![value.into()],
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    pub fn add(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        match self.position(&key) {
            Some(idx) => self.entries[idx].1.push(value.into()),
            None => self.entries.push((key, vec![value.into()])),
        }
    }

    pub fn remove(&mut self, key: &str) -> Vec<String> {
        match self.position(key) {
            Some(idx) => self.entries.remove(idx).1,
            None => Vec::new(),
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        self.position(key).is_some()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(k, _)| k.as_str())
    }

    /// Every (key, value) pair, one per value
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries
            .iter()
            .flat_map(|(k, vs)| vs.iter().map(move |v| (k.as_str(), v.as_str())))
    }

    /// Append every value of `other` after the values already held
    pub fn extend(&mut self, other: Values) {
        for (key, values) in other.entries {
            match self.position(&key) {
                Some(idx) => self.entries[idx].1.extend(values),
                None => self.entries.push((key, values)),
            }
        }
    }

    /// URL-encode as `k=v&k2=v2`, keys sorted
    pub fn encode(&self) -> String {
        let mut keys: Vec<&(String, Vec<String>)> = self.entries.iter().collect();
        keys.sort_by(|a, b| a.0.cmp(&b.0));
        let mut out = String::new();
        for (key, values) in keys {
            let key = query_escape(key);
            for value in values {
                if !out.is_empty() {
                    out.push('&');
                }
                out.push_str(&key);
                out.push('=');
                out.push_str(&query_escape(value));
            }
        }
        out
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Values {
    fn from_iter<T: IntoIterator<Item = (K, V)>>(iter: T) -> Self {
        let mut values = Values::new();
        for (k, v) in iter {
            values.add(k, v);
        }
        values
    }
}

/// Parse a query string or url-encoded body.
///
/// `;` separators and malformed `%` escapes are errors; empty pairs are
/// skipped.
pub fn parse_query(query: &str) -> Result<Values> {
    let mut values = Values::new();
    for pair in query.split('&') {
        if pair.is_empty() {
            continue;
        }
        if pair.contains(';') {
            return Err(Error::InvalidUrl("invalid semicolon separator in query".to_string()));
        }
        let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
        values.add(query_unescape(key)?, query_unescape(value)?);
    }
    Ok(values)
}

/// Decode `+` as space and `%XX` escapes
pub fn query_unescape(s: &str) -> Result<String> {
    let bytes = s.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' {
            let valid = bytes.len() > i + 2
                && bytes[i + 1].is_ascii_hexdigit()
                && bytes[i + 2].is_ascii_hexdigit();
            if !valid {
                let end = (i + 3).min(bytes.len());
                return Err(Error::InvalidUrl(format!(
                    "invalid URL escape {:?}",
                    String::from_utf8_lossy(&bytes[i..end])
                )));
            }
            i += 3;
        } else {
            i += 1;
        }
    }
    let plus_decoded: Cow<str> = if s.contains('+') {
        Cow::Owned(s.replace('+', " "))
    } else {
        Cow::Borrowed(s)
    };
    Ok(String::from_utf8_lossy(&urlencoding::decode_binary(plus_decoded.as_bytes())).into_owned())
}

/// Encode for use inside a query; spaces become `+`
pub fn query_escape(s: &str) -> String {
    urlencoding::encode(s).replace("%20", "+")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let values = parse_query("a=1&b=hello+world&a=2&empty=&flag&&c=%2Fx%3F").unwrap();
        assert_eq!(values.get_all("a"), ["1", "2"]);
        assert_eq!(values.get("b"), Some("hello world"));
        assert_eq!(values.get("empty"), Some(""));
        assert_eq!(values.get("flag"), Some(""));
        assert_eq!(values.get("c"), Some("/x?"));
        assert_eq!(values.keys().collect::<Vec<_>>(), ["a", "b", "empty", "flag", "c"]);
    }

    #[test]
    fn test_parse_query_errors() {
        assert!(parse_query("a=1;b=2").is_err());
        assert!(parse_query("a=%zz").is_err());
        assert!(parse_query("a=%4").is_err());
        assert!(parse_query("").unwrap().is_empty());
    }

    #[test]
    fn test_extend_keeps_existing_first() {
        let mut body: Values = vec![("q", "body")].into_iter().collect();
        let query: Values = vec![("q", "query"), ("z", "1")].into_iter().collect();
        body.extend(query);
        assert_eq!(body.get_all("q"), ["body", "query"]);
        assert_eq!(body.get("z"), Some("1"));
    }

    #[test]
    fn test_encode() {
        let mut values = Values::new();
        values.add("name", "Ava Smith");
        values.add("friend", "Jess");
        values.add("friend", "Sarah & Zoe");
        assert_eq!(values.encode(), "friend=Jess&friend=Sarah+%26+Zoe&name=Ava+Smith");
        assert_eq!(parse_query(&values.encode()).unwrap().get("name"), Some("Ava Smith"));
    }
}
