//! multipart/form-data bodies
//!
//! The reader scans the body for the boundary delimiter as it streams, so
//! part payloads never have to be fully buffered. File parts that do not fit
//! the memory budget are spilled to temporary files.

use super::{Error, Headers, Result, Values, CRLF};
use bytes::{Buf, Bytes, BytesMut};
use memchr::memmem;
use std::io::{self, BufRead, Cursor, Read, Write};
use std::time::{SystemTime, UNIX_EPOCH};
use tempfile::NamedTempFile;

/// Non-file values may use this much on top of the caller's memory budget
const MAX_VALUE_OVERHEAD: u64 = 10 << 20;

/// Budget for the header block of a single part
const MAX_PART_HEADER_BYTES: usize = 64 << 10;

const READ_CHUNK: usize = 8 << 10;

/// A parsed multipart form
#[derive(Debug, Default)]
pub struct MultipartForm {
    pub values: Values,
    files: Vec<(String, Vec<FileHeader>)>,
}

impl MultipartForm {
    /// First file uploaded under `field`
    pub fn file(&self, field: &str) -> Option<&FileHeader> {
        self.files(field).first()
    }

    pub fn files(&self, field: &str) -> &[FileHeader] {
        self.files
            .iter()
            .find(|(name, _)| name == field)
            .map(|(_, files)| files.as_slice())
            .unwrap_or(&[])
    }

    /// Field names that carried files
    pub fn file_fields(&self) -> impl Iterator<Item = &str> {
        self.files.iter().map(|(name, _)| name.as_str())
    }

    fn add_file(&mut self, field: String, file: FileHeader) {
        match self.files.iter_mut().find(|(name, _)| *name == field) {
            Some((_, files)) => files.push(file),
            None => self.files.push((field, vec![file])),
        }
    }
}

enum FileContent {
    Memory(Bytes),
    Disk(NamedTempFile),
}

/// One uploaded file
pub struct FileHeader {
    /// Final path segment of the client-supplied file name
    pub filename: String,
    pub headers: Headers,
    pub size: u64,
    content: FileContent,
}

impl FileHeader {
    /// Open the file content for reading
    pub fn open(&self) -> Result<Box<dyn Read + '_>> {
        match &self.content {
            FileContent::Memory(data) => Ok(Box::new(Cursor::new(&data[..]))),
            FileContent::Disk(tmp) => Ok(Box::new(tmp.reopen()?)),
        }
    }

    /// Whether the content was spilled to a temporary file
    pub fn on_disk(&self) -> bool {
        matches!(self.content, FileContent::Disk(_))
    }
}

impl std::fmt::Debug for FileHeader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHeader")
            .field("filename", &self.filename)
            .field("size", &self.size)
            .field("on_disk", &self.on_disk())
            .finish()
    }
}

/// Buffer in front of the body reader; the delimiter search runs over it.
struct ScanBuffer<R> {
    reader: R,
    buf: BytesMut,
}

impl<R: Read> ScanBuffer<R> {
    /// Pull more bytes from the reader. Returns false at EOF.
    fn fill_more(&mut self) -> io::Result<bool> {
        let start = self.buf.len();
        self.buf.resize(start + READ_CHUNK, 0);
        let n = loop {
            match self.reader.read(&mut self.buf[start..]) {
                Ok(n) => break n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    self.buf.truncate(start);
                    return Err(e);
                }
            }
        };
        self.buf.truncate(start + n);
        Ok(n > 0)
    }

    fn fill_to(&mut self, len: usize) -> io::Result<bool> {
        while self.buf.len() < len {
            if !self.fill_more()? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

impl<R: Read> Read for ScanBuffer<R> {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        let available = self.fill_buf()?;
        let n = available.len().min(out.len());
        out[..n].copy_from_slice(&available[..n]);
        self.consume(n);
        Ok(n)
    }
}

impl<R: Read> BufRead for ScanBuffer<R> {
    fn fill_buf(&mut self) -> io::Result<&[u8]> {
        if self.buf.is_empty() {
            self.fill_more()?;
        }
        Ok(&self.buf[..])
    }

    fn consume(&mut self, amt: usize) {
        self.buf.advance(amt);
    }
}

/// Streaming reader over the parts of a multipart body
pub struct MultipartReader<R> {
    scan: ScanBuffer<R>,
    delimiter: Vec<u8>,
    started: bool,
    in_part: bool,
    finished: bool,
}

impl<R: Read> MultipartReader<R> {
    pub fn new(reader: R, boundary: &str) -> Self {
        // The leading CRLF lets a delimiter on the very first line match.
        let mut buf = BytesMut::with_capacity(READ_CHUNK);
        buf.extend_from_slice(CRLF.as_bytes());
        MultipartReader {
            scan: ScanBuffer { reader, buf },
            delimiter: format!("\r\n--{}", boundary).into_bytes(),
            started: false,
            in_part: false,
            finished: false,
        }
    }

    /// Feed payload to `sink` up to the next delimiter, then consume the rest
    /// of the delimiter line. Returns true after the closing delimiter.
    fn read_until_delimiter(&mut self, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<bool> {
        let finder = memmem::Finder::new(&self.delimiter);
        loop {
            if let Some(idx) = finder.find(&self.scan.buf) {
                sink(&self.scan.buf[..idx])?;
                self.scan.buf.advance(idx + self.delimiter.len());
                return self.finish_delimiter_line();
            }
            // Keep a tail that could be the start of a split delimiter
            let safe = self.scan.buf.len().saturating_sub(self.delimiter.len() - 1);
            if safe > 0 {
                sink(&self.scan.buf[..safe])?;
                self.scan.buf.advance(safe);
            }
            if !self.scan.fill_more()? {
                return Err(Error::Multipart("unexpected EOF".to_string()));
            }
        }
    }

    fn finish_delimiter_line(&mut self) -> Result<bool> {
        if !self.scan.fill_to(2)? {
            return Err(Error::Multipart("unexpected EOF after boundary".to_string()));
        }
        if &self.scan.buf[..2] == b"--" {
            self.scan.buf.advance(2);
            return Ok(true);
        }
        // Transport padding, then the line break
        loop {
            if !self.scan.fill_to(1)? {
                return Err(Error::Multipart("unexpected EOF after boundary".to_string()));
            }
            match self.scan.buf[0] {
                b' ' | b'\t' => self.scan.buf.advance(1),
                b'\n' => {
                    self.scan.buf.advance(1);
                    return Ok(false);
                }
                b'\r' => {
                    if !self.scan.fill_to(2)? || self.scan.buf[1] != b'\n' {
                        return Err(Error::Multipart("malformed boundary line".to_string()));
                    }
                    self.scan.buf.advance(2);
                    return Ok(false);
                }
                _ => return Err(Error::Multipart("malformed boundary line".to_string())),
            }
        }
    }

    /// Advance to the next part and return its headers, or `None` after the
    /// closing delimiter. An unread body of the previous part is skipped.
    pub fn next_part(&mut self) -> Result<Option<Headers>> {
        if !self.started || self.in_part {
            self.started = true;
            self.in_part = false;
            if self.read_until_delimiter(&mut |_: &[u8]| Ok(()))? {
                self.finished = true;
            }
        }
        if self.finished {
            return Ok(None);
        }
        let mut budget = MAX_PART_HEADER_BYTES;
        let headers = Headers::read_from(&mut self.scan, &mut budget).map_err(|e| match e {
            Error::HeaderTooLarge => Error::Multipart("part header too large".to_string()),
            Error::UnexpectedEof => Error::Multipart("unexpected EOF in part header".to_string()),
            other => other,
        })?;
        self.in_part = true;
        Ok(Some(headers))
    }

    /// Stream the body of the current part into `sink`
    pub fn read_part_body(&mut self, sink: &mut dyn FnMut(&[u8]) -> Result<()>) -> Result<()> {
        if !self.in_part {
            return Ok(());
        }
        self.in_part = false;
        if self.read_until_delimiter(sink)? {
            self.finished = true;
        }
        Ok(())
    }
}

/// `Content-Type`/`Content-Disposition` style value: a lower-cased type and
/// its parameters. Parameter values may be quoted strings.
pub(crate) fn parse_media_type(value: &str) -> Option<(String, Vec<(String, String)>)> {
    let (media, mut rest) = match value.find(';') {
        Some(idx) => (&value[..idx], &value[idx..]),
        None => (value, ""),
    };
    let media = media.trim().to_ascii_lowercase();
    if media.is_empty() {
        return None;
    }

    let mut params = Vec::new();
    loop {
        rest = rest.trim_start_matches([' ', '\t']);
        let Some(after) = rest.strip_prefix(';') else {
            break;
        };
        rest = after.trim_start_matches([' ', '\t']);
        if rest.is_empty() {
            break;
        }
        let eq = rest.find('=')?;
        let key = rest[..eq].trim().to_ascii_lowercase();
        rest = &rest[eq + 1..];
        let value = if let Some(quoted) = rest.strip_prefix('"') {
            let mut out = String::new();
            let mut chars = quoted.char_indices();
            let mut end = None;
            while let Some((i, c)) = chars.next() {
                match c {
                    '\\' => {
                        if let Some((_, escaped)) = chars.next() {
                            out.push(escaped);
                        }
                    }
                    '"' => {
                        end = Some(i + 1);
                        break;
                    }
                    c => out.push(c),
                }
            }
            rest = &quoted[end?..];
            out
        } else {
            let end = rest.find(';').unwrap_or(rest.len());
            let token = rest[..end].trim().to_string();
            rest = &rest[end..];
            token
        };
        if key.is_empty() {
            return None;
        }
        params.push((key, value));
    }
    Some((media, params))
}

fn param<'a>(params: &'a [(String, String)], name: &str) -> Option<&'a str> {
    params
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Last segment of a client path, on either separator
fn base_name(filename: &str) -> &str {
    filename.rsplit(['/', '\\']).next().unwrap_or(filename)
}

/// Boundary parameter of a multipart Content-Type, if the type is one the
/// form reader accepts.
pub(crate) fn form_boundary(content_type: &str) -> Option<String> {
    let (media, params) = parse_media_type(content_type)?;
    if media != "multipart/form-data" && media != "multipart/mixed" {
        return None;
    }
    param(&params, "boundary")
        .filter(|b| !b.is_empty())
        .map(str::to_string)
}

enum FileSink {
    Memory(Vec<u8>),
    Disk(NamedTempFile, u64),
}

impl FileSink {
    fn write(&mut self, chunk: &[u8], memory_left: u64) -> Result<()> {
        match self {
            FileSink::Memory(buf) if (buf.len() + chunk.len()) as u64 > memory_left => {
                let mut file = tempfile::Builder::new().prefix("multipart-").tempfile()?;
                file.write_all(buf)?;
                file.write_all(chunk)?;
                let size = (buf.len() + chunk.len()) as u64;
                *self = FileSink::Disk(file, size);
            }
            FileSink::Memory(buf) => buf.extend_from_slice(chunk),
            FileSink::Disk(file, size) => {
                file.write_all(chunk)?;
                *size += chunk.len() as u64;
            }
        }
        Ok(())
    }
}

/// Read a whole multipart form.
///
/// File parts are kept in memory while they fit `max_memory`; larger ones
/// go to temporary files that are removed when the form is dropped.
/// Non-file values may use `max_memory` plus 10 MiB in total.
pub fn read_form<R: Read>(reader: R, boundary: &str, max_memory: u64) -> Result<MultipartForm> {
    let mut parts = MultipartReader::new(reader, boundary);
    let mut form = MultipartForm::default();
    let mut memory_left = max_memory;
    let mut value_left = max_memory.saturating_add(MAX_VALUE_OVERHEAD);

    while let Some(headers) = parts.next_part()? {
        let disposition = headers.get("Content-Disposition").unwrap_or("");
        let Some((disposition_type, params)) = parse_media_type(disposition) else {
            continue;
        };
        if disposition_type != "form-data" {
            continue;
        }
        let Some(name) = param(&params, "name").filter(|n| !n.is_empty()) else {
            continue;
        };
        let name = name.to_string();
        let filename = param(&params, "filename").map(base_name).unwrap_or("");

        if filename.is_empty() {
            let mut value = Vec::new();
            parts.read_part_body(&mut |chunk: &[u8]| {
                if (value.len() + chunk.len()) as u64 > value_left {
                    return Err(Error::Multipart("message too large".to_string()));
                }
                value.extend_from_slice(chunk);
                Ok(())
            })?;
            value_left -= value.len() as u64;
            form.values.add(name, String::from_utf8_lossy(&value).into_owned());
            continue;
        }

        let filename = filename.to_string();
        let mut sink = FileSink::Memory(Vec::new());
        parts.read_part_body(&mut |chunk: &[u8]| sink.write(chunk, memory_left))?;
        let (content, size) = match sink {
            FileSink::Memory(buf) => {
                memory_left -= buf.len() as u64;
                let size = buf.len() as u64;
                (FileContent::Memory(Bytes::from(buf)), size)
            }
            FileSink::Disk(mut file, size) => {
                file.flush()?;
                (FileContent::Disk(file), size)
            }
        };
        form.add_file(
            name,
            FileHeader {
                filename,
                headers,
                size,
                content,
            },
        );
    }
    Ok(form)
}

/// Builds a multipart/form-data body
pub struct MultipartWriter<W: Write> {
    writer: W,
    boundary: String,
    first: bool,
}

impl<W: Write> MultipartWriter<W> {
    /// Writer with a boundary derived from the current time
    pub fn new(writer: W) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        MultipartWriter::with_boundary(writer, &format!("httpwire{:032x}", nanos))
    }

    pub fn with_boundary(writer: W, boundary: &str) -> Self {
        MultipartWriter {
            writer,
            boundary: boundary.to_string(),
            first: true,
        }
    }

    pub fn boundary(&self) -> &str {
        &self.boundary
    }

    /// Content-Type header value for the body being written
    pub fn form_data_content_type(&self) -> String {
        format!("multipart/form-data; boundary={}", self.boundary)
    }

    fn start_part(&mut self, headers: &Headers) -> Result<()> {
        if self.first {
            write!(self.writer, "--{}\r\n", self.boundary)?;
            self.first = false;
        } else {
            write!(self.writer, "\r\n--{}\r\n", self.boundary)?;
        }
        headers.write_to(&mut self.writer, &[])?;
        self.writer.write_all(CRLF.as_bytes())?;
        Ok(())
    }

    pub fn write_field(&mut self, name: &str, value: &str) -> Result<()> {
        let mut headers = Headers::new();
        headers.set(
            "Content-Disposition",
            format!("form-data; name=\"{}\"", escape_quotes(name)),
        );
        self.start_part(&headers)?;
        self.writer.write_all(value.as_bytes())?;
        Ok(())
    }

    pub fn write_file(&mut self, field: &str, filename: &str, data: &[u8]) -> Result<()> {
        let mut headers = Headers::new();
        headers.set(
            "Content-Disposition",
            format!(
                "form-data; name=\"{}\"; filename=\"{}\"",
                escape_quotes(field),
                escape_quotes(filename)
            ),
        );
        headers.set("Content-Type", "application/octet-stream");
        self.start_part(&headers)?;
        self.writer.write_all(data)?;
        Ok(())
    }

    /// Write the closing delimiter and return the inner writer
    pub fn finish(mut self) -> Result<W> {
        if self.first {
            write!(self.writer, "--{}--\r\n", self.boundary)?;
        } else {
            write!(self.writer, "\r\n--{}--\r\n", self.boundary)?;
        }
        self.writer.flush()?;
        Ok(self.writer)
    }
}

fn escape_quotes(s: &str) -> String {
    s.replace('\\', "\\\\").replace('"', "\\\"")
}


#[cfg(test)]
mod tests {
    use super::*;

    const BODY: &str = "preamble ignored\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
hello world\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"upload\"; filename=\"../../etc/passwd\"\r\n\
Content-Type: text/plain\r\n\
\r\n\
root:x:0:0\r\n\
--XyZ \r\n\
Content-Disposition: form-data; name=\"title\"\r\n\
\r\n\
second\r\n\
--XyZ--\r\n\
epilogue";

    fn read_all(file: &FileHeader) -> Vec<u8> {
        let mut out = Vec::new();
        file.open().unwrap().read_to_end(&mut out).unwrap();
        out
    }

    #[test]
    fn test_read_form() {
        let form = read_form(BODY.as_bytes(), "XyZ", 1024).unwrap();
        assert_eq!(form.values.get_all("title"), ["hello world", "second"]);

        let file = form.file("upload").unwrap();
        assert_eq!(file.filename, "passwd");
        assert_eq!(file.size, 10);
        assert_eq!(file.headers.get("Content-Type"), Some("text/plain"));
        assert!(!file.on_disk());
        assert_eq!(read_all(file), b"root:x:0:0");
        assert!(form.file("missing").is_none());
    }

    #[test]
    fn test_large_file_spills_to_disk() {
        let payload = vec![b'z'; 5000];
        let mut writer = MultipartWriter::with_boundary(Vec::new(), "b0undary");
        writer.write_file("blob", "C:\\temp\\big.bin", &payload).unwrap();
        writer.write_field("note", "small").unwrap();
        let body = writer.finish().unwrap();

        let form = read_form(&body[..], "b0undary", 100).unwrap();
        let file = form.file("blob").unwrap();
        assert_eq!(file.filename, "big.bin");
        assert!(file.on_disk());
        assert_eq!(file.size, 5000);
        assert_eq!(read_all(file), payload);
        assert_eq!(form.values.get("note"), Some("small"));
    }

    #[test]
    fn test_delimiter_split_across_reads() {
        let mut writer = MultipartWriter::with_boundary(Vec::new(), "sep");
        let value = "x".repeat(READ_CHUNK - 3);
        writer.write_field("v", &value).unwrap();
        let body = writer.finish().unwrap();

        let reader = io::BufReader::with_capacity(7, &body[..]);
        let form = read_form(reader, "sep", 1 << 20).unwrap();
        assert_eq!(form.values.get("v"), Some(value.as_str()));
    }

    #[test]
    fn test_value_limit() {
        let huge = "a".repeat((MAX_VALUE_OVERHEAD + 1) as usize);
        let mut writer = MultipartWriter::with_boundary(Vec::new(), "lim");
        writer.write_field("big", &huge).unwrap();
        let body = writer.finish().unwrap();

        let err = read_form(&body[..], "lim", 0).unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
        assert!(read_form(&body[..], "lim", 1).is_ok());
    }

    #[test]
    fn test_truncated_body() {
        let body = "--b\r\nContent-Disposition: form-data; name=\"a\"\r\n\r\nno end";
        let err = read_form(body.as_bytes(), "b", 1024).unwrap_err();
        assert!(matches!(err, Error::Multipart(_)));
    }

    #[test]
    fn test_parts_without_name_are_skipped() {
        let body = "--b\r\nContent-Disposition: attachment; name=\"a\"\r\n\r\n1\r\n\
--b\r\nContent-Type: text/plain\r\n\r\n2\r\n--b--";
        let form = read_form(body.as_bytes(), "b", 1024).unwrap();
        assert!(form.values.is_empty());
    }

    #[test]
    fn test_parse_media_type() {
        let (media, params) =
            parse_media_type("Multipart/Form-Data; boundary=\"a b\\\"c\"; charset=utf-8").unwrap();
        assert_eq!(media, "multipart/form-data");
        assert_eq!(param(&params, "boundary"), Some("a b\"c"));
        assert_eq!(param(&params, "charset"), Some("utf-8"));

        assert_eq!(form_boundary("multipart/form-data; boundary=xyz").as_deref(), Some("xyz"));
        assert_eq!(form_boundary("multipart/mixed; boundary=xyz").as_deref(), Some("xyz"));
        assert_eq!(form_boundary("multipart/form-data"), None);
        assert_eq!(form_boundary("text/plain; boundary=xyz"), None);
    }
}
