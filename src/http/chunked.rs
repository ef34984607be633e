//! Chunked transfer encoding support
//!
//! This module provides encoding and decoding for HTTP chunked transfer encoding.

use super::parser::read_line;
use super::{Error, Headers, Result, CRLF};
use std::io::{self, BufRead, Read, Write};

/// Longest accepted chunk-size line, extensions included
const MAX_LINE_LENGTH: usize = 4096;

/// Budget for the trailer block after the last chunk
const MAX_TRAILER_BYTES: usize = 64 << 10;

/// Chunked encoder
///
/// Every non-empty `write` becomes one `<hex-size>\r\n<payload>\r\n` frame.
/// `finish` must be called to emit the terminating zero-size chunk.
pub struct ChunkedEncoder<W: Write> {
    writer: W,
}

impl<W: Write> ChunkedEncoder<W> {
    /// Create a new chunked encoder
    pub fn new(writer: W) -> Self {
        ChunkedEncoder { writer }
    }

    /// Write a chunk of data
    pub fn write_chunk(&mut self, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }

        // Write chunk size in hex
        write!(self.writer, "{:x}{}", data.len(), CRLF)?;

        // Write chunk data
        self.writer.write_all(data)?;

        // Write trailing CRLF
        self.writer.write_all(CRLF.as_bytes())?;

        Ok(())
    }

    /// Write the final chunk (0-sized chunk)
    pub fn finish(&mut self) -> Result<()> {
        self.finish_with_trailers(&Headers::new())
    }

    /// Write the final chunk followed by trailer fields
    pub fn finish_with_trailers(&mut self, trailers: &Headers) -> Result<()> {
        write!(self.writer, "0{}", CRLF)?;
        trailers.write_to(&mut self.writer, &[])?;
        self.writer.write_all(CRLF.as_bytes())?;
        self.writer.flush()?;
        Ok(())
    }

    /// Get a mutable reference to the underlying writer
    pub fn get_mut(&mut self) -> &mut W {
        &mut self.writer
    }

    /// Consume the encoder and return the underlying writer
    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> Write for ChunkedEncoder<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.write_chunk(buf).map_err(Error::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum ReaderState {
    ChunkSize,
    ChunkData(u64),
    ChunkEnd,
    Complete,
}

/// Failure remembered by a `ChunkedReader`; replayed on every later read.
#[derive(Debug, Clone)]
enum Sticky {
    Eof,
    ChunkSize(String),
    Framing(String),
    Io(io::ErrorKind, String),
}

impl Sticky {
    fn capture(err: &Error) -> Sticky {
        match err {
            Error::UnexpectedEof => Sticky::Eof,
            Error::InvalidChunkSize(s) => Sticky::ChunkSize(s.clone()),
            Error::Io(e) => Sticky::Io(e.kind(), e.to_string()),
            other => Sticky::Framing(other.to_string()),
        }
    }

    fn to_error(&self) -> Error {
        match self {
            Sticky::Eof => Error::UnexpectedEof,
            Sticky::ChunkSize(s) => Error::InvalidChunkSize(s.clone()),
            Sticky::Framing(s) => Error::Protocol(s.clone()),
            Sticky::Io(kind, msg) => Error::Io(io::Error::new(*kind, msg.clone())),
        }
    }
}

/// Streaming chunked body decoder
///
/// Reads the chunked framing from `reader` and yields the payload bytes.
/// Trailer fields sent after the last chunk are collected and available
/// from [`ChunkedReader::trailers`] once the reader returns end of stream.
/// The first framing error is sticky.
pub struct ChunkedReader<R> {
    reader: R,
    state: ReaderState,
    trailers: Headers,
    failed: Option<Sticky>,
}

impl<R: BufRead> ChunkedReader<R> {
    pub fn new(reader: R) -> Self {
        ChunkedReader {
            reader,
            state: ReaderState::ChunkSize,
            trailers: Headers::new(),
            failed: None,
        }
    }

    /// Trailer fields, populated after the terminating chunk was read
    pub fn trailers(&self) -> &Headers {
        &self.trailers
    }

    /// Whether the terminating chunk and trailer block were consumed
    pub fn is_complete(&self) -> bool {
        self.state == ReaderState::Complete
    }

    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_chunk_size(&mut self) -> Result<u64> {
        let mut budget = MAX_LINE_LENGTH;
        let line = match read_line(&mut self.reader, &mut budget) {
            Ok(Some(line)) => line,
            Ok(None) => return Err(Error::UnexpectedEof),
            Err(Error::HeaderTooLarge) => {
                return Err(Error::InvalidChunkSize("chunk size line too long".to_string()))
            }
            Err(e) => return Err(e),
        };
        let line = String::from_utf8_lossy(&line);
        let size = line.split(';').next().unwrap_or("").trim_matches([' ', '\t']);
        parse_hex(size)
    }

    fn read_chunk_end(&mut self) -> Result<()> {
        let mut crlf = [0u8; 2];
        self.reader.read_exact(&mut crlf)?;
        if &crlf != b"\r\n" {
            return Err(Error::Protocol("malformed chunked encoding".to_string()));
        }
        Ok(())
    }

    fn read_inner(&mut self, buf: &mut [u8]) -> Result<usize> {
        loop {
            match self.state {
                ReaderState::ChunkSize => {
                    let size = self.read_chunk_size()?;
                    if size == 0 {
                        let mut budget = MAX_TRAILER_BYTES;
                        self.trailers = Headers::read_from(&mut self.reader, &mut budget)?;
                        self.state = ReaderState::Complete;
                    } else {
                        self.state = ReaderState::ChunkData(size);
                    }
                }
                ReaderState::ChunkData(remaining) => {
                    if buf.is_empty() {
                        return Ok(0);
                    }
                    let max = remaining.min(buf.len() as u64) as usize;
                    let n = self.reader.read(&mut buf[..max])?;
                    if n == 0 {
                        return Err(Error::UnexpectedEof);
                    }
                    let remaining = remaining - n as u64;
                    self.state = if remaining == 0 {
                        ReaderState::ChunkEnd
                    } else {
                        ReaderState::ChunkData(remaining)
                    };
                    return Ok(n);
                }
                ReaderState::ChunkEnd => {
                    self.read_chunk_end()?;
                    self.state = ReaderState::ChunkSize;
                }
                ReaderState::Complete => return Ok(0),
            }
        }
    }
}

impl<R: BufRead> Read for ChunkedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(sticky) = &self.failed {
            return Err(sticky.to_error().into_io());
        }
        match self.read_inner(buf) {
            Ok(n) => Ok(n),
            Err(e) => {
                self.failed = Some(Sticky::capture(&e));
                Err(e.into_io())
            }
        }
    }
}

fn parse_hex(s: &str) -> Result<u64> {
    if s.is_empty() || s.len() > 16 || !s.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(Error::InvalidChunkSize(s.to_string()));
    }
    u64::from_str_radix(s, 16).map_err(|_| Error::InvalidChunkSize(s.to_string()))
}

/// Decode complete chunked body from bytes
pub fn decode_chunked_body(input: &[u8]) -> Result<Vec<u8>> {
    let mut reader = ChunkedReader::new(input);
    let mut output = Vec::new();
    reader.read_to_end(&mut output)?;
    Ok(output)
}

/// Encode data as chunked body
pub fn encode_chunked_body(data: &[u8], chunk_size: usize) -> Result<Vec<u8>> {
    let mut output = Vec::new();
    let mut encoder = ChunkedEncoder::new(&mut output);

    for chunk in data.chunks(chunk_size.max(1)) {
        encoder.write_chunk(chunk)?;
    }

    encoder.finish()?;

    Ok(output)
}
