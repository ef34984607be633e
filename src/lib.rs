//! httpwire - HTTP/1.1 message engine
//!
//! This crate parses and serializes HTTP/1.x requests and responses over a
//! blocking byte-stream connection, and provides a small threaded server,
//! a pattern router and a single-connection client on top.

pub mod http;
