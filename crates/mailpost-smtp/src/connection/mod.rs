//! Transport and protocol engine.
//!
//! [`Socket`] moves bytes: line reads with per-iteration timeouts, chunked
//! writes and in-place TLS switching. [`Client`] speaks SMTP over it:
//! command formatting, multi-line replies, EHLO negotiation and pipelined
//! reply batches.

mod client;
mod socket;
mod stream;

pub use client::{
    Client, ClientOptions, DATA_BLOCK_SIZE, DebugHandler, Direction, MAX_REPLY_LINE,
};
pub use socket::{ConnectionState, DEFAULT_CHUNK_SIZE, Socket};
pub use stream::{BoxedIo, Io, SmtpStream, TlsOptions, TlsVersion, create_tls_connector};
