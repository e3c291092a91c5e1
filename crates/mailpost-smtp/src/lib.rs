//! # mailpost-smtp
//!
//! An SMTP delivery client: hands messages to a relay over RFC 5321.
//!
//! ## Features
//!
//! - **Transport**: TCP, Unix sockets, implicit TLS (`ssl://`/`tls://`) and
//!   in-place STARTTLS upgrades, with per-operation timeouts
//! - **Protocol**: EHLO/HELO negotiation, multiline replies, PIPELINING with
//!   deferred reply checking
//! - **Authentication**: PLAIN and LOGIN built in, CRAM-MD5 and DIGEST-MD5
//!   through a [`SaslProvider`]
//! - **Transactions**: header scrubbing, sender selection, SIZE checks,
//!   dot-stuffing and rollback on failure
//!
//! ## Quick Start
//!
//! ```no_run
//! use mailpost_smtp::{AuthSetting, Config, Headers, MailSender, SmtpMailer};
//!
//! # async fn example() -> Result<(), mailpost_smtp::SendError> {
//! let config = Config::builder("smtp.example.com")
//!     .port(587)
//!     .auth(AuthSetting::Best)
//!     .credentials("alice", "secret")
//!     .build();
//! let mut mailer = SmtpMailer::new(config);
//!
//! let mut headers = Headers::new();
//! headers.append("From", "Alice <alice@example.com>");
//! headers.append("To", "bob@example.com");
//! headers.append("Subject", "Hello");
//!
//! mailer
//!     .send(&["bob@example.com".to_string()], &headers, b"Hi Bob!\n")
//!     .await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Layers
//!
//! ```text
//! SmtpMailer ── MAIL/RCPT/DATA, rollback, persistence
//!     │
//! Authenticator ── STARTTLS, mechanism selection, SASL exchange
//!     │
//! Client ── commands, replies, pipelining, capabilities
//!     │
//! Socket ── lines, chunks, timeouts, TLS
//! ```
//!
//! ## Modules
//!
//! - [`auth`]: SASL mechanisms and the authentication exchange
//! - [`codec`]: CRLF normalization and dot-stuffing
//! - [`command`]: SMTP command builders
//! - [`config`]: Mailer configuration
//! - [`connection`]: Socket and protocol client
//! - [`parser`]: Reply parser
//! - [`transaction`]: Headers and the mail transaction
//! - [`types`]: Replies, capabilities and addresses

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![forbid(unsafe_code)]

pub mod auth;
pub mod codec;
pub mod command;
pub mod config;
pub mod connection;
mod error;
pub mod parser;
pub mod transaction;
pub mod types;

pub use auth::{Authenticator, Credentials, Md5SaslProvider, SaslProvider};
pub use config::{AuthSetting, Config, ConfigBuilder};
pub use connection::{
    Client, ClientOptions, DebugHandler, Direction, Socket, TlsOptions, TlsVersion,
};
pub use error::{Error, Result, SendError};
pub use transaction::{HeaderValue, Headers, MailSender, SmtpMailer};
pub use types::{
    AddressListParser, AuthMechanism, Capabilities, Mailbox, Reply, ReplyCode,
    SimpleAddressParser,
};

/// Default submission port.
pub const DEFAULT_PORT: u16 = 25;
