//! Error types for SMTP operations.

use std::io;
use std::time::Duration;

/// Result type alias for SMTP operations.
pub type Result<T> = std::result::Result<T, Error>;

/// SMTP error types.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// TLS error.
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// Invalid DNS name for TLS.
    #[error("Invalid DNS name: {0}")]
    InvalidDnsName(#[from] rustls::pki_types::InvalidDnsNameError),

    /// Address resolution or connection setup failed.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The socket is closed or was never opened.
    #[error("Not connected")]
    NotConnected,

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Server reply did not match the accepted codes.
    #[error(
        "Invalid response code received from server (code: {}, expected: {}): {text}",
        code_text(.code),
        codes_text(.expected)
    )]
    Protocol {
        /// Codes the caller would have accepted.
        expected: Vec<u16>,
        /// Code actually received; `None` when the reply was not numeric
        /// or the connection closed mid-reply.
        code: Option<u16>,
        /// Accumulated reply text.
        text: String,
    },

    /// A deferred (pipelined) command was rejected when its batch was read.
    #[error("Pipelined {verb} {argument} failed: {source}")]
    Pipelined {
        /// Command verb, e.g. `RCPT`.
        verb: String,
        /// Command target, e.g. the recipient address.
        argument: String,
        /// Underlying reply error.
        #[source]
        source: Box<Error>,
    },

    /// Command contains characters that cannot be sent.
    #[error("Invalid command: {0}")]
    Format(String),

    /// No usable mechanism, or credentials rejected.
    #[error("Authentication failed: {0}")]
    Auth(String),

    /// Message is at or above the server's advertised SIZE.
    #[error("Message size exceeds server limit: {size} bytes (limit {limit})")]
    SizeLimitExceeded {
        /// Encoded message size.
        size: usize,
        /// Limit advertised in the SIZE capability.
        limit: usize,
    },

    /// Neither `Return-Path` nor `From` yielded an envelope sender.
    #[error("No From: address has been provided")]
    MissingSender,

    /// A recipient was refused.
    #[error("Recipient {address} refused: {source}")]
    Recipient {
        /// Recipient address as sent in RCPT TO.
        address: String,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },

    /// DATA phase failed.
    #[error("Data transfer failed: {0}")]
    DataTransfer(#[source] Box<Error>),

    /// Connection could not be created.
    #[error("Failed to create SMTP connection: {0}")]
    Create(#[source] Box<Error>),

    /// Address list could not be parsed.
    #[error("Invalid address: {0}")]
    Address(String),

    /// Invalid configuration.
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Invalid state for operation.
    #[error("Invalid state for operation: {0}")]
    InvalidState(String),
}

impl Error {
    /// Creates a protocol error from a reply code and text.
    #[must_use]
    pub fn protocol(expected: &[u16], code: Option<u16>, text: impl Into<String>) -> Self {
        Self::Protocol {
            expected: expected.to_vec(),
            code,
            text: text.into(),
        }
    }

    /// Returns the SMTP reply code carried by this error, if any.
    #[must_use]
    pub fn reply_code(&self) -> Option<u16> {
        match self {
            Self::Protocol { code, .. } => *code,
            Self::Pipelined { source, .. }
            | Self::Recipient { source, .. }
            | Self::DataTransfer(source)
            | Self::Create(source) => source.reply_code(),
            _ => None,
        }
    }

    /// Returns true for resolve/connect/timeout/disconnect failures.
    #[must_use]
    pub fn is_connection_error(&self) -> bool {
        match self {
            Self::Io(_)
            | Self::Tls(_)
            | Self::InvalidDnsName(_)
            | Self::Connection(_)
            | Self::NotConnected
            | Self::Timeout(_) => true,
            Self::Create(source) | Self::DataTransfer(source) => source.is_connection_error(),
            _ => false,
        }
    }

    /// Returns true if this is a permanent error (5xx).
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        self.reply_code().is_some_and(|code| (500..600).contains(&code))
    }

    /// Returns true if this is a transient error (4xx).
    #[must_use]
    pub fn is_transient(&self) -> bool {
        self.reply_code().is_some_and(|code| (400..500).contains(&code))
    }

    /// Fills in the accepted codes of a protocol error raised before they were known.
    pub(crate) fn with_expected(self, accepted: &[u16]) -> Self {
        match self {
            Self::Protocol {
                expected,
                code,
                text,
            } if expected.is_empty() => Self::Protocol {
                expected: accepted.to_vec(),
                code,
                text,
            },
            other => other,
        }
    }
}

/// Failure reported by [`crate::MailSender::send`].
///
/// Embeds the last reply seen on the connection next to the structured
/// cause, so callers can log one line and still match on the error kind.
#[derive(Debug, thiserror::Error)]
#[error("{context} [SMTP: {source} (code: {}, response: {response})]", code_text(.code))]
pub struct SendError {
    /// What the transaction was doing when it failed.
    pub context: String,
    /// Last reply code read from the server.
    pub code: Option<u16>,
    /// Last reply text read from the server.
    pub response: String,
    /// Structured cause.
    #[source]
    pub source: Error,
}

impl SendError {
    /// Creates a send error without server reply context.
    #[must_use]
    pub fn new(context: impl Into<String>, source: Error) -> Self {
        Self {
            context: context.into(),
            code: None,
            response: String::new(),
            source,
        }
    }

    /// Returns the structured cause.
    #[must_use]
    pub const fn kind(&self) -> &Error {
        &self.source
    }

    /// Consumes the error, returning the structured cause.
    #[must_use]
    pub fn into_inner(self) -> Error {
        self.source
    }
}

#[allow(clippy::ref_option)] // thiserror hands fields over by reference
fn code_text(code: &Option<u16>) -> String {
    code.map_or_else(|| "invalid".to_string(), |c| c.to_string())
}

fn codes_text(codes: &[u16]) -> String {
    if codes.is_empty() {
        return "any".to_string();
    }
    codes
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("|")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn protocol_error_display() {
        let err = Error::protocol(&[250, 251], Some(550), "no such user");
        assert_eq!(
            err.to_string(),
            "Invalid response code received from server (code: 550, expected: 250|251): no such user"
        );
        assert!(err.is_permanent());
        assert!(!err.is_transient());
    }

    #[test]
    fn invalid_code_display() {
        let err = Error::protocol(&[], None, "garbage");
        assert!(err.to_string().contains("code: invalid"));
        assert_eq!(err.reply_code(), None);
    }

    #[test]
    fn nested_reply_code() {
        let err = Error::Recipient {
            address: "bob@example.com".into(),
            source: Box::new(Error::protocol(&[250], Some(450), "busy")),
        };
        assert_eq!(err.reply_code(), Some(450));
        assert!(err.is_transient());
    }

    #[test]
    fn connection_errors() {
        assert!(Error::NotConnected.is_connection_error());
        assert!(Error::Timeout(Duration::from_secs(1)).is_connection_error());
        assert!(Error::Create(Box::new(Error::Connection("refused".into()))).is_connection_error());
        assert!(!Error::MissingSender.is_connection_error());
    }

    #[test]
    fn with_expected_only_fills_empty_sets() {
        let err = Error::protocol(&[], None, "x").with_expected(&[220]);
        assert!(matches!(err, Error::Protocol { ref expected, .. } if expected == &[220]));

        let err = Error::protocol(&[250], Some(500), "x").with_expected(&[220]);
        assert!(matches!(err, Error::Protocol { ref expected, .. } if expected == &[250]));
    }

    #[test]
    fn send_error_display() {
        let err = SendError {
            context: "Failed to add recipient: bob@example.com".into(),
            code: Some(550),
            response: "no such user".into(),
            source: Error::protocol(&[250, 251], Some(550), "no such user"),
        };
        let text = err.to_string();
        assert!(text.starts_with("Failed to add recipient: bob@example.com [SMTP: "));
        assert!(text.ends_with("(code: 550, response: no such user)]"));
    }
}
