//! SMTP command builder.

use crate::error::{Error, Result};
use crate::types::AuthMechanism;

/// SMTP command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// HELO - Simple greeting
    Helo {
        /// Client hostname
        hostname: String,
    },
    /// EHLO - Extended greeting
    Ehlo {
        /// Client hostname
        hostname: String,
    },
    /// STARTTLS - Upgrade to TLS
    StartTls,
    /// AUTH - Begin authentication
    Auth {
        /// Authentication mechanism
        mechanism: AuthMechanism,
    },
    /// Client response inside an AUTH exchange (base64 text, possibly empty)
    AuthResponse(String),
    /// MAIL FROM - Start mail transaction
    MailFrom {
        /// Reverse path
        from: String,
        /// ESMTP parameters, already rendered (`KEY` / `KEY=VALUE` tokens)
        params: Option<String>,
    },
    /// RCPT TO - Add recipient
    RcptTo {
        /// Forward path
        to: String,
        /// ESMTP parameters
        params: Option<String>,
    },
    /// DATA - Begin message data
    Data,
    /// RSET - Reset transaction
    Rset,
    /// VRFY - Verify address
    Vrfy {
        /// String to verify
        address: String,
    },
    /// NOOP - No operation
    Noop,
    /// QUIT - Close connection
    Quit,
    /// SEND FROM - Deliver to terminal (deprecated, RFC 821)
    SendFrom {
        /// Reverse path
        from: String,
    },
    /// SOML FROM - Send or mail (deprecated, RFC 821)
    SomlFrom {
        /// Reverse path
        from: String,
    },
    /// SAML FROM - Send and mail (deprecated, RFC 821)
    SamlFrom {
        /// Reverse path
        from: String,
    },
}

impl Command {
    /// Returns the command verb.
    #[must_use]
    pub const fn verb(&self) -> &'static str {
        match self {
            Self::Helo { .. } => "HELO",
            Self::Ehlo { .. } => "EHLO",
            Self::StartTls => "STARTTLS",
            Self::Auth { .. } => "AUTH",
            Self::AuthResponse(_) => "",
            Self::MailFrom { .. } => "MAIL",
            Self::RcptTo { .. } => "RCPT",
            Self::Data => "DATA",
            Self::Rset => "RSET",
            Self::Vrfy { .. } => "VRFY",
            Self::Noop => "NOOP",
            Self::Quit => "QUIT",
            Self::SendFrom { .. } => "SEND",
            Self::SomlFrom { .. } => "SOML",
            Self::SamlFrom { .. } => "SAML",
        }
    }

    /// Returns the argument text that follows the verb.
    #[must_use]
    pub fn args(&self) -> Option<String> {
        match self {
            Self::Helo { hostname } | Self::Ehlo { hostname } => Some(hostname.clone()),
            Self::Auth { mechanism } => Some(mechanism.as_str().to_string()),
            Self::AuthResponse(_)
            | Self::StartTls
            | Self::Data
            | Self::Rset
            | Self::Noop
            | Self::Quit => None,
            Self::MailFrom { from, params } => {
                Some(with_params(format!("FROM:<{from}>"), params.as_deref()))
            }
            Self::RcptTo { to, params } => {
                Some(with_params(format!("TO:<{to}>"), params.as_deref()))
            }
            Self::Vrfy { address } => Some(address.clone()),
            Self::SendFrom { from } | Self::SomlFrom { from } | Self::SamlFrom { from } => {
                Some(format!("FROM:<{from}>"))
            }
        }
    }

    /// Returns the mailbox this command is about, for error reporting.
    #[must_use]
    pub fn target(&self) -> &str {
        match self {
            Self::MailFrom { from, .. }
            | Self::SendFrom { from }
            | Self::SomlFrom { from }
            | Self::SamlFrom { from } => from,
            Self::RcptTo { to, .. } => to,
            Self::Vrfy { address } => address,
            _ => "",
        }
    }

    /// Returns true if the reply may be deferred inside a pipelined batch
    /// (RFC 2920 section 3.1).
    #[must_use]
    pub const fn is_pipelinable(&self) -> bool {
        matches!(
            self,
            Self::MailFrom { .. }
                | Self::RcptTo { .. }
                | Self::Rset
                | Self::SendFrom { .. }
                | Self::SomlFrom { .. }
                | Self::SamlFrom { .. }
        )
    }

    /// Returns true if the line carries credentials and must not be traced.
    #[must_use]
    pub const fn is_sensitive(&self) -> bool {
        matches!(self, Self::AuthResponse(_))
    }

    /// Serializes the command to bytes, CRLF included.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Format`] if the command contains a line break.
    pub fn serialize(&self) -> Result<Vec<u8>> {
        match self {
            Self::AuthResponse(line) => format_command(line, None),
            _ => format_command(self.verb(), self.args().as_deref()),
        }
    }
}

fn with_params(base: String, params: Option<&str>) -> String {
    match params.map(str::trim) {
        Some(params) if !params.is_empty() => format!("{base} {params}"),
        _ => base,
    }
}

/// Formats `VERB[ ARGS]\r\n`, refusing anything that would smuggle a
/// second command onto the wire.
///
/// # Errors
///
/// Returns [`Error::Format`] if `verb` or `args` contains `\r` or `\n`.
pub fn format_command(verb: &str, args: Option<&str>) -> Result<Vec<u8>> {
    let line = match args {
        Some(args) if !args.is_empty() => format!("{verb} {args}"),
        _ => verb.to_string(),
    };
    if line.contains(['\r', '\n']) {
        return Err(Error::Format(format!(
            "command contains a line break: {}",
            line.escape_debug()
        )));
    }

    let mut buf = Vec::with_capacity(line.len() + 2);
    buf.extend_from_slice(line.as_bytes());
    buf.extend_from_slice(b"\r\n");
    Ok(buf)
}
