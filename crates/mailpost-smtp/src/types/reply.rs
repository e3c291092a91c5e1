//! Server replies.

use std::fmt;

/// A complete, possibly multi-line, server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    /// Three-digit reply code.
    pub code: ReplyCode,
    /// Text of each line, without the code and separator.
    pub message: Vec<String>,
}

impl Reply {
    /// Creates a reply.
    #[must_use]
    #[allow(clippy::missing_const_for_fn)]
    pub fn new(code: ReplyCode, message: Vec<String>) -> Self {
        Self { code, message }
    }

    /// Returns true for a 2xx reply.
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.code.0 / 100 == 2
    }

    /// Returns true if the code is in `accepted`.
    #[must_use]
    pub fn is_one_of(&self, accepted: &[ReplyCode]) -> bool {
        accepted.contains(&self.code)
    }

    /// Joins the lines with `\n`.
    #[must_use]
    pub fn message_text(&self) -> String {
        self.message.join("\n")
    }

    /// Extracts `<ID>` from a `... queued as <ID>` line.
    #[must_use]
    pub fn queued_as(&self) -> Option<String> {
        self.message.iter().find_map(|line| {
            let (_, rest) = line.split_once(" queued as ")?;
            rest.split_whitespace().next().map(str::to_string)
        })
    }
}

impl fmt::Display for Reply {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.code, self.message_text())
    }
}

/// Reply code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ReplyCode(u16);

impl ReplyCode {
    /// 220 greeting, also the STARTTLS go-ahead.
    pub const SERVICE_READY: Self = Self(220);
    /// 221 reply to QUIT.
    pub const CLOSING: Self = Self(221);
    /// 235 authentication succeeded.
    pub const AUTH_SUCCESS: Self = Self(235);
    /// 250 action completed.
    pub const OK: Self = Self(250);
    /// 251 recipient not local, will forward.
    pub const FORWARD: Self = Self(251);
    /// 252 cannot VRFY, will accept anyway.
    pub const CANNOT_VERIFY: Self = Self(252);
    /// 334 SASL continuation.
    pub const AUTH_CONTINUE: Self = Self(334);
    /// 354 send the message.
    pub const START_DATA: Self = Self(354);
    /// 503 bad sequence of commands.
    pub const BAD_SEQUENCE: Self = Self(503);
    /// 550 mailbox unavailable.
    pub const MAILBOX_UNAVAILABLE: Self = Self(550);

    /// Parses exactly three ASCII digits.
    #[must_use]
    pub fn parse(digits: &str) -> Option<Self> {
        if digits.len() != 3 || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok().map(Self)
    }

    /// Returns the numeric value.
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

impl fmt::Display for ReplyCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
