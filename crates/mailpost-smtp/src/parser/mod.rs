//! SMTP response parser.
//!
//! SMTP replies can be single-line or multi-line:
//! - Single: `250 OK\r\n`
//! - Multi: `250-First line\r\n250-Second line\r\n250 Last line\r\n`
//!
//! The engine reads a reply one line at a time, so parsing works per line:
//! each line yields its code, whether it ends the reply, and its text.

use crate::error::{Error, Result};
use crate::types::{Reply, ReplyCode};

/// One parsed line of a (possibly multiline) reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplyLine {
    /// Code from the first three characters; `None` if they are not digits.
    pub code: Option<ReplyCode>,
    /// True unless the fourth character is the `-` continuation marker.
    pub last: bool,
    /// Text after the separator.
    pub text: String,
}

/// Parses a single reply line (without its line terminator).
#[must_use]
pub fn parse_line(line: &str) -> ReplyLine {
    let code = line.get(..3).and_then(ReplyCode::parse);
    ReplyLine {
        code,
        last: is_last_reply_line(line),
        text: line.get(4..).unwrap_or_default().to_string(),
    }
}

/// Checks if a line is the last line of a multi-line reply.
///
/// Multi-line replies use `-` as the continuation marker; anything else in
/// the fourth position, including a bare three-digit line, ends the reply.
#[must_use]
pub fn is_last_reply_line(line: &str) -> bool {
    line.as_bytes().get(3) != Some(&b'-')
}

/// Parses a complete reply from its lines.
///
/// The code of the final line is the code of the reply.
///
/// # Errors
///
/// Returns a protocol error if there are no lines or any line lacks a
/// numeric code.
pub fn parse_reply(lines: &[String]) -> Result<Reply> {
    let mut message = Vec::with_capacity(lines.len());
    let mut code = None;

    for line in lines {
        let parsed = parse_line(line);
        let Some(line_code) = parsed.code else {
            return Err(Error::protocol(&[], None, line.clone()));
        };
        code = Some(line_code);
        message.push(parsed.text);
        if parsed.last {
            break;
        }
    }

    code.map(|code| Reply::new(code, message))
        .ok_or_else(|| Error::protocol(&[], None, "Empty reply"))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_line_reply() {
        let lines = vec!["250 OK".to_string()];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["OK"]);
        assert!(reply.is_success());
    }

    #[test]
    fn test_parse_multi_line_reply() {
        let lines = vec!["250-PIPELINING".to_string(), "250 SIZE 1000".to_string()];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code.as_u16(), 250);
        assert_eq!(reply.message, vec!["PIPELINING", "SIZE 1000"]);
    }

    #[test]
    fn test_final_line_code_wins() {
        let lines = vec!["250-first".to_string(), "550 last".to_string()];
        let reply = parse_reply(&lines).unwrap();
        assert_eq!(reply.code, ReplyCode::MAILBOX_UNAVAILABLE);
    }

    #[test]
    fn test_parse_line() {
        let line = parse_line("250-SIZE 1000");
        assert_eq!(line.code, Some(ReplyCode::OK));
        assert!(!line.last);
        assert_eq!(line.text, "SIZE 1000");

        let line = parse_line("221");
        assert_eq!(line.code, Some(ReplyCode::CLOSING));
        assert!(line.last);
        assert_eq!(line.text, "");
    }

    #[test]
    fn test_is_last_reply_line() {
        assert!(is_last_reply_line("250 OK"));
        assert!(!is_last_reply_line("250-Continuing"));
        assert!(is_last_reply_line("250"));
    }

    #[test]
    fn test_parse_error_empty() {
        assert!(parse_reply(&[]).is_err());
    }

    #[test]
    fn test_parse_error_too_short() {
        let lines = vec!["25".to_string()];
        assert!(parse_reply(&lines).is_err());
    }

    #[test]
    fn test_parse_error_invalid_code() {
        let lines = vec!["ABC OK".to_string()];
        let err = parse_reply(&lines).unwrap_err();
        assert_eq!(err.reply_code(), None);
    }
}
