//! Mailbox types and address-list parsing.

use crate::error::{Error, Result};

/// A single mailbox: `local-part@host` with an optional display name.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Mailbox {
    /// Display name (optional).
    pub display_name: Option<String>,
    /// Local part, quotes preserved.
    pub local_part: String,
    /// Domain part.
    pub host: String,
}

impl Mailbox {
    /// Creates a mailbox without a display name.
    #[must_use]
    pub fn new(local_part: impl Into<String>, host: impl Into<String>) -> Self {
        Self {
            display_name: None,
            local_part: local_part.into(),
            host: host.into(),
        }
    }

    /// Returns the bare `local@host` form used in the SMTP envelope.
    #[must_use]
    pub fn address(&self) -> String {
        format!("{}@{}", self.local_part, self.host)
    }
}

impl std::fmt::Display for Mailbox {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.local_part, self.host)
    }
}

/// Turns a free-form address list into mailboxes.
///
/// Implementations must be shareable across connections.
pub trait AddressListParser: Send + Sync {
    /// Parses `text` (e.g. a `To:` header value) into mailboxes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Address`] when the list is malformed.
    fn parse(&self, text: &str) -> Result<Vec<Mailbox>>;
}

/// Address-list parser for the common RFC 5322 forms.
///
/// Handles bare addresses, `Name <addr>`, quoted display names, comments,
/// groups (`team: a@x, b@y;`) and obsolete source routes. A local part
/// without `@` is completed with the default host.
#[derive(Debug, Clone)]
pub struct SimpleAddressParser {
    default_host: String,
}

impl SimpleAddressParser {
    /// Creates a parser completing bare local parts with `default_host`.
    #[must_use]
    pub fn new(default_host: impl Into<String>) -> Self {
        Self {
            default_host: default_host.into(),
        }
    }

    fn parse_mailbox(&self, item: &str) -> Result<Mailbox> {
        let (display_name, spec) = match find_unquoted(item, '<') {
            Some(open) => {
                let close = item[open..]
                    .find('>')
                    .map(|offset| open + offset)
                    .ok_or_else(|| Error::Address(format!("missing '>' in {item}")))?;
                let name = unquote(item[..open].trim());
                let inner = &item[open + 1..close];
                // "@relay1,@relay2:user@host"
                let inner = inner.rsplit_once(':').map_or(inner, |(_, addr)| addr);
                ((!name.is_empty()).then_some(name), inner.trim())
            }
            None => (None, item.trim()),
        };

        let (local, host) = spec.rfind('@').map_or_else(
            || (spec, self.default_host.as_str()),
            |at| (&spec[..at], &spec[at + 1..]),
        );
        let (local, host) = (local.trim(), host.trim());

        if local.is_empty() || host.is_empty() {
            return Err(Error::Address(format!("incomplete address: {item}")));
        }
        if has_unquoted_whitespace(local) || host.chars().any(char::is_whitespace) {
            return Err(Error::Address(format!("whitespace in address: {item}")));
        }

        Ok(Mailbox {
            display_name,
            local_part: local.to_string(),
            host: host.to_string(),
        })
    }
}

impl Default for SimpleAddressParser {
    fn default() -> Self {
        Self::new("localhost")
    }
}

impl AddressListParser for SimpleAddressParser {
    fn parse(&self, text: &str) -> Result<Vec<Mailbox>> {
        let cleaned = strip_comments(text)?;
        split_items(&cleaned)
            .iter()
            .map(|item| self.parse_mailbox(item))
            .collect()
    }
}

/// Removes `(comments)`, honouring quoted strings and escapes.
fn strip_comments(text: &str) -> Result<String> {
    let mut out = String::with_capacity(text.len());
    let mut depth = 0usize;
    let mut in_quote = false;
    let mut chars = text.chars();

    while let Some(c) = chars.next() {
        match c {
            '\\' if in_quote || depth > 0 => {
                let escaped = chars.next();
                if depth == 0 {
                    out.push(c);
                    out.extend(escaped);
                }
            }
            '"' if depth == 0 => {
                in_quote = !in_quote;
                out.push(c);
            }
            '(' if !in_quote => depth += 1,
            ')' if !in_quote && depth > 0 => depth -= 1,
            _ if depth > 0 => {}
            _ => out.push(c),
        }
    }

    if depth > 0 || in_quote {
        return Err(Error::Address(format!(
            "unterminated comment or quoted string: {text}"
        )));
    }
    Ok(out)
}

/// Splits a list on `,` and `;`, dropping group display names.
fn split_items(text: &str) -> Vec<String> {
    let mut items = Vec::new();
    let mut current = String::new();
    let mut in_quote = false;
    let mut in_angle = false;
    let mut escaped = false;

    for c in text.chars() {
        if escaped {
            current.push(c);
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => {
                escaped = true;
                current.push(c);
            }
            '"' => {
                in_quote = !in_quote;
                current.push(c);
            }
            '<' if !in_quote => {
                in_angle = true;
                current.push(c);
            }
            '>' if !in_quote => {
                in_angle = false;
                current.push(c);
            }
            ':' if !in_quote && !in_angle => current.clear(),
            ',' | ';' if !in_quote && !in_angle => items.push(std::mem::take(&mut current)),
            _ => current.push(c),
        }
    }
    items.push(current);

    items
        .into_iter()
        .map(|item| item.trim().to_string())
        .filter(|item| !item.is_empty())
        .collect()
}

fn find_unquoted(text: &str, needle: char) -> Option<usize> {
    let mut in_quote = false;
    let mut escaped = false;
    for (idx, c) in text.char_indices() {
        if escaped {
            escaped = false;
            continue;
        }
        match c {
            '\\' if in_quote => escaped = true,
            '"' => in_quote = !in_quote,
            c if c == needle && !in_quote => return Some(idx),
            _ => {}
        }
    }
    None
}

fn has_unquoted_whitespace(text: &str) -> bool {
    let mut in_quote = false;
    text.chars().any(|c| {
        if c == '"' {
            in_quote = !in_quote;
        }
        c.is_whitespace() && !in_quote
    })
}

fn unquote(name: &str) -> String {
    name.strip_prefix('"')
        .and_then(|inner| inner.strip_suffix('"'))
        .map_or_else(|| name.to_string(), |inner| inner.replace("\\\"", "\""))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn parse(text: &str) -> Result<Vec<Mailbox>> {
        SimpleAddressParser::default().parse(text)
    }

    #[test]
    fn test_bare_address() {
        let boxes = parse("user@example.com").unwrap();
        assert_eq!(boxes, vec![Mailbox::new("user", "example.com")]);
        assert_eq!(boxes[0].address(), "user@example.com");
    }

    #[test]
    fn test_display_name_and_angle_addr() {
        let boxes = parse("\"Doe, John\" <john@example.com>, Jane <jane@example.org>").unwrap();
        assert_eq!(boxes.len(), 2);
        assert_eq!(boxes[0].display_name.as_deref(), Some("Doe, John"));
        assert_eq!(boxes[0].address(), "john@example.com");
        assert_eq!(boxes[1].display_name.as_deref(), Some("Jane"));
        assert_eq!(boxes[1].address(), "jane@example.org");
    }

    #[test]
    fn test_comments_removed() {
        let boxes = parse("bob@example.com (Bob (the builder))").unwrap();
        assert_eq!(boxes[0].address(), "bob@example.com");
    }

    #[test]
    fn test_group_syntax() {
        let boxes = parse("team: a@example.com, b@example.com;, c@example.com").unwrap();
        let addrs: Vec<_> = boxes.iter().map(Mailbox::address).collect();
        assert_eq!(addrs, ["a@example.com", "b@example.com", "c@example.com"]);
    }

    #[test]
    fn test_default_host() {
        let boxes = parse("postmaster").unwrap();
        assert_eq!(boxes[0].address(), "postmaster@localhost");

        let boxes = SimpleAddressParser::new("example.net").parse("root").unwrap();
        assert_eq!(boxes[0].address(), "root@example.net");
    }

    #[test]
    fn test_source_route_dropped() {
        let boxes = parse("<@relay.example.com:user@example.com>").unwrap();
        assert_eq!(boxes[0].address(), "user@example.com");
    }

    #[test]
    fn test_quoted_local_part() {
        let boxes = parse("\"john doe\"@example.com").unwrap();
        assert_eq!(boxes[0].local_part, "\"john doe\"");
    }

    #[test]
    fn test_empty_list() {
        assert!(parse("").unwrap().is_empty());
        assert!(parse(" , ").unwrap().is_empty());
    }

    #[test]
    fn test_invalid_addresses() {
        assert!(parse("<user@example.com").is_err());
        assert!(parse("@example.com").is_err());
        assert!(parse("user@").is_err());
        assert!(parse("john doe@example.com").is_err());
        assert!(parse("bob@example.com (unterminated").is_err());
    }
}
