//! Message headers: injection scrubbing and serialization.

use crate::error::{Error, Result};
use crate::types::AddressListParser;
use regex::Regex;
use std::sync::LazyLock;

/// Line break, or a textual spelling of one, followed by a non-space.
#[allow(clippy::expect_used)]
static INJECTION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)(<CR>|<LF>|0x0A/%0A|0x0D/%0D|\n|\r)\S")
        .expect("injection pattern is valid")
});

/// Value of one header field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HeaderValue {
    /// Single value.
    Single(String),
    /// Several values; joined with `, ` except for `Received`, which gets one
    /// line per value.
    Multiple(Vec<String>),
}

impl HeaderValue {
    /// Returns the values as a slice-like iterator.
    pub fn values(&self) -> impl Iterator<Item = &str> {
        let values: &[String] = match self {
            Self::Single(value) => std::slice::from_ref(value),
            Self::Multiple(values) => values,
        };
        values.iter().map(String::as_str)
    }

    /// Returns the values joined with `, `.
    #[must_use]
    pub fn joined(&self) -> String {
        self.values().collect::<Vec<_>>().join(", ")
    }
}

impl From<&str> for HeaderValue {
    fn from(value: &str) -> Self {
        Self::Single(value.to_string())
    }
}

impl From<String> for HeaderValue {
    fn from(value: String) -> Self {
        Self::Single(value)
    }
}

impl From<Vec<String>> for HeaderValue {
    fn from(values: Vec<String>) -> Self {
        Self::Multiple(values)
    }
}

/// Ordered header fields. Names compare case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Headers {
    fields: Vec<(String, HeaderValue)>,
}

impl Headers {
    /// Creates an empty header set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a field, keeping any existing field of the same name.
    pub fn append(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        self.fields.push((name.into(), value.into()));
    }

    /// Replaces every field named `name` with a single one.
    pub fn set(&mut self, name: impl Into<String>, value: impl Into<HeaderValue>) {
        let name = name.into();
        self.remove(&name);
        self.fields.push((name, value.into()));
    }

    /// Returns the first field named `name`.
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&HeaderValue> {
        self.fields
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value)
    }

    /// Removes every field named `name`, returning how many were removed.
    pub fn remove(&mut self, name: &str) -> usize {
        let before = self.fields.len();
        self.fields.retain(|(key, _)| !key.eq_ignore_ascii_case(name));
        before - self.fields.len()
    }

    /// Iterates over fields in order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &HeaderValue)> {
        self.fields.iter().map(|(name, value)| (name.as_str(), value))
    }

    /// Returns the number of fields.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns true if there are no fields.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

impl<N, V> FromIterator<(N, V)> for Headers
where
    N: Into<String>,
    V: Into<HeaderValue>,
{
    fn from_iter<I: IntoIterator<Item = (N, V)>>(iter: I) -> Self {
        Self {
            fields: iter
                .into_iter()
                .map(|(name, value)| (name.into(), value.into()))
                .collect(),
        }
    }
}

/// Cuts a value at the first line break that starts a new header line.
///
/// A break followed by whitespace is folding and stays.
#[must_use]
pub fn sanitize_value(value: &str) -> String {
    match INJECTION.find(value) {
        Some(found) => value[..found.start()]
            .trim_end_matches(['\r', '\n'])
            .to_string(),
        None => value.to_string(),
    }
}

/// Applies [`sanitize_value`] to every value.
#[must_use]
pub fn sanitize_headers(headers: &Headers) -> Headers {
    let fields = headers.fields.iter().map(|(name, value)| {
        let value = match value {
            HeaderValue::Single(value) => HeaderValue::Single(sanitize_value(value)),
            HeaderValue::Multiple(values) => {
                HeaderValue::Multiple(values.iter().map(|v| sanitize_value(v)).collect())
            }
        };
        (name.clone(), value)
    });
    Headers {
        fields: fields.collect(),
    }
}

/// Serialized header block plus the sender found in `From`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreparedHeaders {
    /// `local@host` of the first `From` mailbox.
    pub from: Option<String>,
    /// Header lines joined with CRLF, without a trailing line break.
    pub text: String,
}

/// Serializes headers for transmission.
///
/// `Received` lines go first, in their original order. Other multi-valued
/// fields are joined with `, `.
///
/// # Errors
///
/// Returns [`Error::Address`] if `From` cannot be parsed, is empty, or
/// yields an address containing whitespace.
pub fn prepare_headers(
    headers: &Headers,
    parser: &dyn AddressListParser,
) -> Result<PreparedHeaders> {
    let mut received = Vec::new();
    let mut lines = Vec::new();
    let mut from = None;

    for (name, value) in headers.iter() {
        if name.eq_ignore_ascii_case("Received") {
            received.extend(value.values().map(|v| format!("{name}: {v}")));
            continue;
        }

        let joined = value.joined();
        if name.eq_ignore_ascii_case("From") && from.is_none() {
            let mailbox = parser
                .parse(&joined)?
                .into_iter()
                .next()
                .ok_or_else(|| Error::Address("From header has no address".into()))?;
            let address = mailbox.address();
            if address.chars().any(char::is_whitespace) {
                return Err(Error::Address(format!(
                    "From address contains whitespace: {address}"
                )));
            }
            from = Some(address);
        }
        lines.push(format!("{name}: {joined}"));
    }

    received.extend(lines);
    Ok(PreparedHeaders {
        from,
        text: received.join("\r\n"),
    })
}

/// Returns the `Return-Path` address without angle brackets.
#[must_use]
pub fn return_path(headers: &Headers) -> Option<String> {
    let value = headers
        .get("Return-Path")?
        .values()
        .map(str::trim)
        .find(|value| !value.is_empty())?;
    let value = value
        .strip_prefix('<')
        .and_then(|v| v.strip_suffix('>'))
        .unwrap_or(value);
    Some(value.trim().to_string())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::types::SimpleAddressParser;

    #[test]
    fn test_sanitize_strips_injected_headers() {
        assert_eq!(
            sanitize_value("Hello\r\nBcc: victim@example.com"),
            "Hello"
        );
        assert_eq!(sanitize_value("Hello\nBcc: x"), "Hello");
        assert_eq!(sanitize_value("Hello<LF>Bcc: x"), "Hello");
        assert_eq!(sanitize_value("Hello%0d%0aBcc: x"), "Hello%0d%0aBcc: x");
        assert_eq!(sanitize_value("Hello0x0A/%0ABcc: x"), "Hello");
    }

    #[test]
    fn test_sanitize_keeps_folding() {
        assert_eq!(
            sanitize_value("a long subject\r\n continued"),
            "a long subject\r\n continued"
        );
    }

    #[test]
    fn test_sanitize_headers() {
        let headers: Headers = [
            ("Subject", HeaderValue::from("hi\nBcc: x")),
            (
                "To",
                HeaderValue::from(vec!["a@x".to_string(), "b@y\rCc: z".to_string()]),
            ),
        ]
        .into_iter()
        .collect();
        let clean = sanitize_headers(&headers);
        assert_eq!(clean.get("subject"), Some(&HeaderValue::from("hi")));
        assert_eq!(clean.get("TO").unwrap().joined(), "a@x, b@y");
    }

    #[test]
    fn test_prepare_headers() {
        let mut headers = Headers::new();
        headers.append("From", "Alice <alice@example.com>");
        headers.append("To", vec!["bob@example.com".to_string(), "carol@example.com".to_string()]);
        headers.append("Received", "from a by b");
        headers.append("Subject", "Hi");
        headers.append(
            "Received",
            vec!["from c by d".to_string(), "from e by f".to_string()],
        );

        let prepared = prepare_headers(&headers, &SimpleAddressParser::default()).unwrap();
        assert_eq!(prepared.from.as_deref(), Some("alice@example.com"));
        assert_eq!(
            prepared.text,
            "Received: from a by b\r\nReceived: from c by d\r\nReceived: from e by f\r\n\
             From: Alice <alice@example.com>\r\nTo: bob@example.com, carol@example.com\r\n\
             Subject: Hi"
        );
    }

    #[test]
    fn test_prepare_headers_bare_from_gets_default_host() {
        let headers: Headers = [("From", "postmaster")].into_iter().collect();
        let prepared = prepare_headers(&headers, &SimpleAddressParser::default()).unwrap();
        assert_eq!(prepared.from.as_deref(), Some("postmaster@localhost"));
    }

    #[test]
    fn test_prepare_headers_rejects_whitespace_sender() {
        let headers: Headers = [("From", "\"john doe\"@example.com")].into_iter().collect();
        assert!(matches!(
            prepare_headers(&headers, &SimpleAddressParser::default()),
            Err(Error::Address(_))
        ));
    }

    #[test]
    fn test_prepare_headers_without_from() {
        let headers: Headers = [("Subject", "x")].into_iter().collect();
        let prepared = prepare_headers(&headers, &SimpleAddressParser::default()).unwrap();
        assert_eq!(prepared.from, None);
        assert_eq!(prepared.text, "Subject: x");
    }

    #[test]
    fn test_return_path() {
        let headers: Headers = [("return-path", " <bounce@example.com> ")]
            .into_iter()
            .collect();
        assert_eq!(return_path(&headers).as_deref(), Some("bounce@example.com"));
        assert_eq!(return_path(&Headers::new()), None);

        let null: Headers = [("Return-Path", "<>")].into_iter().collect();
        assert_eq!(return_path(&null).as_deref(), Some(""));

        let blank: Headers = [("Return-Path", "  ")].into_iter().collect();
        assert_eq!(return_path(&blank), None);
    }

    #[test]
    fn test_headers_set_and_remove() {
        let mut headers = Headers::new();
        headers.append("Bcc", "a@x");
        headers.append("bcc", "b@x");
        headers.set("BCC", "c@x");
        assert_eq!(headers.len(), 1);
        assert_eq!(headers.remove("Bcc"), 1);
        assert!(headers.is_empty());
    }
}
