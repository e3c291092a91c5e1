//! ESMTP capabilities and SASL mechanism types.

use std::collections::BTreeMap;
use std::fmt;

/// Server capabilities discovered from an EHLO reply.
///
/// Maps each capability keyword (upper-cased) to the text that followed it
/// on its reply line, e.g. `SIZE` → `"10485760"`, `AUTH` → `"PLAIN LOGIN"`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities {
    entries: BTreeMap<String, String>,
}

impl Capabilities {
    /// Builds the capability map from EHLO reply lines.
    pub fn from_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut capabilities = Self::default();
        for line in lines {
            if let Some((keyword, rest)) = Self::parse_line(line.as_ref()) {
                // Pre-RFC 2554 servers announce "AUTH=LOGIN"; the standard form wins.
                if let Some(legacy) = keyword.strip_prefix("AUTH=") {
                    let value = format!("{legacy} {rest}").trim().to_string();
                    capabilities
                        .entries
                        .entry("AUTH".to_string())
                        .or_insert(value);
                    continue;
                }
                capabilities.entries.insert(keyword, rest);
            }
        }
        capabilities
    }

    /// Splits a capability line into `KEYWORD` and its trailing text.
    #[must_use]
    pub fn parse_line(line: &str) -> Option<(String, String)> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let (keyword, rest) = line.split_once(' ').unwrap_or((line, ""));
        Some((keyword.to_ascii_uppercase(), rest.trim().to_string()))
    }

    /// Returns the text following `keyword`, if advertised.
    #[must_use]
    pub fn get(&self, keyword: &str) -> Option<&str> {
        self.entries
            .get(&keyword.to_ascii_uppercase())
            .map(String::as_str)
    }

    /// Checks if the server advertised `keyword`.
    #[must_use]
    pub fn contains(&self, keyword: &str) -> bool {
        self.entries.contains_key(&keyword.to_ascii_uppercase())
    }

    /// Returns true when nothing was advertised.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Iterates over `(keyword, text)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    /// Checks if PIPELINING is supported.
    #[must_use]
    pub fn supports_pipelining(&self) -> bool {
        self.contains("PIPELINING")
    }

    /// Checks if STARTTLS is supported.
    #[must_use]
    pub fn supports_starttls(&self) -> bool {
        self.contains("STARTTLS")
    }

    /// Returns the advertised maximum message size.
    ///
    /// `SIZE` without an argument, or `SIZE 0`, means no fixed limit.
    #[must_use]
    pub fn max_message_size(&self) -> Option<usize> {
        self.get("SIZE")
            .and_then(|value| value.split_whitespace().next())
            .and_then(|value| value.parse().ok())
            .filter(|size| *size > 0)
    }

    /// Returns the space-separated AUTH tokens, upper-cased.
    #[must_use]
    pub fn auth_tokens(&self) -> Vec<String> {
        self.get("AUTH")
            .map(|value| {
                value
                    .split_whitespace()
                    .map(str::to_ascii_uppercase)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// SASL authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum AuthMechanism {
    /// DIGEST-MD5 (RFC 2831)
    DigestMd5,
    /// CRAM-MD5 (RFC 2195)
    CramMd5,
    /// LOGIN - legacy plaintext
    Login,
    /// PLAIN (RFC 4616)
    Plain,
}

impl AuthMechanism {
    /// Mechanisms in order of preference, strongest first.
    pub const PREFERENCE: [Self; 4] = [Self::DigestMd5, Self::CramMd5, Self::Login, Self::Plain];

    /// Parses an authentication mechanism name.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DIGEST-MD5" => Some(Self::DigestMd5),
            "CRAM-MD5" => Some(Self::CramMd5),
            "LOGIN" => Some(Self::Login),
            "PLAIN" => Some(Self::Plain),
            _ => None,
        }
    }

    /// Returns the mechanism name as a string.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::DigestMd5 => "DIGEST-MD5",
            Self::CramMd5 => "CRAM-MD5",
            Self::Login => "LOGIN",
            Self::Plain => "PLAIN",
        }
    }

    /// Returns true for mechanisms whose responses need an injected
    /// [`crate::auth::SaslProvider`].
    #[must_use]
    pub const fn needs_provider(self) -> bool {
        matches!(self, Self::DigestMd5 | Self::CramMd5)
    }
}

impl fmt::Display for AuthMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
