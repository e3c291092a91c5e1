//! Splitting a raw RFC 5322 message into headers and body.

use mailpost_smtp::Headers;

/// Header fields that name recipients.
const RECIPIENT_FIELDS: [&str; 3] = ["To", "Cc", "Bcc"];

/// A message read from a file or stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Header fields in their original order.
    pub headers: Headers,
    /// Everything after the blank line.
    pub body: Vec<u8>,
}

impl Message {
    /// Parses `raw`, accepting CRLF or bare LF line endings.
    ///
    /// Continuation lines stay attached to their field with the fold intact.
    /// A line that is neither a field nor a continuation starts the body.
    #[must_use]
    pub fn parse(raw: &[u8]) -> Self {
        let mut headers = Headers::new();
        let mut field: Option<(String, String)> = None;
        let mut body_start = raw.len();
        let mut start = 0;

        while start < raw.len() {
            let end = raw[start..]
                .iter()
                .position(|&b| b == b'\n')
                .map_or(raw.len(), |i| start + i + 1);
            let text = String::from_utf8_lossy(&raw[start..end]);
            let line = text.trim_end_matches(['\r', '\n']);

            if line.is_empty() {
                body_start = end;
                break;
            }
            if line.starts_with([' ', '\t'])
                && let Some((_, value)) = field.as_mut()
            {
                value.push_str("\r\n");
                value.push_str(line);
                start = end;
                continue;
            }
            let Some((name, value)) = line.split_once(':') else {
                body_start = start;
                break;
            };
            if let Some((name, value)) = field.take() {
                headers.append(name, value);
            }
            field = Some((name.trim().to_string(), value.trim().to_string()));
            start = end;
        }
        if let Some((name, value)) = field {
            headers.append(name, value);
        }

        Self {
            headers,
            body: raw[body_start..].to_vec(),
        }
    }

    /// Returns the address lists in `To`, `Cc` and `Bcc`.
    #[must_use]
    pub fn recipients(&self) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(name, _)| {
                RECIPIENT_FIELDS
                    .iter()
                    .any(|field| name.eq_ignore_ascii_case(field))
            })
            .flat_map(|(_, value)| value.values())
            .filter(|list| !list.trim().is_empty())
            .map(str::to_string)
            .collect()
    }

    /// Removes `Bcc` so blind recipients are not disclosed.
    pub fn strip_bcc(&mut self) {
        let removed = self.headers.remove("Bcc");
        if removed > 0 {
            tracing::debug!(removed, "Removed Bcc header");
        }
    }
}
