//! Message body encoding for the DATA phase.

/// Rewrites every bare `\n` and bare `\r` as `\r\n`.
///
/// Existing `\r\n` pairs are left alone, so the function is idempotent.
#[must_use]
pub fn normalize_line_endings(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + data.len() / 32);
    let mut bytes = data.iter().copied().peekable();
    while let Some(b) = bytes.next() {
        match b {
            b'\r' => {
                bytes.next_if_eq(&b'\n');
                out.extend_from_slice(b"\r\n");
            }
            b'\n' => out.extend_from_slice(b"\r\n"),
            _ => out.push(b),
        }
    }
    out
}

/// Doubles a `.` at the start of the data and after every `\r\n`.
#[must_use]
pub fn dot_stuff(data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(data.len() + 16);
    let mut line_start = true;
    for (i, &b) in data.iter().enumerate() {
        if line_start && b == b'.' {
            out.push(b'.');
        }
        out.push(b);
        line_start = b == b'\n' && i > 0 && data[i - 1] == b'\r';
    }
    out
}

/// CRLF-normalizes and dot-stuffs `data` for transmission after DATA.
#[must_use]
pub fn quote_data(data: &[u8]) -> Vec<u8> {
    dot_stuff(&normalize_line_endings(data))
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_normalize_line_endings() {
        assert_eq!(normalize_line_endings(b"a\nb\rc\r\nd"), b"a\r\nb\r\nc\r\nd");
        assert_eq!(normalize_line_endings(b"\n\n"), b"\r\n\r\n");
        assert_eq!(normalize_line_endings(b"\r\r\n"), b"\r\n\r\n");
        assert_eq!(normalize_line_endings(b""), b"");
    }

    #[test]
    fn test_dot_stuff() {
        assert_eq!(dot_stuff(b".hello"), b"..hello");
        assert_eq!(dot_stuff(b"a\r\n.\r\nb"), b"a\r\n..\r\nb");
        assert_eq!(dot_stuff(b"a.b\r\n..c"), b"a.b\r\n...c");
        assert_eq!(dot_stuff(b"x\n.y"), b"x\n.y");
    }

    #[test]
    fn test_quote_data() {
        assert_eq!(quote_data(b"Subject: hi\n\n.hello\n."), b"Subject: hi\r\n\r\n..hello\r\n..");
    }

    proptest! {
        #[test]
        fn normalize_is_idempotent(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let once = normalize_line_endings(&data);
            prop_assert_eq!(normalize_line_endings(&once), once);
        }

        #[test]
        fn normalized_output_has_no_bare_line_breaks(data in proptest::collection::vec(any::<u8>(), 0..256)) {
            let out = normalize_line_endings(&data);
            for (i, &b) in out.iter().enumerate() {
                if b == b'\r' {
                    prop_assert_eq!(out.get(i + 1), Some(&b'\n'));
                }
                if b == b'\n' {
                    prop_assert!(i > 0 && out[i - 1] == b'\r');
                }
            }
        }

        #[test]
        fn quoted_lines_never_end_data(lines in proptest::collection::vec("[.a-z]{0,5}", 0..8)) {
            let body = lines.join("\n");
            let quoted = quote_data(body.as_bytes());
            for line in quoted.split(|&b| b == b'\n') {
                let line = line.strip_suffix(b"\r").unwrap_or(line);
                prop_assert_ne!(line, b".".as_slice());
            }
        }
    }
}
