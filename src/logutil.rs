//! Logging helpers that keep log lines single-line and bounded.
//! Device console text and user-entered names go through [`escape_log`]; raw frames through
//! [`hex_snippet`].

/// Escape a string for single-line logging:
/// - `\n` => `\\n`
/// - `\r` => `\\r`
/// - `\t` => `\\t`
/// - backslash => `\\\\`
///   Truncates very long strings (over `MAX_PREVIEW` chars) with an ellipsis.
pub fn escape_log(s: &str) -> String {
    const MAX_PREVIEW: usize = 300;
    let mut out = String::with_capacity(s.len().min(MAX_PREVIEW) + 8);
    for (count, ch) in s.chars().enumerate() {
        if count >= MAX_PREVIEW {
            out.push('…');
            break;
        }
        match ch {
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if c.is_control() => {
                use std::fmt::Write;
                let _ = write!(&mut out, "\\x{:02X}", c as u32);
            }
            c => out.push(c),
        }
    }
    out
}

/// Lowercase hex of the first `max` bytes, with a `..(+N)` marker for the remainder.
pub fn hex_snippet(data: &[u8], max: usize) -> String {
    use std::fmt::Write;
    let shown = data.len().min(max);
    let mut out = String::with_capacity(shown * 2 + 8);
    for b in &data[..shown] {
        let _ = write!(&mut out, "{:02x}", b);
    }
    if data.len() > shown {
        let _ = write!(&mut out, "..(+{})", data.len() - shown);
    }
    out
}

/// Truncate to at most `max_bytes` without splitting a UTF-8 character.
pub fn truncate_for_log(s: &str, max_bytes: usize) -> &str {
    if s.len() <= max_bytes {
        return s;
    }
    let mut end = max_bytes;
    while end > 0 && !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_newlines_and_control() {
        let s = "Line1\nLine2\r\tEnd\u{1}";
        assert_eq!(escape_log(s), "Line1\\nLine2\\r\\tEnd\\x01");
    }

    #[test]
    fn hex_snippet_marks_remainder() {
        assert_eq!(hex_snippet(&[0x94, 0xc3, 0x00, 0x02], 2), "94c3..(+2)");
        assert_eq!(hex_snippet(&[0xab], 8), "ab");
    }

    #[test]
    fn truncate_respects_char_boundary() {
        let s = "ab😀cd";
        assert_eq!(truncate_for_log(s, 3), "ab");
        assert_eq!(truncate_for_log(s, 6), "ab😀");
        assert_eq!(truncate_for_log(s, 64), s);
    }
}
