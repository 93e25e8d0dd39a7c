//! Error-message hygiene for log lines and typed revert reasons. Provider
//! errors routinely embed entire JSON response bodies and backtraces; the
//! audit trail and the `RevertError` reasons only want the head.

/// Collapse whitespace and bound the length of a raw error message. JSON
/// bodies (anything after a `text:`/`body:` marker) and backtraces are cut
/// before truncation so the budget goes to the useful prefix.
pub fn compact_error_message(message: &str, max_len: usize) -> String {
    let mut head = message;
    for marker in [" text: ", " body: ", "Stack backtrace:"] {
        if let Some(idx) = head.find(marker) {
            head = &head[..idx];
        }
    }

    let mut compact = String::with_capacity(head.len().min(max_len) + 16);
    let mut last_was_space = true;
    for ch in head.chars() {
        if ch.is_whitespace() {
            if !last_was_space {
                compact.push(' ');
                last_was_space = true;
            }
            continue;
        }
        compact.push(ch);
        last_was_space = false;
        if compact.len() > max_len {
            compact.truncate(max_len);
            compact.push_str("...(truncated)");
            break;
        }
    }
    if compact.ends_with(' ') {
        compact.pop();
    }
    compact
}

#[cfg(test)]
mod tests {
    use super::compact_error_message;

    #[test]
    fn test_payload_and_backtrace_are_cut() {
        let raw = "DeserError { err: unknown variant `0x7e` } text: {\"huge\":\"body\"}\nStack backtrace:\n 0: frame";
        let compact = compact_error_message(raw, 260);
        assert!(!compact.contains("huge"));
        assert!(!compact.contains("Stack backtrace"));
        assert!(compact.contains("unknown variant"));
    }

    #[test]
    fn test_whitespace_collapses_and_length_bounds() {
        let raw = "a    b\n\n\tc";
        assert_eq!(compact_error_message(raw, 260), "a b c");

        let long = "x".repeat(500);
        let compact = compact_error_message(&long, 100);
        assert!(compact.len() <= 100 + "...(truncated)".len());
        assert!(compact.ends_with("...(truncated)"));
    }
}
