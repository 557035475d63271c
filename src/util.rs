//! Small helpers shared across the gateway.

/// Truncate a string to at most `max_chars` characters, appending "..." if
/// truncated. Uses character boundaries, not byte indices, so multi-byte
/// content (Hebrew, emoji) truncates safely.
pub fn truncate_with_ellipsis(s: &str, max_chars: usize) -> String {
    match s.char_indices().nth(max_chars) {
        Some((idx, _)) => {
            let truncated = &s[..idx];
            format!("{}...", truncated.trim_end())
        }
        None => s.to_string(),
    }
}

/// Parse a boolean-ish env value ("1", "true", "yes" case-insensitive).
pub fn env_flag(value: &str) -> bool {
    value == "1" || value.eq_ignore_ascii_case("true") || value.eq_ignore_ascii_case("yes")
}
