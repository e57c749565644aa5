//! Small shared helpers for log handling and image naming.

use std::sync::OnceLock;

use regex::Regex;

/// Remove ANSI color/control sequences from terminal output.
///
/// Build and eval logs pass through this before being persisted or parsed.
pub fn strip_ansi(text: &str) -> String {
    static ANSI_RE: OnceLock<Regex> = OnceLock::new();
    let re = ANSI_RE.get_or_init(|| Regex::new(r"\x1b\[[0-9;]*m").unwrap());
    re.replace_all(text, "").into_owned()
}

/// Truncate a string to at most `max` bytes on a char boundary, appending
/// `...` when anything was cut.
pub fn truncate(s: &str, max: usize) -> String {
    if s.len() <= max {
        return s.to_string();
    }
    let mut end = max;
    while !s.is_char_boundary(end) && end > 0 {
        end -= 1;
    }
    format!("{}...", &s[..end])
}

/// Keep only the trailing `max` bytes of a string (char-boundary safe).
///
/// Raw eval outputs are bounded this way before they land in persisted logs.
pub fn tail(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut start = s.len() - max;
    while !s.is_char_boundary(start) && start < s.len() {
        start += 1;
    }
    &s[start..]
}

/// Sanitize an image key or instance id for use as a filename:
/// `:` becomes `__`, `/` becomes `_`.
pub fn safe_name(name: &str) -> String {
    name.replace(':', "__").replace('/', "_")
}
