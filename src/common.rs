use std::time::{SystemTime, UNIX_EPOCH};

/// Truncates untrusted text (error bodies, report excerpts) for log lines.
/// Report and model text is routinely multi-byte, so cut on char boundaries.
pub fn truncate_for_log(text: &str) -> String {
    let trimmed = text.trim();
    let max_chars = 300usize;
    if trimmed.chars().count() <= max_chars {
        trimmed.to_string()
    } else {
        let head: String = trimmed.chars().take(max_chars).collect();
        format!("{head}...")
    }
}

pub fn truncate_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        text.to_string()
    } else {
        text.chars().take(max_chars).collect()
    }
}

pub fn now_unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_for_log_keeps_short_text() {
        assert_eq!(truncate_for_log("  short  "), "short");
    }

    #[test]
    fn truncate_for_log_cuts_on_char_boundaries() {
        let long = "肾".repeat(400);
        let cut = truncate_for_log(&long);
        assert!(cut.ends_with("..."));
        assert_eq!(cut.chars().count(), 303);
    }

    #[test]
    fn truncate_chars_caps_length() {
        assert_eq!(truncate_chars("abcdef", 4), "abcd");
        assert_eq!(truncate_chars("abc", 4), "abc");
        assert_eq!(truncate_chars("报告所见正常", 2), "报告");
    }
}
