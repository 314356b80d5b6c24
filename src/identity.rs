//! Conversation identity: canonical ids and fuzzy id matching.
//!
//! Surface identifiers arrive decorated (`chat-`, `conversation_`, stray
//! punctuation) and are not always byte-identical to the id a conversation was
//! first seen under. Everything that compares conversations goes through
//! [`normalize`] and [`ids_match`].

use std::fmt;

use serde::{Deserialize, Serialize};

/// Id returned when nothing usable survives normalization.
pub const UNKNOWN_CONVERSATION: &str = "unknown";

/// Minimum digit-run length for the numeric overlap heuristic.
const MIN_DIGIT_RUN: usize = 8;

/// Prefixes stripped from raw ids, checked in order.
const STRIP_PREFIXES: &[&str] = &[
    "conversation-",
    "conversation_",
    "contact-",
    "contact_",
    "session-",
    "session_",
    "chat-",
    "chat_",
    "uid-",
    "uid_",
];

/// Canonicalize a raw surface identifier.
///
/// Characters outside `[A-Za-z0-9_-]` are dropped, then known prefixes are
/// stripped (first match in list order, repeated until none applies). An empty
/// result maps to [`UNKNOWN_CONVERSATION`]. `normalize(normalize(x)) == normalize(x)`.
pub fn normalize(raw: &str) -> String {
    let mut id: String = raw
        .chars()
        .filter(|c| c.is_ascii_alphanumeric() || *c == '_' || *c == '-')
        .collect();

    while let Some(prefix) = STRIP_PREFIXES.iter().find(|p| id.starts_with(**p)) {
        id.drain(..prefix.len());
    }

    if id.is_empty() {
        UNKNOWN_CONVERSATION.to_string()
    } else {
        id
    }
}

/// Fuzzy comparison of two raw or canonical ids.
///
/// True when the canonical forms are equal, when one contains the other, or
/// when both carry digit runs of at least eight digits and one run contains
/// the other. The unknown sentinel never matches.
pub fn ids_match(a: &str, b: &str) -> bool {
    let a = normalize(a);
    let b = normalize(b);
    if a == UNKNOWN_CONVERSATION || b == UNKNOWN_CONVERSATION {
        return false;
    }
    if a == b || a.contains(&b) || b.contains(&a) {
        return true;
    }

    let runs_a = digit_runs(&a);
    let runs_b = digit_runs(&b);
    runs_a.iter().any(|ra| {
        runs_b
            .iter()
            .any(|rb| ra.contains(rb.as_str()) || rb.contains(ra.as_str()))
    })
}

/// Maximal runs of ASCII digits that are at least [`MIN_DIGIT_RUN`] long.
fn digit_runs(s: &str) -> Vec<String> {
    let mut runs = Vec::new();
    let mut current = String::new();
    for c in s.chars() {
        if c.is_ascii_digit() {
            current.push(c);
        } else {
            if current.len() >= MIN_DIGIT_RUN {
                runs.push(std::mem::take(&mut current));
            }
            current.clear();
        }
    }
    if current.len() >= MIN_DIGIT_RUN {
        runs.push(current);
    }
    runs
}

/// A canonical conversation id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConversationId(String);

impl ConversationId {
    /// Build from a raw identifier, normalizing it.
    pub fn new(raw: &str) -> Self {
        Self(normalize(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the sentinel produced for unusable input.
    pub fn is_unknown(&self) -> bool {
        self.0 == UNKNOWN_CONVERSATION
    }

    /// Fuzzy-compare against a raw surface identifier.
    pub fn matches(&self, raw: &str) -> bool {
        ids_match(&self.0, raw)
    }
}

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ConversationId {
    fn from(raw: &str) -> Self {
        Self::new(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_known_prefix() {
        assert_eq!(normalize("chat-12345"), "12345");
        assert_eq!(normalize("conversation_abc"), "abc");
    }

    #[test]
    fn strips_disallowed_characters() {
        assert_eq!(normalize("  user#42!  "), "user42");
        assert_eq!(normalize("a.b/c"), "abc");
    }

    #[test]
    fn empty_falls_back_to_sentinel() {
        assert_eq!(normalize(""), UNKNOWN_CONVERSATION);
        assert_eq!(normalize("!!!"), UNKNOWN_CONVERSATION);
        assert_eq!(normalize("chat-"), UNKNOWN_CONVERSATION);
    }

    #[test]
    fn normalize_is_idempotent() {
        let inputs = [
            "chat-123",
            "conv_conv_1",
            "chat-chat-99",
            "c hat-7",
            "conversation-chat_55",
            "",
            "unknown",
            "  ##contact_Jane-Doe##",
            "uid_uid_",
            "日本語-42",
        ];
        for raw in inputs {
            let once = normalize(raw);
            assert_eq!(normalize(&once), once, "not idempotent for {raw:?}");
        }
    }

    #[test]
    fn match_on_equal_and_containment() {
        assert!(ids_match("chat-123", "123"));
        assert!(ids_match("abc123", "123"));
        assert!(!ids_match("123", "456"));
    }

    #[test]
    fn match_on_long_digit_runs() {
        assert!(ids_match("wx_1234567890_a", "b-34567890"));
        assert!(ids_match("user_20261019001", "ref-20261019001-x"));
        // Short runs do not count.
        assert!(!ids_match("a1234567b", "c1234567d"));
    }

    #[test]
    fn sentinel_never_matches() {
        assert!(!ids_match("", ""));
        assert!(!ids_match("unknown", "unknown"));
        assert!(!ids_match("!!", "123"));
    }

    #[test]
    fn conversation_id_wraps_normalized_value() {
        let id = ConversationId::new("chat-777");
        assert_eq!(id.as_str(), "777");
        assert!(id.matches("conversation_777"));
        assert!(!id.is_unknown());
        assert!(ConversationId::new("").is_unknown());
    }
}
