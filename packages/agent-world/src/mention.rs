//! `@name` parsing.
//!
//! Two extractors with different jobs:
//!
//! - [`extract_leading_mentions`] decides who must respond. Only mentions at
//!   the start of the text or at the start of a line count.
//! - [`extract_mentions`] is permissive and only used for reply threading
//!   (does a reply already address its recipient somewhere?).
//!
//! Names are `[A-Za-z0-9_-]+` and compared lowercase.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    // Start of text or start of a line, optional horizontal whitespace.
    static ref LEADING_MENTION: Regex =
        Regex::new(r"(?m)^[ \t]*@([A-Za-z0-9_-]+)").unwrap();

    // Anywhere, but not glued to a preceding word (keeps emails out).
    static ref ANY_MENTION: Regex =
        Regex::new(r"(?:^|[^A-Za-z0-9_.@])@([A-Za-z0-9_-]+)").unwrap();
}

/// Mentions that start a line, lowercase, in order of appearance.
///
/// ```ignore
/// assert_eq!(extract_leading_mentions("@Bob hello"), vec!["bob"]);
/// assert!(extract_leading_mentions("Hello @bob").is_empty());
/// ```
pub fn extract_leading_mentions(text: &str) -> Vec<String> {
    LEADING_MENTION
        .captures_iter(text)
        .filter_map(|cap| cap.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
        .collect()
}

/// Every mention anywhere in the text, lowercase, deduplicated, in order.
pub fn extract_mentions(text: &str) -> Vec<String> {
    let mut names: Vec<String> = Vec::new();
    for cap in ANY_MENTION.captures_iter(text) {
        if let Some(m) = cap.get(1) {
            let name = m.as_str().to_ascii_lowercase();
            if !names.contains(&name) {
                names.push(name);
            }
        }
    }
    names
}

/// Remove `@<agent_id>` tokens from the very start of a reply.
///
/// Repeated self-mentions and the separators after them (`,` `:` `;`,
/// whitespace) are removed too. Returns the text unchanged when it would
/// become empty.
pub fn strip_leading_self_mentions(text: &str, agent_id: &str) -> String {
    let mut rest = text.trim_start();

    loop {
        let Some(after_at) = rest.strip_prefix('@') else {
            break;
        };
        let name_len = after_at
            .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_' || c == '-'))
            .unwrap_or(after_at.len());
        if name_len == 0 || !after_at[..name_len].eq_ignore_ascii_case(agent_id) {
            break;
        }
        rest = after_at[name_len..]
            .trim_start_matches(|c: char| c.is_whitespace() || matches!(c, ',' | ':' | ';'));
    }

    if rest.trim().is_empty() {
        text.to_string()
    } else {
        rest.to_string()
    }
}

/// Address a reply to `recipient` unless it already is.
///
/// A reply that opens with its own mention keeps it (the agent chose whom to
/// address). A reply that names the recipient anywhere is left alone.
/// Otherwise `@recipient ` is prepended so the thread stays traceable.
pub fn address_reply(text: &str, recipient: &str) -> String {
    let recipient = recipient.to_ascii_lowercase();
    if !extract_leading_mentions(text).is_empty() || extract_mentions(text).contains(&recipient) {
        return text.to_string();
    }
    format!("@{} {}", recipient, text.trim_start())
}
