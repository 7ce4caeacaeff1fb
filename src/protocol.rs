//! What an inbound line means and what replies look like.
//!
//! Inbound text is either a JSON document tagged with a `type` the bridge
//! handles itself, or a plain game command for the host.

use serde_json::Value;

use crate::store::RECOMMENDATIONS_TYPE;

/// Message type that empties the recommendation store.
pub const CLEAR_TYPE: &str = "clear";

/// Sent to viewers after the store is cleared.
pub const CLEAR_SENTINEL: &str = r#"{"type":"clear"}"#;

#[derive(Debug, Clone, PartialEq)]
pub enum Inbound<'a> {
    /// Blank line; nothing to do.
    Empty,
    Recommendations(Value),
    Clear,
    /// Anything else, passed to the command executor verbatim (trimmed).
    Command(&'a str),
}

pub fn classify(text: &str) -> Inbound<'_> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return Inbound::Empty;
    }
    if trimmed.starts_with('{') {
        if let Ok(value @ Value::Object(_)) = serde_json::from_str::<Value>(trimmed) {
            match value.get("type").and_then(Value::as_str) {
                Some(RECOMMENDATIONS_TYPE) => return Inbound::Recommendations(value),
                Some(CLEAR_TYPE) => return Inbound::Clear,
                _ => {}
            }
        }
    }
    Inbound::Command(trimmed)
}

/// `{"error": ..., "ready_for_command": ...}` sent back to whoever issued a
/// rejected command.
pub fn error_reply(message: &str, ready_for_command: bool) -> String {
    serde_json::json!({
        "error": message,
        "ready_for_command": ready_for_command,
    })
    .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recommendations_documents_are_recognized() {
        let inbound = classify(r#" {"type":"recommendations","cardScores":{"a":1}} "#);
        let Inbound::Recommendations(value) = inbound else {
            panic!("expected recommendations, got {inbound:?}");
        };
        assert_eq!(value["cardScores"]["a"], 1);
    }

    #[test]
    fn clear_documents_are_recognized() {
        assert_eq!(classify(r#"{"type":"clear"}"#), Inbound::Clear);
    }

    #[test]
    fn plain_text_and_other_json_are_commands() {
        assert_eq!(classify("play 1 0\n"), Inbound::Command("play 1 0"));
        assert_eq!(classify("state"), Inbound::Command("state"));
        assert_eq!(
            classify(r#"{"type":"state"}"#),
            Inbound::Command(r#"{"type":"state"}"#)
        );
        assert_eq!(classify("{broken"), Inbound::Command("{broken"));
    }

    #[test]
    fn blank_lines_are_empty() {
        assert_eq!(classify(""), Inbound::Empty);
        assert_eq!(classify("  \t "), Inbound::Empty);
    }

    #[test]
    fn clear_sentinel_is_a_clear_document() {
        assert_eq!(classify(CLEAR_SENTINEL), Inbound::Clear);
    }

    #[test]
    fn error_reply_shape() {
        let reply: Value = serde_json::from_str(&error_reply("Invalid command: fly", true)).unwrap();
        assert_eq!(reply["error"], "Invalid command: fly");
        assert_eq!(reply["ready_for_command"], true);
        assert_eq!(reply.as_object().unwrap().len(), 2);
    }
}
