//! Prompt assembly for a spoken turn.

use rusty_voice_core::session::{Role, Turn};
use rusty_voice_providers::ChatMessage;

pub const DEFAULT_IDENTITY: &str = "You are Rusty Voice, a friendly spoken assistant. \
Your replies are read aloud, so answer in short conversational sentences \
without markdown, lists or code.";

/// Build the system instructions with an optional persona override.
pub fn build_system_prompt(persona: Option<&str>) -> String {
    let identity = persona.unwrap_or(DEFAULT_IDENTITY);
    let now = chrono::Local::now();
    format!(
        "{identity}\n\nCurrent time: {}",
        now.format("%A, %Y-%m-%d %H:%M %Z")
    )
}

/// The labeled memory block, or `None` when nothing was retrieved.
pub fn memory_block(facts: &[String]) -> Option<String> {
    if facts.is_empty() {
        return None;
    }
    let mut block = String::from("--- Relevant memory ---");
    for fact in facts {
        block.push_str("\n- ");
        block.push_str(fact.trim());
    }
    Some(block)
}

/// Ordered messages: system instructions, memory block, last `history_turns`
/// turns, then the new user turn.
pub fn build_messages(
    system: &str,
    facts: &[String],
    history: &[Turn],
    history_turns: usize,
    user_text: &str,
) -> Vec<ChatMessage> {
    let start = history.len().saturating_sub(history_turns);
    let mut messages = Vec::with_capacity(history.len() - start + 3);

    messages.push(ChatMessage::system(system));
    if let Some(block) = memory_block(facts) {
        messages.push(ChatMessage::system(block));
    }
    messages.extend(history[start..].iter().map(|turn| match turn.role {
        Role::User => ChatMessage::user(turn.text.clone()),
        Role::Assistant => ChatMessage::assistant(turn.text.clone()),
    }));
    messages.push(ChatMessage::user(user_text));
    messages
}

#[cfg(test)]
mod tests {
    use rusty_voice_providers::ChatRole;

    use super::*;

    #[test]
    fn test_persona_overrides_default() {
        let custom = "You are Jarvis, a sophisticated AI butler.";
        let prompt = build_system_prompt(Some(custom));
        assert!(prompt.starts_with(custom));
        assert!(!prompt.contains(DEFAULT_IDENTITY));
        assert!(prompt.contains("Current time: "));
    }

    #[test]
    fn test_persona_none_uses_default() {
        assert!(build_system_prompt(None).starts_with(DEFAULT_IDENTITY));
    }

    #[test]
    fn test_memory_block_follows_system() {
        let history = vec![Turn::user("hi"), Turn::assistant("hello")];
        let facts = vec!["User's name is Ada".to_string()];
        let messages = build_messages("sys", &facts, &history, 12, "what's my name?");

        assert_eq!(messages.len(), 5);
        assert_eq!(messages[0], ChatMessage::system("sys"));
        assert_eq!(messages[1].role, ChatRole::System);
        assert!(messages[1].content.contains("- User's name is Ada"));
        assert_eq!(messages[2], ChatMessage::user("hi"));
        assert_eq!(messages[3], ChatMessage::assistant("hello"));
        assert_eq!(messages[4], ChatMessage::user("what's my name?"));
    }

    #[test]
    fn test_empty_memory_has_no_block() {
        let messages = build_messages("sys", &[], &[], 12, "hello");
        assert_eq!(messages, vec![ChatMessage::system("sys"), ChatMessage::user("hello")]);
    }

    #[test]
    fn test_history_is_limited_to_last_k() {
        let history: Vec<Turn> = (0..20).map(|i| Turn::user(format!("turn {i}"))).collect();
        let messages = build_messages("sys", &[], &history, 3, "now");
        assert_eq!(messages.len(), 5);
        assert_eq!(messages[1].content, "turn 17");
        assert_eq!(messages[3].content, "turn 19");
    }
}
