use shared::domain::{is_pending_id, Message};

/// Messages visible under a revert pointer. Pending messages are always kept;
/// server messages are kept only when their id sorts before the pointer, so
/// the pointer message itself is the hidden boundary.
pub fn visible(messages: Vec<Message>, revert_message_id: Option<&str>) -> Vec<Message> {
    let Some(pointer) = revert_message_id.filter(|id| !id.trim().is_empty()) else {
        return messages;
    };
    messages
        .into_iter()
        .filter(|message| is_pending_id(message.id()) || message.id() < pointer)
        .collect()
}

/// Text to put back into the composer after reverting to `boundary_id`: the
/// last user message at or before the boundary.
pub fn prompt_text_for_revert(messages: &[Message], boundary_id: &str) -> Option<String> {
    let end = messages
        .iter()
        .position(|message| message.id() == boundary_id)?;
    messages[..=end]
        .iter()
        .rev()
        .find(|message| message.is_user())
        .map(|message| message.plain_text().trim().to_string())
        .filter(|text| !text.is_empty())
}

/// Nearest user message at or before `selected_id`, which is the message a
/// revert actually targets.
pub fn revert_target(messages: &[Message], selected_id: &str) -> Option<String> {
    let index = messages
        .iter()
        .position(|message| message.id() == selected_id)?;
    messages[..=index]
        .iter()
        .rev()
        .find(|message| message.is_user())
        .map(|message| message.id().to_string())
}

#[cfg(test)]
#[path = "tests/revert_tests.rs"]
mod tests;
