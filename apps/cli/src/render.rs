use std::collections::HashMap;

use client_core::{ChatError, ChatSnapshot};
use shared::domain::{Message, Part};

/// Turns successive snapshots into terminal lines, printing each message
/// again only when its rendered form changes.
#[derive(Debug, Default)]
pub struct TranscriptPrinter {
    rendered: HashMap<String, String>,
    last_error: Option<ChatError>,
    last_permission: Option<String>,
}

impl TranscriptPrinter {
    pub fn render(&mut self, snapshot: &ChatSnapshot) -> Vec<String> {
        let mut lines = Vec::new();

        self.rendered
            .retain(|id, _| snapshot.messages.iter().any(|message| message.id() == id.as_str()));
        for message in &snapshot.messages {
            let line = describe(message);
            if self.rendered.get(message.id()) != Some(&line) {
                self.rendered.insert(message.id().to_string(), line.clone());
                lines.push(line);
            }
        }

        if snapshot.error != self.last_error {
            if let Some(error) = &snapshot.error {
                lines.push(format!("! {error}"));
            }
            self.last_error = snapshot.error.clone();
        }

        let permission_id = snapshot
            .pending_permission
            .as_ref()
            .map(|request| request.request_id.clone());
        if permission_id != self.last_permission {
            if let Some(request) = &snapshot.pending_permission {
                lines.push(format!(
                    "? permission {} requested for {} ({})",
                    request.request_id,
                    request.permission,
                    request.patterns.join(", ")
                ));
            }
            self.last_permission = permission_id;
        }

        lines
    }
}

fn describe(message: &Message) -> String {
    let speaker = match (message.is_user(), message.is_pending()) {
        (true, true) => "you (sending)",
        (true, false) => "you",
        (false, _) => "assistant",
    };
    let mut body = message.plain_text();
    for part in message.parts() {
        if let Part::Tool { tool, state, .. } = part {
            if !body.is_empty() {
                body.push('\n');
            }
            body.push_str(&format!("  [{tool}: {state:?}]"));
        }
    }
    format!("{speaker}> {body}")
}

#[cfg(test)]
#[path = "tests/render_tests.rs"]
mod tests;
