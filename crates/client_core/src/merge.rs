use shared::domain::Part;

/// Combines the previously known full text of a streaming part with an
/// incoming update.
///
/// A non-empty `delta` is appended to the longer of the two texts unless one
/// of them already ends with it, so replaying the same delta is a no-op.
/// Without a delta the longer text wins. That also covers divergent
/// (out-of-order) updates, where it is only a best-effort choice.
pub fn merge_streaming_text(previous: &str, incoming: &str, delta: Option<&str>) -> String {
    let base = if incoming.len() >= previous.len() {
        incoming
    } else {
        previous
    };

    if let Some(delta) = delta.filter(|delta| !delta.is_empty()) {
        if base.ends_with(delta) || previous.ends_with(delta) || incoming.ends_with(delta) {
            return base.to_string();
        }
        return format!("{base}{delta}");
    }

    if incoming.is_empty() {
        return previous.to_string();
    }
    if incoming.starts_with(previous) || previous.starts_with(incoming) {
        return base.to_string();
    }
    base.to_string()
}

/// Merges `incoming` into `parts`, matching on part id. Text and reasoning
/// parts go through [`merge_streaming_text`]; every other kind is replaced.
/// Parts without a known id are appended.
pub fn merge_streaming_part(parts: &mut Vec<Part>, incoming: Part, delta: Option<&str>) {
    let Some(index) = incoming
        .id()
        .and_then(|id| parts.iter().position(|part| part.id() == Some(id)))
    else {
        parts.push(apply_delta_to_new_part(incoming, delta));
        return;
    };

    let merged = match (&parts[index], incoming) {
        (
            Part::Text { text: previous, .. },
            Part::Text {
                id,
                text,
                synthetic,
            },
        ) => Part::Text {
            id,
            text: merge_streaming_text(previous, &text, delta),
            synthetic,
        },
        (Part::Reasoning { text: previous, .. }, Part::Reasoning { id, text }) => {
            Part::Reasoning {
                id,
                text: merge_streaming_text(previous, &text, delta),
            }
        }
        (_, other) => apply_delta_to_new_part(other, delta),
    };
    parts[index] = merged;
}

fn apply_delta_to_new_part(part: Part, delta: Option<&str>) -> Part {
    match part {
        Part::Text {
            id,
            text,
            synthetic,
        } => Part::Text {
            id,
            text: merge_streaming_text("", &text, delta),
            synthetic,
        },
        Part::Reasoning { id, text } => Part::Reasoning {
            id,
            text: merge_streaming_text("", &text, delta),
        },
        other => other,
    }
}

#[cfg(test)]
#[path = "tests/merge_tests.rs"]
mod tests;
