//! Transcript assembly for the classifier.
//!
//! Each line is tagged by sender. The boundary marker is a hard
//! extraction-scope rule: the model may only extract items from content
//! after it, so context can never leak plan-like language into the output.

use crate::message_store::Message;

/// Marker separating prior context from the new, to-be-classified messages.
pub const BOUNDARY_MARKER: &str = "--- NEW MESSAGES ---";

pub const THEM_TAG: &str = "[them]";
pub const ME_TAG: &str = "[me]";

/// Render context plus fresh messages into the prompt transcript. Both
/// slices are expected in chronological order; `fresh` must be non-empty.
pub fn build_transcript(context: &[Message], fresh: &[Message]) -> String {
    let mut lines = Vec::with_capacity(context.len() + fresh.len() + 1);
    for message in context {
        lines.push(tag_line(message));
    }
    lines.push(BOUNDARY_MARKER.to_string());
    for message in fresh {
        lines.push(tag_line(message));
    }
    lines.join("\n")
}

fn tag_line(message: &Message) -> String {
    let tag = if message.is_from_me { ME_TAG } else { THEM_TAG };
    format!("{} {}", tag, message.text)
}
