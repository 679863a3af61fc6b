//! Output truncation for observations shown to the model and the event stream.

/// Cap `text` at `max_chars` characters.
///
/// Returns the possibly shortened text and whether anything was cut. A cut
/// appends a note with the original length so the model knows output is missing.
pub fn truncate_output(text: &str, max_chars: usize) -> (String, bool) {
    let total = text.chars().count();
    if total <= max_chars {
        return (text.to_string(), false);
    }
    let kept: String = text.chars().take(max_chars).collect();
    (
        format!("{kept}\n... (truncated, {total} total chars)"),
        true,
    )
}
