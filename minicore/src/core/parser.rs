//! Action parsing for model responses.
//!
//! A model proposes a shell command by writing exactly one fenced block:
//!
//! ````text
//! ```bash
//! ls -la
//! ```
//! ````
//!
//! The opening fence (`bash` or `sh` info string) and the closing fence must
//! each sit on their own line. Everything between them, trimmed, is the
//! command. Parsing is total: any input yields a [`ParsedAction`].

use std::sync::LazyLock;

use regex::Regex;

/// Marker a model uses to declare the task finished.
pub const COMPLETION_SENTINEL: &str = "COMPLETE_TASK_AND_SUBMIT_FINAL_OUTPUT";

static ACTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?ms)^[ \t]*```(?:bash|sh)[ \t]*\r?\n(.*?)^[ \t]*```[ \t]*\r?$")
        .expect("action regex should be valid")
});

static THOUGHT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?is)<thought>(.*?)</thought>|<thinking>(.*?)</thinking>")
        .expect("thought regex should be valid")
});

/// Classification of a model response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedAction {
    /// Exactly one non-empty action block.
    Command(String),
    /// No action block.
    NoCommand,
    /// More than one action block (count attached).
    MultipleCommands(usize),
}

impl ParsedAction {
    /// Number of action blocks found.
    pub fn count(&self) -> usize {
        match self {
            ParsedAction::Command(_) => 1,
            ParsedAction::NoCommand => 0,
            ParsedAction::MultipleCommands(n) => *n,
        }
    }
}

/// Classify `text` as one command, none, or several.
pub fn parse_action(text: &str) -> ParsedAction {
    let mut commands: Vec<String> = ACTION_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1))
        .map(|body| body.as_str().trim().to_string())
        .filter(|body| !body.is_empty())
        .collect();
    match commands.len() {
        0 => ParsedAction::NoCommand,
        1 => ParsedAction::Command(commands.remove(0)),
        n => ParsedAction::MultipleCommands(n),
    }
}

/// Render `command` as a canonical action block.
///
/// `parse_action(&format_action(c))` returns `c` for every command that
/// `parse_action` can produce.
pub fn format_action(command: &str) -> String {
    format!("```bash\n{command}\n```")
}

/// Remove every action block from `text`.
pub fn strip_action_blocks(text: &str) -> String {
    ACTION_RE.replace_all(text, "").into_owned()
}

/// Detect the completion sentinel written as prose (outside action blocks).
///
/// Returns the final summary: the text after the marker line, or the whole
/// response without the marker when nothing follows it.
pub fn detect_completion(text: &str) -> Option<String> {
    let prose = strip_action_blocks(text);
    let lines: Vec<&str> = prose.lines().collect();
    let marker = lines
        .iter()
        .position(|line| line.trim() == COMPLETION_SENTINEL)?;

    let after = lines[marker + 1..].join("\n").trim().to_string();
    if !after.is_empty() {
        return Some(after);
    }
    let before = lines[..marker].join("\n").trim().to_string();
    Some(before)
}

/// Detect the completion sentinel as the first line of a command's stdout.
///
/// Returns the remaining output, which becomes the submission.
pub fn completion_from_output(stdout: &str) -> Option<String> {
    let trimmed = stdout.trim_start();
    let mut parts = trimmed.splitn(2, '\n');
    let first = parts.next()?;
    if first.trim() != COMPLETION_SENTINEL {
        return None;
    }
    Some(parts.next().unwrap_or_default().to_string())
}

/// The model's reasoning for the `thought` event.
///
/// Uses explicit `<thought>`/`<thinking>` blocks when present, otherwise the
/// response with its action blocks removed.
pub fn extract_thought(text: &str) -> String {
    let tagged: Vec<&str> = THOUGHT_RE
        .captures_iter(text)
        .filter_map(|caps| caps.get(1).or_else(|| caps.get(2)))
        .map(|m| m.as_str().trim())
        .filter(|s| !s.is_empty())
        .collect();
    if !tagged.is_empty() {
        return tagged.join("\n\n");
    }
    strip_action_blocks(text).trim().to_string()
}
