//! Operator input read from stdin.

/// What to do with one input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Queue a chat line.
    Say(String),
    /// Queue a chat line that may use the priority headroom.
    Priority(String),
    /// Write a protocol line right away, bypassing the queue.
    Raw(String),
}

const PRIORITY_PREFIX: &str = "!priority ";
const RAW_PREFIX: &str = "/raw ";

/// Parse one line. Blank lines yield `None`.
pub fn parse(line: &str) -> Option<Command> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.trim().is_empty() {
        return None;
    }
    if let Some(text) = line.strip_prefix(PRIORITY_PREFIX) {
        return Some(Command::Priority(text.to_string()));
    }
    if let Some(raw) = line.strip_prefix(RAW_PREFIX) {
        return Some(Command::Raw(raw.to_string()));
    }
    Some(Command::Say(line.to_string()))
}
