//! Heuristic agent-state detection from terminal output.
//!
//! Agents that report state through hooks do not need this. For the ones
//! that do not, the classifier watches the last few complete lines of
//! output and guesses whether the agent is working, waiting for input, or
//! waiting for approval. Staying in `working` is always the safe answer:
//! a false "needs attention" is worse than a missed one.

use attn_core::{AgentKind, AgentState};
use std::collections::VecDeque;

/// Complete lines kept for classification.
const WINDOW_LINES: usize = 6;

/// A partial line longer than this is classified as if it were complete.
pub const DEFAULT_MAX_PARTIAL: usize = 2000;

/// Phrase tables for one agent's prompt conventions.
#[derive(Debug)]
pub struct Heuristics {
    pub prompt_markers: &'static [&'static str],
    pub status_markers: &'static [&'static str],
    pub request_phrases: &'static [&'static str],
    pub list_request_triggers: &'static [&'static str],
}

static CODEX_HEURISTICS: Heuristics = Heuristics {
    prompt_markers: &[" › ", " > ", "❯ ", "» ", "❱ "],
    status_markers: &["context left", "for shortcuts"],
    request_phrases: &[
        "let me know what",
        "let me know if",
        "tell me what else",
        "tell me what to do",
        "what should i do",
        "what would you like",
        "what do you want",
        "how can i help",
        "can you",
        "could you",
        "do you want",
    ],
    list_request_triggers: &["pick one", "choose", "select", "tell me"],
};

/// Output grammar a classifier understands, chosen once at spawn time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grammar {
    Codex,
    Copilot,
}

impl Grammar {
    /// Grammar for an agent kind, or `None` when the agent reports its
    /// state through hooks (or is a plain shell).
    pub fn for_agent(agent: AgentKind) -> Option<Self> {
        match agent {
            AgentKind::Codex => Some(Grammar::Codex),
            AgentKind::Copilot => Some(Grammar::Copilot),
            AgentKind::Claude | AgentKind::Shell => None,
        }
    }

    pub fn heuristics(&self) -> &'static Heuristics {
        match self {
            // Copilot's TUI uses the same prompt glyphs and status footer.
            Grammar::Codex | Grammar::Copilot => &CODEX_HEURISTICS,
        }
    }
}

/// Per-session line-buffered classifier.
#[derive(Debug)]
pub struct StateClassifier {
    grammar: Grammar,
    lines: VecDeque<String>,
    partial: String,
    max_partial: usize,
    last_state: Option<AgentState>,
}

impl StateClassifier {
    pub fn new(grammar: Grammar) -> Self {
        Self::with_max_partial(grammar, DEFAULT_MAX_PARTIAL)
    }

    pub fn with_max_partial(grammar: Grammar, max_partial: usize) -> Self {
        Self {
            grammar,
            lines: VecDeque::with_capacity(WINDOW_LINES + 1),
            partial: String::new(),
            max_partial,
            last_state: None,
        }
    }

    pub fn for_agent(agent: AgentKind) -> Option<Self> {
        Grammar::for_agent(agent).map(Self::new)
    }

    /// Most recently reported state.
    #[cfg(test)]
    fn state(&self) -> Option<AgentState> {
        self.last_state
    }

    /// Feed one output chunk. Returns the new state on a transition.
    pub fn observe(&mut self, chunk: &[u8]) -> Option<AgentState> {
        let cleaned = strip_ansi(&String::from_utf8_lossy(chunk));
        if cleaned.trim().is_empty() {
            return None;
        }
        self.partial.push_str(&cleaned);

        let mut completed = false;
        while let Some(pos) = self.partial.find('\n') {
            let line = self.partial[..pos].trim_end_matches('\r').to_string();
            self.partial.drain(..=pos);
            self.push_line(line);
            completed = true;
        }

        if self.partial.len() > self.max_partial {
            let line = std::mem::take(&mut self.partial);
            self.push_line(line);
            completed = true;
        }

        let heuristics = self.grammar.heuristics();
        if !completed && !is_terminated_partial(&self.partial, heuristics) {
            return None;
        }

        let mut window: Vec<&str> = self.lines.iter().map(String::as_str).collect();
        if !self.partial.is_empty() {
            window.push(&self.partial);
        }
        let start = window.len().saturating_sub(WINDOW_LINES);
        let text = window[start..].join("\n");

        let desired = classify_state(&text, heuristics)?;
        if self.last_state == Some(desired) {
            return None;
        }
        self.last_state = Some(desired);
        Some(desired)
    }

    fn push_line(&mut self, line: String) {
        self.lines.push_back(line);
        while self.lines.len() > WINDOW_LINES {
            self.lines.pop_front();
        }
    }
}

/// Whether an unfinished line already looks like a prompt waiting for the
/// user, so classification need not wait for a newline that never comes.
fn is_terminated_partial(partial: &str, h: &Heuristics) -> bool {
    if partial.trim().is_empty() {
        return false;
    }
    if is_prompt_line(partial) || h.prompt_markers.iter().any(|m| partial.contains(m)) {
        return true;
    }
    let lower = partial.to_lowercase();
    if lower.contains("y/n") || lower.contains("yes/no") {
        return true;
    }
    let trimmed = partial.trim_end();
    trimmed.ends_with(':') || trimmed.ends_with('?')
}

/// Remove CSI and OSC sequences; other escapes lose only their ESC byte.
pub fn strip_ansi(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '\x1b' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('[') => {
                chars.next();
                for b in chars.by_ref() {
                    if ('\x40'..='\x7e').contains(&b) {
                        break;
                    }
                }
            }
            Some(']') => {
                chars.next();
                while let Some(b) = chars.next() {
                    if b == '\x07' {
                        break;
                    }
                    if b == '\x1b' && chars.peek() == Some(&'\\') {
                        chars.next();
                        break;
                    }
                }
            }
            _ => {}
        }
    }
    out
}

fn is_pending_approval(text: &str) -> bool {
    let lower = text.to_lowercase();
    if lower.contains("would you like to run the following command") {
        return true;
    }

    let has_keyword = [
        "approve",
        "approval",
        "permission",
        "allow",
        "confirm",
        "proceed",
        "run this command",
        "execute command",
        "run command",
    ]
    .iter()
    .any(|k| lower.contains(k));

    let has_prompt = [
        "y/n",
        "y or n",
        "yes/no",
        "press y",
        "type y",
        "press enter to confirm",
    ]
    .iter()
    .any(|k| lower.contains(k));

    let has_reason = lower.contains("reason:");
    let has_option = [
        "yes, proceed",
        "don't ask again",
        "dont ask again",
        "no, and tell",
    ]
    .iter()
    .any(|k| lower.contains(k));

    (has_keyword && has_prompt) || (has_reason && has_option)
}

fn first_char(line: &str) -> Option<char> {
    line.trim_start_matches([' ', '\t']).chars().next()
}

fn is_prompt_line(line: &str) -> bool {
    matches!(first_char(line), Some('>' | '›' | '❯' | '»' | '❱'))
}

fn is_assistant_line(line: &str) -> bool {
    let trimmed = line.trim_start_matches([' ', '\t']);
    let mut chars = trimmed.chars();
    if !matches!(chars.next(), Some('•' | '·' | '●')) {
        return false;
    }
    let rest = chars.as_str().trim().to_lowercase();
    !["working", "thinking", "running", "executing"]
        .iter()
        .any(|p| rest.starts_with(p))
}

fn last_assistant_text(lines: &[&str], h: &Heuristics) -> Option<String> {
    for line in lines.iter().rev() {
        let trimmed = line.trim();
        if trimmed.is_empty() || !is_assistant_line(trimmed) {
            continue;
        }
        let mut chars = trimmed.chars();
        chars.next();
        let mut text = chars.as_str().trim();
        for marker in h.prompt_markers.iter().chain(h.status_markers) {
            if let Some(idx) = text.find(marker) {
                text = &text[..idx];
            }
        }
        let text = text.trim();
        if !text.is_empty() {
            return Some(text.to_string());
        }
    }
    None
}

fn has_prompt(lines: &[&str], h: &Heuristics) -> bool {
    lines
        .iter()
        .any(|line| is_prompt_line(line) || h.prompt_markers.iter().any(|m| line.contains(m)))
}

fn last_non_empty_line<'a>(lines: &[&'a str]) -> Option<&'a str> {
    lines.iter().rev().map(|l| l.trim()).find(|l| !l.is_empty())
}

fn has_numbered_list(lines: &[&str]) -> bool {
    lines.iter().any(|line| {
        let b = line.trim_start_matches([' ', '\t']).as_bytes();
        b.len() >= 2 && b[0].is_ascii_digit() && b[1] == b'.'
    })
}

fn assistant_requests_input(assistant: &str, full: &str, lines: &[&str], h: &Heuristics) -> bool {
    if assistant.contains('?') {
        return true;
    }
    let lower_assistant = assistant.to_lowercase();
    if h.request_phrases.iter().any(|p| lower_assistant.contains(p)) {
        return true;
    }
    if has_numbered_list(lines) {
        let lower_full = full.to_lowercase();
        return h.list_request_triggers.iter().any(|p| lower_full.contains(p));
    }
    false
}

fn is_waiting_input(text: &str, h: &Heuristics) -> bool {
    let lower = text.to_lowercase();
    if [
        "enter your response",
        "type your response",
        "your response:",
        "your reply:",
        "input:",
    ]
    .iter()
    .any(|p| lower.contains(p))
    {
        return true;
    }

    let non_empty: Vec<&str> = text
        .split('\n')
        .map(|l| l.trim_end_matches(['\r', '\n']))
        .filter(|l| !l.trim().is_empty())
        .collect();
    let Some(last) = non_empty.last() else {
        return false;
    };

    if last.ends_with("You:") || last.ends_with("User:") {
        return true;
    }

    if is_prompt_line(last) {
        return match last_assistant_text(&non_empty, h) {
            Some(assistant) => assistant_requests_input(&assistant, text, &non_empty, h),
            None => true,
        };
    }

    let tail = &non_empty[non_empty.len().saturating_sub(4)..];
    let has_prompt_line = tail.iter().any(|l| is_prompt_line(l));
    let has_status = tail
        .iter()
        .any(|l| h.status_markers.iter().any(|m| l.contains(m)));

    if has_prompt_line && has_status {
        return match last_assistant_text(&non_empty, h) {
            Some(assistant) => assistant_requests_input(&assistant, text, &non_empty, h),
            None => true,
        };
    }
    false
}

/// Classify a window of output text. Checks run in priority order and the
/// first match wins; `None` only for blank text.
pub fn classify_state(text: &str, h: &Heuristics) -> Option<AgentState> {
    let cleaned = strip_ansi(text);
    let lines: Vec<&str> = cleaned.split('\n').collect();

    if is_pending_approval(&cleaned) {
        return Some(AgentState::PendingApproval);
    }
    if is_waiting_input(&cleaned, h) {
        return Some(AgentState::WaitingInput);
    }
    if has_prompt(&lines, h) && last_non_empty_line(&lines).is_some_and(is_prompt_line) {
        return Some(AgentState::Idle);
    }
    if !cleaned.trim().is_empty() {
        return Some(AgentState::Working);
    }
    None
}
