//! Watches shell output for interactive prompts that change what a typed
//! line means: a `[y/N]` confirmation turns `y` into a consequential
//! command, a password prompt turns the next line into a secret.

use regex::Regex;
use shellgate_types::ansi::{current_line, strip_ansi};
use shellgate_types::{Classification, Safety};
use std::sync::OnceLock;

/// Only the tail of the cursor line is kept
const MAX_LINE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    Confirmation,
    Password,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectedPrompt {
    pub kind: PromptKind,
    pub text: String,
}

/// How a typed line relates to the pending prompt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PromptAnswer {
    /// Nothing is prompting; the line is ordinary program input
    NoPrompt,
    /// A harmless answer (a refusal) to a confirmation prompt
    PassThrough,
    /// Answer to a password prompt: forward it, never record it
    Secret,
    /// Affirmative answer to a confirmation prompt
    NeedsApproval(Classification),
}

fn confirmation_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"(?i)(\[y/n\]|\(y/n\)|\[yes/no\]|\(yes/no\)|are you sure|proceed\?|do you want to continue|continue\?)[^\n]*$",
        )
        .expect("static confirmation pattern is valid")
    })
}

fn password_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?i)(password|passphrase|passcode)( for [^:]*)?:\s*$")
            .expect("static password pattern is valid")
    })
}

fn is_affirmative(line: &str) -> bool {
    let answer = line.trim().to_ascii_lowercase();
    matches!(answer.as_str(), "y" | "yes" | "ok" | "proceed" | "continue" | "")
        || answer.starts_with('y')
}

#[derive(Debug, Default)]
pub struct PromptWatcher {
    line: String,
    pending: Option<DetectedPrompt>,
}

impl PromptWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed shell output. Returns the prompt if this chunk completed one.
    pub fn observe(&mut self, output: &str) -> Option<&DetectedPrompt> {
        let text = strip_ansi(output);
        if let Some(pos) = text.rfind('\n') {
            // The prompt line was finished: answered, or just program output
            self.pending = None;
            self.line.clear();
            self.line.push_str(&text[pos + 1..]);
        } else {
            self.line.push_str(&text);
        }
        if self.line.len() > MAX_LINE {
            let mut cut = self.line.len() - MAX_LINE;
            while !self.line.is_char_boundary(cut) {
                cut += 1;
            }
            self.line.drain(..cut);
        }

        if self.pending.is_some() {
            return None;
        }
        let visible = current_line(&self.line).trim_end();
        let kind = if confirmation_regex().is_match(visible) {
            PromptKind::Confirmation
        } else if password_regex().is_match(visible) {
            PromptKind::Password
        } else {
            return None;
        };
        self.pending = Some(DetectedPrompt {
            kind,
            text: visible.trim().to_string(),
        });
        self.pending.as_ref()
    }

    pub fn pending(&self) -> Option<&DetectedPrompt> {
        self.pending.as_ref()
    }

    /// Judge a typed line against the pending prompt, consuming it
    pub fn answer(&mut self, line: &str) -> PromptAnswer {
        let Some(prompt) = self.pending.take() else {
            return PromptAnswer::NoPrompt;
        };
        match prompt.kind {
            PromptKind::Password => PromptAnswer::Secret,
            PromptKind::Confirmation if is_affirmative(line) => {
                PromptAnswer::NeedsApproval(Classification {
                    safety: Safety::Unsafe,
                    requires_approval: true,
                    reason: format!("confirms prompt: {}", prompt.text),
                })
            }
            PromptKind::Confirmation => PromptAnswer::PassThrough,
        }
    }

    pub fn reset(&mut self) {
        self.line.clear();
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_confirmation_detected() {
        let mut watcher = PromptWatcher::new();
        assert!(watcher.observe("Removing 3 files\n").is_none());
        let prompt = watcher.observe("Do you want to continue? [Y/n] ").cloned();
        assert_eq!(prompt.map(|p| p.kind), Some(PromptKind::Confirmation));

        match watcher.answer("y") {
            PromptAnswer::NeedsApproval(classification) => {
                assert_eq!(classification.safety, Safety::Unsafe);
                assert!(classification.reason.contains("Do you want to continue?"));
            }
            other => panic!("unexpected answer {:?}", other),
        }
        assert_eq!(watcher.answer("y"), PromptAnswer::NoPrompt);
    }

    #[test]
    fn test_negative_answer_passes() {
        let mut watcher = PromptWatcher::new();
        watcher.observe("\x1b[1mAre you sure?\x1b[0m (yes/no) ");
        assert_eq!(watcher.answer("no"), PromptAnswer::PassThrough);
    }

    #[test]
    fn test_empty_answer_takes_default_and_needs_approval() {
        let mut watcher = PromptWatcher::new();
        watcher.observe("Proceed? ");
        assert!(matches!(watcher.answer(""), PromptAnswer::NeedsApproval(_)));
    }

    #[test]
    fn test_password_prompt() {
        let mut watcher = PromptWatcher::new();
        watcher.observe("[sudo] password for dev: ");
        assert_eq!(watcher.pending().map(|p| p.kind), Some(PromptKind::Password));
        assert_eq!(watcher.answer("hunter2"), PromptAnswer::Secret);
    }

    #[test]
    fn test_prompt_split_across_chunks() {
        let mut watcher = PromptWatcher::new();
        assert!(watcher.observe("Overwrite file? [y/").is_none());
        assert!(watcher.observe("N] ").is_some());
    }

    #[test]
    fn test_echo_keeps_prompt_until_newline() {
        let mut watcher = PromptWatcher::new();
        watcher.observe("Continue? [y/N] ");
        // The terminal echoes the typed answer before Enter
        watcher.observe("y");
        assert!(watcher.pending().is_some());
        watcher.observe("\r\n");
        assert!(watcher.pending().is_none());
    }

    #[test]
    fn test_ordinary_output_is_not_a_prompt() {
        let mut watcher = PromptWatcher::new();
        assert!(watcher.observe("compiling 12 crates\r\nuser@host:~$ ").is_none());
        assert_eq!(watcher.answer("ls"), PromptAnswer::NoPrompt);
    }
}
