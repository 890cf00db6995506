//! Command completion detection from interactive shell output.
//!
//! Shells started by the backends run a `PROMPT_COMMAND` that prints an
//! invisible OSC marker carrying `$?` right before each prompt:
//!
//! ```text
//! ESC ] 777 ; shellgate ; exit ; <status> BEL
//! ```
//!
//! [`CompletionScanner`] strips those markers from the byte stream and
//! reports them as completions. Shells without `PROMPT_COMMAND` (anything but bash) fall back to
//! matching a prompt at the end of the output, which yields no exit status.

use regex::Regex;
use shellgate_types::ansi::{current_line, strip_ansi};
use std::sync::OnceLock;

pub const MARKER_PREFIX: &str = "\x1b]777;shellgate;exit;";
const MARKER_END: char = '\x07';

/// Longest plausible marker: prefix, a status and the terminator
const MAX_MARKER_LEN: usize = MARKER_PREFIX.len() + 16;

/// Shell snippet that emits the completion marker
pub const PROMPT_COMMAND: &str = r#"printf '\033]777;shellgate;exit;%s\007' "$?""#;

/// Prompt for bash, which expands the escapes
pub const BASH_PS1: &str = r"\u@shellgate:\w\$ ";

/// Prompt for shells that print PS1 literally
pub const PLAIN_PS1: &str = "$ ";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanEvent {
    /// Output text with markers removed
    Text(String),
    /// The shell returned to its prompt
    Completed { exit_code: Option<i32> },
}

fn prompt_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(^|[\w~/\]\)])\s?[$#%>]\s?$").expect("static prompt pattern is valid")
    })
}

/// Whether the visible cursor line of `text` looks like a shell prompt
pub fn looks_like_prompt(text: &str) -> bool {
    let plain = strip_ansi(text);
    let line = current_line(&plain);
    !line.trim().is_empty() && prompt_regex().is_match(line)
}

/// Incremental marker scanner for one shell's output stream
#[derive(Debug, Default)]
pub struct CompletionScanner {
    /// Trailing bytes of an incomplete UTF-8 sequence
    partial_utf8: Vec<u8>,
    /// Text that may be the beginning of a marker
    carry: String,
    prompt_fallback: bool,
}

impl CompletionScanner {
    /// `prompt_fallback` enables prompt matching for shells that cannot
    /// emit markers
    pub fn new(prompt_fallback: bool) -> Self {
        Self {
            prompt_fallback,
            ..Default::default()
        }
    }

    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ScanEvent> {
        let decoded = self.decode(bytes);
        let mut text = std::mem::take(&mut self.carry);
        text.push_str(&decoded);

        let mut events = Vec::new();
        let mut rest = text.as_str();
        loop {
            match rest.find(MARKER_PREFIX) {
                Some(start) => {
                    push_text(&mut events, &rest[..start]);
                    let after = &rest[start + MARKER_PREFIX.len()..];
                    match after.find(MARKER_END) {
                        Some(end) => {
                            let exit_code = after[..end].trim().parse::<i32>().ok();
                            events.push(ScanEvent::Completed { exit_code });
                            rest = &after[end + MARKER_END.len_utf8()..];
                        }
                        None if rest.len() - start > MAX_MARKER_LEN => {
                            // Not a marker after all
                            push_text(&mut events, &rest[start..]);
                            rest = "";
                        }
                        None => {
                            self.carry = rest[start..].to_string();
                            rest = "";
                        }
                    }
                }
                None => {
                    let keep = partial_prefix_len(rest);
                    let (emit, held) = rest.split_at(rest.len() - keep);
                    push_text(&mut events, emit);
                    self.carry = held.to_string();
                    break;
                }
            }
            if rest.is_empty() {
                break;
            }
        }

        if self.prompt_fallback {
            let prompt_seen = matches!(events.last(), Some(ScanEvent::Text(t)) if looks_like_prompt(t));
            if prompt_seen {
                events.push(ScanEvent::Completed { exit_code: None });
            }
        }
        events
    }

    /// Decode UTF-8, holding back an incomplete trailing sequence for the
    /// next chunk and replacing invalid bytes
    fn decode(&mut self, bytes: &[u8]) -> String {
        let mut buffer = std::mem::take(&mut self.partial_utf8);
        buffer.extend_from_slice(bytes);

        let mut out = String::with_capacity(buffer.len());
        let mut input = buffer.as_slice();
        loop {
            match std::str::from_utf8(input) {
                Ok(valid) => {
                    out.push_str(valid);
                    break;
                }
                Err(e) => {
                    let (valid, after) = input.split_at(e.valid_up_to());
                    out.push_str(std::str::from_utf8(valid).unwrap_or_default());
                    match e.error_len() {
                        Some(len) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            input = &after[len..];
                        }
                        None => {
                            self.partial_utf8 = after.to_vec();
                            break;
                        }
                    }
                }
            }
        }
        out
    }
}

fn push_text(events: &mut Vec<ScanEvent>, text: &str) {
    if text.is_empty() {
        return;
    }
    match events.last_mut() {
        Some(ScanEvent::Text(existing)) => existing.push_str(text),
        _ => events.push(ScanEvent::Text(text.to_string())),
    }
}

/// Length of the longest suffix of `text` that is a proper prefix of the
/// marker
fn partial_prefix_len(text: &str) -> usize {
    (1..MARKER_PREFIX.len())
        .rev()
        .find(|&n| text.len() >= n && text.is_char_boundary(text.len() - n) && text.ends_with(&MARKER_PREFIX[..n]))
        .unwrap_or(0)
}
