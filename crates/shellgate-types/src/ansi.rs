//! Terminal escape handling shared by output inspectors

use regex::Regex;
use std::sync::OnceLock;

fn ansi_regex() -> &'static Regex {
    static ANSI: OnceLock<Regex> = OnceLock::new();
    ANSI.get_or_init(|| {
        // CSI sequences, OSC sequences (BEL or ST terminated), two-byte escapes
        Regex::new(r"\x1b\[[0-?]*[ -/]*[@-~]|\x1b\][^\x07\x1b]*(?:\x07|\x1b\\)|\x1b[@-Z\\-_]")
            .expect("static ANSI pattern is valid")
    })
}

/// Remove ANSI escape sequences from terminal output
pub fn strip_ansi(text: &str) -> String {
    ansi_regex().replace_all(text, "").into_owned()
}

/// The text a user currently sees on the cursor line: everything after the
/// last newline, with carriage-return overwrites applied.
pub fn current_line(text: &str) -> &str {
    let line = text.rsplit('\n').next().unwrap_or(text);
    line.rsplit('\r').find(|segment| !segment.is_empty()).unwrap_or("")
}
