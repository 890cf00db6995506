//! Line tracking for raw terminal input.
//!
//! Keystrokes are forwarded to the shell as they arrive so echo and line
//! editing behave normally. Only the line terminator is intercepted: when
//! the shell (or a program's question) is waiting for a line, the line is
//! handed back for classification and its terminator is held until a
//! decision is made. Anything typed in the meantime is buffered.

/// Bound on input buffered while a line awaits a decision
pub const MAX_BACKLOG: usize = 64 * 1024;

/// Clears the shell's line editor: end of line, then kill to start
pub const CLEAR_LINE: &[u8] = b"\x05\x15";

const EDITED: &str = "line was edited with cursor or history keys and cannot be verified";
const COMPLETED: &str = "line uses tab completion and cannot be verified";

/// What a typed line means right now
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LineMode {
    /// The shell prompt is idle: a line is a command
    Command,
    /// A foreground program asked a question: a line is its answer
    Answer,
    /// A program owns the terminal: bytes pass straight through
    Passthrough,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputAction {
    /// Write these bytes to the backend as-is
    Forward(Vec<u8>),
    /// A complete line; its terminator is held until [`InputGate::resolve`]
    Submit {
        line: String,
        mode: LineMode,
        unverifiable: Option<&'static str>,
    },
    /// Input that did not fit in the backlog and was dropped
    Overflow { dropped: usize },
}

#[derive(Debug, Default)]
enum Escape {
    #[default]
    None,
    Start,
    Csi(Vec<u8>),
    Ss3,
}

#[derive(Debug, Default)]
pub struct InputGate {
    line: Vec<u8>,
    unverifiable: Option<&'static str>,
    escape: Escape,
    held: Option<Vec<u8>>,
    backlog: Vec<u8>,
}

impl InputGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// A line is waiting for a decision
    pub fn is_held(&self) -> bool {
        self.held.is_some()
    }

    /// Something has been typed at the prompt but not submitted
    pub fn has_partial_line(&self) -> bool {
        !self.line.is_empty() || self.unverifiable.is_some()
    }

    /// Forget the line being typed, e.g. after the shell's editor was
    /// cleared
    pub fn discard_line(&mut self) {
        self.line.clear();
        self.unverifiable = None;
        self.escape = Escape::None;
    }

    pub fn feed(&mut self, data: &[u8], mode: LineMode) -> Vec<InputAction> {
        let mut actions = Vec::new();
        let mut forward = Vec::new();
        let mut dropped = 0;

        for (i, &byte) in data.iter().enumerate() {
            if self.held.is_some() {
                let rest = &data[i..];
                let room = MAX_BACKLOG.saturating_sub(self.backlog.len());
                let take = rest.len().min(room);
                self.backlog.extend_from_slice(&rest[..take]);
                dropped = rest.len() - take;
                break;
            }

            if mode == LineMode::Passthrough {
                forward.push(byte);
                continue;
            }
            forward.push(byte);

            match std::mem::take(&mut self.escape) {
                Escape::Start => match byte {
                    b'[' => self.escape = Escape::Csi(Vec::new()),
                    b'O' => self.escape = Escape::Ss3,
                    _ => self.unverifiable = Some(EDITED),
                },
                Escape::Csi(mut params) => {
                    if (0x40..=0x7e).contains(&byte) {
                        // Bracketed paste markers do not edit the line
                        let paste = byte == b'~' && (params == b"200" || params == b"201");
                        if !paste {
                            self.unverifiable = Some(EDITED);
                        }
                    } else {
                        params.push(byte);
                        self.escape = Escape::Csi(params);
                    }
                }
                Escape::Ss3 => self.unverifiable = Some(EDITED),
                Escape::None => match byte {
                    0x1b => self.escape = Escape::Start,
                    b'\r' | b'\n' => {
                        forward.pop();
                        let plain_enter = mode == LineMode::Command
                            && self.unverifiable.is_none()
                            && String::from_utf8_lossy(&self.line).trim().is_empty();
                        if plain_enter {
                            forward.push(byte);
                            self.discard_line();
                            continue;
                        }
                        if !forward.is_empty() {
                            actions.push(InputAction::Forward(std::mem::take(&mut forward)));
                        }
                        actions.push(InputAction::Submit {
                            line: String::from_utf8_lossy(&self.line).to_string(),
                            mode,
                            unverifiable: self.unverifiable,
                        });
                        self.held = Some(vec![byte]);
                    }
                    0x7f | 0x08 => pop_char(&mut self.line),
                    0x15 => self.line.clear(),
                    0x17 => pop_word(&mut self.line),
                    0x03 => self.discard_line(),
                    b'\t' => self.unverifiable = Some(COMPLETED),
                    0x04 => {}
                    b if b < 0x20 => self.unverifiable = Some(EDITED),
                    b => self.line.push(b),
                },
            }
        }

        if mode == LineMode::Passthrough && self.held.is_none() {
            self.discard_line();
        }
        if !forward.is_empty() {
            actions.push(InputAction::Forward(forward));
        }
        if dropped > 0 {
            actions.push(InputAction::Overflow { dropped });
        }
        actions
    }

    /// Decide the held line. Returns the bytes to write to the backend:
    /// the terminator when approved, a line clear when refused.
    pub fn resolve(&mut self, approved: bool) -> Vec<u8> {
        let terminator = self.held.take().unwrap_or_else(|| b"\r".to_vec());
        self.discard_line();
        if approved {
            terminator
        } else {
            CLEAR_LINE.to_vec()
        }
    }

    /// Input that arrived while a line was held
    pub fn take_backlog(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.backlog)
    }
}

fn pop_char(line: &mut Vec<u8>) {
    while let Some(byte) = line.pop() {
        if byte & 0xc0 != 0x80 {
            break;
        }
    }
}

fn pop_word(line: &mut Vec<u8>) {
    while line.last() == Some(&b' ') {
        line.pop();
    }
    while matches!(line.last(), Some(b) if *b != b' ') {
        line.pop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn submitted(actions: &[InputAction]) -> Option<(String, Option<&'static str>)> {
        actions.iter().find_map(|a| match a {
            InputAction::Submit { line, unverifiable, .. } => Some((line.clone(), *unverifiable)),
            _ => None,
        })
    }

    #[test]
    fn test_keystrokes_forwarded_and_terminator_held() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"ls -la\r", LineMode::Command);
        assert_eq!(
            actions,
            vec![
                InputAction::Forward(b"ls -la".to_vec()),
                InputAction::Submit {
                    line: "ls -la".to_string(),
                    mode: LineMode::Command,
                    unverifiable: None
                },
            ]
        );
        assert!(gate.is_held());
        assert_eq!(gate.resolve(true), b"\r".to_vec());
        assert!(!gate.is_held());
    }

    #[test]
    fn test_line_built_across_chunks_with_editing() {
        let mut gate = InputGate::new();
        gate.feed(b"rm -rf /tmp/x", LineMode::Command);
        gate.feed(b"\x7f\x7f\x7fy", LineMode::Command);
        gate.feed("é\x7f".as_bytes(), LineMode::Command);
        let actions = gate.feed(b"\r", LineMode::Command);
        assert_eq!(submitted(&actions), Some(("rm -rf /tmy".to_string(), None)));
    }

    #[test]
    fn test_ctrl_u_and_ctrl_w() {
        let mut gate = InputGate::new();
        gate.feed(b"sudo reboot\x15echo one two\x17", LineMode::Command);
        let actions = gate.feed(b"\r", LineMode::Command);
        assert_eq!(submitted(&actions), Some(("echo one ".to_string(), None)));
    }

    #[test]
    fn test_empty_enter_passes() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"  \r", LineMode::Command);
        assert_eq!(actions, vec![InputAction::Forward(b"  \r".to_vec())]);
        assert!(!gate.is_held());
    }

    #[test]
    fn test_history_and_tab_are_unverifiable() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"\x1b[A\r", LineMode::Command);
        assert_eq!(submitted(&actions), Some((String::new(), Some(EDITED))));
        gate.resolve(false);

        let actions = gate.feed(b"cat fi\t\r", LineMode::Command);
        assert_eq!(submitted(&actions), Some(("cat fi".to_string(), Some(COMPLETED))));
    }

    #[test]
    fn test_bracketed_paste_is_verifiable() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"\x1b[200~pwd\x1b[201~\r", LineMode::Command);
        assert_eq!(submitted(&actions), Some(("pwd".to_string(), None)));
    }

    #[test]
    fn test_backlog_while_held() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"rm x\rls\r", LineMode::Command);
        assert_eq!(submitted(&actions), Some(("rm x".to_string(), None)));
        assert_eq!(gate.resolve(false), CLEAR_LINE.to_vec());
        assert_eq!(gate.take_backlog(), b"ls\r".to_vec());
    }

    #[test]
    fn test_backlog_overflow_reported() {
        let mut gate = InputGate::new();
        gate.feed(b"x\r", LineMode::Command);
        let big = vec![b'a'; MAX_BACKLOG + 10];
        let actions = gate.feed(&big, LineMode::Command);
        assert_eq!(actions, vec![InputAction::Overflow { dropped: 10 }]);
    }

    #[test]
    fn test_passthrough_forwards_everything() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"q\r\x1b[A", LineMode::Passthrough);
        assert_eq!(actions, vec![InputAction::Forward(b"q\r\x1b[A".to_vec())]);
        assert!(!gate.is_held());
    }

    #[test]
    fn test_answer_mode_submits_empty_line() {
        let mut gate = InputGate::new();
        let actions = gate.feed(b"\r", LineMode::Answer);
        assert_eq!(
            actions,
            vec![InputAction::Submit {
                line: String::new(),
                mode: LineMode::Answer,
                unverifiable: None
            }]
        );
    }
}
