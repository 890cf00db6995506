//! Small shell lexer for safety checking.
//!
//! Splits a command line such as
//! ```sh
//! cd /tmp && FOO=1 sudo rm -rf build | tee log > out.txt
//! ```
//! into independently checkable sub-commands, each carrying the chain of
//! executables it runs through (wrappers like `sudo` or `nohup` included),
//! its argument words and its redirections. Command substitutions and
//! `bash -c` scripts are lexed recursively.

use std::fmt;

/// Maximum nesting of `bash -c` scripts and command substitutions
const MAX_DEPTH: usize = 8;

const SHELLS: &[&str] = &["bash", "sh", "zsh", "dash", "ksh"];

const KEYWORDS: &[&str] = &[
    "if", "then", "else", "elif", "fi", "do", "done", "while", "until", "!", "{", "}", "esac",
];

/// Wrapper commands and the options that consume a following value
const WRAPPERS: &[(&str, &[&str])] = &[
    ("env", &["-u", "-C", "-S"]),
    ("nohup", &[]),
    ("time", &["-f", "-o"]),
    ("nice", &["-n"]),
    ("command", &[]),
    ("exec", &["-a"]),
    ("builtin", &[]),
    ("xargs", &["-n", "-I", "-P", "-L", "-d", "-s", "-a", "-E"]),
    ("stdbuf", &["-i", "-o", "-e"]),
    ("timeout", &["-s", "-k"]),
    ("sudo", &["-u", "-g", "-C", "-h", "-p"]),
    ("doas", &["-u", "-C"]),
];

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LexError {
    Unterminated(char),
    TooDeep,
}

impl fmt::Display for LexError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LexError::Unterminated('(') => write!(f, "unterminated command substitution"),
            LexError::Unterminated(c) => write!(f, "unterminated {} quote", c),
            LexError::TooDeep => write!(f, "nesting deeper than {} levels", MAX_DEPTH),
        }
    }
}

impl std::error::Error for LexError {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Redirect {
    /// Operator as written, with any file descriptor prefix (`2>`, `&>`, `>>`)
    pub op: String,
    pub target: Option<String>,
}

impl Redirect {
    /// Whether this redirection writes to a file other than `/dev/null`
    /// or another descriptor.
    pub fn writes_file(&self) -> bool {
        let writes = self.op.contains('>') && !self.op.ends_with(">&");
        match self.target.as_deref() {
            _ if !writes => false,
            Some("/dev/null") => false,
            Some(t) if t.starts_with('&') => false,
            _ => true,
        }
    }
}

impl fmt::Display for Redirect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.target {
            Some(ref target) => write!(f, "{} {}", self.op, target),
            None => write!(f, "{}", self.op),
        }
    }
}

/// One simple command extracted from a command line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubCommand {
    /// Executables in invocation order: wrappers first, the program that
    /// finally runs last. Path prefixes are stripped.
    pub executables: Vec<String>,
    /// Argument vector of the innermost program, its base name first
    pub words: Vec<String>,
    pub redirects: Vec<Redirect>,
    /// Sub-commands sharing a pipeline id are connected by `|`
    pub pipeline: usize,
}

impl SubCommand {
    pub fn program(&self) -> &str {
        self.words.first().map(String::as_str).unwrap_or("")
    }

    /// Display form used in classification reasons
    pub fn display(&self) -> String {
        let mut text = self.executables[..self.executables.len().saturating_sub(1)]
            .iter()
            .map(String::as_str)
            .chain(self.words.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ");
        for redirect in &self.redirects {
            text.push(' ');
            text.push_str(&redirect.to_string());
        }
        text
    }
}

/// Split a command line into sub-commands
pub fn split_commands(line: &str) -> Result<Vec<SubCommand>, LexError> {
    let mut lexer = Lexer::default();
    lexer.lex(line, &[], 0)?;
    Ok(lexer.commands)
}

/// Base name of an executable path (`/usr/bin/rm` → `rm`)
pub fn base_name(word: &str) -> &str {
    word.rsplit('/').find(|s| !s.is_empty()).unwrap_or(word)
}

fn is_assignment(word: &str) -> bool {
    match word.split_once('=') {
        Some((name, _)) => {
            let mut chars = name.chars();
            matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
                && chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
        }
        None => false,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Separator {
    Pipe,
    Other,
}

#[derive(Default)]
struct Segment {
    words: Vec<String>,
    redirects: Vec<Redirect>,
}

#[derive(Default)]
struct Lexer {
    commands: Vec<SubCommand>,
    next_pipeline: usize,
}

impl Lexer {
    fn lex(&mut self, line: &str, outer: &[String], depth: usize) -> Result<(), LexError> {
        if depth > MAX_DEPTH {
            return Err(LexError::TooDeep);
        }

        let (segments, substitutions) = scan(line)?;

        let mut pipeline = self.allocate_pipeline();
        for (segment, separator) in segments {
            self.resolve(segment, outer, pipeline, depth)?;
            if separator != Some(Separator::Pipe) {
                pipeline = self.allocate_pipeline();
            }
        }

        for script in substitutions {
            self.lex(&script, outer, depth + 1)?;
        }
        Ok(())
    }

    fn allocate_pipeline(&mut self) -> usize {
        self.next_pipeline += 1;
        self.next_pipeline
    }

    /// Turn one raw segment into a sub-command: drop keywords and
    /// assignments, unwrap wrappers, recurse into `sh -c` scripts.
    fn resolve(
        &mut self,
        segment: Segment,
        outer: &[String],
        pipeline: usize,
        depth: usize,
    ) -> Result<(), LexError> {
        let mut words = segment.words.as_slice();

        while let Some(first) = words.first() {
            if KEYWORDS.contains(&first.as_str()) {
                words = &words[1..];
            } else {
                break;
            }
        }
        // Loop headers run nothing themselves; their substitutions were
        // already collected by the scanner.
        if matches!(words.first().map(String::as_str), Some("for" | "select" | "case" | "in")) {
            return Ok(());
        }

        let mut executables = outer.to_vec();
        loop {
            while words.first().is_some_and(|w| is_assignment(w)) {
                words = &words[1..];
            }
            let Some(first) = words.first() else { break };
            let name = base_name(first).to_string();
            executables.push(name.clone());

            let Some((_, value_options)) = WRAPPERS.iter().find(|(w, _)| *w == name) else {
                break;
            };
            let mut rest = &words[1..];
            while let Some(option) = rest.first() {
                if option == "--" {
                    rest = &rest[1..];
                    break;
                }
                if !option.starts_with('-') || option.len() == 1 {
                    break;
                }
                let takes_value = value_options.contains(&option.as_str());
                rest = &rest[if takes_value { 2.min(rest.len()) } else { 1 }..];
            }
            if name == "timeout" && !rest.is_empty() {
                rest = &rest[1..];
            }
            if rest.is_empty() {
                // Bare wrapper such as `env` or `time`
                words = &words[..1];
                break;
            }
            words = rest;
        }

        if executables.len() == outer.len() {
            if !segment.redirects.is_empty() {
                // Bare redirection like `> file` still writes
                let mut executables = executables;
                executables.push(":".to_string());
                self.commands.push(SubCommand {
                    executables,
                    words: vec![":".to_string()],
                    redirects: segment.redirects,
                    pipeline,
                });
            }
            return Ok(());
        }

        let mut argv: Vec<String> = words.to_vec();
        if let Some(first) = argv.first_mut() {
            *first = base_name(first).to_string();
        }

        if let Some(script) = shell_script(&argv) {
            let script = script.to_string();
            if !segment.redirects.is_empty() {
                self.commands.push(SubCommand {
                    executables: executables.clone(),
                    words: argv,
                    redirects: segment.redirects,
                    pipeline,
                });
            }
            return self.lex(&script, &executables, depth + 1);
        }

        self.commands.push(SubCommand {
            executables,
            words: argv,
            redirects: segment.redirects,
            pipeline,
        });
        Ok(())
    }
}

/// The script argument of `bash -c '<script>'` style invocations
fn shell_script(argv: &[String]) -> Option<&str> {
    let program = argv.first()?;
    if !SHELLS.contains(&program.as_str()) {
        return None;
    }
    let flag_index = argv.iter().skip(1).position(|arg| {
        arg.starts_with('-') && !arg.starts_with("--") && arg.contains('c')
    })?;
    argv.get(flag_index + 2).map(String::as_str)
}

/// Character-level scan into raw segments plus substitution scripts
fn scan(line: &str) -> Result<(Vec<(Segment, Option<Separator>)>, Vec<String>), LexError> {
    let chars: Vec<char> = line.chars().collect();
    let mut scanner = Scanner::default();
    let mut i = 0;

    while i < chars.len() {
        let c = chars[i];
        let next = chars.get(i + 1).copied();
        match c {
            '\\' => {
                match next {
                    Some('\n') => {}
                    Some(escaped) => scanner.push_char(escaped),
                    None => {}
                }
                i += 2;
            }
            '\'' => {
                let close = (i + 1..chars.len())
                    .find(|&j| chars[j] == '\'')
                    .ok_or(LexError::Unterminated('\''))?;
                scanner.push_str(&chars[i + 1..close].iter().collect::<String>());
                i = close + 1;
            }
            '"' => {
                i = scanner.double_quoted(&chars, i + 1)?;
            }
            '$' if next == Some('(') => {
                let (inner, end) = read_parenthesized(&chars, i + 2)?;
                scanner.substitutions.push(inner);
                scanner.push_str("$(...)");
                i = end;
            }
            '`' => {
                let (inner, end) = read_backticks(&chars, i + 1)?;
                scanner.substitutions.push(inner);
                scanner.push_str("`...`");
                i = end;
            }
            '<' if next == Some('(') => {
                // Process substitution
                let (inner, end) = read_parenthesized(&chars, i + 2)?;
                scanner.substitutions.push(inner);
                scanner.push_str("<(...)");
                i = end;
            }
            '#' if !scanner.in_word => {
                while i < chars.len() && chars[i] != '\n' {
                    i += 1;
                }
            }
            ' ' | '\t' | '\r' => {
                scanner.flush_word();
                i += 1;
            }
            '\n' | ';' | '(' | ')' => {
                scanner.end_segment(Separator::Other);
                i += if c == ';' && next == Some(';') { 2 } else { 1 };
            }
            '&' => match next {
                Some('&') => {
                    scanner.end_segment(Separator::Other);
                    i += 2;
                }
                Some('>') => {
                    scanner.flush_word();
                    let append = chars.get(i + 2) == Some(&'>');
                    scanner.begin_redirect(if append { "&>>" } else { "&>" });
                    i += if append { 3 } else { 2 };
                }
                _ => {
                    scanner.end_segment(Separator::Other);
                    i += 1;
                }
            },
            '|' => match next {
                Some('|') => {
                    scanner.end_segment(Separator::Other);
                    i += 2;
                }
                Some('&') => {
                    scanner.end_segment(Separator::Pipe);
                    i += 2;
                }
                _ => {
                    scanner.end_segment(Separator::Pipe);
                    i += 1;
                }
            },
            '>' | '<' => {
                let mut op = String::new();
                if scanner.in_word && scanner.word.chars().all(|ch| ch.is_ascii_digit()) {
                    op.push_str(&scanner.word);
                    scanner.word.clear();
                    scanner.in_word = false;
                } else {
                    scanner.flush_word();
                }
                op.push(c);
                i += 1;
                while let Some(&ch) = chars.get(i) {
                    if ch == c || (c == '>' && (ch == '&' || ch == '|')) {
                        op.push(ch);
                        i += 1;
                        if ch != c {
                            break;
                        }
                    } else {
                        break;
                    }
                }
                scanner.begin_redirect(&op);
            }
            _ => {
                scanner.push_char(c);
                i += 1;
            }
        }
    }

    scanner.end_segment(Separator::Other);
    Ok((scanner.segments, scanner.substitutions))
}

#[derive(Default)]
struct Scanner {
    segments: Vec<(Segment, Option<Separator>)>,
    substitutions: Vec<String>,
    current: Segment,
    word: String,
    in_word: bool,
    pending_redirect: Option<String>,
}

impl Scanner {
    fn push_char(&mut self, c: char) {
        self.word.push(c);
        self.in_word = true;
    }

    fn push_str(&mut self, s: &str) {
        self.word.push_str(s);
        self.in_word = true;
    }

    fn flush_word(&mut self) {
        if !self.in_word {
            return;
        }
        let word = std::mem::take(&mut self.word);
        self.in_word = false;
        match self.pending_redirect.take() {
            Some(op) => self.current.redirects.push(Redirect {
                op,
                target: Some(word),
            }),
            None => self.current.words.push(word),
        }
    }

    fn begin_redirect(&mut self, op: &str) {
        self.close_redirect();
        self.pending_redirect = Some(op.to_string());
    }

    fn close_redirect(&mut self) {
        if let Some(op) = self.pending_redirect.take() {
            self.current.redirects.push(Redirect { op, target: None });
        }
    }

    fn end_segment(&mut self, separator: Separator) {
        self.flush_word();
        self.close_redirect();
        let segment = std::mem::take(&mut self.current);
        if segment.words.is_empty() && segment.redirects.is_empty() {
            // `a | | b` or leading separators; keep the pipe link if any
            if let (Separator::Pipe, Some(last)) = (separator, self.segments.last_mut()) {
                last.1 = Some(Separator::Pipe);
            }
            return;
        }
        self.segments.push((segment, Some(separator)));
    }

    /// Consume a double-quoted string starting after the opening quote
    fn double_quoted(&mut self, chars: &[char], mut i: usize) -> Result<usize, LexError> {
        self.in_word = true;
        loop {
            let c = *chars.get(i).ok_or(LexError::Unterminated('"'))?;
            let next = chars.get(i + 1).copied();
            match c {
                '"' => return Ok(i + 1),
                '\\' if matches!(next, Some('"' | '\\' | '$' | '`' | '\n')) => {
                    if next != Some('\n') {
                        self.word.push(next.unwrap_or_default());
                    }
                    i += 2;
                }
                '$' if next == Some('(') => {
                    let (inner, end) = read_parenthesized(chars, i + 2)?;
                    self.substitutions.push(inner);
                    self.word.push_str("$(...)");
                    i = end;
                }
                '`' => {
                    let (inner, end) = read_backticks(chars, i + 1)?;
                    self.substitutions.push(inner);
                    self.word.push_str("`...`");
                    i = end;
                }
                _ => {
                    self.word.push(c);
                    i += 1;
                }
            }
        }
    }
}

/// Read up to the matching `)`, honoring quotes. Returns the inner text and
/// the index after the closing parenthesis.
fn read_parenthesized(chars: &[char], start: usize) -> Result<(String, usize), LexError> {
    let mut depth = 1usize;
    let mut i = start;
    let mut quote: Option<char> = None;
    while let Some(&c) = chars.get(i) {
        match (quote, c) {
            (Some(q), _) if c == q => quote = None,
            (Some('"'), '\\') => i += 1,
            (Some(_), _) => {}
            (None, '\\') => i += 1,
            (None, '\'' | '"') => quote = Some(c),
            (None, '(') => depth += 1,
            (None, ')') => {
                depth -= 1;
                if depth == 0 {
                    return Ok((chars[start..i].iter().collect(), i + 1));
                }
            }
            _ => {}
        }
        i += 1;
    }
    Err(LexError::Unterminated(quote.unwrap_or('(')))
}

fn read_backticks(chars: &[char], start: usize) -> Result<(String, usize), LexError> {
    let mut inner = String::new();
    let mut i = start;
    while let Some(&c) = chars.get(i) {
        match c {
            '`' => return Ok((inner, i + 1)),
            '\\' => {
                if let Some(&escaped) = chars.get(i + 1) {
                    inner.push(escaped);
                }
                i += 2;
            }
            _ => {
                inner.push(c);
                i += 1;
            }
        }
    }
    Err(LexError::Unterminated('`'))
}
