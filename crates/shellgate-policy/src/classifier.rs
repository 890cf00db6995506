//! Safety classification of command lines against a [`Policy`].
//!
//! Every sub-command produced by the lexer is judged on its own and the
//! command line takes the most severe verdict. Rules per sub-command, in
//! order:
//!
//! 1. any executable in its wrapper chain, a multi-word blacklist entry at
//!    the program, or a blacklisted redirection operator → `dangerous`
//! 2. program matches the whitelist, no blacklisted word among its
//!    arguments, no file-writing redirection → `safe`
//! 3. anything else → `unsafe`
//!
//! A network download piped into a shell interpreter is `dangerous` as well.

use shellgate_types::{Classification, Safety};
use std::collections::{BTreeMap, BTreeSet};

use crate::lexer::{base_name, split_commands, SubCommand};
use crate::Policy;

const NETWORK_TOOLS: &[&str] = &["curl", "wget", "fetch", "nc", "ncat"];
const INTERPRETERS: &[&str] = &[
    "sh", "bash", "zsh", "dash", "ksh", "fish", "python", "python3", "perl", "ruby", "node",
];

/// Classify a command line. Never fails: anything unrecognized or
/// unparseable is `unsafe`.
pub fn classify(command: &str, policy: &Policy) -> Classification {
    let (safety, reason) = verdict(command, policy);
    let requires_approval = match safety {
        Safety::Safe => !policy.auto_approve_mode,
        Safety::Unsafe | Safety::Dangerous => true,
    };
    Classification {
        safety,
        requires_approval,
        reason,
    }
}

fn verdict(command: &str, policy: &Policy) -> (Safety, String) {
    if command.trim().is_empty() {
        return (Safety::Unsafe, "empty command".to_string());
    }

    let commands = match split_commands(command) {
        Ok(commands) => commands,
        Err(e) => return (Safety::Unsafe, format!("could not parse command: {}", e)),
    };
    if commands.is_empty() {
        return (Safety::Unsafe, "empty command".to_string());
    }

    let mut worst: Option<(Safety, String)> = None;
    let mut consider = |safety: Safety, reason: String| {
        if worst.as_ref().map_or(true, |(current, _)| safety > *current) {
            worst = Some((safety, reason));
        }
    };

    if let Some(reason) = pipe_to_interpreter(&commands) {
        consider(Safety::Dangerous, reason);
    }
    for sub in &commands {
        let (safety, reason) = classify_sub(sub, policy);
        consider(safety, reason);
    }

    worst.unwrap_or((Safety::Unsafe, "empty command".to_string()))
}

fn classify_sub(sub: &SubCommand, policy: &Policy) -> (Safety, String) {
    let blacklist = &policy.dangerous_command_blacklist;

    if let Some(exe) = sub.executables.iter().find(|exe| blacklist.contains(exe.as_str())) {
        return (Safety::Dangerous, format!("command matches blacklist: {}", exe));
    }
    if let Some(entry) = longest_prefix_match(blacklist, &sub.words) {
        return (Safety::Dangerous, format!("command matches blacklist: {}", entry));
    }
    if let Some(redirect) = sub.redirects.iter().find(|r| blacklist.contains(&r.op)) {
        return (
            Safety::Dangerous,
            format!("command matches blacklist: {}", redirect.op),
        );
    }

    let Some(entry) = longest_prefix_match(&policy.safe_command_whitelist, &sub.words) else {
        return (
            Safety::Unsafe,
            format!("command not in whitelist: {}", subject(sub)),
        );
    };

    let blacklisted_argument = sub.words[1..]
        .iter()
        .find(|word| blacklist.contains(word.as_str()) || blacklist.contains(base_name(word)));
    if let Some(word) = blacklisted_argument {
        return (
            Safety::Unsafe,
            format!("argument matches blacklist: {} in {}", word, sub.display()),
        );
    }
    if let Some(redirect) = sub.redirects.iter().find(|r| r.writes_file()) {
        return (
            Safety::Unsafe,
            format!("output redirection requires approval: {}", redirect),
        );
    }

    (Safety::Safe, format!("command matches whitelist: {}", entry))
}

/// Name of a sub-command in reasons. Bare wrappers (`env X=1`) have no
/// program and bare redirections run `:`, so those fall back to their text.
fn subject(sub: &SubCommand) -> String {
    let is_word = |s: &str| s.chars().any(char::is_alphanumeric);
    if is_word(sub.program()) {
        return sub.program().to_string();
    }
    let text = sub
        .executables
        .iter()
        .filter(|exe| is_word(exe))
        .cloned()
        .chain(sub.redirects.iter().map(ToString::to_string))
        .collect::<Vec<_>>()
        .join(" ");
    if text.is_empty() {
        sub.display()
    } else {
        text
    }
}

/// Longest entry whose words are a prefix of `words`
fn longest_prefix_match<'a>(entries: &'a BTreeSet<String>, words: &[String]) -> Option<&'a str> {
    entries
        .iter()
        .filter(|entry| {
            let mut parts = entry.split_whitespace();
            let mut count = 0;
            let all_match = parts.by_ref().zip(words.iter()).all(|(part, word)| {
                count += 1;
                part == word
            });
            all_match && count > 0 && parts.next().is_none()
        })
        .max_by_key(|entry| entry.split_whitespace().count())
        .map(String::as_str)
}

fn pipe_to_interpreter(commands: &[SubCommand]) -> Option<String> {
    let mut pipelines: BTreeMap<usize, Vec<&SubCommand>> = BTreeMap::new();
    for sub in commands {
        pipelines.entry(sub.pipeline).or_default().push(sub);
    }

    pipelines.values().find_map(|stages| {
        let download = stages
            .iter()
            .position(|s| s.executables.iter().any(|e| NETWORK_TOOLS.contains(&e.as_str())))?;
        let interpreter = stages[download + 1..]
            .iter()
            .find(|s| INTERPRETERS.contains(&s.program()))?;
        Some(format!(
            "pipes network download into a shell: {} | {}",
            stages[download].program(),
            interpreter.program()
        ))
    })
}
