//! Command safety gate for worker-proposed shell commands.
//!
//! The gate is a pre-flight check, not a sandbox: it rejects commands whose
//! top-level executable is on the deny list, `git push` in any segment, and
//! commands that chain more pipes than the policy allows. Isolation is the
//! sandbox executor's job.

const FORBIDDEN_EXECUTABLES: &[&str] = &[
    "rm", "dd", "mkfs", "shutdown", "reboot", "halt", "poweroff", "kill", "pkill", "del", "erase",
];

const WRAPPER_EXECUTABLES: &[&str] = &["sudo", "command", "nohup", "time"];

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Word(String),
    Pipe,
    SegmentBreak,
}

/// Check one shell command string against the command policy.
///
/// Success guarantees: no forbidden top-level executable in any segment, no
/// `git push` sub-command, and at most `max_pipes` pipe operators.
pub fn check_command(cmd: &str, max_pipes: usize) -> Result<(), String> {
    let tokens = tokenize(cmd)?;
    let pipe_count = tokens.iter().filter(|t| matches!(t, Token::Pipe)).count();
    if pipe_count > max_pipes {
        return Err(format!(
            "command uses {pipe_count} pipes, policy allows at most {max_pipes}"
        ));
    }

    let mut segments: Vec<Vec<&str>> = vec![Vec::new()];
    for token in &tokens {
        match token {
            Token::Word(w) => segments
                .last_mut()
                .expect("segments is never empty")
                .push(w.as_str()),
            Token::Pipe | Token::SegmentBreak => segments.push(Vec::new()),
        }
    }

    let mut saw_executable = false;
    for segment in &segments {
        if let Some(exe) = segment_executable(segment) {
            saw_executable = true;
            check_segment(exe, segment)?;
        }
    }
    if !saw_executable {
        return Err("empty command".to_string());
    }
    Ok(())
}

fn check_segment(exe: &str, segment: &[&str]) -> Result<(), String> {
    let base = basename_lower(exe);
    if FORBIDDEN_EXECUTABLES.contains(&base.as_str()) {
        return Err(format!("forbidden executable: {base}"));
    }
    if base == "git" {
        let exe_idx = segment
            .iter()
            .position(|t| *t == exe)
            .unwrap_or(segment.len());
        let sub = segment[exe_idx + 1..]
            .iter()
            .find(|t| !t.starts_with('-'))
            .copied();
        if sub == Some("push") {
            return Err("git push is not allowed".to_string());
        }
    }
    Ok(())
}

/// First token of a segment after skipping `KEY=VALUE` assignments and
/// wrapper executables. `env` also swallows its own flags and assignments.
fn segment_executable<'a>(segment: &[&'a str]) -> Option<&'a str> {
    let mut rest = segment;
    loop {
        let first = *rest.first()?;
        if is_env_assignment(first) {
            rest = &rest[1..];
            continue;
        }
        let base = basename_lower(first);
        if WRAPPER_EXECUTABLES.contains(&base.as_str()) {
            rest = &rest[1..];
            continue;
        }
        if base == "env" {
            rest = &rest[1..];
            while let Some(next) = rest.first() {
                if next.starts_with('-') || is_env_assignment(next) {
                    rest = &rest[1..];
                } else {
                    break;
                }
            }
            continue;
        }
        return Some(first);
    }
}

fn is_env_assignment(token: &str) -> bool {
    let Some(eq) = token.find('=') else {
        return false;
    };
    if eq == 0 {
        return false;
    }
    token[..eq]
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
}

fn basename_lower(token: &str) -> String {
    token
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or(token)
        .to_ascii_lowercase()
}

/// Split a command string into word and operator tokens, honoring single
/// quotes, double quotes, and backslash escapes. `&&`, `||`, `;`, newline and
/// a single `&` break segments; a single `|` is counted as a pipe.
fn tokenize(cmd: &str) -> Result<Vec<Token>, String> {
    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut has_current = false;
    let mut chars = cmd.chars().peekable();
    let mut in_single = false;
    let mut in_double = false;

    while let Some(c) = chars.next() {
        if in_single {
            if c == '\'' {
                in_single = false;
            } else {
                current.push(c);
            }
            continue;
        }
        if in_double {
            match c {
                '"' => in_double = false,
                '\\' => {
                    if let Some(next) = chars.next() {
                        current.push(next);
                    }
                }
                _ => current.push(c),
            }
            continue;
        }
        match c {
            '\'' => {
                in_single = true;
                has_current = true;
            }
            '"' => {
                in_double = true;
                has_current = true;
            }
            '\\' => {
                if let Some(next) = chars.next() {
                    current.push(next);
                    has_current = true;
                }
            }
            '|' => {
                flush(&mut tokens, &mut current, &mut has_current);
                if chars.peek() == Some(&'|') {
                    chars.next();
                    tokens.push(Token::SegmentBreak);
                } else {
                    tokens.push(Token::Pipe);
                }
            }
            '&' => {
                flush(&mut tokens, &mut current, &mut has_current);
                if chars.peek() == Some(&'&') {
                    chars.next();
                }
                tokens.push(Token::SegmentBreak);
            }
            ';' | '\n' => {
                flush(&mut tokens, &mut current, &mut has_current);
                tokens.push(Token::SegmentBreak);
            }
            c if c.is_whitespace() => flush(&mut tokens, &mut current, &mut has_current),
            _ => {
                current.push(c);
                has_current = true;
            }
        }
    }
    if in_single || in_double {
        return Err("unterminated quote in command".to_string());
    }
    flush(&mut tokens, &mut current, &mut has_current);
    Ok(tokens)
}

fn flush(tokens: &mut Vec<Token>, current: &mut String, has_current: &mut bool) {
    if *has_current {
        tokens.push(Token::Word(std::mem::take(current)));
        *has_current = false;
    }
}
