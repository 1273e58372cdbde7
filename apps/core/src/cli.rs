use std::path::{Path, PathBuf};

use crate::bang::split_bang_line;
use crate::config::DEFAULT_CONFIG_FILE;
use crate::startup::StartupMode;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CliAction {
    Start {
        config_path: PathBuf,
        startup_mode: StartupMode,
    },
    Forward { command: String, args: String },
}

// Double or single quotes group whitespace and are removed. A quote that is
// never closed is literal, and the token runs to the end of the line.
fn next_token(line: &str) -> Option<(String, &str)> {
    let trimmed = line.trim_start();
    if trimmed.is_empty() {
        return None;
    }

    let mut token = String::new();
    let mut quote: Option<char> = None;
    for (offset, ch) in trimmed.char_indices() {
        match quote {
            Some(open) if ch == open => quote = None,
            Some(_) => token.push(ch),
            None if ch == '"' || ch == '\'' => quote = Some(ch),
            None if ch.is_whitespace() => return Some((token, &trimmed[offset..])),
            None => token.push(ch),
        }
    }
    if quote.is_some() {
        return Some((trimmed.trim_end().to_string(), ""));
    }
    Some((token, ""))
}

/// Parses the process command line. Unknown `-` switches and tokens that do
/// not name an existing file are ignored.
pub fn parse_command_line(line: &str, app_dir: &Path) -> CliAction {
    let mut config_path = app_dir.join(DEFAULT_CONFIG_FILE);
    let mut startup_mode = StartupMode::Default;

    let mut rest = line;
    loop {
        if let Some((command, args)) = split_bang_line(rest) {
            return CliAction::Forward {
                command: command.to_string(),
                args: args.to_string(),
            };
        }
        let Some((token, remaining)) = next_token(rest) else {
            break;
        };
        rest = remaining;
        if token.starts_with('-') {
            if token.eq_ignore_ascii_case("-nostartup") {
                startup_mode = StartupMode::DontRun;
            } else if token.eq_ignore_ascii_case("-startup") {
                startup_mode = StartupMode::ForceRun;
            } else {
                tracing::debug!(%token, "ignored command line switch");
            }
            continue;
        }
        if token.is_empty() {
            continue;
        }

        let candidate = if token.contains(['\\', '/']) {
            PathBuf::from(&token)
        } else {
            app_dir.join(&token)
        };
        if candidate.is_file() {
            config_path = candidate;
        } else {
            tracing::debug!(%token, "ignored command line token");
        }
    }

    CliAction::Start {
        config_path,
        startup_mode,
    }
}

pub fn join_args<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|arg| {
            let arg = arg.as_ref();
            if arg.is_empty() || arg.contains(char::is_whitespace) {
                format!("\"{arg}\"")
            } else {
                arg.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join(" ")
}
