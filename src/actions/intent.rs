//! Free-text command parsing
//!
//! Maps short operator phrases ("restart server nginx", "show logs") onto a
//! whitelisted action. Anything unrecognised yields `None`; there is no
//! fallback action.

use serde::{Deserialize, Serialize};

use super::registry::Action;

/// Service restarted when the phrase names none
const DEFAULT_SERVICE: &str = "app";

/// Action and arguments derived from a text command
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandIntent {
    pub action: Action,
    pub args: Vec<String>,
}

/// Parse a free-text command
pub fn parse_command_text(text: &str) -> Option<CommandIntent> {
    let lower = text.trim().to_lowercase();
    if lower.is_empty() {
        return None;
    }

    if let Some(idx) = lower.find("restart") {
        let service = service_after_restart(&lower[idx + "restart".len()..]);
        return Some(CommandIntent {
            action: Action::RestartService,
            args: vec![service],
        });
    }

    let words: Vec<&str> = lower.split_whitespace().collect();
    let asks_for_logs = words.windows(2).any(|pair| {
        ["fetch", "show", "get"]
            .iter()
            .any(|verb| pair[0].ends_with(verb))
            && pair[1].starts_with("log")
    });
    if asks_for_logs {
        return Some(CommandIntent {
            action: Action::FetchLogs,
            args: Vec::new(),
        });
    }

    None
}

fn service_after_restart(rest: &str) -> String {
    // "server" and "service" are skipped as bare prefixes, so "servers nginx"
    // leaves "s nginx" behind and names nothing
    let rest = ["server", "service"]
        .iter()
        .find_map(|filler| after_spaced_prefix(rest, filler))
        .unwrap_or(rest);

    // "restarting" and the like carry no service name
    if !rest.starts_with(char::is_whitespace) {
        return DEFAULT_SERVICE.to_string();
    }

    let name: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        .collect();
    if name.is_empty() {
        DEFAULT_SERVICE.to_string()
    } else {
        name
    }
}

/// Text after whitespace followed by `prefix`, if `text` starts that way
fn after_spaced_prefix<'a>(text: &'a str, prefix: &str) -> Option<&'a str> {
    if !text.starts_with(char::is_whitespace) {
        return None;
    }
    text.trim_start().strip_prefix(prefix)
}
