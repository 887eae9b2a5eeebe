//! Action Registry
//!
//! Static mapping from whitelisted action names to the scripts that implement
//! them. The table is built once at startup and never mutated.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Name of the certificate-rotation pseudo-action
pub const ROTATE_CERTS: &str = "rotate_certs";

/// A script-backed action
///
/// Adding a variant forces every `match` over actions (including the registry
/// constructor) to be updated, so nothing becomes executable by accident.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Restart a managed service
    RestartService,
    /// Run the deployment script
    Deploy,
    /// Collect recent service logs
    FetchLogs,
}

impl Action {
    /// Every whitelisted action
    pub const ALL: [Action; 3] = [Action::RestartService, Action::Deploy, Action::FetchLogs];

    /// Wire name of the action
    pub fn name(self) -> &'static str {
        match self {
            Action::RestartService => "restart_service",
            Action::Deploy => "deploy",
            Action::FetchLogs => "fetch_logs",
        }
    }

    /// Look up an action by wire name
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|a| a.name() == name)
    }

    /// File stem of the backing script
    fn script_stem(self) -> &'static str {
        match self {
            Action::RestartService => "restart-service",
            Action::Deploy => "deploy",
            Action::FetchLogs => "fetch-logs",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| format!("unknown action '{}'", s))
    }
}

/// Anything a handshake request may name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestedAction {
    /// Run a whitelisted script
    Script(Action),
    /// Pull TLS material from the vault
    RotateCerts,
}

impl RequestedAction {
    /// Parse a requested action name; `None` means "not allowed"
    pub fn parse(name: &str) -> Option<Self> {
        if name == ROTATE_CERTS {
            return Some(RequestedAction::RotateCerts);
        }
        Action::from_name(name).map(RequestedAction::Script)
    }

    pub fn name(&self) -> &'static str {
        match self {
            RequestedAction::Script(action) => action.name(),
            RequestedAction::RotateCerts => ROTATE_CERTS,
        }
    }
}

/// Host platform family, which selects the script variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Platform {
    /// Shell scripts executed directly
    Unix,
    /// PowerShell scripts executed through `powershell.exe`
    Windows,
}

impl Platform {
    /// Platform of the running host
    pub fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    /// Operating system name reported in suggestions
    pub fn os_name(self) -> &'static str {
        match self {
            Platform::Unix => std::env::consts::OS,
            Platform::Windows => "windows",
        }
    }
}

/// Immutable whitelist entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionDefinition {
    pub action: Action,
    pub script_unix: PathBuf,
    pub script_windows: PathBuf,
}

impl ActionDefinition {
    pub fn name(&self) -> &'static str {
        self.action.name()
    }

    /// Script to run on the given platform
    pub fn script_for(&self, platform: Platform) -> &Path {
        match platform {
            Platform::Unix => &self.script_unix,
            Platform::Windows => &self.script_windows,
        }
    }
}

/// The whitelist table
#[derive(Debug, Clone)]
pub struct ActionRegistry {
    scripts_dir: PathBuf,
    definitions: Vec<ActionDefinition>,
}

impl ActionRegistry {
    /// Build the table with scripts resolved under `scripts_dir`
    pub fn new(scripts_dir: impl Into<PathBuf>) -> Self {
        let scripts_dir = scripts_dir.into();
        let definitions = Action::ALL
            .into_iter()
            .map(|action| ActionDefinition {
                action,
                script_unix: scripts_dir.join(format!("{}.sh", action.script_stem())),
                script_windows: scripts_dir.join(format!("{}.ps1", action.script_stem())),
            })
            .collect();

        Self {
            scripts_dir,
            definitions,
        }
    }

    /// Directory holding the scripts
    pub fn scripts_dir(&self) -> &Path {
        &self.scripts_dir
    }

    /// Definition for an action (every variant has one)
    pub fn get(&self, action: Action) -> &ActionDefinition {
        // Built from Action::ALL in declaration order
        &self.definitions[action as usize]
    }

    /// Whitelist lookup by wire name
    pub fn lookup(&self, name: &str) -> Option<&ActionDefinition> {
        Action::from_name(name).map(|a| self.get(a))
    }

    /// Script path for an action on a platform
    pub fn script_path(&self, action: Action, platform: Platform) -> &Path {
        self.get(action).script_for(platform)
    }

    pub fn definitions(&self) -> &[ActionDefinition] {
        &self.definitions
    }
}
