//! Command Audit Trail
//!
//! Every stage a command passes through (received, suggested, executing,
//! finished) is appended as one JSON object per line to the audit log.
//! Entries are never rewritten or removed by this process.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::error;

use crate::auth::PeerIdentity;

/// Lifecycle stage of a command request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditStage {
    /// Request passed the gates and entered the state machine
    Received,
    /// Request was answered with a suggestion only
    Suggested,
    /// Script or rotation is about to run
    Executing,
    /// Terminal outcome, with error or result
    Finished,
}

impl std::fmt::Display for AuditStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuditStage::Received => write!(f, "received"),
            AuditStage::Suggested => write!(f, "suggested"),
            AuditStage::Executing => write!(f, "executing"),
            AuditStage::Finished => write!(f, "finished"),
        }
    }
}

/// Identity of a TLS client as recorded in the audit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientSummary {
    /// Certificate subject Common Name
    pub subject: Option<String>,
    /// SHA-256 fingerprint of the leaf certificate
    pub fingerprint: Option<String>,
}

impl From<&PeerIdentity> for ClientSummary {
    fn from(peer: &PeerIdentity) -> Self {
        Self {
            subject: peer.common_name.clone(),
            fingerprint: peer.fingerprint.clone(),
        }
    }
}

/// A single audit record
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Caller-chosen correlation id
    pub id: Option<String>,

    /// Action name (handshake requests and parsed text commands)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<String>,

    /// Original free text (text commands only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,

    /// Request parameters as received
    #[serde(default)]
    pub params: Value,

    /// When this entry was written (UTC)
    pub ts: DateTime<Utc>,

    /// Remote address of the caller
    pub origin: Option<String>,

    /// TLS client identity, when the connection carried one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client: Option<ClientSummary>,

    /// Lifecycle stage
    pub stage: AuditStage,

    /// Failure message (finished entries only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Suggestion returned to the caller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion: Option<Value>,

    /// Rotation outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,

    /// Captured script output
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
}

/// Fields shared by every entry written for one request
#[derive(Debug, Clone)]
pub struct AuditTrail {
    id: Option<String>,
    action: Option<String>,
    text: Option<String>,
    params: Value,
    origin: Option<String>,
    client: Option<ClientSummary>,
}

impl AuditTrail {
    /// Start a trail for one request
    pub fn new(
        id: Option<String>,
        origin: Option<String>,
        client: Option<ClientSummary>,
    ) -> Self {
        Self {
            id,
            action: None,
            text: None,
            params: Value::Null,
            origin,
            client,
        }
    }

    pub fn with_action(mut self, action: impl Into<String>) -> Self {
        self.action = Some(action.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_params(mut self, params: Value) -> Self {
        self.params = params;
        self
    }

    /// Build an entry for the given stage, timestamped now
    pub fn entry(&self, stage: AuditStage) -> AuditEntry {
        AuditEntry {
            id: self.id.clone(),
            action: self.action.clone(),
            text: self.text.clone(),
            params: self.params.clone(),
            ts: Utc::now(),
            origin: self.origin.clone(),
            client: self.client.clone(),
            stage,
            error: None,
            suggestion: None,
            result: None,
            output: None,
        }
    }
}

impl AuditEntry {
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.error = Some(error.into());
        self
    }

    pub fn with_suggestion(mut self, suggestion: Value) -> Self {
        self.suggestion = Some(suggestion);
        self
    }

    pub fn with_result(mut self, result: Value) -> Self {
        self.result = Some(result);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = Some(output);
        self
    }
}

/// Append-only newline-delimited JSON audit log
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,

    /// Serializes appends so concurrent requests never interleave lines
    write_lock: Mutex<()>,
}

impl AuditLog {
    /// Create an audit log writing to `path` (created on first write)
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the log file
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append an entry, reporting failures through tracing only
    ///
    /// A failing audit sink must not change the outcome of the command.
    pub async fn record(&self, entry: &AuditEntry) {
        if let Err(e) = self.try_record(entry).await {
            error!(
                path = %self.path.display(),
                stage = %entry.stage,
                "audit write failed: {:#}",
                e
            );
        }
    }

    /// Append an entry, returning any I/O or encoding failure
    pub async fn try_record(&self, entry: &AuditEntry) -> anyhow::Result<()> {
        let mut line = serde_json::to_string(entry)?;
        line.push('\n');

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    /// Read back every entry (for operators and tests)
    pub async fn read_entries(&self) -> anyhow::Result<Vec<AuditEntry>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        content
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(Into::into))
            .collect()
    }

    /// Entries for one correlation id, in write order
    pub async fn entries_for(&self, id: &str) -> anyhow::Result<Vec<AuditEntry>> {
        Ok(self
            .read_entries()
            .await?
            .into_iter()
            .filter(|e| e.id.as_deref() == Some(id))
            .collect())
    }
}
