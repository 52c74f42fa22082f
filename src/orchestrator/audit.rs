//! Audit journal recording and replay (§4.10).
//!
//! The journal is a flat JSON document: a timestamped, ordered list of
//! module invocations plus a summary. Replay matches strictly
//! positionally against a loaded journal — module and host must match the
//! next unreplayed action and that action must have succeeded, or replay
//! is permanently disabled for every subsequent request in the run (a
//! partial, inconsistent replay is worse than none).

use std::collections::VecDeque;
use std::path::Path;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::error::{Error, Result};

const SENSITIVE_HEADER_KEYS: &[&str] = &["authorization", "cookie", "x-api-key", "x-auth-token"];
const REDACTED: &str = "**REDACTED**";

/// A single recorded module invocation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditAction {
    pub module: String,
    pub host: String,
    pub params: Value,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub started: String,
    pub duration_secs: f64,
    /// True when this action's outcome came from [`AuditReplayer`]
    /// rather than a live dispatch (§8 round-trip law: a second
    /// recording taken under replay must mark every replayed action).
    #[serde(default)]
    pub replayed: bool,
}

/// The full journal written at the end of a run and read back for replay.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditJournal {
    pub started: String,
    pub completed: String,
    pub check_mode: bool,
    pub success: bool,
    pub actions: Vec<AuditAction>,
    pub errors: Vec<String>,
}

/// Redact fields an HTTP-style module (`uri`, `get_url`, ...) must never
/// leak into the journal: sensitive header values, `bearer_token`,
/// `url_password`. Non-HTTP modules pass through untouched.
#[must_use]
pub fn redact_params(params: &Value) -> Value {
    let mut redacted = params.clone();
    let Some(obj) = redacted.as_object_mut() else {
        return redacted;
    };

    if let Some(headers) = obj.get_mut("headers").and_then(Value::as_object_mut) {
        for (key, value) in headers.iter_mut() {
            if SENSITIVE_HEADER_KEYS.contains(&key.to_lowercase().as_str()) {
                *value = Value::String(REDACTED.to_string());
            }
        }
    }
    for field in ["bearer_token", "url_password"] {
        if obj.contains_key(field) {
            obj.insert(field.to_string(), Value::String(REDACTED.to_string()));
        }
    }
    redacted
}

/// Accumulates actions over the course of a run and writes the final
/// journal.
pub struct AuditRecorder {
    started: String,
    actions: Mutex<Vec<AuditAction>>,
    errors: Mutex<Vec<String>>,
}

impl AuditRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self {
            started: Utc::now().to_rfc3339(),
            actions: Mutex::new(Vec::new()),
            errors: Mutex::new(Vec::new()),
        }
    }

    pub async fn record(&self, action: AuditAction) {
        self.actions.lock().await.push(action);
    }

    pub async fn record_error(&self, message: impl Into<String>) {
        self.errors.lock().await.push(message.into());
    }

    /// Build the final journal and write it to `path`. `check_mode` and
    /// overall `success` describe the run; `success` is conventionally
    /// `!failed` from the orchestrator's own bookkeeping.
    pub async fn write(&self, path: &Path, check_mode: bool, success: bool) -> Result<()> {
        let journal = AuditJournal {
            started: self.started.clone(),
            completed: Utc::now().to_rfc3339(),
            check_mode,
            success,
            actions: self.actions.lock().await.clone(),
            errors: self.errors.lock().await.clone(),
        };
        let serialized = serde_json::to_vec_pretty(&journal).map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| Error::Persistence {
                path: path.to_path_buf(),
                message: e.to_string(),
            })?;
        }
        std::fs::write(path, serialized).map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        })
    }
}

impl Default for AuditRecorder {
    fn default() -> Self {
        Self::new()
    }
}

struct ReplayState {
    remaining: VecDeque<AuditAction>,
    invalidated: bool,
}

/// Replays a previously recorded journal, strictly in order.
pub struct AuditReplayer {
    state: Mutex<ReplayState>,
}

impl AuditReplayer {
    pub fn load(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path).map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        let journal: AuditJournal = serde_json::from_str(&contents).map_err(|e| Error::Persistence {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        Ok(Self {
            state: Mutex::new(ReplayState {
                remaining: journal.actions.into(),
                invalidated: false,
            }),
        })
    }

    /// Return the recorded result for `(module, host)` if it's next in
    /// the journal and succeeded; otherwise permanently disable replay
    /// for the rest of the run and return `None`.
    pub async fn try_replay(&self, module: &str, host: &str) -> Option<AuditAction> {
        let mut state = self.state.lock().await;
        if state.invalidated {
            return None;
        }
        match state.remaining.front() {
            Some(action) if action.module == module && action.host == host && action.success => {
                state.remaining.pop_front()
            }
            _ => {
                state.invalidated = true;
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn action(module: &str, host: &str, success: bool) -> AuditAction {
        AuditAction {
            module: module.to_string(),
            host: host.to_string(),
            params: json!({}),
            success,
            result: Some(json!({"changed": false})),
            error: None,
            started: Utc::now().to_rfc3339(),
            duration_secs: 0.001,
            replayed: false,
        }
    }

    #[tokio::test]
    async fn recorder_writes_a_readable_journal() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");

        let recorder = AuditRecorder::new();
        recorder.record(action("ping", "web1", true)).await;
        recorder.write(&path, false, true).await.unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let journal: AuditJournal = serde_json::from_str(&contents).unwrap();
        assert_eq!(journal.actions.len(), 1);
        assert!(journal.success);
    }

    #[tokio::test]
    async fn replay_matches_module_and_host_positionally() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let recorder = AuditRecorder::new();
        recorder.record(action("ping", "web1", true)).await;
        recorder.record(action("command", "web2", true)).await;
        recorder.write(&path, false, true).await.unwrap();

        let replayer = AuditReplayer::load(&path).unwrap();
        assert!(replayer.try_replay("ping", "web1").await.is_some());
        assert!(replayer.try_replay("command", "web2").await.is_some());
    }

    #[tokio::test]
    async fn mismatch_invalidates_the_rest_of_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let recorder = AuditRecorder::new();
        recorder.record(action("ping", "web1", true)).await;
        recorder.record(action("command", "web2", true)).await;
        recorder.write(&path, false, true).await.unwrap();

        let replayer = AuditReplayer::load(&path).unwrap();
        assert!(replayer.try_replay("command", "web1").await.is_none());
        assert!(replayer.try_replay("command", "web2").await.is_none());
    }

    #[tokio::test]
    async fn failed_action_is_never_replayed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("journal.json");
        let recorder = AuditRecorder::new();
        recorder.record(action("ping", "web1", false)).await;
        recorder.write(&path, false, false).await.unwrap();

        let replayer = AuditReplayer::load(&path).unwrap();
        assert!(replayer.try_replay("ping", "web1").await.is_none());
    }

    #[test]
    fn redact_params_scrubs_sensitive_header_and_fields() {
        let params = json!({
            "url": "https://example.com",
            "headers": {"Authorization": "Bearer abc", "Accept": "application/json"},
            "bearer_token": "secret",
            "url_password": "hunter2",
        });
        let redacted = redact_params(&params);
        assert_eq!(redacted["headers"]["Authorization"], REDACTED);
        assert_eq!(redacted["headers"]["Accept"], "application/json");
        assert_eq!(redacted["bearer_token"], REDACTED);
        assert_eq!(redacted["url_password"], REDACTED);
    }
}
