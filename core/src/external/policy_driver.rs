//! Policy driver subprocess: an external "brain" that receives `{mode, ...}` on
//! stdin and returns one JSON object on stdout (spec.md §6). Used as the default
//! decision source for intent/summary/chat/continue/plan when no in-process LLM
//! client is configured.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tokio::time::timeout;
use tracing::warn;

use crate::error::{CoreError, CoreResult, ErrorKind};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PolicyMode {
    Intent,
    Summary,
    Chat,
    Continue,
    Plan,
}

impl PolicyMode {
    fn as_str(&self) -> &'static str {
        match self {
            PolicyMode::Intent => "intent",
            PolicyMode::Summary => "summary",
            PolicyMode::Chat => "chat",
            PolicyMode::Continue => "continue",
            PolicyMode::Plan => "plan",
        }
    }
}

#[async_trait]
pub trait PolicyDriver: Send + Sync {
    async fn decide(&self, mode: PolicyMode, payload: Value) -> CoreResult<Value>;
}

/// Invokes `policy_driver <mode>` with the payload as JSON on stdin, capped by
/// `timeout`; parses a single JSON object from stdout.
pub struct SubprocessPolicyDriver {
    binary: PathBuf,
    timeout: Duration,
}

impl SubprocessPolicyDriver {
    pub fn new(binary: PathBuf, timeout: Duration) -> Self {
        Self { binary, timeout }
    }
}

#[async_trait]
impl PolicyDriver for SubprocessPolicyDriver {
    async fn decide(&self, mode: PolicyMode, payload: Value) -> CoreResult<Value> {
        let envelope = json!({ "mode": mode.as_str(), "payload": payload });
        let mut child = Command::new(&self.binary)
            .arg(mode.as_str())
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::null())
            .spawn()
            .map_err(|e| CoreError::kind(ErrorKind::ToolError, format!("failed to spawn policy driver: {e}")))?;

        if let Some(mut stdin) = child.stdin.take() {
            let body = serde_json::to_vec(&envelope)?;
            let _ = stdin.write_all(&body).await;
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return Err(CoreError::kind(ErrorKind::ToolError, e.to_string())),
            Err(_) => return Err(CoreError::kind(ErrorKind::Timeout, "policy driver timed out")),
        };

        if !output.status.success() {
            warn!(status = ?output.status, "policy driver exited non-zero");
        }
        let stdout = String::from_utf8_lossy(&output.stdout);
        serde_json::from_str(stdout.trim()).map_err(|e| CoreError::kind(ErrorKind::ParseError, format!("malformed policy driver output: {e}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn policy_mode_as_str_matches_contract() {
        assert_eq!(PolicyMode::Intent.as_str(), "intent");
        assert_eq!(PolicyMode::Continue.as_str(), "continue");
    }
}
