//! Tool Dispatch: the uniform execute-one-action surface shared by the Pulse Executor
//! and the Autonomic Engine's level handlers (§4.4).

pub mod chains;
pub mod code_safety;
pub mod error;
pub mod handlers;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::error::ErrorKind;
use crate::permission::{Decision, PermissionEngine, SideEffect};
use error::DispatchError;

/// Matches `DOMAIN.ACTION.vN` with uppercase alphanumeric-plus-underscore segments.
static ACTION_ID_SHAPE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Z][A-Z0-9_]*\.[A-Z][A-Z0-9_]*\.v[0-9]+$").unwrap());

pub fn validate_action_id(id: &str) -> (bool, Option<&'static str>) {
    if ACTION_ID_SHAPE.is_match(id) {
        (true, None)
    } else {
        (false, Some("action id must match DOMAIN.ACTION.vN"))
    }
}

/// Legacy alias -> canonical action identifier, matching the teacher's normalization-map
/// idiom for renamed or shorthand names.
static ALIAS_MAP: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("shell", "SHELL.EXEC.v1"),
        ("code", "CODE.EXEC.v1"),
        ("read_file", "FILE.READ.v1"),
        ("write_file", "FILE.WRITE.v1"),
        ("list_files", "FILE.LIST.v1"),
        ("delete_file", "FILE.DELETE.v1"),
        ("http_get", "NET.HTTP_GET.v1"),
    ]
    .into_iter()
    .collect()
});

pub fn resolve_alias(name: &str) -> String {
    ALIAS_MAP.get(name).map(|s| s.to_string()).unwrap_or_else(|| name.to_string())
}

/// External tool-host subprocess contract (§6 "Tool host subprocess", SPEC_FULL
/// supplement 3). Unknown action identifiers not covered by a built-in handler are
/// forwarded here.
#[async_trait]
pub trait ToolHost: Send + Sync {
    async fn run(&self, action_id: &str, inputs: Value) -> Result<String, DispatchError>;
}

/// No-op host used when no external toolhost binary is configured; every
/// forwarded call fails with `not_found`, matching the original's behavior when
/// `machina_cli` is missing.
pub struct MissingToolHost;

#[async_trait]
impl ToolHost for MissingToolHost {
    async fn run(&self, action_id: &str, _inputs: Value) -> Result<String, DispatchError> {
        Err(DispatchError::new(action_id, ErrorKind::NotFound, "no tool host configured"))
    }
}

/// Invokes `tool_exec <action_id>` as a subprocess with the envelope
/// `{"input_json": ..., "ds_state": {"slots": {}}}` on stdin, parsing the first line
/// of stdout as `{status, output_json, error?}` (SPEC_FULL supplement 3).
pub struct SubprocessToolHost {
    pub binary_path: PathBuf,
    pub cwd: PathBuf,
    pub timeout: Duration,
}

#[async_trait]
impl ToolHost for SubprocessToolHost {
    async fn run(&self, action_id: &str, inputs: Value) -> Result<String, DispatchError> {
        use tokio::io::AsyncWriteExt;
        use tokio::process::Command;

        if !self.binary_path.exists() {
            return Err(DispatchError::new(action_id, ErrorKind::NotFound, format!("tool host not found at {}", self.binary_path.display())));
        }

        let envelope = serde_json::json!({
            "input_json": serde_json::to_string(&inputs).unwrap_or_default(),
            "ds_state": {"slots": {}},
        });
        let request = format!("{}\n", envelope);

        let mut child = Command::new(&self.binary_path)
            .arg("tool_exec")
            .arg(action_id)
            .current_dir(&self.cwd)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .spawn()
            .map_err(|e| DispatchError::new(action_id, ErrorKind::Exception, e.to_string()))?;

        if let Some(stdin) = child.stdin.as_mut() {
            let _ = stdin.write_all(request.as_bytes()).await;
        }

        let output = match timeout(self.timeout, child.wait_with_output()).await {
            Ok(Ok(o)) => o,
            Ok(Err(e)) => return Err(DispatchError::new(action_id, ErrorKind::Exception, e.to_string())),
            Err(_) => return Err(DispatchError::new(action_id, ErrorKind::Timeout, format!("toolhost timed out ({:?})", self.timeout))),
        };

        let mut stdout = String::from_utf8_lossy(&output.stdout).to_string();
        const MAX_OUTPUT: usize = 1_048_576;
        if stdout.len() > MAX_OUTPUT {
            warn!(action_id, from = stdout.len(), "toolhost output truncated");
            stdout = stdout.chars().take(MAX_OUTPUT).collect::<String>();
            stdout.push_str("\n...(output truncated: exceeded 1MB limit)");
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let mut detail = stderr;
            if !stdout.trim().is_empty() {
                detail = format!("{}\n{}", stdout.trim(), detail);
            }
            return Err(DispatchError::new(action_id, ErrorKind::Crash, detail));
        }
        if stdout.trim().is_empty() {
            return Err(DispatchError::new(action_id, ErrorKind::EmptyOutput, "tool_exec returned empty output"));
        }

        let first_line = stdout.trim().lines().next().unwrap_or("");
        let payload: Value = serde_json::from_str(first_line)
            .map_err(|e| DispatchError::new(action_id, ErrorKind::ParseError, format!("malformed JSON: {e}")))?;

        let status = payload.get("status").and_then(|v| v.as_str()).unwrap_or("");
        if !status.is_empty() && status != "OK" {
            let err_text = payload.get("error").and_then(|v| v.as_str()).unwrap_or("");
            let detail = if err_text.is_empty() { format!("tool_exec status={status}") } else { err_text.to_string() };
            return Err(DispatchError::new(action_id, ErrorKind::ToolError, detail));
        }

        match payload.get("output_json") {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(other) => Ok(other.to_string()),
            None => Ok(String::new()),
        }
    }
}

/// Manifest-derived metadata used for side-effect inference when no default-map
/// entry covers an action identifier.
#[derive(Clone, Default)]
pub struct ManifestEntry {
    pub side_effects: HashSet<SideEffect>,
}

pub struct Dispatcher {
    pub permission_engine: PermissionEngine,
    pub manifest: HashMap<String, ManifestEntry>,
    pub tool_host: Box<dyn ToolHost>,
    pub work_root: PathBuf,
    pub trash_dir: PathBuf,
}

impl Dispatcher {
    pub fn new(permission_engine: PermissionEngine, work_root: PathBuf) -> Self {
        let trash_dir = work_root.join(".trash");
        Self {
            permission_engine,
            manifest: HashMap::new(),
            tool_host: Box::new(MissingToolHost),
            work_root,
            trash_dir,
        }
    }

    fn side_effects_for(&self, action_id: &str) -> HashSet<SideEffect> {
        self.manifest.get(action_id).map(|m| m.side_effects.clone()).unwrap_or_default()
    }

    /// Execute semantics (§4.4): resolve alias -> permission check -> dispatch.
    pub async fn execute(&self, action_id_or_alias: &str, inputs: Value, caller_approved: bool) -> Result<String, DispatchError> {
        let action_id = resolve_alias(action_id_or_alias);
        let (valid, reason) = validate_action_id(&action_id);
        if !valid {
            return Err(DispatchError::new(&action_id, ErrorKind::InvalidInput, reason.unwrap_or("invalid action id")));
        }

        let side_effects = self.side_effects_for(&action_id);
        let decision = self.permission_engine.check(&action_id, &side_effects);
        debug!(action_id = %action_id, ?decision, "permission check");
        match decision {
            Decision::Deny => {
                return Err(DispatchError::new(&action_id, ErrorKind::ApprovalRequired, "action denied by permission mode"));
            }
            Decision::Ask if !caller_approved => {
                return Err(DispatchError::new(&action_id, ErrorKind::ApprovalRequired, "awaiting caller approval"));
            }
            _ => {}
        }

        self.dispatch_builtin_or_host(&action_id, inputs, caller_approved).await
    }

    async fn dispatch_builtin_or_host(&self, action_id: &str, inputs: Value, caller_approved: bool) -> Result<String, DispatchError> {
        match action_id {
            "FILE.READ.v1" => handlers::file_read(&self.work_root, &inputs).await,
            "FILE.WRITE.v1" => handlers::file_write(&self.work_root, &inputs).await,
            "FILE.APPEND.v1" => handlers::file_append(&self.work_root, &inputs).await,
            "FILE.DELETE.v1" => handlers::file_delete(&self.work_root, &self.trash_dir, &inputs).await,
            "FILE.LIST.v1" => handlers::file_list(&self.work_root, &inputs).await,
            "CODE.EXEC.v1" => handlers::code_exec(&self.work_root, &inputs, caller_approved).await,
            "SHELL.EXEC.v1" => handlers::shell_exec(&self.work_root, &inputs).await,
            other => self.tool_host.run(other, inputs).await,
        }
    }

    /// Runs a named chain of steps, threading each step's output into the next's
    /// inputs; halts on the first error (§4.4 "Chains").
    pub async fn execute_chain(&self, steps: &[chains::ChainStep], caller_approved: bool) -> Vec<chains::ChainStepResult> {
        let mut results = Vec::new();
        let mut prev_output = String::new();
        for step in steps {
            let threaded_inputs = chains::thread_inputs(&step.inputs, &prev_output);
            match self.execute(&step.action_id, threaded_inputs, caller_approved).await {
                Ok(output) => {
                    prev_output = output.clone();
                    results.push(chains::ChainStepResult { action_id: step.action_id.clone(), output, hint: None });
                }
                Err(e) => {
                    results.push(chains::ChainStepResult {
                        action_id: step.action_id.clone(),
                        output: serde_json::to_string(&e).unwrap_or_default(),
                        hint: e.hint.clone(),
                    });
                    break;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::permission::Mode;
    use serde_json::json;

    #[test]
    fn validate_action_id_shape() {
        assert!(validate_action_id("FILE.READ.v1").0);
        assert!(!validate_action_id("file.read.v1").0);
        assert!(!validate_action_id("FILE.READ").0);
    }

    #[test]
    fn resolve_alias_maps_legacy_names() {
        assert_eq!(resolve_alias("shell"), "SHELL.EXEC.v1");
        assert_eq!(resolve_alias("FILE.READ.v1"), "FILE.READ.v1");
    }

    #[tokio::test]
    async fn execute_denies_in_locked_mode() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PermissionEngine::new(Mode::Locked, HashMap::new());
        let dispatcher = Dispatcher::new(engine, dir.path().to_path_buf());
        let result = dispatcher.execute("SHELL.EXEC.v1", json!({"cmd": "echo hi"}), false).await;
        assert!(result.is_err());
        assert_eq!(result.unwrap_err().kind, ErrorKind::ApprovalRequired.to_string());
    }

    #[tokio::test]
    async fn execute_ask_without_approval_fails() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PermissionEngine::new(Mode::Standard, HashMap::new());
        let dispatcher = Dispatcher::new(engine, dir.path().to_path_buf());
        let result = dispatcher.execute("SHELL.EXEC.v1", json!({"cmd": "echo hi"}), false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn execute_allow_action_runs_handler() {
        let dir = tempfile::tempdir().unwrap();
        let engine = PermissionEngine::new(Mode::Standard, HashMap::new());
        let dispatcher = Dispatcher::new(engine, dir.path().to_path_buf());
        let result = dispatcher
            .execute("FILE.WRITE.v1", json!({"path": "a.txt", "content": "hi"}), false)
            .await;
        assert!(result.is_ok());
    }
}
