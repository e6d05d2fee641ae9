//! Built-in action handlers (§4.4). Each returns a plain string on success or a
//! [`DispatchError`] on failure; handlers never panic or early-return via `io::Error`
//! directly — they translate everything into the closed error taxonomy.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde_json::Value;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::ErrorKind;
use super::code_safety::{auto_fix, check_blocklist, BlockReason};
use super::error::DispatchError;

const MAX_OUTPUT_BYTES: usize = 1_048_576;
const SHELL_TIMEOUT_SECS: u64 = 20;
const CODE_TIMEOUT_SECS: u64 = 60;

fn truncate_output(output: String) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output;
    }
    let mut truncated: String = output.chars().take(MAX_OUTPUT_BYTES).collect();
    truncated.push_str("\n...(output truncated: exceeded 1MB limit)");
    truncated
}

/// Resolves `relative` against `sandbox_root`, rejecting any path that escapes the
/// root via symlinks or `..` components (§8 invariant 5: realpath before bounds check).
pub fn resolve_in_sandbox(sandbox_root: &Path, relative: &str) -> Result<PathBuf, DispatchError> {
    let candidate = sandbox_root.join(relative);
    let root_real = std::fs::canonicalize(sandbox_root)
        .map_err(|e| DispatchError::new("FILE.WRITE.v1", ErrorKind::IoError, e.to_string()))?;

    let parent = candidate.parent().unwrap_or(sandbox_root);
    std::fs::create_dir_all(parent).ok();
    let parent_real = std::fs::canonicalize(parent).unwrap_or_else(|_| parent.to_path_buf());

    if !parent_real.starts_with(&root_real) {
        return Err(DispatchError::new(
            "FILE.WRITE.v1",
            ErrorKind::PathOutsideSandbox,
            format!("{relative} escapes sandbox root"),
        ));
    }
    let file_name = candidate
        .file_name()
        .ok_or_else(|| DispatchError::new("FILE.WRITE.v1", ErrorKind::InvalidInput, "empty path"))?;
    Ok(parent_real.join(file_name))
}

pub async fn file_read(root: &Path, inputs: &Value) -> Result<String, DispatchError> {
    let path = inputs.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
        DispatchError::new("FILE.READ.v1", ErrorKind::InvalidInput, "missing 'path'")
    })?;
    let resolved = resolve_in_sandbox(root, path)
        .map_err(|e| DispatchError::new("FILE.READ.v1", ErrorKind::PathOutsideSandbox, e.detail))?;
    tokio::fs::read_to_string(&resolved)
        .await
        .map(truncate_output)
        .map_err(|e| DispatchError::new("FILE.READ.v1", ErrorKind::NotFound, e.to_string()))
}

pub async fn file_write(root: &Path, inputs: &Value) -> Result<String, DispatchError> {
    let path = inputs.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
        DispatchError::new("FILE.WRITE.v1", ErrorKind::InvalidInput, "missing 'path'")
    })?;
    let content = inputs.get("content").and_then(|v| v.as_str()).unwrap_or("");
    let resolved = resolve_in_sandbox(root, path)?;
    tokio::fs::write(&resolved, content)
        .await
        .map(|_| format!("wrote {} bytes to {}", content.len(), path))
        .map_err(|e| DispatchError::new("FILE.WRITE.v1", ErrorKind::IoError, e.to_string()))
}

pub async fn file_append(root: &Path, inputs: &Value) -> Result<String, DispatchError> {
    use tokio::io::AsyncWriteExt;
    let path = inputs.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
        DispatchError::new("FILE.APPEND.v1", ErrorKind::InvalidInput, "missing 'path'")
    })?;
    let content = inputs.get("content").and_then(|v| v.as_str()).unwrap_or("");
    let resolved = resolve_in_sandbox(root, path)?;
    let mut file = tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&resolved)
        .await
        .map_err(|e| DispatchError::new("FILE.APPEND.v1", ErrorKind::IoError, e.to_string()))?;
    file.write_all(content.as_bytes())
        .await
        .map_err(|e| DispatchError::new("FILE.APPEND.v1", ErrorKind::IoError, e.to_string()))?;
    Ok(format!("appended {} bytes to {}", content.len(), path))
}

pub async fn file_delete(root: &Path, trash_dir: &Path, inputs: &Value) -> Result<String, DispatchError> {
    let path = inputs.get("path").and_then(|v| v.as_str()).ok_or_else(|| {
        DispatchError::new("FILE.DELETE.v1", ErrorKind::InvalidInput, "missing 'path'")
    })?;
    let resolved = resolve_in_sandbox(root, path)?;
    tokio::fs::create_dir_all(trash_dir).await.ok();
    let now_ms = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    let base_name = resolved.file_name().and_then(|n| n.to_str()).unwrap_or("deleted");
    let trashed = trash_dir.join(format!("{now_ms}-{base_name}"));
    tokio::fs::rename(&resolved, &trashed)
        .await
        .map(|_| format!("moved {path} to trash"))
        .map_err(|e| DispatchError::new("FILE.DELETE.v1", ErrorKind::IoError, e.to_string()))
}

pub async fn file_list(root: &Path, inputs: &Value) -> Result<String, DispatchError> {
    let rel = inputs.get("path").and_then(|v| v.as_str()).unwrap_or(".");
    let resolved = resolve_in_sandbox(root, rel)?;
    let mut entries = Vec::new();
    let mut read_dir = tokio::fs::read_dir(&resolved)
        .await
        .map_err(|e| DispatchError::new("FILE.LIST.v1", ErrorKind::NotFound, e.to_string()))?;
    while let Ok(Some(entry)) = read_dir.next_entry().await {
        entries.push(entry.file_name().to_string_lossy().to_string());
    }
    entries.sort();
    Ok(entries.join("\n"))
}

pub async fn code_exec(work_root: &Path, inputs: &Value, caller_approved: bool) -> Result<String, DispatchError> {
    let lang = inputs.get("lang").and_then(|v| v.as_str()).unwrap_or("python");
    let raw_code = inputs.get("code").and_then(|v| v.as_str()).ok_or_else(|| {
        DispatchError::new("CODE.EXEC.v1", ErrorKind::InvalidInput, "missing 'code'")
    })?;
    if raw_code.trim().is_empty() {
        return Err(DispatchError::new("CODE.EXEC.v1", ErrorKind::InvalidInput, "empty code"));
    }

    let fixed = auto_fix(raw_code, lang);

    if !caller_approved {
        if let Some(reason) = check_blocklist(&fixed) {
            let kind = match reason {
                BlockReason::Dangerous => ErrorKind::DangerousCodeBlocked,
                BlockReason::Network => ErrorKind::NetworkCodeBlocked,
            };
            return Err(DispatchError::new("CODE.EXEC.v1", kind, "code matched safety blocklist"));
        }
    }

    let (program, args, ext) = match lang {
        "python" => ("python3", vec!["-c".to_string(), fixed.clone()], "py"),
        "bash" => ("bash", vec!["-c".to_string(), fixed.clone()], "sh"),
        other => {
            return Err(DispatchError::new(
                "CODE.EXEC.v1",
                ErrorKind::InvalidInput,
                format!("unsupported lang '{other}' (c/c++ route through genesis compile)"),
            ))
        }
    };
    let _ = ext;

    run_subprocess("CODE.EXEC.v1", work_root, program, &args, Duration::from_secs(CODE_TIMEOUT_SECS)).await
}

pub async fn shell_exec(work_root: &Path, inputs: &Value) -> Result<String, DispatchError> {
    let cmd = inputs.get("cmd").and_then(|v| v.as_str()).ok_or_else(|| {
        DispatchError::new("SHELL.EXEC.v1", ErrorKind::InvalidInput, "missing 'cmd'")
    })?;
    if cmd.trim().is_empty() {
        return Err(DispatchError::new("SHELL.EXEC.v1", ErrorKind::InvalidInput, "empty cmd"));
    }
    run_subprocess(
        "SHELL.EXEC.v1",
        work_root,
        "bash",
        &["-c".to_string(), cmd.to_string()],
        Duration::from_secs(SHELL_TIMEOUT_SECS),
    )
    .await
}

async fn run_subprocess(
    action_id: &str,
    cwd: &Path,
    program: &str,
    args: &[String],
    wall_clock: Duration,
) -> Result<String, DispatchError> {
    let child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .output();

    match timeout(wall_clock, child).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
            if !output.status.success() {
                combined.push_str(&String::from_utf8_lossy(&output.stderr));
                return Err(DispatchError::new(action_id, ErrorKind::Crash, truncate_output(combined)));
            }
            if combined.trim().is_empty() {
                return Err(DispatchError::new(action_id, ErrorKind::EmptyOutput, "no output produced"));
            }
            Ok(truncate_output(combined))
        }
        Ok(Err(e)) => Err(DispatchError::new(action_id, ErrorKind::Exception, e.to_string())),
        Err(_) => Err(DispatchError::new(action_id, ErrorKind::Timeout, format!("exceeded {:?}", wall_clock))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn file_write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = json!({"path": "note.txt", "content": "hello"});
        file_write(dir.path(), &inputs).await.unwrap();
        let read_inputs = json!({"path": "note.txt"});
        let content = file_read(dir.path(), &read_inputs).await.unwrap();
        assert_eq!(content, "hello");
    }

    #[tokio::test]
    async fn file_write_rejects_path_escape() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = json!({"path": "../outside.txt", "content": "x"});
        let result = file_write(dir.path(), &inputs).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn code_exec_rejects_empty_code() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = json!({"lang": "python", "code": ""});
        let result = code_exec(dir.path(), &inputs, false).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn code_exec_blocks_dangerous_code_without_approval() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = json!({"lang": "python", "code": "import subprocess\nsubprocess.run(['ls'])"});
        let err = code_exec(dir.path(), &inputs, false).await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DangerousCodeBlocked.to_string());
    }

    #[tokio::test]
    async fn shell_exec_rejects_empty_cmd() {
        let dir = tempfile::tempdir().unwrap();
        let inputs = json!({"cmd": "  "});
        assert!(shell_exec(dir.path(), &inputs).await.is_err());
    }
}
