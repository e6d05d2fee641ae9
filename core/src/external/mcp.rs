//! MCP bridge: `start -> list_tools per server -> expose each as MCP.<server>.<tool>.vN
//! -> call marshals through the permission engine` (spec.md §6). Hand-rolled minimal
//! JSON-RPC-over-stdio client — no MCP SDK dependency, since the pack's only MCP crate
//! pulled in a git dependency that cannot be fetched in this workspace.

use std::collections::HashMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{CoreError, CoreResult, ErrorKind};

#[derive(Clone, Debug)]
pub struct McpServerSpec {
    pub name: String,
    pub command: String,
    pub args: Vec<String>,
}

#[derive(Clone, Debug)]
pub struct McpToolSpec {
    pub server: String,
    pub tool: String,
    pub description: String,
    pub input_schema: Value,
}

impl McpToolSpec {
    /// Virtual action identifier this tool is exposed as, e.g. `MCP.search.web_search.v1`.
    pub fn action_id(&self) -> String {
        format!("MCP.{}.{}.v1", self.server, self.tool)
    }
}

struct ServerConn {
    child: Child,
    stdin: ChildStdin,
    stdout: tokio::io::Lines<BufReader<tokio::process::ChildStdout>>,
}

/// Minimal JSON-RPC 2.0 client speaking the MCP stdio transport: one request per line
/// on stdin, one response per line on stdout.
pub struct McpBridge {
    servers: Mutex<HashMap<String, ServerConn>>,
    next_id: AtomicI64,
}

impl McpBridge {
    pub fn new() -> Self {
        Self { servers: Mutex::new(HashMap::new()), next_id: AtomicI64::new(1) }
    }

    pub async fn start(&self, spec: &McpServerSpec) -> CoreResult<()> {
        let mut child = Command::new(&spec.command)
            .args(&spec.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| CoreError::kind(ErrorKind::ToolError, format!("failed to start mcp server {}: {e}", spec.name)))?;

        let stdin = child.stdin.take().ok_or_else(|| CoreError::kind(ErrorKind::ToolError, "mcp server has no stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| CoreError::kind(ErrorKind::ToolError, "mcp server has no stdout"))?;
        let lines = BufReader::new(stdout).lines();

        let mut guard = self.servers.lock().await;
        guard.insert(spec.name.clone(), ServerConn { child, stdin, stdout: lines });
        Ok(())
    }

    async fn rpc_call(&self, server: &str, method: &str, params: Value) -> CoreResult<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let request = json!({ "jsonrpc": "2.0", "id": id, "method": method, "params": params });
        let mut line = serde_json::to_string(&request)?;
        line.push('\n');

        let mut guard = self.servers.lock().await;
        let conn = guard
            .get_mut(server)
            .ok_or_else(|| CoreError::kind(ErrorKind::NotFound, format!("mcp server '{server}' not started")))?;

        conn.stdin.write_all(line.as_bytes()).await.map_err(|e| CoreError::kind(ErrorKind::ToolError, e.to_string()))?;
        conn.stdin.flush().await.map_err(|e| CoreError::kind(ErrorKind::ToolError, e.to_string()))?;

        let mut response_line = String::new();
        loop {
            match conn.stdout.next_line().await {
                Ok(Some(raw)) => {
                    response_line = raw;
                    break;
                }
                Ok(None) => return Err(CoreError::kind(ErrorKind::EmptyOutput, "mcp server closed stdout")),
                Err(e) => return Err(CoreError::kind(ErrorKind::ToolError, e.to_string())),
            }
        }

        let response: Value = serde_json::from_str(&response_line)
            .map_err(|e| CoreError::kind(ErrorKind::ParseError, format!("malformed mcp response: {e}")))?;
        if let Some(error) = response.get("error") {
            return Err(CoreError::kind(ErrorKind::ToolError, error.to_string()));
        }
        Ok(response.get("result").cloned().unwrap_or(Value::Null))
    }

    pub async fn list_tools(&self, server: &str) -> CoreResult<Vec<McpToolSpec>> {
        let result = self.rpc_call(server, "tools/list", json!({})).await?;
        let tools = result.get("tools").and_then(|v| v.as_array()).cloned().unwrap_or_default();
        Ok(tools
            .into_iter()
            .filter_map(|t| {
                let tool = t.get("name")?.as_str()?.to_string();
                Some(McpToolSpec {
                    server: server.to_string(),
                    tool,
                    description: t.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string(),
                    input_schema: t.get("inputSchema").cloned().unwrap_or(json!({})),
                })
            })
            .collect())
    }

    pub async fn call_tool(&self, server: &str, tool: &str, arguments: Value) -> CoreResult<Value> {
        self.rpc_call(server, "tools/call", json!({ "name": tool, "arguments": arguments })).await
    }

    /// Kills and removes the connection; callers reconnect via `start` on the next
    /// `mcp reload`.
    pub async fn reload(&self, spec: &McpServerSpec) -> CoreResult<()> {
        let mut guard = self.servers.lock().await;
        if let Some(mut conn) = guard.remove(&spec.name) {
            let _ = conn.child.kill().await;
        }
        drop(guard);
        debug!(server = %spec.name, "reloading mcp server");
        self.start(spec).await
    }
}

impl Default for McpBridge {
    fn default() -> Self {
        Self::new()
    }
}

pub type SharedMcpBridge = Arc<McpBridge>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn action_id_follows_mcp_naming_scheme() {
        let spec = McpToolSpec {
            server: "search".to_string(),
            tool: "web_search".to_string(),
            description: String::new(),
            input_schema: json!({}),
        };
        assert_eq!(spec.action_id(), "MCP.search.web_search.v1");
    }

    #[tokio::test]
    async fn calling_unstarted_server_returns_not_found() {
        let bridge = McpBridge::new();
        let err = bridge.rpc_call("missing", "tools/list", json!({})).await.unwrap_err();
        assert_eq!(err.as_kind(), ErrorKind::NotFound);
    }
}
