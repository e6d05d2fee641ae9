//! External collaborator seams (spec.md §6): LLM client, MCP bridge, policy driver
//! subprocess, chat transport, web search. Everything here is a narrow trait plus one
//! concrete adapter; the rest of `core` depends only on the trait.

pub mod chat_transport;
pub mod llm;
pub mod mcp;
pub mod policy_driver;
pub mod web_search;

pub use chat_transport::{ChatTransport, NullChatTransport};
pub use llm::{LlmClient, LlmRequest, OpenAiCompatClient};
pub use mcp::{McpBridge, McpServerSpec, McpToolSpec, SharedMcpBridge};
pub use policy_driver::{PolicyDriver, PolicyMode, SubprocessPolicyDriver};
pub use web_search::{HttpWebSearcher, SearchResult, WebSearcher};
