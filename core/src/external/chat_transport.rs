//! Narrow chat transport seam: the Pulse Executor sends replies and intermediate
//! output through this trait, never touching a concrete messaging backend directly
//! (spec.md §1 Non-goals: "the chat UI transport"). `stream-event` carries the
//! richer progress/audit event shape; this trait is just the send boundary.

use async_trait::async_trait;

use stream_event::ProtocolEvent;

#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_text(&self, chat_id: &str, text: &str);
    async fn send_event(&self, chat_id: &str, event: ProtocolEvent);
}

/// Transport used when no concrete backend is attached (e.g. `autonomicd run`):
/// events are dropped, text goes nowhere. Callers relying on the return value of
/// `handle_user_message` still get the reply string directly.
pub struct NullChatTransport;

#[async_trait]
impl ChatTransport for NullChatTransport {
    async fn send_text(&self, _chat_id: &str, _text: &str) {}
    async fn send_event(&self, _chat_id: &str, _event: ProtocolEvent) {}
}
