//! Phase 0 (context assembly) and Phase 4 (post-processing) helpers that don't belong
//! to intent classification or planning (§4.10).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreResult;
use crate::external::{LlmClient, LlmRequest};
use crate::pulse::intent::Intent;
use crate::retrieval::{search_experiences, SearchHit};
use crate::storage::record::{Insight, InsightType};
use crate::storage::{Storage, Stream};

const SESSION_CONTINUITY_SEC: u64 = 30 * 60;
const HISTORY_WINDOW: usize = 20;
const HISTORY_KEEP_VERBATIM: usize = 16;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub text: String,
}

/// Sliding window with summary compression: once history exceeds 20 turns, the
/// oldest overflow collapses into one synthetic `[summary]`-prefixed turn and the
/// most recent 16 stay verbatim.
pub fn compress_history(history: &[HistoryTurn]) -> Vec<HistoryTurn> {
    if history.len() <= HISTORY_WINDOW {
        return history.to_vec();
    }
    let split = history.len() - HISTORY_KEEP_VERBATIM;
    let (older, recent) = history.split_at(split);
    let summary_text: String = older
        .iter()
        .map(|t| format!("{}: {}", t.role, t.text))
        .collect::<Vec<_>>()
        .join(" / ")
        .chars()
        .take(1000)
        .collect();
    let mut compressed = vec![HistoryTurn { role: "system".to_string(), text: format!("[summary] {summary_text}") }];
    compressed.extend_from_slice(recent);
    compressed
}

/// Per-chat session-id continuity tracker: the same id is reused for 30 minutes of
/// continuous activity, otherwise a fresh one is minted.
pub struct SessionTracker {
    sessions: Mutex<HashMap<String, (String, Instant)>>,
}

impl SessionTracker {
    pub fn new() -> Self {
        Self { sessions: Mutex::new(HashMap::new()) }
    }

    pub fn resolve(&self, chat_id: &str, session_seed: impl FnOnce() -> String) -> String {
        let mut sessions = self.sessions.lock().unwrap();
        let now = Instant::now();
        match sessions.get(chat_id) {
            Some((id, last_active)) if now.duration_since(*last_active).as_secs() < SESSION_CONTINUITY_SEC => {
                let id = id.clone();
                sessions.insert(chat_id.to_string(), (id.clone(), now));
                id
            }
            _ => {
                let id = session_seed();
                sessions.insert(chat_id.to_string(), (id.clone(), now));
                id
            }
        }
    }
}

impl Default for SessionTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Clone, Debug, Default)]
pub struct Context {
    pub session_id: String,
    pub history: Vec<HistoryTurn>,
    pub memory_hits: Vec<SearchHit>,
    pub wisdom: Vec<String>,
    pub skill_hints: Vec<String>,
}

/// Phase 0: loads recent history, resolves the session id, retrieves memory context
/// and wisdom (rule/alternative insights plus skill-search hints).
pub fn assemble_context(
    storage: &Storage,
    sessions: &SessionTracker,
    chat_id: &str,
    text: &str,
    history: &[HistoryTurn],
    session_seed: impl FnOnce() -> String,
) -> CoreResult<Context> {
    let session_id = sessions.resolve(chat_id, session_seed);
    let compressed = compress_history(history);
    let memory_hits = search_experiences(storage, text, 5)?;

    let insights: Vec<Insight> = storage.read(Stream::Insights, Some(50))?;
    let wisdom = insights
        .iter()
        .filter(|i| matches!(i.kind, InsightType::Rules | InsightType::SelfReflection))
        .filter_map(|i| i.payload.get("rules").and_then(|v| v.as_array()).map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect::<Vec<_>>()))
        .flatten()
        .take(10)
        .collect();

    Ok(Context { session_id, history: compressed, memory_hits, wisdom, skill_hints: Vec::new() })
}

/// Coerces a non-string JSON response down to displayable text (Phase 4).
pub fn coerce_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

static JSON_WRAPPER: Lazy<Regex> = Lazy::new(|| Regex::new(r#"^\s*\{\s*"(?:reply|response|answer|text)"\s*:\s*"(.*)"\s*\}\s*$"#).unwrap());

/// Strips a `{"reply": "..."}`-style wrapper some LLM backends emit even when asked
/// for plain text.
pub fn strip_json_wrapper(text: &str) -> String {
    if let Some(caps) = JSON_WRAPPER.captures(text) {
        caps[1].replace("\\\"", "\"").replace("\\n", "\n")
    } else {
        text.to_string()
    }
}

/// Self-correction: recovers an action intent embedded in a conversational reply
/// (e.g. the model "talked" an action instead of emitting one).
pub fn recover_embedded_action(text: &str) -> Option<Intent> {
    let value = crate::external::llm::extract_json(text)?;
    let action_id = value.get("action_id")?.as_str()?.to_string();
    let inputs = value.get("inputs").cloned().unwrap_or(Value::Object(Default::default()));
    Some(Intent::action(action_id, inputs))
}

/// A one- or two-character message with no letters or digits ("?", "..", "ㅋㅋ") is
/// too short to classify; short-circuit to a greeting rather than invoking dispatch.
pub fn is_greeting_shortcircuit(text: &str) -> bool {
    let trimmed = text.trim();
    let count = trimmed.chars().count();
    count >= 1 && count <= 2 && !trimmed.chars().any(|c| c.is_alphanumeric())
}

pub const GREETING_REPLY: &str = "안녕하세요! 무엇을 도와드릴까요?";

const COMPLEXITY_KEYWORDS: &[&str] = &["분석", "비교", "설계", "최적화", "리팩토링", "analyze", "design", "optimize", "refactor", "compare"];
pub const AUTO_ROUTE_THRESHOLD: f64 = 0.6;

/// `[0,1]` complexity score from message length, complexity keywords, multi-step
/// markers, and history depth (§4.10 "Auto-routing").
pub fn complexity_score(text: &str, history: &[HistoryTurn]) -> f64 {
    let length_score = (text.chars().count() as f64 / 400.0).min(1.0);
    let lower = text.to_lowercase();
    let keyword_score = if COMPLEXITY_KEYWORDS.iter().any(|k| lower.contains(k)) { 1.0 } else { 0.0 };
    let multistep_score = if crate::pulse::plan::has_multistep_markers(text) { 1.0 } else { 0.0 };
    let history_score = (history.len() as f64 / HISTORY_WINDOW as f64).min(1.0);
    0.35 * length_score + 0.3 * keyword_score + 0.2 * multistep_score + 0.15 * history_score
}

/// Local-LLM-only auto-memory fact detection: persists up to 3 previously-unseen
/// facts per turn (Phase 4). Caller is responsible for ensuring `llm` is the local
/// backend, never the paid one.
pub async fn detect_auto_memory_facts(llm: &dyn LlmClient, text: &str) -> Vec<String> {
    let prompt = format!(
        "Extract up to 3 standalone factual statements worth remembering from this message, one per line. \
         If there are none, reply with an empty response.\nMessage: {text}"
    );
    let raw = llm.complete(LlmRequest::new(prompt)).await;
    raw.lines().map(str::trim).filter(|l| !l.is_empty()).take(3).map(String::from).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compress_history_collapses_overflow_into_summary() {
        let history: Vec<HistoryTurn> = (0..25).map(|i| HistoryTurn { role: "user".into(), text: format!("turn {i}") }).collect();
        let compressed = compress_history(&history);
        assert_eq!(compressed.len(), HISTORY_KEEP_VERBATIM + 1);
        assert!(compressed[0].text.starts_with("[summary]"));
    }

    #[test]
    fn short_history_is_unchanged() {
        let history = vec![HistoryTurn { role: "user".into(), text: "hi".into() }];
        assert_eq!(compress_history(&history).len(), 1);
    }

    #[test]
    fn session_tracker_reuses_id_within_window() {
        let tracker = SessionTracker::new();
        let first = tracker.resolve("chat1", || "seed-a".to_string());
        let second = tracker.resolve("chat1", || "seed-b".to_string());
        assert_eq!(first, second);
    }

    #[test]
    fn strip_json_wrapper_unwraps_reply_field() {
        assert_eq!(strip_json_wrapper(r#"{"reply": "hello"}"#), "hello");
        assert_eq!(strip_json_wrapper("plain text"), "plain text");
    }

    #[test]
    fn complexity_score_rewards_keywords_and_length() {
        let short = complexity_score("hi", &[]);
        let long_complex = complexity_score(&"analyze ".repeat(60), &[]);
        assert!(long_complex > short);
    }

    #[test]
    fn greeting_shortcircuit_matches_short_punctuation_only() {
        assert!(is_greeting_shortcircuit("?"));
        assert!(is_greeting_shortcircuit(".."));
        assert!(is_greeting_shortcircuit("ㅋㅋ"));
        assert!(!is_greeting_shortcircuit("hi"));
        assert!(!is_greeting_shortcircuit(""));
        assert!(!is_greeting_shortcircuit("..."));
    }
}
