//! Phase 1 — intent classification: a three-tier fast-path before ever calling the LLM
//! (§4.10 "Phase 1"). Keyword rules, then distilled policy rules from past
//! experience, then LLM fallback with a meta-question guardrail.

use std::collections::HashMap;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::CoreResult;
use crate::external::{LlmClient, LlmRequest};
use crate::retrieval::tokenize::tokenize;
use crate::storage::record::Experience;
use crate::storage::{Storage, Stream};

const POLICY_JACCARD_MIN: f64 = 0.3;
const POLICY_SUCCESS_RATE_MIN: f64 = 0.8;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    Reply,
    Action,
    Config,
    Plan,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub action_id: Option<String>,
    #[serde(default)]
    pub inputs: Value,
    #[serde(default, rename = "_next")]
    pub next: Option<Box<Intent>>,
}

impl Intent {
    pub fn reply() -> Self {
        Self { kind: IntentKind::Reply, action_id: None, inputs: Value::Null, next: None }
    }

    pub fn action(action_id: impl Into<String>, inputs: Value) -> Self {
        Self { kind: IntentKind::Action, action_id: Some(action_id.into()), inputs, next: None }
    }
}

/// Meta-questions ("is X ok?", "can you do Y?") talk *about* a tool rather than
/// invoking it, so the fast-path must not misclassify them as actions.
static META_QUESTION: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(할 수 있|가능한가|괜찮을까|해도 (돼|될까)|can you|is it (ok|okay|fine)|could you tell me)").unwrap()
});

pub fn is_meta_question(text: &str) -> bool {
    META_QUESTION.is_match(text)
}

/// Keyword -> action-id table. Small and conservative; anything ambiguous falls
/// through to the next tier rather than guessing.
static KEYWORD_RULES: Lazy<HashMap<&'static str, &'static str>> = Lazy::new(|| {
    [
        ("파일 읽어", "FILE.READ.v1"),
        ("read the file", "FILE.READ.v1"),
        ("파일 목록", "FILE.LIST.v1"),
        ("list files", "FILE.LIST.v1"),
        ("파일 삭제", "FILE.DELETE.v1"),
        ("delete the file", "FILE.DELETE.v1"),
        ("쉘 명령", "SHELL.EXEC.v1"),
        ("run this command", "SHELL.EXEC.v1"),
        ("검색해", "NET.WEB_SEARCH.v1"),
        ("search the web", "NET.WEB_SEARCH.v1"),
    ]
    .into_iter()
    .collect()
});

/// Tier (a): direct keyword match. Rejects on a meta-question pattern regardless of a
/// keyword hit.
pub fn keyword_tier(text: &str) -> Option<Intent> {
    if is_meta_question(text) {
        return None;
    }
    let lower = text.to_lowercase();
    KEYWORD_RULES
        .iter()
        .find(|(needle, _)| lower.contains(&needle.to_lowercase()))
        .map(|(_, action_id)| Intent::action(*action_id, Value::Object(Default::default())))
}

fn jaccard(a: &[String], b: &[String]) -> f64 {
    let sa: std::collections::HashSet<&String> = a.iter().collect();
    let sb: std::collections::HashSet<&String> = b.iter().collect();
    if sa.is_empty() && sb.is_empty() {
        return 0.0;
    }
    let inter = sa.intersection(&sb).count() as f64;
    let union = sa.union(&sb).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        inter / union
    }
}

/// Tier (b): distilled policy rules from past experience. Groups the last 500
/// experiences by `tool_used`, and for the group whose `user_request` overlaps the
/// incoming text the most (Jaccard ≥ 0.3) with a success rate ≥ 0.8, replays that tool.
pub fn policy_tier(storage: &Storage, text: &str) -> CoreResult<Option<Intent>> {
    if is_meta_question(text) {
        return Ok(None);
    }
    let experiences: Vec<Experience> = storage.read(Stream::Experiences, Some(500))?;
    let query_tokens = tokenize(text);

    let mut by_tool: HashMap<String, Vec<&Experience>> = HashMap::new();
    for exp in &experiences {
        by_tool.entry(exp.tool_used.clone()).or_default().push(exp);
    }

    let mut best: Option<(String, f64)> = None;
    for (tool, group) in &by_tool {
        let success_rate = group.iter().filter(|e| e.success).count() as f64 / group.len() as f64;
        if success_rate < POLICY_SUCCESS_RATE_MIN {
            continue;
        }
        let overlap = group
            .iter()
            .map(|e| jaccard(&query_tokens, &tokenize(&e.user_request)))
            .fold(0.0_f64, f64::max);
        if overlap >= POLICY_JACCARD_MIN && best.as_ref().map(|(_, s)| overlap > *s).unwrap_or(true) {
            best = Some((tool.clone(), overlap));
        }
    }

    Ok(best.map(|(tool, _)| Intent::action(tool, Value::Object(Default::default()))))
}

/// Tier (c): LLM fallback. Emits a small JSON structure; a post-parse guardrail
/// re-routes to chat when the input is a meta-question but the LLM proposed an action.
pub async fn llm_tier(llm: &dyn LlmClient, text: &str) -> Intent {
    let prompt = format!(
        "Classify this user message as either a reply (chat) or an action (tool call).\n\
         Message: {text}\n\
         Reply with JSON: {{\"kind\": \"reply\"|\"action\", \"action_id\": \"DOMAIN.ACTION.vN\"|null, \"inputs\": {{}}}}"
    );
    let raw = llm.complete(LlmRequest::new(prompt)).await;
    let parsed = crate::external::llm::extract_json(&raw);

    let mut intent = match parsed {
        Some(value) => {
            let kind = match value.get("kind").and_then(|v| v.as_str()) {
                Some("action") => IntentKind::Action,
                _ => IntentKind::Reply,
            };
            let action_id = value.get("action_id").and_then(|v| v.as_str()).map(String::from);
            let inputs = value.get("inputs").cloned().unwrap_or(Value::Object(Default::default()));
            Intent { kind, action_id, inputs, next: None }
        }
        None => Intent::reply(),
    };

    if is_meta_question(text) && intent.kind == IntentKind::Action {
        intent = Intent::reply();
    }
    intent
}

/// Runs the fast-path tiers in order; `None` means "fall through to the LLM".
pub fn fast_path(storage: &Storage, text: &str) -> CoreResult<Option<Intent>> {
    if let Some(intent) = keyword_tier(text) {
        return Ok(Some(intent));
    }
    policy_tier(storage, text)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keyword_tier_matches_known_phrase() {
        let intent = keyword_tier("파일 목록 보여줘").unwrap();
        assert_eq!(intent.action_id.as_deref(), Some("FILE.LIST.v1"));
    }

    #[test]
    fn meta_question_suppresses_keyword_match() {
        assert!(keyword_tier("쉘 명령 실행해도 괜찮을까?").is_none());
    }

    #[test]
    fn policy_tier_requires_high_success_rate() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        for _ in 0..5 {
            storage
                .append(Stream::Experiences, &Experience::new("execute", "날씨 검색해줘", crate::storage::record::IntentType::Action, "NET.WEB_SEARCH.v1", false, 0.1, "error"))
                .unwrap();
        }
        let result = policy_tier(&storage, "오늘 날씨 검색해줘").unwrap();
        assert!(result.is_none());
    }

    #[test]
    fn policy_tier_replays_high_success_tool() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        for _ in 0..5 {
            storage
                .append(Stream::Experiences, &Experience::new("execute", "오늘 날씨 검색해줘", crate::storage::record::IntentType::Action, "NET.WEB_SEARCH.v1", true, 0.1, "ok"))
                .unwrap();
        }
        let result = policy_tier(&storage, "오늘 날씨 검색해줘").unwrap();
        assert_eq!(result.unwrap().action_id.as_deref(), Some("NET.WEB_SEARCH.v1"));
    }
}
