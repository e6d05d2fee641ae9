//! Record schemas for the learning substrate's append-only streams (§3).

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const STORE_RESULT_PREVIEW_LEN: usize = 1000;
pub const STORE_SKILL_CODE_LEN: usize = 3000;
pub const STORE_INSIGHT_TEXT_LEN: usize = 2000;
pub const STORE_AUDIT_DETAIL_LEN: usize = 1000;

/// Truncates `s` to `max_chars` characters (not bytes), respecting UTF-8 boundaries.
pub fn truncate_chars(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        return s.to_string();
    }
    s.chars().take(max_chars).collect()
}

fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentType {
    Reply,
    Action,
    Config,
    Plan,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Difficulty {
    #[default]
    Easy,
    Medium,
    Hard,
}

/// One record per executed action or test (stream `experiences`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Experience {
    pub ts_ms: i64,
    pub event: String,
    pub user_request: String,
    pub intent_type: IntentType,
    pub tool_used: String,
    pub success: bool,
    pub elapsed_sec: f64,
    pub result_preview: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub difficulty: Option<Difficulty>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl Experience {
    pub fn new(
        event: impl Into<String>,
        user_request: impl Into<String>,
        intent_type: IntentType,
        tool_used: impl Into<String>,
        success: bool,
        elapsed_sec: f64,
        result_preview: impl AsRef<str>,
    ) -> Self {
        Self {
            ts_ms: now_ms(),
            event: event.into(),
            user_request: truncate_chars(&user_request.into(), STORE_RESULT_PREVIEW_LEN),
            intent_type,
            tool_used: tool_used.into(),
            success,
            elapsed_sec,
            result_preview: truncate_chars(result_preview.as_ref(), STORE_RESULT_PREVIEW_LEN),
            difficulty: None,
            source: None,
            session_id: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InsightType {
    Rules,
    Failure,
    ToolStats,
    TestFailureAnalysis,
    SelfReflection,
    ToolAudit,
    WebLesson,
    KnowledgeActionable,
}

/// Extracted rule or reflection (stream `insights`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Insight {
    pub ts_ms: i64,
    #[serde(rename = "type")]
    pub kind: InsightType,
    pub quality_score: f64,
    #[serde(flatten)]
    pub payload: Value,
}

impl Insight {
    pub fn new(kind: InsightType, quality_score: f64, payload: Value) -> Self {
        Self {
            ts_ms: now_ms(),
            kind,
            quality_score: quality_score.clamp(0.0, 1.0),
            payload,
        }
    }
}

/// Reusable code snippet (stream `skills`), dedup-keyed by `code_hash`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Skill {
    pub ts_ms: i64,
    pub name: String,
    pub lang: String,
    pub code: String,
    pub code_hash: String,
    pub request: String,
    pub result_preview: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

impl Skill {
    pub fn new(
        name: impl Into<String>,
        lang: impl Into<String>,
        code: impl AsRef<str>,
        request: impl AsRef<str>,
        result_preview: impl AsRef<str>,
        tags: Vec<String>,
    ) -> Self {
        let code = truncate_chars(code.as_ref(), STORE_SKILL_CODE_LEN);
        let code_hash = sha256_hex(code.as_bytes());
        Self {
            ts_ms: now_ms(),
            name: name.into(),
            lang: lang.into(),
            code,
            code_hash,
            request: truncate_chars(request.as_ref(), STORE_RESULT_PREVIEW_LEN),
            result_preview: truncate_chars(result_preview.as_ref(), STORE_RESULT_PREVIEW_LEN),
            tags,
        }
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// Web-search summary (stream `knowledge`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Knowledge {
    pub ts_ms: i64,
    pub query: String,
    pub summary: String,
    pub sources: Vec<String>,
    pub rounds: u32,
    pub pages_read: u32,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Email,
    Date,
    Url,
    Ip,
    Path,
    Measure,
    Tech,
    Concept,
}

/// Graph-memory node (stream `entities`). `id` is `sha256(lowercased name)[:16]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Entity {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: EntityType,
    #[serde(default)]
    pub aliases: Vec<String>,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub mention_count: u64,
    #[serde(default)]
    pub metadata: Value,
}

impl Entity {
    pub fn id_for(name: &str) -> String {
        let hash = sha256_hex(name.to_lowercase().as_bytes());
        hash[..16].to_string()
    }
}

/// Graph-memory edge (stream `relations`). `id` is `sha256(src+tgt+predicate)[:16]`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Relation {
    pub id: String,
    pub source_id: String,
    pub target_id: String,
    pub predicate: String,
    pub weight: f64,
    pub first_seen_ms: i64,
    pub last_seen_ms: i64,
    pub mention_count: u64,
}

impl Relation {
    pub fn id_for(source_id: &str, target_id: &str, predicate: &str) -> String {
        let material = format!("{source_id}{target_id}{predicate}");
        sha256_hex(material.as_bytes())[..16].to_string()
    }

    /// Strengthens an existing relation in place: bumps mention_count, refreshes
    /// last_seen_ms, and asymptotes weight toward 1.0.
    pub fn strengthen(&mut self, at_ms: i64) {
        self.mention_count += 1;
        self.last_seen_ms = at_ms;
        self.weight = self.weight + (1.0 - self.weight) * 0.25;
    }
}

/// Proposed new-tool specification awaiting execution (stream `genesis_suggestions`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GenesisSuggestion {
    pub ts_ms: i64,
    pub suggestion_key: String,
    pub priority: u32,
    pub description: String,
    #[serde(default)]
    pub executed: bool,
}

/// Structured operational event (stream `autonomic_audit`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditEvent {
    pub ts_ms: i64,
    pub level: String,
    pub success: bool,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub span_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_span_id: Option<String>,
}

impl AuditEvent {
    pub fn new(level: impl Into<String>, success: bool, detail: impl AsRef<str>) -> Self {
        Self {
            ts_ms: now_ms(),
            level: level.into(),
            success,
            detail: truncate_chars(detail.as_ref(), STORE_AUDIT_DETAIL_LEN),
            trace_id: None,
            span_id: None,
            parent_span_id: None,
        }
    }
}

/// Dedup log entry for the random-stimulus pool (stream `stimulus_done`).
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StimulusDone {
    pub ts_ms: i64,
    pub stimulus_hash: String,
}

/// Trust score: `recency_factor * quality_factor`.
///
/// `recency_factor = 2^(-age_days/7)`; `quality_factor` is 1.0/0.3/0.5 for
/// success/failure/unknown respectively.
pub fn trust_score(age_days: f64, success: Option<bool>) -> f64 {
    let recency_factor = 2f64.powf(-age_days / 7.0);
    let quality_factor = match success {
        Some(true) => 1.0,
        Some(false) => 0.3,
        None => 0.5,
    };
    recency_factor * quality_factor
}
