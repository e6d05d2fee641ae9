//! Learning Recorder: records executions as experiences, extracts insights
//! periodically, and records reusable code as skills (§4.5).

pub mod insights;

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::error::CoreResult;
use crate::storage::record::{
    sha256_hex, Experience, GenesisSuggestion, IntentType, Skill, STORE_SKILL_CODE_LEN,
};
use crate::storage::{Storage, Stream};
use insights::{aggregate_tool_stats, build_rules, classify_failure, scan_genesis_triggers, should_emit_rules};

const INSIGHT_EXTRACTION_PERIOD: u64 = 10;
const HASH_CACHE_TTL: Duration = Duration::from_secs(60);
const ERROR_MARKERS: [&str; 6] = ["error", "traceback", "failed", "exception", "fault", "errno"];

pub struct LearningRecorder {
    storage: Storage,
    experience_count: AtomicU64,
    skill_hash_cache: Mutex<(Instant, HashSet<String>)>,
}

impl LearningRecorder {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            experience_count: AtomicU64::new(0),
            skill_hash_cache: Mutex::new((Instant::now() - HASH_CACHE_TTL, HashSet::new())),
        }
    }

    /// Experience gate (§4.5): rejects dummy `expected == got` records, stress-test
    /// spam, and 24h duplicates with identical (tool, success, result-prefix).
    fn passes_experience_gate(&self, experience: &Experience, recent: &[Experience]) -> bool {
        if experience.source.as_deref() != Some("test") {
            let lower_result = experience.result_preview.to_lowercase();
            let lower_request = experience.user_request.to_lowercase();
            if !lower_request.is_empty() && lower_result.contains(&lower_request) && lower_result.contains("expected") {
                return false;
            }
        }

        let day_ms = 86_400_000i64;
        let prefix_len = 50.min(experience.result_preview.len());
        let prefix = &experience.result_preview[..prefix_len];
        let is_duplicate = recent.iter().any(|r| {
            r.tool_used == experience.tool_used
                && r.success == experience.success
                && r.result_preview.len() >= prefix_len
                && &r.result_preview[..prefix_len] == prefix
                && (experience.ts_ms - r.ts_ms).abs() < day_ms
        });
        !is_duplicate
    }

    pub fn record_experience(
        &self,
        user_text: &str,
        intent: IntentType,
        tool_used: &str,
        result: &str,
        success: bool,
        elapsed_sec: f64,
    ) -> CoreResult<Option<Vec<crate::storage::record::Insight>>> {
        let experience = Experience::new("execute", user_text, intent, tool_used, success, elapsed_sec, result);
        let recent: Vec<Experience> = self.storage.read(Stream::Experiences, Some(500))?;
        if !self.passes_experience_gate(&experience, &recent) {
            debug!(tool = tool_used, "experience rejected by quality gate");
            return Ok(None);
        }
        self.storage.append(Stream::Experiences, &experience)?;

        let count = self.experience_count.fetch_add(1, Ordering::SeqCst) + 1;
        if count % INSIGHT_EXTRACTION_PERIOD == 0 {
            return self.extract_insights();
        }
        Ok(None)
    }

    /// Periodic ExpeL-style extraction over the last 30 experiences, plus genesis
    /// suggestion emission per the same trigger (§4.5).
    pub fn extract_insights(&self) -> CoreResult<Option<Vec<crate::storage::record::Insight>>> {
        let experiences: Vec<Experience> = self.storage.read(Stream::Experiences, Some(30))?;
        let stats = aggregate_tool_stats(&experiences);
        let new_rules = build_rules(&stats);

        let recent_insights: Vec<crate::storage::record::Insight> =
            self.storage.read(Stream::Insights, Some(20))?;
        let recent_rule_sets: Vec<Vec<String>> = recent_insights
            .iter()
            .filter(|i| i.kind == crate::storage::record::InsightType::Rules)
            .filter_map(|i| i.payload.get("rules").and_then(|v| v.as_array()))
            .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
            .collect();

        let mut emitted = Vec::new();
        if let Some(insight) = should_emit_rules(&new_rules, &recent_rule_sets, &stats) {
            self.storage.append(Stream::Insights, &insight)?;
            emitted.push(insight);
        }

        let failure_classes: Vec<insights::FailureClass> = experiences
            .iter()
            .filter(|e| !e.success)
            .map(|e| classify_failure(&e.result_preview))
            .collect();
        let unhandled = experiences.iter().filter(|e| e.tool_used.is_empty()).count() as u32;
        let triggers = scan_genesis_triggers(&stats, &failure_classes, unhandled);
        for trigger in triggers {
            self.emit_genesis_suggestion(trigger)?;
        }

        if emitted.is_empty() {
            Ok(None)
        } else {
            Ok(Some(emitted))
        }
    }

    fn emit_genesis_suggestion(&self, trigger: insights::GenesisTrigger) -> CoreResult<()> {
        use insights::GenesisTrigger::*;
        let (key, description, priority) = match trigger {
            FailingTool { tool, failures, total } => (
                format!("failing_tool:{tool}"),
                format!("'{tool}' fails {failures}/{total}; needs a more robust alternative or repair"),
                4,
            ),
            RepeatedFailureType { kind, count } => (
                format!("repeated_failure:{kind:?}"),
                format!("{count} recent failures classified as {kind:?}"),
                3,
            ),
            UnhandledRequests { count } => (
                "unhandled_requests".to_string(),
                format!("{count} recent requests had no tool chosen"),
                3,
            ),
        };
        let existing: Vec<GenesisSuggestion> = self.storage.read(Stream::GenesisSuggestions, None)?;
        if existing.iter().any(|s| s.suggestion_key == key) {
            return Ok(());
        }
        let suggestion = GenesisSuggestion {
            ts_ms: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_millis() as i64)
                .unwrap_or(0),
            suggestion_key: key,
            priority,
            description,
            executed: false,
        };
        self.storage.append(Stream::GenesisSuggestions, &suggestion)
    }

    fn refresh_hash_cache(&self) -> CoreResult<()> {
        let mut guard = self.skill_hash_cache.lock().unwrap();
        if guard.0.elapsed() < HASH_CACHE_TTL {
            return Ok(());
        }
        let recent: Vec<Skill> = self.storage.read(Stream::Skills, Some(200))?;
        guard.1 = recent.into_iter().map(|s| s.code_hash).collect();
        guard.0 = Instant::now();
        Ok(())
    }

    /// Skill recording quality gate (SPEC_FULL supplement 4): code must have at
    /// least 2 newlines (>=3 lines); result must not contain any error marker in its
    /// first 500 chars; dedups by `code_hash` against the last 200 skill records.
    pub fn record_skill(
        &self,
        name: &str,
        lang: &str,
        code: &str,
        request: &str,
        result: &str,
        tags: Vec<String>,
    ) -> CoreResult<bool> {
        if code.matches('\n').count() < 2 {
            return Ok(false);
        }
        let result_prefix: String = result.chars().take(500).collect::<String>().to_lowercase();
        if ERROR_MARKERS.iter().any(|m| result_prefix.contains(m)) {
            return Ok(false);
        }

        self.refresh_hash_cache()?;
        let truncated_code: String = code.chars().take(STORE_SKILL_CODE_LEN).collect();
        let hash = sha256_hex(truncated_code.as_bytes());
        {
            let guard = self.skill_hash_cache.lock().unwrap();
            if guard.1.contains(&hash) {
                return Ok(false);
            }
        }

        let skill = Skill::new(name, lang, code, request, result, tags);
        self.storage.append(Stream::Skills, &skill)?;
        self.skill_hash_cache.lock().unwrap().1.insert(hash);
        Ok(true)
    }

    /// Emits a `self_reflection` insight analyzing a single failure, used by the
    /// reflect level handler and on-demand diagnostics.
    pub fn reflect_on_failure(&self, user_text: &str, intent: &str, result: &str) -> CoreResult<()> {
        let class = classify_failure(result);
        let insight = crate::storage::record::Insight::new(
            crate::storage::record::InsightType::SelfReflection,
            0.5,
            serde_json::json!({
                "user_text": user_text,
                "intent": intent,
                "failure_class": format!("{class:?}"),
                "result_preview": crate::storage::record::truncate_chars(result, 500),
            }),
        );
        self.storage.append(Stream::Insights, &insight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn record_experience_appends() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let recorder = LearningRecorder::new(storage.clone());
        recorder
            .record_experience("hello", IntentType::Action, "SHELL.EXEC.v1", "ok", true, 0.2)
            .unwrap();
        let experiences: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        assert_eq!(experiences.len(), 1);
    }

    #[tokio::test]
    async fn record_skill_rejects_short_code() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let recorder = LearningRecorder::new(storage);
        let recorded = recorder.record_skill("noop", "python", "x = 1", "req", "ok", vec![]).unwrap();
        assert!(!recorded);
    }

    #[tokio::test]
    async fn record_skill_rejects_error_result() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let recorder = LearningRecorder::new(storage);
        let code = "a = 1\nb = 2\nprint(a + b)";
        let recorded = recorder
            .record_skill("add", "python", code, "req", "Traceback: failed", vec![])
            .unwrap();
        assert!(!recorded);
    }

    #[tokio::test]
    async fn record_skill_dedups_by_hash() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        let recorder = LearningRecorder::new(storage.clone());
        let code = "a = 1\nb = 2\nprint(a + b)";
        let first = recorder.record_skill("add", "python", code, "req", "3", vec![]).unwrap();
        let second = recorder.record_skill("add", "python", code, "req", "3", vec![]).unwrap();
        assert!(first);
        assert!(!second);
        let skills: Vec<Skill> = storage.read(Stream::Skills, None).unwrap();
        assert_eq!(skills.len(), 1);
    }
}
