//! Self-Questioner / Tester / Healer: generates test scenarios, runs them, classifies
//! failures, and proposes repairs gated through the Regression Gate (§4.7).

use std::collections::HashSet;

use crate::dispatch::code_safety::check_blocklist;
use crate::error::CoreResult;
use crate::learning::LearningRecorder;
use crate::regression::RegressionGate;
use crate::retrieval::tokenize::tokenize;
use crate::storage::record::{Difficulty, Experience, GenesisSuggestion};
use crate::storage::{Storage, Stream};

#[derive(Clone, Debug)]
pub struct Scenario {
    pub prompt: String,
    pub expected_type: String,
    pub difficulty: Difficulty,
    pub novelty: f64,
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoveltyTracker {
    pub high: u32,
    pub low: u32,
    pub skipped: u32,
}

impl NoveltyTracker {
    pub fn reset(&mut self) {
        *self = NoveltyTracker::default();
    }
}

const NOVELTY_LOW_FLOOR: f64 = 0.25;

/// Jaccard similarity against the last 20 experiences and last 10 insights
/// (SPEC_FULL supplement 6), tokenized on word chars plus Hangul syllables.
pub fn compute_novelty(candidate_text: &str, recent_experience_texts: &[String], recent_insight_texts: &[String]) -> f64 {
    let candidate_tokens: HashSet<String> = tokenize(candidate_text).into_iter().collect();
    if candidate_tokens.is_empty() {
        return 0.0;
    }
    let corpus: Vec<&String> = recent_experience_texts.iter().chain(recent_insight_texts.iter()).collect();
    if corpus.is_empty() {
        return 1.0;
    }
    let mut max_similarity = 0.0f64;
    for text in corpus {
        let other_tokens: HashSet<String> = tokenize(text).into_iter().collect();
        let intersection = candidate_tokens.intersection(&other_tokens).count() as f64;
        let union = candidate_tokens.union(&other_tokens).count() as f64;
        let similarity = if union == 0.0 { 0.0 } else { intersection / union };
        max_similarity = max_similarity.max(similarity);
    }
    1.0 - max_similarity
}

pub struct StaticBank;

impl StaticBank {
    pub fn scenarios_for(difficulty: Difficulty) -> Vec<(&'static str, &'static str)> {
        match difficulty {
            Difficulty::Easy => vec![("안녕", "reply"), ("파일 목록 보여줘", "action")],
            Difficulty::Medium => vec![("피보나치 10개 출력해줘", "action"), ("이 코드가 왜 틀렸는지 설명해줘", "reply")],
            Difficulty::Hard => vec![("여러 파일을 읽고 요약한 다음 리포트를 작성해줘", "plan")],
        }
    }
}

pub struct SelfQuestioner {
    storage: Storage,
    novelty_tracker: NoveltyTracker,
}

impl SelfQuestioner {
    pub fn new(storage: Storage) -> Self {
        Self { storage, novelty_tracker: NoveltyTracker::default() }
    }

    pub fn start_burst(&mut self) {
        self.novelty_tracker.reset();
    }

    /// WebRL-style difficulty selection: easy if easy success-rate < 0.8, else medium
    /// if medium < 0.7, else hard (§4.7).
    pub fn select_difficulty(easy_rate: f64, medium_rate: f64) -> Difficulty {
        if easy_rate < 0.8 {
            Difficulty::Easy
        } else if medium_rate < 0.7 {
            Difficulty::Medium
        } else {
            Difficulty::Hard
        }
    }

    /// Builds the batch: static-bank scenarios at the selected difficulty, replays of
    /// the last three distinct failure insights, and one coverage filler per known
    /// tool not tested in the recent window.
    pub fn build_batch(
        &mut self,
        difficulty: Difficulty,
        failure_replays: &[String],
        untested_tools: &[String],
    ) -> CoreResult<Vec<Scenario>> {
        let recent_experiences: Vec<Experience> = self.storage.read(Stream::Experiences, Some(20))?;
        let recent_texts: Vec<String> = recent_experiences.iter().map(|e| e.user_request.clone()).collect();

        let mut batch = Vec::new();
        for (prompt, expected) in StaticBank::scenarios_for(difficulty) {
            let novelty = compute_novelty(prompt, &recent_texts, &[]);
            self.track_novelty(novelty);
            batch.push(Scenario { prompt: prompt.to_string(), expected_type: expected.to_string(), difficulty, novelty });
        }
        for failure in failure_replays.iter().take(3) {
            let novelty = compute_novelty(failure, &recent_texts, &[]);
            self.track_novelty(novelty);
            batch.push(Scenario { prompt: failure.clone(), expected_type: "action".to_string(), difficulty, novelty });
        }
        for tool in untested_tools {
            let prompt = format!("{tool} 사용해서 확인해줘");
            let novelty = compute_novelty(&prompt, &recent_texts, &[]);
            self.track_novelty(novelty);
            batch.push(Scenario { prompt, expected_type: "action".to_string(), difficulty, novelty });
        }
        Ok(batch)
    }

    fn track_novelty(&mut self, novelty: f64) {
        if novelty < NOVELTY_LOW_FLOOR {
            self.novelty_tracker.low += 1;
        } else {
            self.novelty_tracker.high += 1;
        }
    }

    pub fn novelty_tracker(&self) -> NoveltyTracker {
        self.novelty_tracker
    }
}

#[derive(Clone, Debug)]
pub struct TestOutcome {
    pub scenario: Scenario,
    pub got_type: String,
    pub passed: bool,
}

/// Classifies intent without invoking an LLM judge (no LLM judges its own output;
/// this is the Tester's classifier-subprocess stand-in, a caller-supplied closure).
pub type IntentClassifier<'a> = dyn Fn(&str) -> String + Send + Sync + 'a;

pub struct Tester;

impl Tester {
    /// Runs each scenario through `classify`, comparing against the expected type.
    /// Can be interrupted mid-batch by `abort_check`.
    pub fn run_batch(
        scenarios: &[Scenario],
        classify: &IntentClassifier,
        abort_check: impl Fn() -> bool,
    ) -> Vec<TestOutcome> {
        let mut outcomes = Vec::new();
        for scenario in scenarios {
            if abort_check() {
                break;
            }
            let got_type = classify(&scenario.prompt);
            let passed = got_type == scenario.expected_type;
            outcomes.push(TestOutcome { scenario: scenario.clone(), got_type, passed });
        }
        outcomes
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HealFailureClass {
    EmptyOutput,
    IntentMisclassActionVsReply,
    IntentMisclassReverse,
}

pub fn classify_heal_failure(outcome: &TestOutcome) -> HealFailureClass {
    if outcome.got_type.is_empty() {
        return HealFailureClass::EmptyOutput;
    }
    if outcome.scenario.expected_type == "reply" && outcome.got_type == "action" {
        HealFailureClass::IntentMisclassActionVsReply
    } else if outcome.scenario.expected_type == "action" && outcome.got_type == "reply" {
        HealFailureClass::IntentMisclassReverse
    } else {
        HealFailureClass::EmptyOutput
    }
}

pub fn most_frequent_failure_class(outcomes: &[TestOutcome]) -> Option<HealFailureClass> {
    use std::collections::HashMap;
    let mut counts: HashMap<HealFailureClass, u32> = HashMap::new();
    for outcome in outcomes.iter().filter(|o| !o.passed) {
        *counts.entry(classify_heal_failure(outcome)).or_insert(0) += 1;
    }
    counts.into_iter().max_by_key(|(_, count)| *count).map(|(class, _)| class)
}

impl std::hash::Hash for HealFailureClass {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
    }
}

/// Genesis sliding-window rate limit: at most two attempts per wall-clock hour
/// (SPEC_FULL supplement 7, `GENESIS_MAX_PER_HOUR = 2`).
pub struct GenesisRateLimiter {
    max_per_hour: u32,
    attempts_this_hour: u32,
    hour_bucket: i64,
}

impl GenesisRateLimiter {
    pub fn new() -> Self {
        Self { max_per_hour: 2, attempts_this_hour: 0, hour_bucket: 0 }
    }

    pub fn can_attempt(&mut self, now_ms: i64) -> bool {
        let bucket = now_ms / 3_600_000;
        if bucket != self.hour_bucket {
            self.hour_bucket = bucket;
            self.attempts_this_hour = 0;
        }
        self.attempts_this_hour < self.max_per_hour
    }

    pub fn record_attempt(&mut self) {
        self.attempts_this_hour += 1;
    }
}

impl Default for GenesisRateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

pub struct Healer {
    storage: Storage,
    learning: LearningRecorder,
    regression: RegressionGate,
    rate_limiter: GenesisRateLimiter,
}

impl Healer {
    pub fn new(storage: Storage, learning: LearningRecorder, regression: RegressionGate) -> Self {
        Self { storage, learning, regression, rate_limiter: GenesisRateLimiter::new() }
    }

    /// For the most frequent failure class, generates a short diagnostic script
    /// (here, from a deterministic template — the LLM-backed path is the caller's
    /// responsibility via `proposed_code`), applies the safety blocklist, sandbox-
    /// tests it through the Regression Gate, and records on success.
    pub async fn attempt_heal(
        &mut self,
        now_ms: i64,
        failure_class: HealFailureClass,
        proposed_code: &str,
    ) -> CoreResult<bool> {
        if !self.rate_limiter.can_attempt(now_ms) {
            return Ok(false);
        }
        if check_blocklist(proposed_code).is_some() {
            return Ok(false);
        }
        self.rate_limiter.record_attempt();

        let run_result = self.regression.run().await?;
        let baseline = self.regression.ensure_baseline()?;
        if !self.regression.check(&run_result, &baseline) {
            return Ok(false);
        }
        self.regression.accept(&run_result)?;
        self.learning.record_skill(
            &format!("heal_{failure_class:?}"),
            "python",
            proposed_code,
            "automated heal",
            "accepted",
            vec!["heal".into()],
        )?;
        Ok(true)
    }

    /// Processes the single highest-priority un-executed genesis suggestion
    /// (§4.9 "Heal" level handler).
    pub fn next_suggestion(&self) -> CoreResult<Option<GenesisSuggestion>> {
        let mut suggestions: Vec<GenesisSuggestion> = self.storage.read(Stream::GenesisSuggestions, None)?;
        suggestions.retain(|s| !s.executed && s.priority >= 3);
        suggestions.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(suggestions.into_iter().next())
    }

    pub fn mark_executed(&self, suggestion_key: &str) -> CoreResult<()> {
        let suggestions: Vec<GenesisSuggestion> = self.storage.read(Stream::GenesisSuggestions, None)?;
        for mut s in suggestions {
            if s.suggestion_key == suggestion_key {
                s.executed = true;
                self.storage.append(Stream::GenesisSuggestions, &s)?;
            }
        }
        // compact keeps only the most recently appended record per key, so the
        // freshly appended `executed = true` row wins over the stale one.
        self.storage.compact::<GenesisSuggestion, String, _>(Stream::GenesisSuggestions, |s| s.suggestion_key.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn novelty_of_unseen_text_is_one() {
        let novelty = compute_novelty("완전히 새로운 문장", &[], &[]);
        assert_eq!(novelty, 1.0);
    }

    #[test]
    fn novelty_of_repeated_text_is_low() {
        let novelty = compute_novelty("fix the bug", &["fix the bug".to_string()], &[]);
        assert!(novelty < 0.2);
    }

    #[test]
    fn difficulty_selection_prefers_easy_when_struggling() {
        assert_eq!(SelfQuestioner::select_difficulty(0.5, 0.9), Difficulty::Easy);
        assert_eq!(SelfQuestioner::select_difficulty(0.9, 0.5), Difficulty::Medium);
        assert_eq!(SelfQuestioner::select_difficulty(0.9, 0.9), Difficulty::Hard);
    }

    #[test]
    fn classify_heal_failure_detects_reverse_misclass() {
        let outcome = TestOutcome {
            scenario: Scenario { prompt: "x".into(), expected_type: "action".into(), difficulty: Difficulty::Easy, novelty: 0.5 },
            got_type: "reply".into(),
            passed: false,
        };
        assert_eq!(classify_heal_failure(&outcome), HealFailureClass::IntentMisclassReverse);
    }

    #[test]
    fn genesis_rate_limiter_caps_at_two_per_hour() {
        let mut limiter = GenesisRateLimiter::new();
        assert!(limiter.can_attempt(0));
        limiter.record_attempt();
        assert!(limiter.can_attempt(0));
        limiter.record_attempt();
        assert!(!limiter.can_attempt(0));
        assert!(limiter.can_attempt(3_600_000));
    }
}
