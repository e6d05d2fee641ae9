//! ExpeL-style insight extraction from a window of experiences (§4.5).

use std::collections::HashMap;

use serde_json::json;

use crate::storage::record::{Experience, Insight, InsightType};

const WINDOW_SIZE: usize = 30;
const NOVELTY_THRESHOLD: f64 = 0.4;
const QUALITY_THRESHOLD: f64 = 0.3;

#[derive(Clone, Debug, Default)]
pub struct ToolStats {
    pub success: u32,
    pub failure: u32,
}

impl ToolStats {
    pub fn fail_rate(&self) -> f64 {
        let total = self.success + self.failure;
        if total == 0 {
            0.0
        } else {
            self.failure as f64 / total as f64
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum FailureClass {
    Parse,
    Timeout,
    Runtime,
}

pub fn classify_failure(result_preview: &str) -> FailureClass {
    let lower = result_preview.to_lowercase();
    if lower.contains("timeout") || lower.contains("timed out") {
        FailureClass::Timeout
    } else if lower.contains("parse") || lower.contains("json") || lower.contains("syntax") {
        FailureClass::Parse
    } else {
        FailureClass::Runtime
    }
}

/// Aggregates per-tool success/failure counts over the most recent `WINDOW_SIZE`
/// experiences.
pub fn aggregate_tool_stats(experiences: &[Experience]) -> HashMap<String, ToolStats> {
    let window = window_tail(experiences);
    let mut stats: HashMap<String, ToolStats> = HashMap::new();
    for exp in window {
        let entry = stats.entry(exp.tool_used.clone()).or_default();
        if exp.success {
            entry.success += 1;
        } else {
            entry.failure += 1;
        }
    }
    stats
}

fn window_tail(experiences: &[Experience]) -> &[Experience] {
    if experiences.len() > WINDOW_SIZE {
        &experiences[experiences.len() - WINDOW_SIZE..]
    } else {
        experiences
    }
}

/// Builds candidate "AVOID"/"PREFER" rule strings from tool stats, e.g.
/// `"AVOID: 'X' fails often (4/5). Try alternative tools."`.
pub fn build_rules(stats: &HashMap<String, ToolStats>) -> Vec<String> {
    let mut rules: Vec<String> = Vec::new();
    for (tool, s) in stats {
        let total = s.success + s.failure;
        if total >= 3 && s.fail_rate() > 0.4 {
            rules.push(format!(
                "AVOID: '{tool}' fails often ({}/{}). Try alternative tools.",
                s.failure, total
            ));
        } else if total >= 3 && s.fail_rate() < 0.2 {
            rules.push(format!("PREFER: '{tool}' is reliable ({}/{}).", s.success, total));
        }
    }
    rules.sort();
    rules
}

fn tokenize_rule_set(rules: &[String]) -> std::collections::HashSet<String> {
    rules.iter().flat_map(|r| crate::retrieval::tokenize::tokenize(r)).collect()
}

fn jaccard(a: &std::collections::HashSet<String>, b: &std::collections::HashSet<String>) -> f64 {
    if a.is_empty() && b.is_empty() {
        return 1.0;
    }
    let intersection = a.intersection(b).count() as f64;
    let union = a.union(b).count() as f64;
    if union == 0.0 {
        0.0
    } else {
        intersection / union
    }
}

/// Specificity score: rewards rules that name a concrete tool and a concrete ratio
/// over generic statements.
fn specificity_score(rules: &[String]) -> f64 {
    if rules.is_empty() {
        return 0.0;
    }
    let specific = rules.iter().filter(|r| r.contains('\'') && r.contains('/')).count();
    specific as f64 / rules.len() as f64
}

fn data_score(stats: &HashMap<String, ToolStats>) -> f64 {
    let total: u32 = stats.values().map(|s| s.success + s.failure).sum();
    (total as f64 / WINDOW_SIZE as f64).min(1.0)
}

/// Decides whether a fresh `rules` insight should be emitted: the rule set must
/// differ from every recent `rules` insight by at least 40% (Jaccard distance) AND
/// `quality_score = 0.4*data_score + 0.6*specificity_score >= 0.3`.
pub fn should_emit_rules(
    new_rules: &[String],
    recent_rule_insights: &[Vec<String>],
    stats: &HashMap<String, ToolStats>,
) -> Option<Insight> {
    if new_rules.is_empty() {
        return None;
    }
    let new_tokens = tokenize_rule_set(new_rules);
    let is_novel = recent_rule_insights.iter().all(|prev| {
        let prev_tokens = tokenize_rule_set(prev);
        1.0 - jaccard(&new_tokens, &prev_tokens) >= NOVELTY_THRESHOLD
    });
    if !is_novel {
        return None;
    }
    let quality = 0.4 * data_score(stats) + 0.6 * specificity_score(new_rules);
    if quality < QUALITY_THRESHOLD {
        return None;
    }
    Some(Insight::new(
        InsightType::Rules,
        quality,
        json!({ "rules": new_rules }),
    ))
}

/// Gap triggers for genesis suggestions, evaluated under the same reflect cadence
/// as rule extraction (§4.5).
#[derive(Clone, Debug)]
pub enum GenesisTrigger {
    FailingTool { tool: String, failures: u32, total: u32 },
    RepeatedFailureType { kind: FailureClass, count: u32 },
    UnhandledRequests { count: u32 },
}

pub fn scan_genesis_triggers(
    stats: &HashMap<String, ToolStats>,
    failure_classes: &[FailureClass],
    unhandled_count: u32,
) -> Vec<GenesisTrigger> {
    let mut triggers = Vec::new();
    for (tool, s) in stats {
        let total = s.success + s.failure;
        if s.failure >= 3 && s.fail_rate() > 0.6 {
            triggers.push(GenesisTrigger::FailingTool {
                tool: tool.clone(),
                failures: s.failure,
                total,
            });
        }
    }
    let mut class_counts: HashMap<FailureClass, u32> = HashMap::new();
    for class in failure_classes {
        *class_counts.entry(*class).or_insert(0) += 1;
    }
    for (kind, count) in class_counts {
        if count >= 3 {
            triggers.push(GenesisTrigger::RepeatedFailureType { kind, count });
        }
    }
    if unhandled_count >= 3 {
        triggers.push(GenesisTrigger::UnhandledRequests { count: unhandled_count });
    }
    triggers
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::IntentType;

    fn exp(tool: &str, success: bool) -> Experience {
        Experience::new("execute", "req", IntentType::Action, tool, success, 0.1, "result")
    }

    #[test]
    fn aggregate_counts_success_and_failure() {
        let experiences = vec![exp("X", true), exp("X", false), exp("X", false)];
        let stats = aggregate_tool_stats(&experiences);
        let s = stats.get("X").unwrap();
        assert_eq!(s.success, 1);
        assert_eq!(s.failure, 2);
    }

    #[test]
    fn build_rules_flags_high_failure_tool() {
        let mut stats = HashMap::new();
        stats.insert("X".to_string(), ToolStats { success: 1, failure: 4 });
        let rules = build_rules(&stats);
        assert!(rules.iter().any(|r| r.contains("AVOID") && r.contains('X')));
    }

    #[test]
    fn should_emit_rules_rejects_low_novelty() {
        let mut stats = HashMap::new();
        stats.insert("X".to_string(), ToolStats { success: 1, failure: 4 });
        let rules = build_rules(&stats);
        let recent = vec![rules.clone()];
        assert!(should_emit_rules(&rules, &recent, &stats).is_none());
    }

    #[test]
    fn scan_genesis_triggers_detects_failing_tool() {
        let mut stats = HashMap::new();
        stats.insert("X".to_string(), ToolStats { success: 1, failure: 4 });
        let triggers = scan_genesis_triggers(&stats, &[], 0);
        assert!(matches!(triggers[0], GenesisTrigger::FailingTool { .. }));
    }
}
