//! Curiosity Driver: scans capability gaps, synthesizes a candidate skill, executes it
//! in sandbox, gates it, and records or rolls back (§4.8).

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::dispatch::code_safety::check_blocklist;
use crate::error::CoreResult;
use crate::learning::LearningRecorder;
use crate::regression::RegressionGate;
use crate::storage::record::{sha256_hex, Experience, Skill};
use crate::storage::{Storage, Stream};

#[derive(Clone, Debug)]
pub enum Gap {
    HighFailureTool { tool: String, uses: u32, fail_rate: f64 },
    UnhandledCapability { count: u32 },
    UntestedTool { tool: String },
}

/// Gap scan over the last 200 experiences plus the manifest-declared tool set
/// (§4.8 "Gap scan").
pub fn scan_gaps(experiences: &[Experience], known_tools: &HashSet<String>) -> Vec<Gap> {
    let window: &[Experience] = if experiences.len() > 200 { &experiences[experiences.len() - 200..] } else { experiences };

    let mut per_tool: HashMap<String, (u32, u32)> = HashMap::new();
    let mut unhandled = 0u32;
    for exp in window {
        if exp.tool_used.is_empty() {
            unhandled += 1;
            continue;
        }
        let entry = per_tool.entry(exp.tool_used.clone()).or_insert((0, 0));
        entry.0 += 1;
        if !exp.success {
            entry.1 += 1;
        }
    }

    let mut gaps = Vec::new();
    for (tool, (uses, failures)) in &per_tool {
        let fail_rate = *failures as f64 / *uses as f64;
        if *uses >= 3 && fail_rate > 0.4 {
            gaps.push(Gap::HighFailureTool { tool: tool.clone(), uses: *uses, fail_rate });
        }
    }
    if unhandled >= 3 {
        gaps.push(Gap::UnhandledCapability { count: unhandled });
    }
    for tool in known_tools {
        if !per_tool.contains_key(tool) {
            gaps.push(Gap::UntestedTool { tool: tool.clone() });
        }
    }
    gaps
}

#[derive(Clone, Debug)]
pub struct Goal {
    pub name: String,
    pub lang: String,
    pub code: String,
    pub description: String,
}

/// Validates an LLM-proposed goal's JSON; on parse failure or missing fields returns
/// a deterministic fallback templated from the gap, so the curiosity loop never
/// dead-ends (§4.8 "Goal synthesis").
pub fn synthesize_goal(gap: &Gap, llm_response: Option<&serde_json::Value>) -> Goal {
    if let Some(value) = llm_response {
        if let (Some(name), Some(lang), Some(code)) = (
            value.get("name").and_then(|v| v.as_str()),
            value.get("lang").and_then(|v| v.as_str()),
            value.get("code").and_then(|v| v.as_str()),
        ) {
            return Goal {
                name: name.to_string(),
                lang: lang.to_string(),
                code: code.to_string(),
                description: value.get("description").and_then(|v| v.as_str()).unwrap_or("").to_string(),
            };
        }
    }
    fallback_goal(gap)
}

fn fallback_goal(gap: &Gap) -> Goal {
    match gap {
        Gap::HighFailureTool { tool, uses, fail_rate } => Goal {
            name: format!("diagnose_{}", tool.to_lowercase().replace('.', "_")),
            lang: "python".to_string(),
            code: format!(
                "failures = {uses}\nfail_rate = {fail_rate:.2}\nprint(f\"tool={tool} uses={{failures}} fail_rate={{fail_rate}}\")"
            ),
            description: format!("diagnostic summary for high-failure tool {tool}"),
        },
        Gap::UnhandledCapability { count } => Goal {
            name: "coverage_planner".to_string(),
            lang: "python".to_string(),
            code: format!("unhandled = {count}\nprint(f\"unhandled requests: {{unhandled}}\")"),
            description: "plan coverage for unhandled request patterns".to_string(),
        },
        Gap::UntestedTool { tool } => Goal {
            name: format!("histogram_{}", tool.to_lowercase().replace('.', "_")),
            lang: "python".to_string(),
            code: format!("tool = \"{tool}\"\nprint(f\"request-token histogram stub for {{tool}}\")"),
            description: format!("request-token histogram for untested tool {tool}"),
        },
    }
}

const DOMAIN_WHITELIST: &[&str] = &["diagnose", "coverage", "histogram", "repair", "monitor", "report"];

/// Deterministic relevance gate (§4.8): rejects goals whose name shares no token
/// with the domain whitelist, whose code is too short/long, or whose hash matches an
/// existing skill.
pub fn passes_relevance_gate(goal: &Goal, existing_skill_hashes: &HashSet<String>) -> bool {
    let name_lower = goal.name.to_lowercase();
    if !DOMAIN_WHITELIST.iter().any(|w| name_lower.contains(w)) {
        return false;
    }
    if goal.code.len() < 30 || goal.code.len() > 10_000 {
        return false;
    }
    let hash = sha256_hex(goal.code.as_bytes());
    !existing_skill_hashes.contains(&hash)
}

pub struct RateLimiter {
    max_per_day: u32,
    cooldown: Duration,
    runs_today: u32,
    day_bucket: i64,
    last_run: Option<Instant>,
}

impl RateLimiter {
    pub fn new(max_per_day: u32, cooldown: Duration) -> Self {
        Self { max_per_day, cooldown, runs_today: 0, day_bucket: 0, last_run: None }
    }

    pub fn can_run(&mut self, now_ms: i64) -> bool {
        let bucket = now_ms / 86_400_000;
        if bucket != self.day_bucket {
            self.day_bucket = bucket;
            self.runs_today = 0;
        }
        if self.runs_today >= self.max_per_day {
            return false;
        }
        if let Some(last) = self.last_run {
            if last.elapsed() < self.cooldown {
                return false;
            }
        }
        true
    }

    pub fn record_run(&mut self) {
        self.runs_today += 1;
        self.last_run = Some(Instant::now());
    }
}

pub struct CuriosityDriver {
    storage: Storage,
    learning: LearningRecorder,
    regression: RegressionGate,
    utils_dir: PathBuf,
}

pub enum CuriosityOutcome {
    Recorded { skill_name: String },
    Rejected { reason: String },
    NoGap,
}

impl CuriosityDriver {
    pub fn new(storage: Storage, learning: LearningRecorder, regression: RegressionGate, utils_dir: PathBuf) -> Self {
        Self { storage, learning, regression, utils_dir }
    }

    pub async fn run_cycle(&self, known_tools: &HashSet<String>) -> CoreResult<CuriosityOutcome> {
        let experiences: Vec<Experience> = self.storage.read(Stream::Experiences, Some(200))?;
        let gaps = scan_gaps(&experiences, known_tools);
        let Some(top_gap) = gaps.into_iter().next() else {
            return Ok(CuriosityOutcome::NoGap);
        };

        let goal = synthesize_goal(&top_gap, None);
        let existing_skills: Vec<Skill> = self.storage.read(Stream::Skills, None)?;
        let existing_hashes: HashSet<String> = existing_skills.into_iter().map(|s| s.code_hash).collect();

        if !passes_relevance_gate(&goal, &existing_hashes) {
            return Ok(CuriosityOutcome::Rejected { reason: "failed relevance gate".to_string() });
        }
        if check_blocklist(&goal.code).is_some() {
            return Ok(CuriosityOutcome::Rejected { reason: "failed safety blocklist".to_string() });
        }

        let safe_name: String = goal.name.chars().filter(|c| c.is_alphanumeric() || *c == '_').collect();
        std::fs::create_dir_all(&self.utils_dir)?;
        let script_path = self.utils_dir.join(format!("{safe_name}.py"));
        std::fs::write(&script_path, &goal.code)?;

        let run_result = self.regression.run().await?;
        let baseline = self.regression.ensure_baseline()?;
        if self.regression.check(&run_result, &baseline) {
            self.regression.accept(&run_result)?;
            self.learning.record_skill(&goal.name, &goal.lang, &goal.code, &goal.description, "accepted", vec!["curiosity".into()])?;
            self.storage.append(
                Stream::AutonomicAudit,
                &crate::storage::record::AuditEvent::new("curiosity", true, json!({"goal": goal.name}).to_string()),
            )?;
            Ok(CuriosityOutcome::Recorded { skill_name: goal.name })
        } else {
            let _ = std::fs::remove_file(&script_path);
            Ok(CuriosityOutcome::Rejected { reason: "regression gate rejected".to_string() })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::record::IntentType;

    fn exp(tool: &str, success: bool) -> Experience {
        Experience::new("execute", "req", IntentType::Action, tool, success, 0.1, "out")
    }

    #[test]
    fn scan_gaps_flags_high_failure_tool() {
        let experiences = vec![exp("X", false), exp("X", false), exp("X", false), exp("X", true)];
        let gaps = scan_gaps(&experiences, &HashSet::new());
        assert!(gaps.iter().any(|g| matches!(g, Gap::HighFailureTool { tool, .. } if tool == "X")));
    }

    #[test]
    fn relevance_gate_rejects_off_domain_name() {
        let goal = Goal { name: "random_thing".into(), lang: "python".into(), code: "x".repeat(40), description: String::new() };
        assert!(!passes_relevance_gate(&goal, &HashSet::new()));
    }

    #[test]
    fn relevance_gate_rejects_existing_hash() {
        let code = "print('diagnose something useful here please')".to_string();
        let goal = Goal { name: "diagnose_x".into(), lang: "python".into(), code: code.clone(), description: String::new() };
        let mut hashes = HashSet::new();
        hashes.insert(sha256_hex(code.as_bytes()));
        assert!(!passes_relevance_gate(&goal, &hashes));
    }

    #[test]
    fn rate_limiter_resets_daily() {
        let mut limiter = RateLimiter::new(1, Duration::from_secs(0));
        assert!(limiter.can_run(0));
        limiter.record_run();
        assert!(!limiter.can_run(0));
        assert!(limiter.can_run(86_400_000));
    }
}
