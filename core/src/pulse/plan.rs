//! Phase 2 — plan: detects multi-step requests and produces a step queue, either
//! deterministically or via an LLM-authored plan (§4.10 "Phase 2").

use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;

use crate::external::{LlmClient, LlmRequest};
use crate::pulse::intent::Intent;

static MULTISTEP_MARKER: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)(그리고 나서|그 다음|먼저.*그리고|첫번째.*두번째|^\s*\d+[.)]\s|then\b|after that|first.*then)").unwrap()
});

pub fn has_multistep_markers(text: &str) -> bool {
    MULTISTEP_MARKER.is_match(text)
}

#[derive(Clone, Debug)]
pub struct PlanStep {
    pub action_id: String,
    pub inputs: Value,
}

#[derive(Clone, Debug, Default)]
pub struct Plan {
    pub steps: Vec<PlanStep>,
}

impl Plan {
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn pop_front(&mut self) -> Option<PlanStep> {
        if self.steps.is_empty() {
            None
        } else {
            Some(self.steps.remove(0))
        }
    }
}

/// Deterministic fallback: one step per recognized action-id-shaped token found in the
/// text, in order of appearance. Used when the LLM plan call is skipped or fails.
static ACTION_TOKEN: Lazy<Regex> = Lazy::new(|| Regex::new(r"[A-Z][A-Z0-9_]*\.[A-Z][A-Z0-9_]*\.v[0-9]+").unwrap());

pub fn build_all_tools_plan(text: &str) -> Plan {
    let steps = ACTION_TOKEN
        .find_iter(text)
        .map(|m| PlanStep { action_id: m.as_str().to_string(), inputs: Value::Object(Default::default()) })
        .collect();
    Plan { steps }
}

/// Requests a plan from the LLM: a JSON array of `{action_id, inputs}` steps. Falls
/// back to an empty plan (not the deterministic plan — that's the caller's decision)
/// on any parse failure.
pub async fn request_llm_plan(llm: &dyn LlmClient, text: &str) -> Plan {
    let prompt = format!(
        "Break this multi-step request into an ordered list of tool actions.\n\
         Request: {text}\n\
         Reply with a JSON array: [{{\"action_id\": \"DOMAIN.ACTION.vN\", \"inputs\": {{}}}}, ...]"
    );
    let raw = llm.complete(LlmRequest::new(prompt)).await;
    let Some(Value::Array(items)) = crate::external::llm::extract_json(&raw) else {
        return Plan::default();
    };
    let steps = items
        .into_iter()
        .filter_map(|item| {
            let action_id = item.get("action_id")?.as_str()?.to_string();
            let inputs = item.get("inputs").cloned().unwrap_or(Value::Object(Default::default()));
            Some(PlanStep { action_id, inputs })
        })
        .collect();
    Plan { steps }
}

/// First step of a plan becomes the initial intent; the rest queue up (§4.10 "Phase 2").
pub fn plan_to_initial_intent(mut plan: Plan) -> (Option<Intent>, Plan) {
    match plan.pop_front() {
        Some(step) => (Some(Intent::action(step.action_id, step.inputs)), plan),
        None => (None, plan),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_numbered_list_marker() {
        assert!(has_multistep_markers("1. 파일 읽고 2. 삭제해줘"));
    }

    #[test]
    fn plain_request_has_no_marker() {
        assert!(!has_multistep_markers("오늘 날씨 알려줘"));
    }

    #[test]
    fn all_tools_plan_extracts_action_tokens_in_order() {
        let plan = build_all_tools_plan("먼저 FILE.READ.v1 하고 그다음 FILE.DELETE.v1");
        assert_eq!(plan.steps.len(), 2);
        assert_eq!(plan.steps[0].action_id, "FILE.READ.v1");
        assert_eq!(plan.steps[1].action_id, "FILE.DELETE.v1");
    }

    #[test]
    fn plan_to_initial_intent_pops_first_step() {
        let plan = Plan { steps: vec![PlanStep { action_id: "FILE.READ.v1".into(), inputs: Value::Null }] };
        let (intent, remaining) = plan_to_initial_intent(plan);
        assert!(intent.is_some());
        assert!(remaining.is_empty());
    }
}
