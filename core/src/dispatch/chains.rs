//! Named multi-step recipes: a single dispatch call executing a sequence of actions
//! with output threading; errors halt the chain (§4.4 "Chains").

use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Clone, Debug, Deserialize)]
pub struct ChainStep {
    pub action_id: String,
    /// Template inputs; `"$prev"` anywhere in a string value is replaced with the
    /// previous step's output before dispatch.
    pub inputs: Value,
}

#[derive(Clone, Debug, Serialize)]
pub struct ChainStepResult {
    pub action_id: String,
    pub output: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

pub fn thread_inputs(inputs: &Value, prev_output: &str) -> Value {
    match inputs {
        Value::String(s) if s == "$prev" => Value::String(prev_output.to_string()),
        Value::String(s) => Value::String(s.replace("$prev", prev_output)),
        Value::Object(map) => {
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.clone(), thread_inputs(v, prev_output));
            }
            Value::Object(out)
        }
        Value::Array(items) => Value::Array(items.iter().map(|v| thread_inputs(v, prev_output)).collect()),
        other => other.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn threads_previous_output_into_string_field() {
        let templated = json!({"path": "$prev/out.txt"});
        let result = thread_inputs(&templated, "work");
        assert_eq!(result["path"], "work/out.txt");
    }
}
