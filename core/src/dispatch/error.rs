//! Structured dispatch error record (§4.4, §7).

use serde::{Deserialize, Serialize};

use crate::error::ErrorKind;
use crate::storage::record::truncate_chars;

const HINT_MAX_LEN: usize = 300;

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DispatchError {
    pub error: bool,
    pub action_id: String,
    pub kind: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

impl DispatchError {
    pub fn new(action_id: impl Into<String>, kind: ErrorKind, detail: impl AsRef<str>) -> Self {
        let mut err = Self {
            error: true,
            action_id: action_id.into(),
            kind: kind.to_string(),
            detail: truncate_chars(detail.as_ref(), 2000),
            hint: None,
        };
        err.hint = lookup_hint(&err.detail);
        err
    }
}

/// Substring-match table mapping error output fragments to actionable hints for the
/// LLM's next step (§4.4 "Error hints").
fn lookup_hint(detail: &str) -> Option<String> {
    let lower = detail.to_lowercase();
    let table: &[(&str, &str)] = &[
        ("permission denied", "권한 문제입니다. 샌드박스 경로(work/) 내부인지 확인하세요."),
        ("no such file", "경로를 다시 확인하세요. FILE.LIST로 존재 여부를 확인할 수 있습니다."),
        ("connection refused", "네트워크 대상에 연결할 수 없습니다. URL 또는 서비스 상태를 확인하세요."),
        ("timed out", "시간 초과되었습니다. 더 작은 작업으로 나누어 재시도하세요."),
        ("syntaxerror", "코드 문법 오류입니다. 들여쓰기와 괄호를 확인하세요."),
        ("modulenotfounderror", "필요한 패키지가 설치되어 있지 않습니다. SYSTEM.PIP_INSTALL을 고려하세요."),
    ];
    table
        .iter()
        .find(|(needle, _)| lower.contains(needle))
        .map(|(_, hint)| truncate_chars(hint, HINT_MAX_LEN))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attaches_hint_for_known_substring() {
        let err = DispatchError::new("SHELL.EXEC.v1", ErrorKind::ToolError, "bash: permission denied");
        assert!(err.hint.is_some());
    }

    #[test]
    fn no_hint_for_unknown_error() {
        let err = DispatchError::new("SHELL.EXEC.v1", ErrorKind::ToolError, "something weird happened");
        assert!(err.hint.is_none());
    }
}
