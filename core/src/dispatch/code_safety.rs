//! Auto-fix and safety-blocklist pipeline for locally-executed code (§4.4, §9).

use once_cell::sync::Lazy;
use regex::Regex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockReason {
    Dangerous,
    Network,
}

/// Six-layer auto-fix pass, applied before the safety blocklist check.
pub fn auto_fix(code: &str, lang: &str) -> String {
    let mut fixed = strip_markdown_fences(code);
    if lang == "python" {
        fixed = replace_input_calls(&fixed);
        fixed = fix_missing_block_colons(&fixed);
    }
    fixed = trim_trailing_broken_lines(&fixed);
    if lang == "python" {
        fixed = inject_print_for_bare_assignment(&fixed);
    }
    fixed
}

fn strip_markdown_fences(code: &str) -> String {
    let trimmed = code.trim();
    if let Some(rest) = trimmed.strip_prefix("```") {
        let without_lang = rest
            .splitn(2, '\n')
            .nth(1)
            .unwrap_or(rest);
        without_lang.trim_end().trim_end_matches("```").trim().to_string()
    } else {
        trimmed.to_string()
    }
}

fn replace_input_calls(code: &str) -> String {
    static INPUT_CALL: Lazy<Regex> = Lazy::new(|| Regex::new(r#"input\s*\([^)]*\)"#).unwrap());
    INPUT_CALL.replace_all(code, "\"\"").to_string()
}

fn fix_missing_block_colons(code: &str) -> String {
    static BLOCK_KEYWORD: Lazy<Regex> = Lazy::new(|| {
        Regex::new(r"^(\s*)(if|elif|else|for|while|def|class|try|except|finally|with)\b(.*[^:\s])\s*$").unwrap()
    });
    code.lines()
        .map(|line| {
            if let Some(caps) = BLOCK_KEYWORD.captures(line) {
                if !line.trim_end().ends_with(':') {
                    format!("{}{}{}:", &caps[1], &caps[2], &caps[3])
                } else {
                    line.to_string()
                }
            } else {
                line.to_string()
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn trim_trailing_broken_lines(code: &str) -> String {
    let mut lines: Vec<&str> = code.lines().collect();
    while let Some(last) = lines.last() {
        let trimmed = last.trim_end();
        let unbalanced = trimmed.ends_with(['(', '[', '{', ',', '\\']);
        if trimmed.is_empty() || unbalanced {
            lines.pop();
        } else {
            break;
        }
    }
    lines.join("\n")
}

fn inject_print_for_bare_assignment(code: &str) -> String {
    if code.contains("print(") {
        return code.to_string();
    }
    static ASSIGNMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([A-Za-z_][A-Za-z0-9_]*)\s*=\s*[^=].*$").unwrap());
    let last_line = match code.lines().last() {
        Some(l) => l,
        None => return code.to_string(),
    };
    if let Some(caps) = ASSIGNMENT.captures(last_line.trim()) {
        format!("{code}\nprint({})", &caps[1])
    } else {
        code.to_string()
    }
}

/// Patterns covering process spawn, arbitrary-string eval/exec, importlib/ctypes/
/// pickle/socket/network modules, filesystem mutation outside the sandbox, and
/// indirect-variable-mode `open()` (§4.4 "Code safety").
static DANGEROUS_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bos\.system\s*\(",
        r"\bsubprocess\.",
        r"\bexec\s*\(",
        r"\beval\s*\(",
        r"\b__import__\s*\(",
        r"\bimportlib\b",
        r"\bctypes\b",
        r"\bpickle\.loads\b",
        r"\bos\.remove\s*\(",
        r"\bos\.rmdir\s*\(",
        r"\bshutil\.rmtree\s*\(",
        r"open\s*\(\s*[A-Za-z_][A-Za-z0-9_]*\s*,\s*['\"]w",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

static NETWORK_PATTERNS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"\bsocket\.",
        r"\burllib\.",
        r"\brequests\.",
        r"\bhttp\.client\b",
        r"\bftplib\b",
    ]
    .iter()
    .map(|p| Regex::new(p).unwrap())
    .collect()
});

fn normalize(code: &str) -> String {
    code.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Returns `Some(reason)` if the normalized code matches any blocklist pattern.
/// Bypassable only by the caller setting `caller_approved` after a user approval
/// round-trip; that check happens above this function, in dispatch.
pub fn check_blocklist(code: &str) -> Option<BlockReason> {
    let normalized = normalize(code);
    if DANGEROUS_PATTERNS.iter().any(|re| re.is_match(&normalized)) {
        return Some(BlockReason::Dangerous);
    }
    if NETWORK_PATTERNS.iter().any(|re| re.is_match(&normalized)) {
        return Some(BlockReason::Network);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_markdown_fence() {
        let code = "```python\nprint(1)\n```";
        assert_eq!(auto_fix(code, "python"), "print(1)");
    }

    #[test]
    fn injects_print_for_bare_assignment() {
        let fixed = auto_fix("x = 1 + 2", "python");
        assert!(fixed.ends_with("print(x)"));
    }

    #[test]
    fn does_not_double_inject_print() {
        let fixed = auto_fix("x = 1\nprint(x)", "python");
        assert_eq!(fixed.matches("print(").count(), 1);
    }

    #[test]
    fn blocks_subprocess_call() {
        assert_eq!(check_blocklist("import subprocess\nsubprocess.run(['ls'])"), Some(BlockReason::Dangerous));
    }

    #[test]
    fn blocks_network_module() {
        assert_eq!(check_blocklist("import socket\ns = socket.socket()"), Some(BlockReason::Network));
    }

    #[test]
    fn allows_benign_code() {
        assert_eq!(check_blocklist("a, b = 0, 1\nfor _ in range(10):\n    print(a, end=' ')\n    a, b = b, a + b"), None);
    }

    #[test]
    fn trims_trailing_unbalanced_line() {
        let fixed = trim_trailing_broken_lines("x = 1\ny = (1 +");
        assert_eq!(fixed, "x = 1");
    }
}
