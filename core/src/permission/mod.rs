//! Three-tier allow/ask/deny permission resolution (§4.3).
//!
//! Modes: `open` (everything allow), `locked` (read-only allow, rest deny),
//! `supervised` (read-only allow, rest ask), `standard` (default, full resolution
//! chain). Session grants are process-wide and thread-safe; cleared on explicit
//! command or process restart.

use std::collections::{HashMap, HashSet};
use std::sync::RwLock;

use once_cell::sync::Lazy;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Decision {
    Allow,
    Ask,
    Deny,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Mode {
    Open,
    Locked,
    Supervised,
    Standard,
}

impl Mode {
    pub fn parse(s: &str) -> Mode {
        match s {
            "open" => Mode::Open,
            "locked" => Mode::Locked,
            "supervised" => Mode::Supervised,
            _ => Mode::Standard,
        }
    }
}

/// Side effects a manifest can declare for an action. Used to infer a decision when
/// no explicit default-map entry or override exists.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum SideEffect {
    FilesystemRead,
    FilesystemWrite,
    FilesystemDelete,
    NetworkIo,
    ProcExec,
    ProcessSpawn,
    ProcessIntrospection,
    DynamicLibraryLoad,
}

fn infer_from_side_effects(effects: &HashSet<SideEffect>) -> Decision {
    const BENIGN: [SideEffect; 2] = [SideEffect::FilesystemRead, SideEffect::ProcessIntrospection];
    if effects.is_empty() || effects.iter().all(|e| BENIGN.contains(e)) {
        Decision::Allow
    } else {
        Decision::Ask
    }
}

/// Pinned from the original Python system's default map (SPEC_FULL supplement 1):
/// read-only file/memory/util actions allow; code-exec/shell/network/genesis-compile/
/// project-build/pip-install-or-uninstall ask; pip-list and genesis-write-file allow.
static DEFAULT_PERMISSIONS: Lazy<HashMap<&'static str, Decision>> = Lazy::new(|| {
    use Decision::*;
    [
        ("FILE.READ.v1", Allow),
        ("FILE.LIST.v1", Allow),
        ("FILE.SEARCH.v1", Allow),
        ("FILE.DIFF.v1", Allow),
        ("MEMORY.QUERY.v1", Allow),
        ("MEMORY.APPEND.v1", Allow),
        ("UTIL.LIST.v1", Allow),
        ("UTIL.SAVE.v1", Allow),
        ("UTIL.RUN.v1", Allow),
        ("UTIL.DELETE.v1", Allow),
        ("UTIL.UPDATE.v1", Allow),
        ("CODE.EXEC.v1", Ask),
        ("NET.WEB_SEARCH.v1", Allow),
        ("FILE.WRITE.v1", Allow),
        ("FILE.EDIT.v1", Allow),
        ("FILE.APPEND.v1", Allow),
        ("PROJECT.CREATE.v1", Allow),
        ("FILE.DELETE.v1", Ask),
        ("SHELL.EXEC.v1", Ask),
        ("NET.HTTP_GET.v1", Ask),
        ("GENESIS.COMPILE_SHARED.v1", Ask),
        ("GENESIS.LOAD_PLUGIN.v1", Ask),
        ("PROJECT.BUILD.v1", Ask),
        ("SYSTEM.PIP_INSTALL.v1", Ask),
        ("SYSTEM.PIP_UNINSTALL.v1", Ask),
        ("SYSTEM.PIP_LIST.v1", Allow),
        ("GENESIS.WRITE_FILE.v1", Allow),
    ]
    .into_iter()
    .collect()
});

static READONLY_ACTIONS: Lazy<HashSet<&'static str>> = Lazy::new(|| {
    [
        "FILE.READ.v1",
        "FILE.LIST.v1",
        "FILE.SEARCH.v1",
        "FILE.DIFF.v1",
        "MEMORY.QUERY.v1",
        "UTIL.LIST.v1",
        "SYSTEM.PIP_LIST.v1",
    ]
    .into_iter()
    .collect()
});

#[derive(Default)]
struct State {
    mode: Option<Mode>,
    session_grants: HashSet<String>,
    env_overrides: HashMap<String, Decision>,
}

/// Process-wide permission resolver. Cheap to clone (all state is behind an `Arc`-like
/// `RwLock` held internally via `Lazy` per-process singleton semantics through
/// `PermissionEngine::global`, but tests should construct their own instance).
pub struct PermissionEngine {
    state: RwLock<State>,
}

impl PermissionEngine {
    pub fn new(mode: Mode, overrides: HashMap<String, Decision>) -> Self {
        Self {
            state: RwLock::new(State {
                mode: Some(mode),
                session_grants: HashSet::new(),
                env_overrides: overrides,
            }),
        }
    }

    pub fn mode(&self) -> Mode {
        self.state.read().unwrap().mode.unwrap_or(Mode::Standard)
    }

    pub fn set_mode(&self, mode: Mode) {
        self.state.write().unwrap().mode = Some(mode);
    }

    pub fn grant_session(&self, action_id: &str) {
        self.state.write().unwrap().session_grants.insert(action_id.to_string());
    }

    pub fn clear_session(&self) {
        self.state.write().unwrap().session_grants.clear();
    }

    /// Resolves an action identifier to a decision. `side_effects` is the manifest's
    /// declared side-effect set, used only when no default-map entry matches.
    pub fn check(&self, action_id: &str, side_effects: &HashSet<SideEffect>) -> Decision {
        let state = self.state.read().unwrap();
        let mode = state.mode.unwrap_or(Mode::Standard);

        match mode {
            Mode::Open => return Decision::Allow,
            Mode::Locked => {
                return if READONLY_ACTIONS.contains(action_id) {
                    Decision::Allow
                } else {
                    Decision::Deny
                };
            }
            Mode::Supervised => {
                return if READONLY_ACTIONS.contains(action_id) {
                    Decision::Allow
                } else {
                    Decision::Ask
                };
            }
            Mode::Standard => {}
        }

        if state.session_grants.contains(action_id) {
            return Decision::Allow;
        }
        if let Some(decision) = state.env_overrides.get(action_id) {
            return *decision;
        }
        if let Some(decision) = DEFAULT_PERMISSIONS.get(action_id) {
            return *decision;
        }
        if !side_effects.is_empty() {
            return infer_from_side_effects(side_effects);
        }
        // Unknown action, no manifest inference: default to ask, never allow or deny
        // (SPEC_FULL supplement 1).
        Decision::Ask
    }

    /// Human-readable approval prompt for an `ask` decision (SPEC_FULL supplement 2).
    pub fn format_approval(&self, action_id: &str, inputs: &serde_json::Value) -> String {
        match action_id {
            "SHELL.EXEC.v1" => format!(
                "쉘 명령을 실행하려고 합니다: `{}`\n승인하시겠습니까?",
                inputs.get("cmd").and_then(|v| v.as_str()).unwrap_or("?")
            ),
            "CODE.EXEC.v1" => format!(
                "코드를 실행하려고 합니다 ({}):\n```\n{}\n```\n승인하시겠습니까?",
                inputs.get("lang").and_then(|v| v.as_str()).unwrap_or("?"),
                inputs.get("code").and_then(|v| v.as_str()).unwrap_or("?")
            ),
            "FILE.DELETE.v1" => format!(
                "파일을 삭제하려고 합니다: `{}`\n승인하시겠습니까?",
                inputs.get("path").and_then(|v| v.as_str()).unwrap_or("?")
            ),
            "NET.HTTP_GET.v1" => format!(
                "외부 네트워크에 접속하려고 합니다: `{}`\n승인하시겠습니까?",
                inputs.get("url").and_then(|v| v.as_str()).unwrap_or("?")
            ),
            other => format!("`{other}` 작업을 실행하려고 합니다. 승인하시겠습니까?"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_map_matches_pinned_decisions() {
        let engine = PermissionEngine::new(Mode::Standard, HashMap::new());
        assert_eq!(engine.check("FILE.READ.v1", &HashSet::new()), Decision::Allow);
        assert_eq!(engine.check("SHELL.EXEC.v1", &HashSet::new()), Decision::Ask);
        assert_eq!(engine.check("SYSTEM.PIP_LIST.v1", &HashSet::new()), Decision::Allow);
    }

    #[test]
    fn unknown_action_defaults_to_ask() {
        let engine = PermissionEngine::new(Mode::Standard, HashMap::new());
        assert_eq!(engine.check("UNKNOWN.FOO.v1", &HashSet::new()), Decision::Ask);
    }

    #[test]
    fn locked_mode_denies_non_readonly() {
        let engine = PermissionEngine::new(Mode::Locked, HashMap::new());
        assert_eq!(engine.check("SHELL.EXEC.v1", &HashSet::new()), Decision::Deny);
        assert_eq!(engine.check("FILE.READ.v1", &HashSet::new()), Decision::Allow);
    }

    #[test]
    fn session_grant_then_revoke_returns_to_default() {
        let engine = PermissionEngine::new(Mode::Standard, HashMap::new());
        assert_eq!(engine.check("SHELL.EXEC.v1", &HashSet::new()), Decision::Ask);
        engine.grant_session("SHELL.EXEC.v1");
        assert_eq!(engine.check("SHELL.EXEC.v1", &HashSet::new()), Decision::Allow);
        engine.clear_session();
        assert_eq!(engine.check("SHELL.EXEC.v1", &HashSet::new()), Decision::Ask);
    }

    #[test]
    fn side_effect_inference_for_unmapped_action() {
        let engine = PermissionEngine::new(Mode::Standard, HashMap::new());
        let mut effects = HashSet::new();
        effects.insert(SideEffect::FilesystemRead);
        assert_eq!(engine.check("CUSTOM.READ.v1", &effects), Decision::Allow);

        let mut write_effects = HashSet::new();
        write_effects.insert(SideEffect::FilesystemWrite);
        assert_eq!(engine.check("CUSTOM.WRITE.v1", &write_effects), Decision::Ask);
    }
}
