//! Wires the collaborators every subcommand needs: storage, dispatcher, permission
//! engine, learning recorder, regression gate, curiosity driver, the Autonomic Engine,
//! and the Pulse Executor. One `Runtime` per process invocation.

use std::collections::{HashMap, HashSet};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use core::autonomic::{AutonomicEngine, EngineDeps};
use core::curiosity::CuriosityDriver;
use core::dispatch::Dispatcher;
use core::error::CoreResult;
use core::external::llm::OpenAiCompatClient;
use core::external::web_search::HttpWebSearcher;
use core::external::LlmClient;
use core::learning::LearningRecorder;
use core::permission::{Decision, Mode, PermissionEngine};
use core::pulse::{AutoDenyApprovalChannel, PulseExecutor};
use core::regression::RegressionGate;
use core::storage::Storage;

use config::state::RuntimeConfig;

/// Built-in action ids the dispatcher handles directly (not via the subprocess tool
/// host). Anything else comes from a manifest file loaded at dispatch time.
pub const BUILTIN_ACTIONS: &[&str] = &[
    "FILE.READ.v1",
    "FILE.WRITE.v1",
    "FILE.APPEND.v1",
    "FILE.DELETE.v1",
    "FILE.LIST.v1",
    "CODE.EXEC.v1",
    "SHELL.EXEC.v1",
];

pub struct Runtime {
    pub storage: Storage,
    pub engine: Arc<AutonomicEngine>,
    pub pulse: PulseExecutor,
}

fn parse_overrides(raw: &str) -> HashMap<String, Decision> {
    let Ok(serde_json::Value::Object(map)) = serde_json::from_str::<serde_json::Value>(raw) else {
        return HashMap::new();
    };
    map.into_iter()
        .filter_map(|(k, v)| {
            let decision = match v.as_str()? {
                "allow" => Decision::Allow,
                "deny" => Decision::Deny,
                _ => Decision::Ask,
            };
            Some((k, decision))
        })
        .collect()
}

impl Runtime {
    pub fn build(work_root: &Path) -> CoreResult<Self> {
        let cfg = RuntimeConfig;
        let storage = Storage::new(work_root)?;

        let mode = Mode::parse(&cfg.permission_mode());
        let overrides = parse_overrides(&cfg.permission_overrides());
        let permission_engine = PermissionEngine::new(mode, overrides);
        let dispatcher = Dispatcher::new(permission_engine, work_root.to_path_buf());

        let learning = LearningRecorder::new(storage.clone());
        let regression = RegressionGate::new(
            storage.clone(),
            work_root.join("scripts/run_tests.sh"),
            Duration::from_secs(cfg.subprocess_timeout_secs()),
        );
        let curiosity = CuriosityDriver::new(storage.clone(), learning, regression.clone(), work_root.join("scripts/utils"));

        let llm: Arc<dyn LlmClient> =
            Arc::new(OpenAiCompatClient::new(cfg.model_name(), Some(&cfg.base_url()), cfg.api_key().as_deref()));
        let searcher = Arc::new(HttpWebSearcher::new(std::env::var("AUTONOMIC_WEB_SEARCH_URL").unwrap_or_else(|_| "http://localhost:8765/search".to_string())));

        let known_tools: HashSet<String> = BUILTIN_ACTIONS.iter().map(|s| s.to_string()).collect();

        let deps = EngineDeps {
            storage: storage.clone(),
            regression,
            curiosity,
            llm: llm.clone(),
            searcher,
            known_tools,
            scripts_dir: work_root.join("scripts"),
        };
        let engine = Arc::new(AutonomicEngine::new(deps, cfg.dev_explore())?);

        let pulse = PulseExecutor::new(dispatcher, storage.clone(), llm, Arc::new(AutoDenyApprovalChannel), work_root.join("logs"));
        if cfg.dev_explore() {
            pulse.set_dev_mode(true);
        }

        Ok(Self { storage, engine, pulse })
    }
}

