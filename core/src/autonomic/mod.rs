//! Autonomic Engine: heartbeat-driven scheduler for the six background levels plus
//! burst-mode priority work (§4.9). The single place that decides "what runs now".

pub mod burst;
pub mod constants;
pub mod levels;
pub mod stasis;

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{error, info, warn};

use crate::curiosity::CuriosityDriver;
use crate::error::CoreResult;
use crate::external::{LlmClient, WebSearcher};
use crate::gvu::{IntentClassifier, SelfQuestioner};
use crate::regression::RegressionGate;
use crate::storage::Storage;

use burst::{pick_next_action, BurstAction, BurstControl, BurstSession, LevelReadiness};
use constants::{profile_for, TimingProfile};
use levels::LevelOutcome;
use stasis::{state_hash, StasisDetector};

const STATE_FILE: &str = "autonomic_state.json";
const ALERT_QUEUE_MAX: usize = 50;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Level {
    Reflect,
    Test,
    Heal,
    Hygiene,
    Curiosity,
    WebExplore,
    Burst,
}

impl Level {
    pub fn key(&self) -> &'static str {
        match self {
            Level::Reflect => "reflect",
            Level::Test => "test",
            Level::Heal => "heal",
            Level::Hygiene => "hygiene",
            Level::Curiosity => "curiosity",
            Level::WebExplore => "web_explore",
            Level::Burst => "_burst",
        }
    }
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct PersistedEngineState {
    level_done: HashMap<String, i64>,
    saved_ts: i64,
}

#[derive(Clone, Debug)]
pub struct EngineStatus {
    pub dev_explore: bool,
    pub paused: bool,
    pub stasis_active: bool,
    pub idle_seconds: u64,
    pub level_done: HashMap<String, i64>,
    pub pending_alerts: usize,
}

/// Collaborators the engine drives each tick. Everything here is a trait object or a
/// cheaply-cloneable handle so the engine itself stays `Send + Sync`.
pub struct EngineDeps {
    pub storage: Storage,
    pub regression: RegressionGate,
    pub curiosity: CuriosityDriver,
    pub llm: Arc<dyn LlmClient>,
    pub searcher: Arc<dyn WebSearcher>,
    pub known_tools: HashSet<String>,
    pub scripts_dir: PathBuf,
}

pub struct AutonomicEngine {
    deps: EngineDeps,
    questioner: AsyncMutex<SelfQuestioner>,
    dev_explore: AtomicBool,
    paused: AtomicBool,
    last_touch: StdMutex<Instant>,
    level_done: StdMutex<HashMap<String, i64>>,
    stasis: StdMutex<StasisDetector>,
    tick_lock: AsyncMutex<()>,
    alerts: StdMutex<VecDeque<String>>,
}

fn epoch_ms() -> i64 {
    std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).map(|d| d.as_millis() as i64).unwrap_or(0)
}

impl AutonomicEngine {
    pub fn new(deps: EngineDeps, dev_explore: bool) -> CoreResult<Self> {
        let profile = profile_for(dev_explore);
        let persisted: PersistedEngineState = deps.storage.read_single(STATE_FILE)?.unwrap_or_default();
        Ok(Self {
            questioner: AsyncMutex::new(SelfQuestioner::new(deps.storage.clone())),
            stasis: StdMutex::new(StasisDetector::new(profile.stasis_threshold, Duration::from_secs(profile.stasis_max_sec))),
            deps,
            dev_explore: AtomicBool::new(dev_explore),
            paused: AtomicBool::new(false),
            last_touch: StdMutex::new(Instant::now()),
            level_done: StdMutex::new(persisted.level_done),
            tick_lock: AsyncMutex::new(()),
            alerts: StdMutex::new(VecDeque::new()),
        })
    }

    fn profile(&self) -> TimingProfile {
        profile_for(self.dev_explore.load(Ordering::SeqCst))
    }

    pub fn touch(&self) {
        *self.last_touch.lock().unwrap() = Instant::now();
    }

    pub fn idle_seconds(&self) -> u64 {
        self.last_touch.lock().unwrap().elapsed().as_secs()
    }

    pub fn set_mode(&self, dev_explore: bool) {
        self.dev_explore.store(dev_explore, Ordering::SeqCst);
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    fn push_alert(&self, message: impl Into<String>) {
        let mut alerts = self.alerts.lock().unwrap();
        if alerts.len() >= ALERT_QUEUE_MAX {
            alerts.pop_front();
        }
        alerts.push_back(message.into());
    }

    /// Drains queued alerts outside the tick thread, one send attempt with up to 3x
    /// exponential-backoff retry per message (§4.9 "Alerts").
    pub async fn drain_alerts(&self, mut send: impl FnMut(&str) -> bool) {
        let pending: Vec<String> = {
            let mut alerts = self.alerts.lock().unwrap();
            alerts.drain(..).collect()
        };
        for message in pending {
            let mut delay = Duration::from_millis(200);
            let mut delivered = false;
            for _ in 0..3 {
                if send(&message) {
                    delivered = true;
                    break;
                }
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
            if !delivered {
                warn!(message = %message, "alert delivery failed after retries");
            }
        }
    }

    fn level_done_at(&self, level: Level) -> i64 {
        *self.level_done.lock().unwrap().get(level.key()).unwrap_or(&0)
    }

    fn mark_done(&self, level: Level, at_ms: i64) {
        self.level_done.lock().unwrap().insert(level.key().to_string(), at_ms);
    }

    fn eligible(&self, level: Level, idle_s: u64, now_ms: i64, timing: constants::LevelTiming) -> bool {
        idle_s >= timing.idle_sec && (now_ms - self.level_done_at(level)) as u64 >= timing.rate_sec * 1000
    }

    fn persist_state(&self) -> CoreResult<()> {
        let state = PersistedEngineState { level_done: self.level_done.lock().unwrap().clone(), saved_ts: epoch_ms() };
        self.deps.storage.write_single(STATE_FILE, &state)
    }

    pub fn get_status(&self) -> EngineStatus {
        EngineStatus {
            dev_explore: self.dev_explore.load(Ordering::SeqCst),
            paused: self.paused.load(Ordering::SeqCst),
            stasis_active: self.stasis.lock().unwrap().is_active(),
            idle_seconds: self.idle_seconds(),
            level_done: self.level_done.lock().unwrap().clone(),
            pending_alerts: self.alerts.lock().unwrap().len(),
        }
    }

    /// One heartbeat: refreshes the stasis window, runs every eligible level handler
    /// in documented order, then attempts a burst session if idle long enough.
    /// Serialized via `tick_lock` so only one tick runs at a time (§4.9 "Heartbeat").
    pub async fn tick(&self, abort_check: &(dyn Fn() -> bool + Sync)) -> CoreResult<()> {
        let _guard = self.tick_lock.lock().await;
        if self.paused.load(Ordering::SeqCst) {
            return Ok(());
        }

        let profile = self.profile();
        let now_ms = epoch_ms();
        let idle_s = self.idle_seconds();

        let skills_count = self.deps.storage.read::<crate::storage::record::Skill>(crate::storage::Stream::Skills, None)?.len() as u64;
        let experiences: Vec<crate::storage::record::Experience> =
            self.deps.storage.read(crate::storage::Stream::Experiences, Some(200))?;
        let insights_count = self.deps.storage.read::<crate::storage::record::Insight>(crate::storage::Stream::Insights, None)?.len() as u64;
        let success_rate = if experiences.is_empty() {
            1.0
        } else {
            experiences.iter().filter(|e| e.success).count() as f64 / experiences.len() as f64
        };
        let hash = state_hash(skills_count, experiences.len() as u64, insights_count, success_rate, now_ms);
        let stasis_active = self.stasis.lock().unwrap().observe(hash);

        if self.eligible(Level::Reflect, idle_s, now_ms, profile.reflect) {
            match levels::reflect(&self.deps.storage).await {
                Ok(outcome) => self.note_outcome(Level::Reflect, outcome, now_ms),
                Err(e) => self.note_error("reflect", e),
            }
        }

        if !stasis_active {
            if self.eligible(Level::Test, idle_s, now_ms, profile.test) {
                let classify: Box<IntentClassifier> = Box::new(|_text: &str| "action".to_string());
                let mut questioner = self.questioner.lock().await;
                match levels::test_and_learn(&self.deps.storage, &self.deps.regression, &mut questioner, &*classify, || abort_check())
                    .await
                {
                    Ok(outcome) => self.note_outcome(Level::Test, outcome, now_ms),
                    Err(e) => self.note_error("test", e),
                }
            }
            if self.eligible(Level::Heal, idle_s, now_ms, profile.heal) {
                match levels::heal(&self.deps.storage, &self.deps.regression).await {
                    Ok(outcome) => self.note_outcome(Level::Heal, outcome, now_ms),
                    Err(e) => self.note_error("heal", e),
                }
            }
        }

        let hygiene_timing = constants::LevelTiming { idle_sec: 0, rate_sec: profile.hygiene_rate_sec };
        if self.eligible(Level::Hygiene, idle_s, now_ms, hygiene_timing) {
            match levels::hygiene(&self.deps.storage, &self.deps.scripts_dir).await {
                Ok(outcome) => self.note_outcome(Level::Hygiene, outcome, now_ms),
                Err(e) => self.note_error("hygiene", e),
            }
        }

        let curiosity_rate = if stasis_active { profile.stasis_curiosity_rate_sec } else { profile.curiosity.rate_sec };
        let curiosity_timing = constants::LevelTiming { idle_sec: profile.curiosity.idle_sec, rate_sec: curiosity_rate };
        if self.eligible(Level::Curiosity, idle_s, now_ms, curiosity_timing) {
            match levels::curiosity(&self.deps.storage, &self.deps.curiosity, &self.deps.known_tools).await {
                Ok(outcome) => {
                    if outcome == LevelOutcome::Productive {
                        self.stasis.lock().unwrap().reset();
                    }
                    self.note_outcome(Level::Curiosity, outcome, now_ms);
                }
                Err(e) => self.note_error("curiosity", e),
            }
        }

        let web_explore_timing = constants::LevelTiming { idle_sec: 0, rate_sec: profile.web_explore_rate_sec };
        if self.eligible(Level::WebExplore, idle_s, now_ms, web_explore_timing) {
            let result = levels::web_explore(
                &self.deps.storage,
                self.deps.llm.as_ref(),
                self.deps.searcher.as_ref(),
                "current capability gaps",
            )
            .await;
            match result {
                Ok(outcome) => self.note_outcome(Level::WebExplore, outcome, now_ms),
                Err(e) => self.note_error("web_explore", e),
            }
        }

        if idle_s >= profile.burst.idle_sec && (now_ms - self.level_done_at(Level::Burst)) as u64 >= profile.burst.rate_sec * 1000 {
            self.run_burst(&profile, abort_check).await;
            self.mark_done(Level::Burst, epoch_ms());
        }

        if let Err(e) = self.persist_state() {
            error!(error = %e, "failed to persist autonomic engine state");
        }
        Ok(())
    }

    fn note_outcome(&self, level: Level, outcome: LevelOutcome, now_ms: i64) {
        if outcome != LevelOutcome::NoOp {
            self.mark_done(level, now_ms);
        }
    }

    fn note_error(&self, level: &str, error: crate::error::CoreError) {
        warn!(level, error = %error, "level handler errored; recorded and continuing");
        if let Err(e) = self.deps.storage.append(
            crate::storage::Stream::AutonomicAudit,
            &crate::storage::record::AuditEvent::new(level, false, error.to_string()),
        ) {
            error!(error = %e, "failed to record level handler error to audit log");
        }
        self.push_alert(format!("{level} failed: {error}"));
    }

    async fn run_burst(&self, profile: &TimingProfile, abort_check: &(dyn Fn() -> bool + Sync)) {
        let mut session = BurstSession::start(Duration::from_secs(profile.burst.max_duration_sec), profile.burst.stall_limit);
        info!("entering burst session");
        loop {
            let now_ms = epoch_ms();
            let candidates = vec![
                LevelReadiness {
                    action: BurstAction::Curiosity,
                    eligible: self.eligible(Level::Curiosity, self.idle_seconds(), now_ms, profile.curiosity),
                    priority: overdue_score(self.level_done_at(Level::Curiosity), now_ms, profile.curiosity.rate_sec),
                },
                LevelReadiness {
                    action: BurstAction::Reflect,
                    eligible: self.eligible(Level::Reflect, self.idle_seconds(), now_ms, profile.reflect),
                    priority: overdue_score(self.level_done_at(Level::Reflect), now_ms, profile.reflect.rate_sec),
                },
                LevelReadiness {
                    action: BurstAction::Heal,
                    eligible: self.eligible(Level::Heal, self.idle_seconds(), now_ms, profile.heal),
                    priority: overdue_score(self.level_done_at(Level::Heal), now_ms, profile.heal.rate_sec),
                },
            ];
            let action = pick_next_action(candidates);
            let productive = self.run_burst_action(action).await;

            let control = session.record_turn(productive, self.idle_seconds(), abort_check());
            match control {
                BurstControl::Continue => continue,
                BurstControl::EndStalled => {
                    info!(turns = session.turns_run(), "burst session ended: stalled");
                    break;
                }
                BurstControl::EndTimedOut => {
                    info!(turns = session.turns_run(), "burst session ended: max duration reached");
                    break;
                }
                BurstControl::EndUserActive => {
                    info!(turns = session.turns_run(), "burst session ended: user active or aborted");
                    break;
                }
            }
        }
        self.stasis.lock().unwrap().reset();
    }

    async fn run_burst_action(&self, action: BurstAction) -> bool {
        let outcome = match action {
            BurstAction::Curiosity => levels::curiosity(&self.deps.storage, &self.deps.curiosity, &self.deps.known_tools).await,
            BurstAction::Reflect => levels::reflect(&self.deps.storage).await,
            BurstAction::Heal => levels::heal(&self.deps.storage, &self.deps.regression).await,
            _ => Ok(LevelOutcome::NoOp),
        };
        matches!(outcome, Ok(LevelOutcome::Productive))
    }

    /// Runs a single tick synchronously; used by the CLI's one-shot entry point.
    pub async fn run_once(&self) -> CoreResult<()> {
        self.tick(&|| false).await
    }

    /// Drives the heartbeat loop until `shutdown` resolves true; each iteration
    /// submits a tick and returns immediately for alert draining, matching the spec's
    /// "event loop submits the tick and returns immediately" ordering guarantee.
    pub async fn run_forever(&self, shutdown: impl Fn() -> bool) {
        loop {
            if shutdown() {
                if let Err(e) = self.persist_state() {
                    error!(error = %e, "failed to persist state on shutdown");
                }
                return;
            }
            if let Err(e) = self.tick(&|| shutdown()).await {
                error!(error = %e, "tick failed");
            }
            tokio::time::sleep(Duration::from_secs(self.profile().heartbeat_sec)).await;
        }
    }
}

fn overdue_score(last_done_ms: i64, now_ms: i64, rate_sec: u64) -> f64 {
    let elapsed_sec = ((now_ms - last_done_ms).max(0) as f64) / 1000.0;
    if rate_sec == 0 {
        1.0
    } else {
        elapsed_sec / rate_sec as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::curiosity::CuriosityDriver;
    use crate::external::{HttpWebSearcher, LlmClient, LlmRequest, OpenAiCompatClient};
    use crate::learning::LearningRecorder;

    struct StubLlm;
    #[async_trait::async_trait]
    impl LlmClient for StubLlm {
        async fn complete(&self, _request: LlmRequest) -> String {
            "no".to_string()
        }
    }

    fn deps(dir: &std::path::Path) -> EngineDeps {
        let storage = Storage::new(dir).unwrap();
        let regression = RegressionGate::new(storage.clone(), PathBuf::from("/nonexistent"), Duration::from_secs(1));
        let learning = LearningRecorder::new(storage.clone());
        let curiosity = CuriosityDriver::new(storage.clone(), learning, regression.clone(), dir.join("scripts/utils"));
        EngineDeps {
            storage,
            regression,
            curiosity,
            llm: Arc::new(StubLlm),
            searcher: Arc::new(HttpWebSearcher::new("http://localhost:0/search")),
            known_tools: HashSet::new(),
            scripts_dir: dir.join("scripts"),
        }
    }

    #[tokio::test]
    async fn fresh_engine_has_no_level_done_timestamps() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AutonomicEngine::new(deps(dir.path()), false).unwrap();
        let status = engine.get_status();
        assert!(status.level_done.is_empty());
        assert!(!status.stasis_active);
    }

    #[tokio::test]
    async fn touch_resets_idle_seconds() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AutonomicEngine::new(deps(dir.path()), false).unwrap();
        engine.touch();
        assert_eq!(engine.idle_seconds(), 0);
    }

    #[tokio::test]
    async fn set_mode_switches_timing_profile() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AutonomicEngine::new(deps(dir.path()), false).unwrap();
        assert_eq!(engine.profile().heartbeat_sec, 60);
        engine.set_mode(true);
        assert_eq!(engine.profile().heartbeat_sec, 30);
    }

    #[tokio::test]
    async fn tick_does_not_error_on_fresh_state() {
        let dir = tempfile::tempdir().unwrap();
        let engine = AutonomicEngine::new(deps(dir.path()), false).unwrap();
        engine.tick(&|| false).await.unwrap();
    }
}
