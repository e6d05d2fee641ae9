//! Burst mode: once idle long enough, run priority-ranked background turns back to
//! back until the session stalls, times out, or the user returns (§4.9 "Burst mode").

use std::time::{Duration, Instant};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum BurstAction {
    Reflect,
    Test,
    Heal,
    Hygiene,
    Curiosity,
    WebExplore,
    SelfQuestion,
    RandomStimulus,
}

#[derive(Clone, Copy, Debug)]
pub struct LevelReadiness {
    pub action: BurstAction,
    pub eligible: bool,
    /// Higher priority wins; level handlers that have waited longer since their last
    /// run, or that address a known gap, should score higher.
    pub priority: f64,
}

/// Picks the single highest-priority eligible action for one burst turn. Always
/// returns something: falls back to a self-question, then a random-stimulus item, if
/// no level handler is eligible.
pub fn pick_next_action(mut candidates: Vec<LevelReadiness>) -> BurstAction {
    candidates.retain(|c| c.eligible);
    candidates.sort_by(|a, b| b.priority.partial_cmp(&a.priority).unwrap_or(std::cmp::Ordering::Equal));
    candidates.first().map(|c| c.action).unwrap_or(BurstAction::RandomStimulus)
}

pub struct BurstSession {
    started_at: Instant,
    max_duration: Duration,
    stall_limit: u32,
    consecutive_unproductive: u32,
    turns_run: u32,
}

pub enum BurstControl {
    Continue,
    EndStalled,
    EndTimedOut,
    EndUserActive,
}

impl BurstSession {
    pub fn start(max_duration: Duration, stall_limit: u32) -> Self {
        Self { started_at: Instant::now(), max_duration, stall_limit, consecutive_unproductive: 0, turns_run: 0 }
    }

    /// A turn is productive iff it advanced a level_done timestamp or explicitly set
    /// `last_action_productive`. Returns the control decision for the *next* turn.
    pub fn record_turn(&mut self, productive: bool, idle_seconds: u64, abort: bool) -> BurstControl {
        self.turns_run += 1;
        if productive {
            self.consecutive_unproductive = 0;
        } else {
            self.consecutive_unproductive += 1;
        }

        if idle_seconds < 30 || abort {
            return BurstControl::EndUserActive;
        }
        if self.started_at.elapsed() >= self.max_duration {
            return BurstControl::EndTimedOut;
        }
        if self.consecutive_unproductive >= self.stall_limit {
            return BurstControl::EndStalled;
        }
        BurstControl::Continue
    }

    pub fn turns_run(&self) -> u32 {
        self.turns_run
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pick_next_action_prefers_highest_priority_eligible() {
        let candidates = vec![
            LevelReadiness { action: BurstAction::Reflect, eligible: true, priority: 0.2 },
            LevelReadiness { action: BurstAction::Curiosity, eligible: true, priority: 0.8 },
            LevelReadiness { action: BurstAction::Heal, eligible: false, priority: 0.9 },
        ];
        assert_eq!(pick_next_action(candidates), BurstAction::Curiosity);
    }

    #[test]
    fn pick_next_action_falls_back_to_random_stimulus() {
        let candidates = vec![LevelReadiness { action: BurstAction::Heal, eligible: false, priority: 0.9 }];
        assert_eq!(pick_next_action(candidates), BurstAction::RandomStimulus);
    }

    #[test]
    fn stall_limit_ends_session() {
        let mut session = BurstSession::start(Duration::from_secs(3600), 3);
        assert!(matches!(session.record_turn(false, 1800, false), BurstControl::Continue));
        assert!(matches!(session.record_turn(false, 1800, false), BurstControl::Continue));
        assert!(matches!(session.record_turn(false, 1800, false), BurstControl::EndStalled));
    }

    #[test]
    fn user_activity_ends_session_immediately() {
        let mut session = BurstSession::start(Duration::from_secs(3600), 3);
        assert!(matches!(session.record_turn(true, 5, false), BurstControl::EndUserActive));
    }
}
