//! Stasis detector: a rolling window of state-hashes that flags a converged runtime so
//! level handlers can back off (§4.9 step 2, §8 invariants 6-7).

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use md5::{Digest, Md5};

/// `MD5(skills_count|experiences_count|insights_count|success_rate_bucket|floor(now/600))`,
/// truncated to 8 hex chars. The 10-minute time bucket guarantees stasis auto-expires
/// even with zero data changes.
pub fn state_hash(skills_count: u64, experiences_count: u64, insights_count: u64, success_rate: f64, now_ms: i64) -> String {
    let bucket = now_ms / 600_000;
    let success_bucket = (success_rate * 100.0).round() as i64;
    let material = format!("{skills_count}|{experiences_count}|{insights_count}|{success_bucket}|{bucket}");
    let mut hasher = Md5::new();
    hasher.update(material.as_bytes());
    let digest = hasher.finalize();
    hex_prefix(&digest, 4)
}

fn hex_prefix(bytes: &[u8], n: usize) -> String {
    bytes.iter().take(n).map(|b| format!("{b:02x}")).collect()
}

pub struct StasisDetector {
    threshold: u32,
    max_duration: Duration,
    window: VecDeque<String>,
    entered: Option<Instant>,
}

impl StasisDetector {
    pub fn new(threshold: u32, max_duration: Duration) -> Self {
        Self { threshold, max_duration, window: VecDeque::with_capacity(threshold as usize + 1), entered: None }
    }

    /// Appends a new hash, keeps the window bounded to `threshold`, and returns whether
    /// stasis is currently active. Auto-expires after `max_duration` regardless of
    /// whether the window still reads as converged.
    pub fn observe(&mut self, hash: String) -> bool {
        self.window.push_back(hash);
        while self.window.len() > self.threshold as usize {
            self.window.pop_front();
        }
        let converged = self.window.len() == self.threshold as usize && self.window.iter().all(|h| h == &self.window[0]);

        if converged {
            if self.entered.is_none() {
                self.entered = Some(Instant::now());
            }
        } else {
            self.entered = None;
        }

        match self.entered {
            Some(at) if at.elapsed() >= self.max_duration => {
                self.entered = None;
                self.window.clear();
                false
            }
            Some(_) => true,
            None => false,
        }
    }

    pub fn is_active(&self) -> bool {
        self.entered.is_some()
    }

    /// Engine state is reloaded fresh on restart; stasis is never restored to avoid a
    /// permanent-stasis deadlock across process lifetimes.
    pub fn reset(&mut self) {
        self.window.clear();
        self.entered = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identical_hashes_trigger_stasis_after_threshold() {
        let mut detector = StasisDetector::new(3, Duration::from_secs(600));
        assert!(!detector.observe("aaaa".to_string()));
        assert!(!detector.observe("aaaa".to_string()));
        assert!(detector.observe("aaaa".to_string()));
    }

    #[test]
    fn changing_hash_resets_window() {
        let mut detector = StasisDetector::new(2, Duration::from_secs(600));
        assert!(detector.observe("aaaa".to_string()));
        assert!(!detector.observe("bbbb".to_string()));
    }

    #[test]
    fn same_inputs_produce_same_hash() {
        let a = state_hash(1, 2, 3, 0.5, 1_200_000);
        let b = state_hash(1, 2, 3, 0.5, 1_200_000);
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
    }

    #[test]
    fn different_time_bucket_changes_hash() {
        let a = state_hash(1, 2, 3, 0.5, 0);
        let b = state_hash(1, 2, 3, 0.5, 600_000);
        assert_ne!(a, b);
    }

    #[test]
    fn stasis_auto_expires_after_max_duration() {
        let mut detector = StasisDetector::new(2, Duration::from_millis(1));
        assert!(detector.observe("same".to_string()));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!detector.observe("same".to_string()), "stasis must lapse once max_duration has elapsed");
    }
}
