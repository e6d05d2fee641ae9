//! Normal / Dev-Explore timing profile (spec.md §6 timing table; SPEC_FULL supplement 5).

#[derive(Clone, Copy, Debug)]
pub struct LevelTiming {
    pub idle_sec: u64,
    pub rate_sec: u64,
}

#[derive(Clone, Copy, Debug)]
pub struct BurstTiming {
    pub idle_sec: u64,
    pub rate_sec: u64,
    pub max_duration_sec: u64,
    pub stall_limit: u32,
}

#[derive(Clone, Copy, Debug)]
pub struct TimingProfile {
    pub heartbeat_sec: u64,
    pub reflect: LevelTiming,
    pub test: LevelTiming,
    pub heal: LevelTiming,
    pub hygiene_rate_sec: u64,
    pub curiosity: LevelTiming,
    pub web_explore_rate_sec: u64,
    pub burst: BurstTiming,
    pub stasis_threshold: u32,
    pub stasis_max_sec: u64,
    pub curiosity_max_per_day: u32,
    pub curiosity_cooldown_sec: u64,
    /// Curiosity still runs on this slower cadence even while in stasis.
    pub stasis_curiosity_rate_sec: u64,
    /// Minimum spacing between periodic digest alerts; 0 disables throttling.
    pub report_min_interval_sec: u64,
}

pub const NORMAL: TimingProfile = TimingProfile {
    heartbeat_sec: 60,
    reflect: LevelTiming { idle_sec: 180, rate_sec: 300 },
    test: LevelTiming { idle_sec: 300, rate_sec: 600 },
    heal: LevelTiming { idle_sec: 600, rate_sec: 1800 },
    hygiene_rate_sec: 1800,
    curiosity: LevelTiming { idle_sec: 900, rate_sec: 1800 },
    web_explore_rate_sec: 1800,
    burst: BurstTiming { idle_sec: 1800, rate_sec: 3600, max_duration_sec: 3600, stall_limit: 5 },
    stasis_threshold: 6,
    stasis_max_sec: 600,
    curiosity_max_per_day: 10,
    curiosity_cooldown_sec: 1800,
    stasis_curiosity_rate_sec: 1800,
    report_min_interval_sec: 0,
};

pub const DEV_EXPLORE: TimingProfile = TimingProfile {
    heartbeat_sec: 30,
    reflect: LevelTiming { idle_sec: 60, rate_sec: 300 },
    test: LevelTiming { idle_sec: 120, rate_sec: 600 },
    heal: LevelTiming { idle_sec: 180, rate_sec: 600 },
    hygiene_rate_sec: 1800,
    curiosity: LevelTiming { idle_sec: 180, rate_sec: 600 },
    web_explore_rate_sec: 900,
    burst: BurstTiming { idle_sec: 180, rate_sec: 600, max_duration_sec: 3600, stall_limit: 5 },
    stasis_threshold: 5,
    stasis_max_sec: 600,
    curiosity_max_per_day: 20,
    curiosity_cooldown_sec: 600,
    stasis_curiosity_rate_sec: 600,
    report_min_interval_sec: 300,
};

pub fn profile_for(dev_explore: bool) -> TimingProfile {
    if dev_explore {
        DEV_EXPLORE
    } else {
        NORMAL
    }
}
