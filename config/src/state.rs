//! Persisted runtime config overlay (`work/config_state.json`) plus typed accessors for
//! the recognized environment keys listed in the system spec's external-interfaces
//! section: LLM backend selection, auto-route toggle, profile, permission mode and
//! per-action overrides, sandbox requirement, budget caps, subprocess timeouts, and the
//! autonomic heartbeat interval.
//!
//! Writers go through [`ConfigStore::set`], which updates both the persisted file
//! (exclusive-locked, atomic rename) and the process environment together, so the
//! change is visible to the rest of the process immediately and survives a restart.
//! Readers never cache: every accessor re-reads `std::env` on each call.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use fs2::FileExt;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigStateError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Snapshot of the persisted overlay. Any key set here is re-applied to the process
/// environment on [`ConfigStore::load_into_env`] unless already present in env.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct PersistedConfig {
    #[serde(flatten)]
    pub values: BTreeMap<String, String>,
}

/// Handle to `work/config_state.json`. One instance per process; cheap to clone the path.
#[derive(Clone, Debug)]
pub struct ConfigStore {
    path: PathBuf,
}

impl ConfigStore {
    pub fn new(work_dir: impl AsRef<Path>) -> Self {
        Self {
            path: work_dir.as_ref().join("config_state.json"),
        }
    }

    fn read(&self) -> Result<PersistedConfig, ConfigStateError> {
        if !self.path.exists() {
            return Ok(PersistedConfig::default());
        }
        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(PersistedConfig::default());
        }
        Ok(serde_json::from_str(&raw)?)
    }

    /// Loads the persisted overlay into `std::env`, once, at startup. Existing env vars
    /// win (matches the `load_and_apply` precedence at crate root).
    pub fn load_into_env(&self) -> Result<(), ConfigStateError> {
        let cfg = self.read()?;
        for (k, v) in cfg.values {
            if std::env::var(&k).is_err() {
                std::env::set_var(&k, v);
            }
        }
        Ok(())
    }

    /// Sets one key: writes it to both the persisted file (locked, atomic rename) and
    /// the process environment.
    pub fn set(&self, key: &str, value: &str) -> Result<(), ConfigStateError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut cfg = self.read()?;
        cfg.values.insert(key.to_string(), value.to_string());

        let tmp_path = self.path.with_extension("json.tmp");
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.lock_exclusive()?;
            let body = serde_json::to_string_pretty(&cfg)?;
            tmp.write_all(body.as_bytes())?;
            tmp.sync_all()?;
            fs2::FileExt::unlock(&tmp)?;
        }
        fs::rename(&tmp_path, &self.path)?;

        std::env::set_var(key, value);
        Ok(())
    }
}

/// Typed view over recognized runtime config keys. Always reads `std::env` live.
#[derive(Clone, Copy, Debug, Default)]
pub struct RuntimeConfig;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Profile {
    Dev,
    Prod,
}

impl RuntimeConfig {
    fn env_str(key: &str, default: &str) -> String {
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    }

    fn env_bool(key: &str, default: bool) -> bool {
        match std::env::var(key) {
            Ok(v) => v == "1" || v.eq_ignore_ascii_case("true"),
            Err(_) => default,
        }
    }

    fn env_u64(key: &str, default: u64) -> u64 {
        std::env::var(key)
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(default)
    }

    pub fn profile(&self) -> Profile {
        match Self::env_str("AUTONOMIC_PROFILE", "prod").as_str() {
            "dev" => Profile::Dev,
            _ => Profile::Prod,
        }
    }

    pub fn dev_explore(&self) -> bool {
        Self::env_bool("AUTONOMIC_DEV_EXPLORE", false)
    }

    pub fn auto_route(&self) -> bool {
        Self::env_bool("AUTONOMIC_AUTO_ROUTE", false)
    }

    pub fn llm_backend(&self) -> String {
        Self::env_str("AUTONOMIC_LLM_BACKEND", "local")
    }

    pub fn model_name(&self) -> String {
        Self::env_str("AUTONOMIC_MODEL", "default")
    }

    pub fn base_url(&self) -> String {
        Self::env_str("AUTONOMIC_BASE_URL", "http://localhost:11434/v1")
    }

    pub fn api_key(&self) -> Option<String> {
        std::env::var("AUTONOMIC_API_KEY").ok()
    }

    pub fn default_temperature(&self) -> f32 {
        std::env::var("AUTONOMIC_TEMPERATURE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0.7)
    }

    pub fn default_max_tokens(&self) -> u32 {
        Self::env_u64("AUTONOMIC_MAX_TOKENS", 2048) as u32
    }

    pub fn permission_mode(&self) -> String {
        Self::env_str("AUTONOMIC_PERMISSION_MODE", "standard")
    }

    pub fn permission_overrides(&self) -> String {
        Self::env_str("AUTONOMIC_PERMISSION_OVERRIDES", "{}")
    }

    pub fn sandbox_required(&self) -> bool {
        Self::env_bool("AUTONOMIC_SANDBOX_REQUIRED", true)
    }

    pub fn daily_llm_call_budget(&self) -> u64 {
        Self::env_u64("AUTONOMIC_DAILY_LLM_CALLS", 2000)
    }

    pub fn daily_token_budget(&self) -> u64 {
        Self::env_u64("AUTONOMIC_DAILY_TOKENS", 2_000_000)
    }

    pub fn subprocess_timeout_secs(&self) -> u64 {
        Self::env_u64("AUTONOMIC_SUBPROCESS_TIMEOUT_SEC", 90)
    }

    pub fn heartbeat_interval_secs(&self) -> u64 {
        let default = if self.dev_explore() { 30 } else { 60 };
        Self::env_u64("AUTONOMIC_HEARTBEAT_INTERVAL_SEC", default)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_then_load_into_env_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        std::env::remove_var("AUTONOMIC_TEST_KEY");
        store.set("AUTONOMIC_TEST_KEY", "hello").unwrap();
        assert_eq!(std::env::var("AUTONOMIC_TEST_KEY").unwrap(), "hello");

        std::env::remove_var("AUTONOMIC_TEST_KEY");
        store.load_into_env().unwrap();
        assert_eq!(std::env::var("AUTONOMIC_TEST_KEY").unwrap(), "hello");
        std::env::remove_var("AUTONOMIC_TEST_KEY");
    }

    #[test]
    fn existing_env_wins_on_load() {
        let dir = tempfile::tempdir().unwrap();
        let store = ConfigStore::new(dir.path());
        store.set("AUTONOMIC_TEST_KEY2", "from_file").unwrap();
        std::env::set_var("AUTONOMIC_TEST_KEY2", "from_process_env");
        store.load_into_env().unwrap();
        assert_eq!(
            std::env::var("AUTONOMIC_TEST_KEY2").unwrap(),
            "from_process_env"
        );
        std::env::remove_var("AUTONOMIC_TEST_KEY2");
    }

    #[test]
    fn runtime_config_defaults() {
        std::env::remove_var("AUTONOMIC_PERMISSION_MODE");
        let rc = RuntimeConfig;
        assert_eq!(rc.permission_mode(), "standard");
        assert_eq!(rc.profile(), Profile::Prod);
    }
}
