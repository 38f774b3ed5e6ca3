use std::env;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Environment variable names
pub mod env_vars {
    pub const SAVE_DEBOUNCE_MS: &str = "NOTE_SESSION_SAVE_DEBOUNCE_MS";
    pub const STATUS_MIN_MS: &str = "NOTE_SESSION_STATUS_MIN_MS";
    pub const PROTECTION_SECS: &str = "NOTE_SESSION_PROTECTION_SECS";
    pub const EDITOR_RELOAD_MS: &str = "NOTE_SESSION_EDITOR_RELOAD_MS";
    /// SQLite file used by the `note-session` binary.
    pub const DATABASE_PATH: &str = "NOTE_SESSION_DB";
}

/// Default values
pub mod defaults {
    pub const SAVE_DEBOUNCE_MS: u64 = 100;
    pub const STATUS_MIN_MS: u64 = 400;
    /// How long a protected note stays visible after the last edit once the
    /// unprotected session has expired.
    pub const PROTECTION_SECS: u64 = 30;
    /// Reloading the editor view back-to-back can destroy the same view twice,
    /// so plugin-set changes are coalesced.
    pub const EDITOR_RELOAD_MS: u64 = 25;
    pub const DATABASE_PATH: &str = "notes.sqlite";
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub save_debounce: Duration,
    pub min_status_duration: Duration,
    pub protection_threshold: Duration,
    pub editor_reload_debounce: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            save_debounce: Duration::from_millis(defaults::SAVE_DEBOUNCE_MS),
            min_status_duration: Duration::from_millis(defaults::STATUS_MIN_MS),
            protection_threshold: Duration::from_secs(defaults::PROTECTION_SECS),
            editor_reload_debounce: Duration::from_millis(defaults::EDITOR_RELOAD_MS),
        }
    }
}

impl SessionConfig {
    /// Defaults overridden by whichever `NOTE_SESSION_*` variables are set.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(ms) = parse_u64(&lookup, env_vars::SAVE_DEBOUNCE_MS) {
            config.save_debounce = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_u64(&lookup, env_vars::STATUS_MIN_MS) {
            config.min_status_duration = Duration::from_millis(ms);
        }
        if let Some(secs) = parse_u64(&lookup, env_vars::PROTECTION_SECS) {
            config.protection_threshold = Duration::from_secs(secs);
        }
        if let Some(ms) = parse_u64(&lookup, env_vars::EDITOR_RELOAD_MS) {
            config.editor_reload_debounce = Duration::from_millis(ms);
        }
        config
    }
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<u64> {
    let raw = lookup(key)?;
    match raw.trim().parse::<u64>() {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!(key, value = %raw, "Ignoring invalid config value: {e}");
            None
        }
    }
}

/// Path of the SQLite note database for the binary.
pub fn database_path() -> String {
    env::var(env_vars::DATABASE_PATH).unwrap_or_else(|_| defaults::DATABASE_PATH.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_match_editor_timings() {
        let config = SessionConfig::default();
        assert_eq!(config.save_debounce, Duration::from_millis(100));
        assert_eq!(config.min_status_duration, Duration::from_millis(400));
        assert_eq!(config.protection_threshold, Duration::from_secs(30));
        assert_eq!(config.editor_reload_debounce, Duration::from_millis(25));
    }

    #[test]
    fn overrides_apply_and_garbage_is_ignored() {
        let vars: HashMap<&str, &str> = HashMap::from([
            (env_vars::SAVE_DEBOUNCE_MS, "250"),
            (env_vars::PROTECTION_SECS, "not-a-number"),
        ]);
        let config = SessionConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(config.save_debounce, Duration::from_millis(250));
        assert_eq!(config.protection_threshold, Duration::from_secs(30));
    }
}
