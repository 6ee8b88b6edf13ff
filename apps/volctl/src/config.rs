use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use anyhow::Context;
use serde::Deserialize;
use shared::{
    domain::{VolumeLevel, VolumeRange, DEFAULT_VOLUME, MAX_VOLUME, MIN_VOLUME},
    error::RangeError,
};
use tracing::warn;
use volume_core::SyncConfig;

const DEFAULT_CONFIG_FILE: &str = "volctl.toml";
const ENV_PREFIX: &str = "VOLCTL__";

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub min_volume: i32,
    pub max_volume: i32,
    pub initial_volume: i32,
    pub fallback_volume: i32,
    pub query_timeout_ms: u64,
    pub resubscribe_attempts: u32,
    pub resubscribe_backoff_ms: u64,
    pub resubscribe_backoff_max_ms: u64,
    pub echo_writes: bool,
    pub key_step: f64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            min_volume: MIN_VOLUME,
            max_volume: MAX_VOLUME,
            initial_volume: DEFAULT_VOLUME,
            fallback_volume: DEFAULT_VOLUME,
            query_timeout_ms: 2000,
            resubscribe_attempts: 5,
            resubscribe_backoff_ms: 200,
            resubscribe_backoff_max_ms: 5000,
            echo_writes: true,
            key_step: 1.0,
        }
    }
}

impl Settings {
    /// Freezes the range and derives the controller configuration.
    pub fn sync_config(&self) -> Result<SyncConfig, RangeError> {
        let range = VolumeRange::new(self.min_volume, self.max_volume)?;
        Ok(SyncConfig {
            range,
            initial_volume: range.clamp(self.initial_volume).level,
            fallback_volume: range.clamp(self.fallback_volume).level,
            query_timeout: Duration::from_millis(self.query_timeout_ms),
            resubscribe_attempts: self.resubscribe_attempts,
            resubscribe_backoff: Duration::from_millis(self.resubscribe_backoff_ms),
            resubscribe_backoff_max: Duration::from_millis(self.resubscribe_backoff_max_ms),
        })
    }

    pub fn initial_level(&self) -> VolumeLevel {
        VolumeLevel(self.initial_volume)
    }

    /// Keys absent from `raw` keep their defaults; unknown keys are ignored.
    pub(crate) fn from_toml(raw: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(raw)
    }

    /// Environment values are plain strings. Unknown keys and unparseable values are skipped.
    fn apply_env_value(&mut self, key: &str, value: &str) {
        let value = value.trim();
        let applied = match key {
            "min_volume" => parse_into(value, &mut self.min_volume),
            "max_volume" => parse_into(value, &mut self.max_volume),
            "initial_volume" => parse_into(value, &mut self.initial_volume),
            "fallback_volume" => parse_into(value, &mut self.fallback_volume),
            "query_timeout_ms" => parse_into(value, &mut self.query_timeout_ms),
            "resubscribe_attempts" => parse_into(value, &mut self.resubscribe_attempts),
            "resubscribe_backoff_ms" => parse_into(value, &mut self.resubscribe_backoff_ms),
            "resubscribe_backoff_max_ms" => {
                parse_into(value, &mut self.resubscribe_backoff_max_ms)
            }
            "echo_writes" => parse_into(value, &mut self.echo_writes),
            "key_step" => parse_into(value, &mut self.key_step),
            _ => return,
        };
        if !applied {
            warn!(key, value, "config: ignoring unparseable value");
        }
    }

    pub(crate) fn apply_env(&mut self, vars: impl IntoIterator<Item = (String, String)>) {
        for (name, value) in vars {
            if let Some(key) = name.strip_prefix(ENV_PREFIX) {
                self.apply_env_value(&key.to_ascii_lowercase(), &value);
            }
        }
    }
}

fn parse_into<T: std::str::FromStr>(value: &str, slot: &mut T) -> bool {
    match value.parse() {
        Ok(parsed) => {
            *slot = parsed;
            true
        }
        Err(_) => false,
    }
}

/// Defaults, then the config file, then `VOLCTL__*` environment variables.
/// A missing default file is fine; a missing explicit `path` is an error.
pub fn load_settings(path: Option<&Path>) -> anyhow::Result<Settings> {
    let (path, explicit) = match path {
        Some(path) => (path.to_path_buf(), true),
        None => (PathBuf::from(DEFAULT_CONFIG_FILE), false),
    };
    let mut settings = match fs::read_to_string(&path) {
        Ok(raw) => Settings::from_toml(&raw)
            .with_context(|| format!("failed to parse config file '{}'", path.display()))?,
        Err(err) if explicit => {
            return Err(err)
                .with_context(|| format!("failed to read config file '{}'", path.display()));
        }
        Err(_) => Settings::default(),
    };

    settings.apply_env(std::env::vars());
    Ok(settings)
}

#[cfg(test)]
mod tests {
    use std::{
        env,
        time::{SystemTime, UNIX_EPOCH},
    };

    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), value.to_string()))
            .collect()
    }

    #[test]
    fn file_values_override_defaults() {
        let settings = Settings::from_toml(
            r#"
            min_volume = -60
            query_timeout_ms = 750
            echo_writes = false
            key_step = 2.5
            unrelated = "ignored"
            "#,
        )
        .expect("parse");

        assert_eq!(settings.min_volume, -60);
        assert_eq!(settings.query_timeout_ms, 750);
        assert!(!settings.echo_writes);
        assert_eq!(settings.key_step, 2.5);
        assert_eq!(settings.max_volume, MAX_VOLUME);
        assert_eq!(settings.resubscribe_attempts, 5);
    }

    #[test]
    fn mistyped_file_value_is_an_error() {
        assert!(Settings::from_toml("query_timeout_ms = \"soon\"").is_err());
        assert!(Settings::from_toml("min_volume = -60.5").is_err());
    }

    #[test]
    fn env_overrides_file_and_skips_garbage() {
        let mut settings = Settings::from_toml("initial_volume = -30").expect("parse");
        settings.apply_env(vars(&[
            ("VOLCTL__INITIAL_VOLUME", "-12"),
            ("VOLCTL__QUERY_TIMEOUT_MS", "soon"),
            ("PATH", "/usr/bin"),
        ]));

        assert_eq!(settings.initial_volume, -12);
        assert_eq!(settings.query_timeout_ms, 2000);
    }

    #[test]
    fn sync_config_clamps_levels_into_range() {
        let settings = Settings {
            initial_volume: 10,
            fallback_volume: -80,
            ..Settings::default()
        };
        let config = settings.sync_config().expect("valid range");
        assert_eq!(config.initial_volume, VolumeLevel(0));
        assert_eq!(config.fallback_volume, VolumeLevel(-50));
        assert_eq!(config.query_timeout, Duration::from_secs(2));
    }

    #[test]
    fn inverted_range_is_rejected() {
        let settings = Settings {
            min_volume: 0,
            max_volume: -50,
            ..Settings::default()
        };
        assert_eq!(
            settings.sync_config().expect_err("inverted"),
            RangeError::Inverted { min: 0, max: -50 }
        );
    }

    #[test]
    fn explicit_missing_file_is_an_error() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let missing = env::temp_dir().join(format!("volctl_missing_{suffix}.toml"));
        assert!(load_settings(Some(&missing)).is_err());
    }

    #[test]
    fn loads_explicit_file() {
        let suffix = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("clock")
            .as_nanos();
        let temp_root = env::temp_dir().join(format!("volctl_config_test_{suffix}"));
        fs::create_dir_all(&temp_root).expect("temp root");
        let path = temp_root.join("volctl.toml");
        fs::write(&path, "max_volume = -5\nresubscribe_attempts = 9\n").expect("write");

        let settings = load_settings(Some(&path)).expect("load");
        assert_eq!(settings.max_volume, -5);
        assert_eq!(settings.resubscribe_attempts, 9);

        fs::remove_dir_all(temp_root).expect("cleanup");
    }
}
