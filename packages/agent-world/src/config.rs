use std::env;
use std::path::PathBuf;

use anyhow::{Context, Result};
use dotenvy::dotenv;

use crate::bus::DEFAULT_CAPACITY;
use crate::error::WorldError;

/// Default pass token: an agent replying with exactly this hands control back.
pub const DEFAULT_PASS_TOKEN: &str = "<world>pass</world>";

/// Routing settings shared by every world of a process.
#[derive(Debug, Clone, PartialEq)]
pub struct WorldSettings {
    /// Turn limit for newly created worlds.
    pub default_turn_limit: u32,
    /// How many memory entries go into a prompt.
    pub memory_window: usize,
    pub pass_token: String,
    /// Queue length of bus observers. Agent pipelines are unbounded.
    pub bus_capacity: usize,
    /// Whether a failed model call uses up turn budget.
    pub count_failed_calls: bool,
}

impl Default for WorldSettings {
    fn default() -> Self {
        Self {
            default_turn_limit: 5,
            memory_window: 50,
            pass_token: DEFAULT_PASS_TOKEN.to_string(),
            bus_capacity: DEFAULT_CAPACITY,
            count_failed_calls: false,
        }
    }
}

impl WorldSettings {
    pub fn validate(&self) -> std::result::Result<(), WorldError> {
        if self.default_turn_limit == 0 {
            return Err(WorldError::InvalidConfig(
                "turn limit must be at least 1".into(),
            ));
        }
        if self.memory_window == 0 {
            return Err(WorldError::InvalidConfig(
                "memory window must be at least 1".into(),
            ));
        }
        if self.pass_token.trim().is_empty() {
            return Err(WorldError::InvalidConfig("pass token must not be empty".into()));
        }
        if self.bus_capacity == 0 {
            return Err(WorldError::InvalidConfig("bus capacity must be at least 1".into()));
        }
        Ok(())
    }
}

/// Process configuration loaded from environment variables
#[derive(Debug, Clone)]
pub struct Config {
    pub data_dir: PathBuf,
    pub settings: WorldSettings,
    pub default_model: String,
    pub openai_api_key: Option<String>,
    pub openai_base_url: Option<String>,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        // Load .env file if present (development)
        let _ = dotenv();
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = WorldSettings::default();

        let settings = WorldSettings {
            default_turn_limit: match var("AGENT_WORLD_TURN_LIMIT") {
                Some(v) => v
                    .parse()
                    .context("AGENT_WORLD_TURN_LIMIT must be a positive number")?,
                None => defaults.default_turn_limit,
            },
            memory_window: match var("AGENT_WORLD_MEMORY_WINDOW") {
                Some(v) => v
                    .parse()
                    .context("AGENT_WORLD_MEMORY_WINDOW must be a positive number")?,
                None => defaults.memory_window,
            },
            pass_token: var("AGENT_WORLD_PASS_TOKEN").unwrap_or(defaults.pass_token),
            bus_capacity: match var("AGENT_WORLD_BUS_CAPACITY") {
                Some(v) => v
                    .parse()
                    .context("AGENT_WORLD_BUS_CAPACITY must be a positive number")?,
                None => defaults.bus_capacity,
            },
            count_failed_calls: match var("AGENT_WORLD_COUNT_FAILED_CALLS") {
                Some(v) => v
                    .parse()
                    .context("AGENT_WORLD_COUNT_FAILED_CALLS must be true or false")?,
                None => defaults.count_failed_calls,
            },
        };
        settings
            .validate()
            .context("invalid agent world settings")?;

        Ok(Self {
            data_dir: var("AGENT_WORLD_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./data")),
            settings,
            default_model: var("AGENT_WORLD_DEFAULT_MODEL")
                .unwrap_or_else(|| "gpt-4o-mini".to_string()),
            openai_api_key: var("OPENAI_API_KEY").filter(|k| !k.is_empty()),
            openai_base_url: var("OPENAI_BASE_URL").filter(|u| !u.is_empty()),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.settings, WorldSettings::default());
        assert_eq!(config.default_model, "gpt-4o-mini");
        assert!(config.openai_api_key.is_none());
    }

    #[test]
    fn test_overrides() {
        let config = Config::from_lookup(lookup(&[
            ("AGENT_WORLD_TURN_LIMIT", "3"),
            ("AGENT_WORLD_MEMORY_WINDOW", "10"),
            ("AGENT_WORLD_DATA_DIR", "/tmp/worlds"),
            ("OPENAI_API_KEY", "sk-test"),
        ]))
        .unwrap();
        assert_eq!(config.settings.default_turn_limit, 3);
        assert_eq!(config.settings.memory_window, 10);
        assert_eq!(config.data_dir, PathBuf::from("/tmp/worlds"));
        assert_eq!(config.openai_api_key.as_deref(), Some("sk-test"));
    }

    #[test]
    fn test_bad_number_has_context() {
        let err = Config::from_lookup(lookup(&[("AGENT_WORLD_TURN_LIMIT", "many")])).unwrap_err();
        assert!(err.to_string().contains("AGENT_WORLD_TURN_LIMIT"));
    }

    #[test]
    fn test_zero_window_rejected() {
        assert!(Config::from_lookup(lookup(&[("AGENT_WORLD_MEMORY_WINDOW", "0")])).is_err());
        let settings = WorldSettings {
            memory_window: 0,
            ..Default::default()
        };
        assert!(matches!(settings.validate(), Err(WorldError::InvalidConfig(_))));
    }
}
