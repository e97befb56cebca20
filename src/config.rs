//! Runtime configuration for agent-relay.
//!
//! Configuration is read from a small set of named variables. Resolution
//! priority is always:
//!
//! 1. **Process environment** (highest priority)
//! 2. **Environment-file values** handed in by the host's env-file loader
//!
//! The env-file loader itself is an external collaborator; this module
//! only consumes the already-materialized key/value map.
//!
//! ## Variables
//!
//! | Variable | Meaning |
//! |----------|---------|
//! | `GEMINI_API_KEY` | Plain API key credential |
//! | `GOOGLE_API_KEY` | Enterprise key credential |
//! | `GOOGLE_CLOUD_PROJECT` | Enterprise project id |
//! | `GOOGLE_CLOUD_LOCATION` | Enterprise region |
//! | `OPENROUTER_API_KEY` | Marketplace aggregator key |
//! | `AGENT_RELAY_AGENT_MODE` | Enables autonomous agent sessions (`1`/`true`) |
//! | `AGENT_RELAY_COST_LIMIT_USD` | Daily cost ceiling for the ledger |
//! | `AGENT_RELAY_DEFAULT_MODEL` | Router default-model hint |

use crate::{Error, Result};
use crate::types::find_model;
use std::collections::HashMap;
use std::env;
use std::path::PathBuf;

/// Materialized runtime settings.
#[derive(Debug, Clone, Default)]
pub struct RelayConfig {
    /// Plain API key (`GEMINI_API_KEY`).
    pub api_key: Option<String>,

    /// Enterprise key (`GOOGLE_API_KEY`).
    pub enterprise_key: Option<String>,

    /// Enterprise project (`GOOGLE_CLOUD_PROJECT`).
    pub enterprise_project: Option<String>,

    /// Enterprise region (`GOOGLE_CLOUD_LOCATION`).
    pub enterprise_location: Option<String>,

    /// Marketplace aggregator key (`OPENROUTER_API_KEY`).
    pub marketplace_key: Option<String>,

    /// Whether autonomous agent sessions may be created.
    pub agent_mode_enabled: bool,

    /// Daily monetary ceiling for the cost ledger, in USD.
    pub cost_limit_usd_per_day: Option<f64>,

    /// Default model hint consulted by the router.
    pub default_model: Option<String>,
}

impl RelayConfig {
    /// Read configuration from the process environment only.
    pub fn from_env() -> Result<Self> {
        Self::from_env_with_file(&HashMap::new())
    }

    /// Read configuration with env-file fallback values. Process
    /// environment always wins.
    pub fn from_env_with_file(file_values: &HashMap<String, String>) -> Result<Self> {
        Self::from_sources(|name| {
            env::var(name)
                .ok()
                .or_else(|| file_values.get(name).cloned())
        })
    }

    /// Build from an arbitrary lookup function. This is the pure core the
    /// env-backed constructors delegate to.
    pub fn from_sources(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let agent_mode_enabled = match lookup("AGENT_RELAY_AGENT_MODE") {
            None => false,
            Some(raw) => parse_bool(&raw).ok_or_else(|| {
                Error::config(format!(
                    "AGENT_RELAY_AGENT_MODE must be a boolean, got `{}`",
                    raw
                ))
            })?,
        };

        let cost_limit_usd_per_day = match lookup("AGENT_RELAY_COST_LIMIT_USD") {
            None => None,
            Some(raw) => {
                let value: f64 = raw.parse().map_err(|_| {
                    Error::config(format!(
                        "AGENT_RELAY_COST_LIMIT_USD must be a number, got `{}`",
                        raw
                    ))
                })?;
                if value < 0.0 {
                    return Err(Error::config(
                        "AGENT_RELAY_COST_LIMIT_USD must not be negative",
                    ));
                }
                Some(value)
            }
        };

        let default_model = lookup("AGENT_RELAY_DEFAULT_MODEL");
        if let Some(name) = &default_model {
            if find_model(name).is_none() {
                return Err(Error::config(format!(
                    "AGENT_RELAY_DEFAULT_MODEL names unknown model `{}`",
                    name
                )));
            }
        }

        Ok(Self {
            api_key: lookup("GEMINI_API_KEY"),
            enterprise_key: lookup("GOOGLE_API_KEY"),
            enterprise_project: lookup("GOOGLE_CLOUD_PROJECT"),
            enterprise_location: lookup("GOOGLE_CLOUD_LOCATION"),
            marketplace_key: lookup("OPENROUTER_API_KEY"),
            agent_mode_enabled,
            cost_limit_usd_per_day,
            default_model,
        })
    }

    /// Fail fast when agent mode is not enabled. Agent sessions relax the
    /// tool restrictions passed to the worker CLI, so they are opt-in.
    pub fn ensure_agent_mode(&self) -> Result<()> {
        if self.agent_mode_enabled {
            Ok(())
        } else {
            Err(Error::config(
                "agent mode is disabled; set AGENT_RELAY_AGENT_MODE=1 to allow autonomous sessions",
            ))
        }
    }

    /// User-writable state directory (`~/.agent-relay`), used for the cache
    /// file and agent-session artifacts.
    pub fn state_dir() -> Result<PathBuf> {
        dirs::home_dir()
            .map(|home| home.join(".agent-relay"))
            .ok_or_else(|| Error::config("cannot determine home directory"))
    }
}

fn parse_bool(raw: &str) -> Option<bool> {
    match raw.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lookup_from<'a>(map: &'a HashMap<&'a str, &'a str>) -> impl Fn(&str) -> Option<String> + 'a {
        move |name| map.get(name).map(|v| v.to_string())
    }

    #[test]
    fn test_empty_sources_yield_defaults() {
        let config = RelayConfig::from_sources(|_| None).unwrap();
        assert!(config.api_key.is_none());
        assert!(!config.agent_mode_enabled);
        assert!(config.cost_limit_usd_per_day.is_none());
    }

    #[test]
    fn test_full_sources() {
        let map = HashMap::from([
            ("GEMINI_API_KEY", "AIzaSyTest"),
            ("GOOGLE_API_KEY", "AIzaSyEnterprise"),
            ("GOOGLE_CLOUD_PROJECT", "my-project"),
            ("GOOGLE_CLOUD_LOCATION", "us-central1"),
            ("OPENROUTER_API_KEY", "sk-or-v1-test"),
            ("AGENT_RELAY_AGENT_MODE", "true"),
            ("AGENT_RELAY_COST_LIMIT_USD", "2.50"),
            ("AGENT_RELAY_DEFAULT_MODEL", "gemini-2.5-flash"),
        ]);
        let config = RelayConfig::from_sources(lookup_from(&map)).unwrap();
        assert_eq!(config.api_key.as_deref(), Some("AIzaSyTest"));
        assert_eq!(config.enterprise_project.as_deref(), Some("my-project"));
        assert!(config.agent_mode_enabled);
        assert_eq!(config.cost_limit_usd_per_day, Some(2.50));
        assert_eq!(config.default_model.as_deref(), Some("gemini-2.5-flash"));
    }

    #[test]
    fn test_malformed_agent_mode_rejected() {
        let map = HashMap::from([("AGENT_RELAY_AGENT_MODE", "maybe")]);
        let err = RelayConfig::from_sources(lookup_from(&map)).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_malformed_cost_limit_rejected() {
        let map = HashMap::from([("AGENT_RELAY_COST_LIMIT_USD", "lots")]);
        assert!(RelayConfig::from_sources(lookup_from(&map)).is_err());

        let map = HashMap::from([("AGENT_RELAY_COST_LIMIT_USD", "-1")]);
        assert!(RelayConfig::from_sources(lookup_from(&map)).is_err());
    }

    #[test]
    fn test_unknown_default_model_rejected() {
        let map = HashMap::from([("AGENT_RELAY_DEFAULT_MODEL", "gpt-99")]);
        let err = RelayConfig::from_sources(lookup_from(&map)).unwrap_err();
        assert!(err.to_string().contains("gpt-99"));
    }

    #[test]
    fn test_agent_gate() {
        let config = RelayConfig::default();
        assert!(config.ensure_agent_mode().is_err());

        let config = RelayConfig {
            agent_mode_enabled: true,
            ..Default::default()
        };
        assert!(config.ensure_agent_mode().is_ok());
    }

    #[test]
    fn test_parse_bool_variants() {
        assert_eq!(parse_bool("1"), Some(true));
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("off"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }
}
