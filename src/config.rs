// src/config.rs
// Startup configuration: defaults, optional ~/.contextd/config.toml, env overrides

use std::path::PathBuf;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

use crate::error::{ContextdError, Result};

/// Environment override names. Only these are recognised.
pub const ENV_AUTO_CHECKPOINT_ON_CLEAR: &str = "CONTEXTD_AUTO_CHECKPOINT_ON_CLEAR";
pub const ENV_AUTO_RESUME_ON_START: &str = "CONTEXTD_AUTO_RESUME_ON_START";
pub const ENV_CHECKPOINT_THRESHOLD: &str = "CONTEXTD_CHECKPOINT_THRESHOLD";
pub const ENV_VERIFY_BEFORE_CLEAR: &str = "CONTEXTD_VERIFY_BEFORE_CLEAR";

/// Hook manager configuration. Hot-reloadable as one snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HooksConfig {
    pub auto_checkpoint_on_clear: bool,
    pub auto_resume_on_start: bool,
    pub checkpoint_threshold_percent: u8,
    pub verify_before_clear: bool,
}

impl Default for HooksConfig {
    fn default() -> Self {
        Self {
            auto_checkpoint_on_clear: false,
            auto_resume_on_start: true,
            checkpoint_threshold_percent: 70,
            verify_before_clear: true,
        }
    }
}

impl HooksConfig {
    /// Apply recognised environment overrides. Parsing is strict: booleans
    /// must be exactly `true` or `false`, the threshold must be 1-99.
    pub fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var(ENV_AUTO_CHECKPOINT_ON_CLEAR) {
            self.auto_checkpoint_on_clear = parse_strict_bool(ENV_AUTO_CHECKPOINT_ON_CLEAR, &v)?;
        }
        if let Ok(v) = std::env::var(ENV_AUTO_RESUME_ON_START) {
            self.auto_resume_on_start = parse_strict_bool(ENV_AUTO_RESUME_ON_START, &v)?;
        }
        if let Ok(v) = std::env::var(ENV_VERIFY_BEFORE_CLEAR) {
            self.verify_before_clear = parse_strict_bool(ENV_VERIFY_BEFORE_CLEAR, &v)?;
        }
        if let Ok(v) = std::env::var(ENV_CHECKPOINT_THRESHOLD) {
            self.checkpoint_threshold_percent = parse_threshold(&v)?;
        }
        self.validate()
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=99).contains(&self.checkpoint_threshold_percent) {
            return Err(ContextdError::validation(
                "checkpoint_threshold_percent",
                "must be between 1 and 99",
            ));
        }
        Ok(())
    }
}

fn parse_strict_bool(name: &str, value: &str) -> Result<bool> {
    match value {
        "true" => Ok(true),
        "false" => Ok(false),
        other => Err(ContextdError::validation(
            name,
            format!("must be 'true' or 'false', got '{other}'"),
        )),
    }
}

fn parse_threshold(value: &str) -> Result<u8> {
    let n: u8 = value.parse().map_err(|_| {
        ContextdError::validation(ENV_CHECKPOINT_THRESHOLD, "must be an integer between 1 and 99")
    })?;
    if !(1..=99).contains(&n) {
        return Err(ContextdError::validation(
            ENV_CHECKPOINT_THRESHOLD,
            "must be between 1 and 99",
        ));
    }
    Ok(n)
}

/// Atomically-swappable hooks config. Handlers read the current snapshot
/// at event time; hot reload swaps the pointer.
#[derive(Debug, Default)]
pub struct HooksConfigHandle {
    inner: RwLock<Arc<HooksConfig>>,
}

impl HooksConfigHandle {
    pub fn new(config: HooksConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Current snapshot. Cheap; clones the Arc, not the config.
    pub fn current(&self) -> Arc<HooksConfig> {
        self.inner
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Swap in a new snapshot.
    pub fn swap(&self, config: HooksConfig) {
        let mut guard = self
            .inner
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *guard = Arc::new(config);
    }
}

/// Immutable daemon configuration loaded at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Mandatory tenant identifier (lowercase).
    pub tenant_id: String,
    /// Optional team identifier for shared pattern storage.
    pub team_id: Option<String>,
    /// Qdrant gRPC endpoint.
    pub qdrant_url: String,
    /// Address for the localhost HTTP API.
    pub http_addr: String,
    /// Embedding vector dimension.
    pub embedding_dim: usize,
    /// Whether the scrubber is active.
    pub scrub_enabled: bool,
    /// Replacement literal for redacted spans.
    pub scrub_replacement: String,
    pub hooks: HooksConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            tenant_id: "local".to_string(),
            team_id: None,
            qdrant_url: "http://localhost:6334".to_string(),
            http_addr: "127.0.0.1:8787".to_string(),
            embedding_dim: 256,
            scrub_enabled: true,
            scrub_replacement: crate::scrub::DEFAULT_REPLACEMENT.to_string(),
            hooks: HooksConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration: defaults, then `~/.contextd/config.toml` if
    /// present, then environment overrides.
    pub fn load() -> Result<Self> {
        let mut config = match Self::config_file_path() {
            Some(path) if path.exists() => {
                let raw = std::fs::read_to_string(&path)?;
                toml::from_str(&raw).map_err(|e| {
                    ContextdError::validation("config.toml", e.to_string())
                })?
            }
            _ => Self::default(),
        };
        config.apply_env_overrides()?;
        crate::identity::validate_tenant_id(&config.tenant_id)?;
        if let Some(ref team) = config.team_id {
            crate::identity::validate_team_id(team)?;
        }
        Ok(config)
    }

    fn config_file_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".contextd/config.toml"))
    }

    fn apply_env_overrides(&mut self) -> Result<()> {
        if let Ok(v) = std::env::var("CONTEXTD_TENANT") {
            self.tenant_id = v;
        }
        if let Ok(v) = std::env::var("CONTEXTD_TEAM") {
            self.team_id = if v.is_empty() { None } else { Some(v) };
        }
        if let Ok(v) = std::env::var("CONTEXTD_QDRANT_URL") {
            self.qdrant_url = v;
        }
        if let Ok(v) = std::env::var("CONTEXTD_HTTP_ADDR") {
            self.http_addr = v;
        }
        if let Ok(v) = std::env::var("CONTEXTD_EMBEDDING_DIM") {
            self.embedding_dim = v.parse().map_err(|_| {
                ContextdError::validation("CONTEXTD_EMBEDDING_DIM", "must be a positive integer")
            })?;
        }
        self.hooks.apply_env_overrides()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let hooks = HooksConfig::default();
        assert!(!hooks.auto_checkpoint_on_clear);
        assert!(hooks.auto_resume_on_start);
        assert_eq!(hooks.checkpoint_threshold_percent, 70);
        assert!(hooks.verify_before_clear);
    }

    #[test]
    fn test_strict_bool_parsing() {
        assert!(parse_strict_bool("X", "true").unwrap());
        assert!(!parse_strict_bool("X", "false").unwrap());
        assert!(parse_strict_bool("X", "True").is_err());
        assert!(parse_strict_bool("X", "1").is_err());
        assert!(parse_strict_bool("X", "yes").is_err());
    }

    #[test]
    fn test_threshold_parsing() {
        assert_eq!(parse_threshold("70").unwrap(), 70);
        assert_eq!(parse_threshold("1").unwrap(), 1);
        assert_eq!(parse_threshold("99").unwrap(), 99);
        assert!(parse_threshold("0").is_err());
        assert!(parse_threshold("100").is_err());
        assert!(parse_threshold("abc").is_err());
    }

    #[test]
    fn test_hooks_config_handle_swap() {
        let handle = HooksConfigHandle::new(HooksConfig::default());
        assert_eq!(handle.current().checkpoint_threshold_percent, 70);
        let mut updated = HooksConfig::default();
        updated.checkpoint_threshold_percent = 85;
        handle.swap(updated);
        assert_eq!(handle.current().checkpoint_threshold_percent, 85);
    }

    #[test]
    fn test_toml_roundtrip() {
        let raw = r#"
            tenant_id = "acme"
            qdrant_url = "http://localhost:7000"

            [hooks]
            auto_checkpoint_on_clear = true
            checkpoint_threshold_percent = 80
        "#;
        let config: Config = toml::from_str(raw).unwrap();
        assert_eq!(config.tenant_id, "acme");
        assert_eq!(config.qdrant_url, "http://localhost:7000");
        assert!(config.hooks.auto_checkpoint_on_clear);
        assert_eq!(config.hooks.checkpoint_threshold_percent, 80);
        // Unset fields keep defaults.
        assert!(config.hooks.auto_resume_on_start);
    }
}
