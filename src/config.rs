use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{ensure_unit_interval, MemoryError};

#[derive(Debug, Deserialize, Clone, Default)]
#[serde(default)]
pub struct StrataConfig {
    pub logging: LoggingConfig,
    pub storage: StorageConfig,
    pub lifecycle: LifecycleConfig,
    pub dedup: DedupConfig,
    pub consolidation: ConsolidationConfig,
    pub retrieval: RetrievalConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: String,
    pub embedding_dim: usize,
}

/// Promotion, decay, and archival thresholds.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct LifecycleConfig {
    pub working_min_age_minutes: i64,
    pub working_min_access: u32,
    pub working_min_importance: f64,
    pub short_term_min_importance: f64,
    pub half_life_days: f64,
    pub archive_age_days: i64,
    pub archive_max_importance: f64,
    pub archive_decay_floor: f64,
    /// Max records visited per tier in one sweep.
    pub sweep_limit: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DedupConfig {
    pub global_threshold: f64,
    pub batch_threshold: f64,
    pub batch_window: usize,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct ConsolidationConfig {
    pub volume_trigger: usize,
    pub window_min_volume: usize,
    /// UTC hour the maintenance window opens (inclusive).
    pub window_start_hour: u32,
    /// UTC hour the maintenance window closes (exclusive).
    pub window_end_hour: u32,
    pub concurrency: usize,
    pub max_group_size: usize,
    pub fetch_limit: usize,
    pub importance: f64,
    pub lease_ttl_secs: i64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RetrievalConfig {
    pub default_top_k: usize,
    pub rrf_k: usize,
    pub vector_weight: f64,
    pub text_weight: f64,
    pub adaptive_intent: bool,
    pub proximity_window: f64,
    pub neighbor_limit: usize,
    pub max_query_variants: usize,
    pub embedding_cache_size: usize,
    pub embedding_cache_ttl_secs: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        let db_path = default_strata_dir()
            .join("memory.db")
            .to_string_lossy()
            .into_owned();
        Self {
            db_path,
            embedding_dim: 384,
        }
    }
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            working_min_age_minutes: 30,
            working_min_access: 5,
            working_min_importance: 0.8,
            short_term_min_importance: 0.9,
            half_life_days: 30.0,
            archive_age_days: 90,
            archive_max_importance: 0.3,
            archive_decay_floor: 0.1,
            sweep_limit: 1000,
        }
    }
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            global_threshold: 0.98,
            batch_threshold: 0.95,
            batch_window: 50,
        }
    }
}

impl Default for ConsolidationConfig {
    fn default() -> Self {
        Self {
            volume_trigger: 100,
            window_min_volume: 20,
            window_start_hour: 2,
            window_end_hour: 5,
            concurrency: 5,
            max_group_size: 10,
            fetch_limit: 500,
            importance: 0.8,
            lease_ttl_secs: 600,
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            default_top_k: 10,
            rrf_k: 60,
            vector_weight: 1.0,
            text_weight: 1.0,
            adaptive_intent: true,
            proximity_window: 10.0,
            neighbor_limit: 20,
            max_query_variants: 3,
            embedding_cache_size: 256,
            embedding_cache_ttl_secs: 300,
        }
    }
}

/// Returns `~/.strata/`, or `./.strata/` when no home directory is known.
pub fn default_strata_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".strata")
}

/// Returns the default config file path: `~/.strata/config.toml`
pub fn default_config_path() -> PathBuf {
    default_strata_dir().join("config.toml")
}

impl StrataConfig {
    /// Load config from TOML file (if it exists) then apply env var overrides.
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path, then apply env var overrides and validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents =
                std::fs::read_to_string(path).context("failed to read config file")?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            info!("no config file at {}, using defaults", path.display());
            StrataConfig::default()
        };

        config.apply_env_overrides();
        config.validate().context("invalid configuration")?;
        Ok(config)
    }

    /// Apply environment variable overrides (STRATA_DB, STRATA_LOG_LEVEL).
    fn apply_env_overrides(&mut self) {
        if let Ok(val) = std::env::var("STRATA_DB") {
            self.storage.db_path = val;
        }
        if let Ok(val) = std::env::var("STRATA_LOG_LEVEL") {
            self.logging.level = val;
        }
    }

    /// Resolve the database path, expanding `~` if needed.
    pub fn resolved_db_path(&self) -> PathBuf {
        expand_tilde(&self.storage.db_path)
    }

    /// Reject out-of-range thresholds and zero-sized limits.
    pub fn validate(&self) -> Result<(), MemoryError> {
        let l = &self.lifecycle;
        ensure_unit_interval("lifecycle.working_min_importance", l.working_min_importance)?;
        ensure_unit_interval("lifecycle.short_term_min_importance", l.short_term_min_importance)?;
        ensure_unit_interval("lifecycle.archive_max_importance", l.archive_max_importance)?;
        ensure_unit_interval("lifecycle.archive_decay_floor", l.archive_decay_floor)?;
        positive("lifecycle.half_life_days", l.half_life_days)?;
        non_zero("lifecycle.sweep_limit", l.sweep_limit)?;
        if l.working_min_age_minutes < 0 || l.archive_age_days < 0 {
            return Err(MemoryError::validation("lifecycle ages must not be negative"));
        }

        let d = &self.dedup;
        ensure_unit_interval("dedup.global_threshold", d.global_threshold)?;
        ensure_unit_interval("dedup.batch_threshold", d.batch_threshold)?;
        non_zero("dedup.batch_window", d.batch_window)?;

        let c = &self.consolidation;
        ensure_unit_interval("consolidation.importance", c.importance)?;
        non_zero("consolidation.concurrency", c.concurrency)?;
        non_zero("consolidation.max_group_size", c.max_group_size)?;
        non_zero("consolidation.fetch_limit", c.fetch_limit)?;
        if c.lease_ttl_secs <= 0 {
            return Err(MemoryError::validation("consolidation.lease_ttl_secs must be positive"));
        }
        if c.window_start_hour > 23 || c.window_end_hour > 24 {
            return Err(MemoryError::validation(
                "consolidation window hours must be within 0..=24",
            ));
        }

        let r = &self.retrieval;
        non_zero("retrieval.default_top_k", r.default_top_k)?;
        non_negative("retrieval.vector_weight", r.vector_weight)?;
        non_negative("retrieval.text_weight", r.text_weight)?;
        positive("retrieval.proximity_window", r.proximity_window)?;
        non_zero("retrieval.max_query_variants", r.max_query_variants)?;

        non_zero("storage.embedding_dim", self.storage.embedding_dim)?;
        Ok(())
    }
}

fn non_zero(name: &str, value: usize) -> Result<(), MemoryError> {
    if value == 0 {
        return Err(MemoryError::validation(format!("{name} must be greater than 0")));
    }
    Ok(())
}

fn positive(name: &str, value: f64) -> Result<(), MemoryError> {
    if !(value > 0.0 && value.is_finite()) {
        return Err(MemoryError::validation(format!("{name} must be positive, got {value}")));
    }
    Ok(())
}

fn non_negative(name: &str, value: f64) -> Result<(), MemoryError> {
    if !(value >= 0.0 && value.is_finite()) {
        return Err(MemoryError::validation(format!(
            "{name} must not be negative, got {value}"
        )));
    }
    Ok(())
}

pub fn expand_tilde(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        let config = StrataConfig::default();
        assert_eq!(config.logging.level, "info");
        assert_eq!(config.retrieval.rrf_k, 60);
        assert_eq!(config.dedup.global_threshold, 0.98);
        assert_eq!(config.consolidation.concurrency, 5);
        assert!(config.storage.db_path.ends_with("memory.db"));
        config.validate().unwrap();
    }

    #[test]
    fn parse_toml_config() {
        let toml_str = r#"
[logging]
level = "debug"

[storage]
db_path = "/tmp/test.db"
embedding_dim = 8

[consolidation]
volume_trigger = 50
"#;
        let config: StrataConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.storage.db_path, "/tmp/test.db");
        assert_eq!(config.storage.embedding_dim, 8);
        assert_eq!(config.consolidation.volume_trigger, 50);
        // defaults still apply for unset fields
        assert_eq!(config.consolidation.window_min_volume, 20);
        assert_eq!(config.lifecycle.half_life_days, 30.0);
    }

    #[test]
    fn validate_rejects_out_of_range_values() {
        let mut config = StrataConfig::default();
        config.dedup.global_threshold = 1.2;
        assert!(matches!(config.validate(), Err(MemoryError::Validation(_))));

        let mut config = StrataConfig::default();
        config.consolidation.concurrency = 0;
        assert!(config.validate().is_err());

        let mut config = StrataConfig::default();
        config.retrieval.text_weight = -0.5;
        assert!(config.validate().is_err());

        let mut config = StrataConfig::default();
        config.consolidation.lease_ttl_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn load_from_missing_file_uses_defaults() {
        let tmp = tempfile::TempDir::new().unwrap();
        let config = StrataConfig::load_from(tmp.path().join("absent.toml")).unwrap();
        assert_eq!(config.retrieval.default_top_k, 10);
    }

    #[test]
    fn load_from_rejects_invalid_file() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("config.toml");
        std::fs::write(&path, "[dedup]\nbatch_threshold = 7.0\n").unwrap();
        assert!(StrataConfig::load_from(&path).is_err());
    }

    #[test]
    fn env_overrides_apply() {
        let mut config = StrataConfig::default();
        std::env::set_var("STRATA_DB", "/tmp/override.db");
        std::env::set_var("STRATA_LOG_LEVEL", "trace");

        config.apply_env_overrides();

        assert_eq!(config.storage.db_path, "/tmp/override.db");
        assert_eq!(config.logging.level, "trace");

        // Clean up
        std::env::remove_var("STRATA_DB");
        std::env::remove_var("STRATA_LOG_LEVEL");
    }
}
