//! Configuration for Doclens
//!
//! Every hand-tuned constant of the cache and learning loop lives here as a
//! named field with a default, so an empty TOML file is a valid config.

use crate::error::{DoclensError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Environment variable naming a TOML config file
pub const CONFIG_ENV: &str = "DOCLENS_CONFIG";

/// Environment variable overriding the database location
pub const DB_PATH_ENV: &str = "DOCLENS_DB_PATH";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub ledger: LedgerConfig,
    pub learning: LearningConfig,
    pub experiments: ExperimentConfig,
    pub thresholds: ChangeThresholds,
    pub export: ExportConfig,
}

/// Where the database and rule file live
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
    pub rules_path: PathBuf,

    /// Maximum pooled connections
    pub pool_size: usize,

    /// SQLite busy timeout (in seconds)
    #[serde(with = "serde_duration")]
    pub busy_timeout: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Lifetime of a cache entry (in seconds)
    #[serde(with = "serde_duration")]
    pub ttl: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LedgerConfig {
    /// Delay before a delivery becomes eligible for scoring (in seconds)
    #[serde(with = "serde_duration")]
    pub grace_period: Duration,

    /// Minimum contributing sessions for an aggregate group
    pub min_group_sessions: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Maximum sessions scored per cycle
    pub batch_size: usize,

    /// Lookback window for aggregation and style analysis
    pub window_days: i64,

    /// Lookback window for sequence analysis
    pub pattern_window_days: i64,

    /// Sections must score strictly above this mean to be kept
    pub effectiveness_floor: f64,

    /// Minimum sessions backing a kept section
    pub min_section_sessions: usize,

    /// Upper bound on sections per derived rule
    pub max_sections: usize,

    /// No new session is scored once a cycle has run this long (in seconds)
    #[serde(with = "serde_duration")]
    pub time_budget: Duration,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// How long a test runs before completing (in seconds)
    #[serde(with = "serde_duration")]
    pub duration: Duration,

    /// Probability of assignment to the test arm
    pub traffic_split: f64,

    /// Sessions each arm needs before a recommendation is made
    pub min_sessions_per_arm: usize,

    /// Improvement (in percent) that separates a winner from noise
    pub improvement_threshold_pct: f64,

    /// Tests older than this are purged at finalize (in seconds)
    #[serde(with = "serde_duration")]
    pub retention: Duration,
}

/// Thresholds deciding between direct replacement and an experiment
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChangeThresholds {
    /// Relative token budget change that triggers an experiment
    pub token_change_ratio: f64,

    /// Section symmetric difference, relative to the active list
    pub section_change_ratio: f64,

    pub high_confidence: f64,
    pub high_confidence_sessions: i64,

    /// Session growth factor allowing direct replacement
    pub session_growth_factor: f64,

    pub confidence_gain: f64,
    pub confidence_gain_sessions: i64,

    /// Candidates below this confidence never replace an existing rule
    pub min_confidence: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExportConfig {
    pub enabled: bool,

    /// Program and arguments; the cache entry JSON is written to stdin
    pub command: Vec<String>,

    /// Bounded queue length; overflow is dropped
    pub queue_capacity: usize,

    /// Per-export timeout (in seconds)
    #[serde(with = "serde_duration")]
    pub timeout: Duration,
}

// Custom serde module for Duration (serialize/deserialize as seconds)
mod serde_duration {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// Default data directory: `<data_local_dir>/doclens`, or `./.doclens`
pub fn default_data_dir() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("doclens"))
        .unwrap_or_else(|| PathBuf::from(".doclens"))
}

impl Default for StorageConfig {
    fn default() -> Self {
        let dir = default_data_dir();
        Self {
            db_path: dir.join("doclens.db"),
            rules_path: dir.join("rules.json"),
            pool_size: 4,
            busy_timeout: Duration::from_secs(30),
        }
    }
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(86400), // 24 hours
        }
    }
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            grace_period: Duration::from_secs(300), // 5 minutes
            min_group_sessions: 3,
        }
    }
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            window_days: 7,
            pattern_window_days: 14,
            effectiveness_floor: 0.3,
            min_section_sessions: 2,
            max_sections: 6,
            time_budget: Duration::from_secs(60),
        }
    }
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(604800), // 7 days
            traffic_split: 0.5,
            min_sessions_per_arm: 20,
            improvement_threshold_pct: 5.0,
            retention: Duration::from_secs(2592000), // 30 days
        }
    }
}

impl Default for ChangeThresholds {
    fn default() -> Self {
        Self {
            token_change_ratio: 0.3,
            section_change_ratio: 0.5,
            high_confidence: 0.8,
            high_confidence_sessions: 10,
            session_growth_factor: 1.5,
            confidence_gain: 0.1,
            confidence_gain_sessions: 5,
            min_confidence: 0.3,
        }
    }
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            command: Vec::new(),
            queue_capacity: 64,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Load configuration from TOML file
    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Load configuration from TOML string
    pub fn from_toml(toml_str: &str) -> Result<Self> {
        let config: Config =
            toml::from_str(toml_str).map_err(|e| DoclensError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Resolve configuration from an explicit path, then `DOCLENS_CONFIG`,
    /// falling back to defaults. `DOCLENS_DB_PATH` overrides the database path.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let env_path = std::env::var_os(CONFIG_ENV).map(PathBuf::from);
        let mut config = match explicit.map(Path::to_path_buf).or(env_path) {
            Some(path) => {
                debug!("Loading config from {}", path.display());
                Self::from_file(&path)?
            }
            None => Self::default(),
        };

        if let Some(db) = std::env::var_os(DB_PATH_ENV) {
            config.storage.db_path = PathBuf::from(db);
        }
        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.cache.ttl.is_zero() {
            return Err(invalid("cache.ttl must be greater than zero"));
        }

        if self.storage.pool_size == 0 {
            return Err(invalid("storage.pool_size must be at least 1"));
        }

        if self.learning.batch_size == 0 || self.learning.batch_size > 10000 {
            return Err(invalid("learning.batch_size must be between 1 and 10000"));
        }

        if self.learning.window_days <= 0 || self.learning.pattern_window_days <= 0 {
            return Err(invalid("learning windows must be at least 1 day"));
        }

        if !(0.0..1.0).contains(&self.learning.effectiveness_floor) {
            return Err(invalid("learning.effectiveness_floor must be in [0, 1)"));
        }

        if self.learning.time_budget.is_zero() {
            return Err(invalid("learning.time_budget must be greater than zero"));
        }

        if self.learning.max_sections == 0 {
            return Err(invalid("learning.max_sections must be at least 1"));
        }

        let split = self.experiments.traffic_split;
        if split <= 0.0 || split >= 1.0 {
            return Err(invalid("experiments.traffic_split must be in (0, 1)"));
        }

        if self.experiments.duration.is_zero() {
            return Err(invalid("experiments.duration must be greater than zero"));
        }

        let t = &self.thresholds;
        let positive = [
            t.token_change_ratio,
            t.section_change_ratio,
            t.high_confidence,
            t.session_growth_factor,
            t.confidence_gain,
            self.experiments.improvement_threshold_pct,
        ];
        if positive.iter().any(|v| *v <= 0.0) {
            return Err(invalid("thresholds must be positive"));
        }

        if self.export.enabled && self.export.command.is_empty() {
            return Err(invalid("export.command is required when export is enabled"));
        }

        if self.export.queue_capacity == 0 {
            return Err(invalid("export.queue_capacity must be at least 1"));
        }

        Ok(())
    }

    /// Save configuration to TOML file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let toml_str =
            toml::to_string_pretty(self).map_err(|e| DoclensError::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, toml_str)?;
        Ok(())
    }
}

fn invalid(msg: &str) -> DoclensError {
    DoclensError::Config(msg.to_string())
}
