use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, ZenError};
use crate::mapper;
use crate::paths;

pub const LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error", "fatal", "panic"];
pub const OUTPUT_FORMATS: &[&str] = &["text", "json", "yaml"];

/// Environment variable prefix for overrides (`ZEN_CACHE_SIZE_LIMIT_MB`).
pub const ENV_PREFIX: &str = "ZEN_";

// ---------------------------------------------------------------------------
// ConfigWarning / WarnLevel
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConfigWarning {
    pub level: WarnLevel,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WarnLevel {
    Warning,
    Error,
}

impl ConfigWarning {
    fn warning(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Warning,
            message: message.into(),
        }
    }

    fn error(message: impl Into<String>) -> Self {
        Self {
            level: WarnLevel::Error,
            message: message.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Per-provider overrides
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_burst")]
    pub burst: u32,
    #[serde(default = "default_rate")]
    pub rate_per_sec: f64,
}

fn default_burst() -> u32 {
    20
}

fn default_rate() -> f64 {
    10.0
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            burst: default_burst(),
            rate_per_sec: default_rate(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitConfig {
    #[serde(default = "default_threshold")]
    pub threshold: u32,
    #[serde(default = "default_reset_secs")]
    pub reset_timeout_secs: u64,
}

fn default_threshold() -> u32 {
    5
}

fn default_reset_secs() -> u64 {
    30
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self {
            threshold: default_threshold(),
            reset_timeout_secs: default_reset_secs(),
        }
    }
}

impl CircuitConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_secs(self.reset_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProviderConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_key: Option<String>,
    /// `owner/name` for source-forge providers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// `bearer` (default) or `basic`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub field_mappings: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub circuit: Option<CircuitConfig>,
}

// ---------------------------------------------------------------------------
// IntegrationConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IntegrationConfig {
    /// Name of the provider that is the system of record, or `none`.
    #[serde(default = "default_task_system")]
    pub task_system: String,
    #[serde(default)]
    pub sync_enabled: bool,
    #[serde(default)]
    pub providers: BTreeMap<String, ProviderConfig>,
    #[serde(default = "default_health_interval")]
    pub health_interval_secs: u64,
}

fn default_task_system() -> String {
    "none".to_string()
}

fn default_health_interval() -> u64 {
    60
}

impl Default for IntegrationConfig {
    fn default() -> Self {
        Self {
            task_system: default_task_system(),
            sync_enabled: false,
            providers: BTreeMap::new(),
            health_interval_secs: default_health_interval(),
        }
    }
}

impl IntegrationConfig {
    pub fn is_configured(&self) -> bool {
        let ts = self.task_system.trim();
        !ts.is_empty() && !ts.eq_ignore_ascii_case("none")
    }

    pub fn provider(&self, name: &str) -> Option<&ProviderConfig> {
        self.providers.get(name)
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// CacheConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    #[serde(default = "default_cache_path")]
    pub base_path: PathBuf,
    #[serde(default = "default_size_limit_mb")]
    pub size_limit_mb: u64,
    /// 0 = entries never expire.
    #[serde(default)]
    pub default_ttl_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
}

fn default_cache_path() -> PathBuf {
    PathBuf::from(paths::DEFAULT_CACHE_DIR)
}

fn default_size_limit_mb() -> u64 {
    100
}

fn default_cleanup_interval() -> u64 {
    300
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            base_path: default_cache_path(),
            size_limit_mb: default_size_limit_mb(),
            default_ttl_secs: 0,
            cleanup_interval_secs: default_cleanup_interval(),
        }
    }
}

impl CacheConfig {
    /// Absolute cache directory: `~` expanded, relative paths anchored at `root`.
    pub fn resolved_path(&self, root: &Path) -> PathBuf {
        paths::resolve_under(root, &self.base_path)
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

// ---------------------------------------------------------------------------
// Config (top-level)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default = "default_version")]
    pub version: u32,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_output")]
    pub output: String,
    #[serde(default)]
    pub integration: IntegrationConfig,
    #[serde(default)]
    pub cache: CacheConfig,
}

fn default_version() -> u32 {
    1
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_output() -> String {
    "text".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: default_version(),
            log_level: default_log_level(),
            output: default_output(),
            integration: IntegrationConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

impl Config {
    /// Load `<root>/.zen/config.yaml`.
    pub fn load(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if !path.exists() {
            return Err(ZenError::config(format!("no config at {}", path.display()))
                .with_hint("run `zen init` to create one"));
        }
        Self::load_from(&path)
    }

    /// Load `<root>/.zen/config.yaml`, falling back to defaults when absent.
    pub fn load_or_default(root: &Path) -> Result<Self> {
        let path = paths::config_path(root);
        if path.exists() {
            Self::load_from(&path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path).map_err(|e| {
            ZenError::config(format!("cannot read {}", path.display())).with_source(e)
        })?;
        serde_yaml::from_str(&data).map_err(|e| {
            ZenError::config(format!("invalid config {}", path.display())).with_source(e)
        })
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        self.save_to(&paths::config_path(root))
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let data = serde_yaml::to_string(self)?;
        crate::io::atomic_write(path, data.as_bytes())
    }

    /// Apply `ZEN_*` overrides. Unknown variables are ignored; malformed
    /// values are a `config_error`.
    pub fn apply_env<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: AsRef<str>,
    {
        for (key, value) in vars {
            let Some(name) = key.as_ref().strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let value = value.as_ref();
            match name {
                "LOG_LEVEL" => self.log_level = value.to_ascii_lowercase(),
                "OUTPUT" => self.output = value.to_ascii_lowercase(),
                "INTEGRATION_TASK_SYSTEM" => self.integration.task_system = value.to_string(),
                "INTEGRATION_SYNC_ENABLED" => {
                    self.integration.sync_enabled = parse_bool(name, value)?
                }
                "INTEGRATION_HEALTH_INTERVAL_SECS" => {
                    self.integration.health_interval_secs = parse_num(name, value)?
                }
                "CACHE_BASE_PATH" => self.cache.base_path = PathBuf::from(value),
                "CACHE_SIZE_LIMIT_MB" => self.cache.size_limit_mb = parse_num(name, value)?,
                "CACHE_DEFAULT_TTL_SECS" => self.cache.default_ttl_secs = parse_num(name, value)?,
                "CACHE_CLEANUP_INTERVAL_SECS" => {
                    self.cache.cleanup_interval_secs = parse_num(name, value)?
                }
                _ => {}
            }
        }
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Validation
    // -----------------------------------------------------------------------

    pub fn validate(&self) -> Vec<ConfigWarning> {
        let mut warnings = Vec::new();

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            warnings.push(ConfigWarning::error(format!(
                "invalid log_level '{}' (expected one of {})",
                self.log_level,
                LOG_LEVELS.join("|")
            )));
        }
        if !OUTPUT_FORMATS.contains(&self.output.as_str()) {
            warnings.push(ConfigWarning::error(format!(
                "invalid output '{}' (expected one of {})",
                self.output,
                OUTPUT_FORMATS.join("|")
            )));
        }

        let integ = &self.integration;
        if integ.sync_enabled && !integ.is_configured() {
            warnings.push(ConfigWarning::warning(
                "integration.sync_enabled is true but no task_system is set",
            ));
        }
        if integ.is_configured()
            && integ.task_system == "jira"
            && integ
                .provider("jira")
                .and_then(|p| p.server_url.as_deref())
                .map_or(true, |u| u.trim().is_empty())
        {
            warnings.push(ConfigWarning::error(
                "task_system 'jira' requires integration.providers.jira.server_url",
            ));
        }
        if integ.health_interval_secs == 0 {
            warnings.push(ConfigWarning::warning(
                "integration.health_interval_secs is 0; health monitoring is disabled",
            ));
        }

        for (name, p) in &integ.providers {
            if let Some(auth) = p.auth_type.as_deref() {
                if auth != "bearer" && auth != "basic" {
                    warnings.push(ConfigWarning::error(format!(
                        "provider '{name}' has unknown auth_type '{auth}'"
                    )));
                }
            }
            if !p.field_mappings.is_empty() {
                if let Err(e) = mapper::validate_mapping(&p.field_mappings) {
                    warnings.push(ConfigWarning::error(format!(
                        "provider '{name}' field_mappings: {}",
                        e.message
                    )));
                }
            }
            if let Some(rl) = &p.rate_limit {
                if rl.burst == 0 || rl.rate_per_sec <= 0.0 {
                    warnings.push(ConfigWarning::error(format!(
                        "provider '{name}' rate_limit needs burst > 0 and rate_per_sec > 0"
                    )));
                }
            }
            if let Some(cb) = &p.circuit {
                if cb.threshold == 0 {
                    warnings.push(ConfigWarning::error(format!(
                        "provider '{name}' circuit.threshold must be at least 1"
                    )));
                }
            }
        }

        if self.cache.size_limit_mb == 0 {
            warnings.push(ConfigWarning::warning(
                "cache.size_limit_mb is 0; the cache is unbounded",
            ));
        }

        warnings
    }

    /// Fail with `config_error` when validation reports any error-level issue.
    pub fn ensure_valid(&self) -> Result<()> {
        let errors: Vec<String> = self
            .validate()
            .into_iter()
            .filter(|w| w.level == WarnLevel::Error)
            .map(|w| w.message)
            .collect();
        if errors.is_empty() {
            Ok(())
        } else {
            Err(ZenError::config(errors.join("; ")).with_hint("run `zen config validate`"))
        }
    }

    /// `tracing` filter directive for `log_level`.
    pub fn log_directive(&self) -> &'static str {
        match self.log_level.as_str() {
            "trace" => "trace",
            "debug" => "debug",
            "warn" => "warn",
            "error" | "fatal" | "panic" => "error",
            _ => "info",
        }
    }
}

fn parse_bool(name: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ZenError::config(format!(
            "{ENV_PREFIX}{name}: expected a boolean, got '{value}'"
        ))),
    }
}

fn parse_num(name: &str, value: &str) -> Result<u64> {
    value.trim().parse().map_err(|_| {
        ZenError::config(format!("{ENV_PREFIX}{name}: expected a number, got '{value}'"))
    })
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
