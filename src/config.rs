//! Pipeline configuration.
//! Loaded from a JSON file or built in code; every field has a default.
//! Secrets may be left out of the file and supplied through the environment.

use std::path::Path;
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::translate::azure::AzureConfig;
use crate::translate::baidu::BaiduConfig;
use crate::translate::chat::ChatConfig;
use crate::translate::tencent::TencentConfig;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("{backend} backend requires `{field}` (set it in the config or via ${env})")]
    MissingCredential {
        backend: &'static str,
        field: &'static str,
        env: &'static str,
    },
    #[error("invalid {name} pattern: {source}")]
    InvalidPattern {
        name: &'static str,
        #[source]
        source: regex::Error,
    },
    #[error("invalid setting: {0}")]
    Invalid(String),
}

/// Top-level settings for one pipeline instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Whether translation starts enabled.
    pub enabled: bool,
    /// Character budget for one dequeue cycle. Longer texts are chunked to this size.
    pub max_chars_per_cycle: usize,
    /// Optional cap on the number of queued requests taken per cycle.
    pub max_items_per_cycle: Option<usize>,
    /// Scheduler tick between cycles.
    pub cycle_interval_ms: u64,
    /// Result cache capacity (entries).
    pub cache_capacity: usize,
    /// Total characters that may be sent before translation is force-disabled.
    pub char_alert_threshold: Option<u64>,
    pub retry: RetryPolicy,
    pub http_timeout_secs: u64,
    pub filters: FilterConfig,
    pub backend: BackendConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_chars_per_cycle: 200,
            max_items_per_cycle: None,
            cycle_interval_ms: 100,
            cache_capacity: 10_000,
            char_alert_threshold: None,
            retry: RetryPolicy::default(),
            http_timeout_secs: 30,
            filters: FilterConfig::default(),
            backend: BackendConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Load settings from a JSON file, then fill missing secrets from the environment.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        let mut config: PipelineConfig = serde_json::from_str(&content)?;
        config.backend.fill_secrets_from_env();
        info!(path = %path.display(), backend = config.backend.name(), "pipeline config loaded");
        Ok(config)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_millis(self.cycle_interval_ms)
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    /// Checks everything that would make the pipeline unusable.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.validate_settings()?;
        self.backend.validate()
    }

    /// Pipeline settings only, leaving backend credentials aside.
    pub fn validate_settings(&self) -> Result<(), ConfigError> {
        if self.max_chars_per_cycle == 0 {
            return Err(ConfigError::Invalid("max_chars_per_cycle must be > 0".into()));
        }
        if self.cache_capacity == 0 {
            return Err(ConfigError::Invalid("cache_capacity must be > 0".into()));
        }
        self.filters.compile_all()
    }
}

/// Fixed-count, fixed-interval retry settings shared by every backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    pub max_retry_count: u32,
    pub retry_interval_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retry_count: 2,
            retry_interval_ms: 1000,
        }
    }
}

impl RetryPolicy {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.retry_interval_ms)
    }

    /// First attempt plus retries.
    pub fn max_attempts(&self) -> u32 {
        self.max_retry_count.saturating_add(1)
    }
}

/// Optional regex gates. A missing pattern always passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FilterConfig {
    /// Whole text must match this pattern.
    pub full_text: Option<String>,
    /// At least one line must match this pattern.
    pub per_line: Option<String>,
    /// Spans matching this pattern pass through untranslated. Capture groups keep
    /// the captured text as a fragment of its own.
    pub ignore: Option<String>,
    /// Drop texts already detected as the backend's target language.
    pub skip_target_language: bool,
    /// Lowest whatlang confidence at which a detection counts.
    pub language_confidence: f64,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            full_text: None,
            per_line: None,
            ignore: None,
            skip_target_language: false,
            language_confidence: 0.1,
        }
    }
}

impl FilterConfig {
    pub fn full_text_regex(&self) -> Result<Option<Regex>, ConfigError> {
        compile("full_text", self.full_text.as_deref())
    }

    pub fn per_line_regex(&self) -> Result<Option<Regex>, ConfigError> {
        compile("per_line", self.per_line.as_deref())
    }

    pub fn ignore_regex(&self) -> Result<Option<Regex>, ConfigError> {
        compile("ignore", self.ignore.as_deref())
    }

    fn compile_all(&self) -> Result<(), ConfigError> {
        self.full_text_regex()?;
        self.per_line_regex()?;
        self.ignore_regex()?;
        Ok(())
    }
}

fn compile(name: &'static str, pattern: Option<&str>) -> Result<Option<Regex>, ConfigError> {
    match pattern {
        None => Ok(None),
        Some(p) if p.is_empty() => Ok(None),
        Some(p) => Regex::new(p)
            .map(Some)
            .map_err(|source| ConfigError::InvalidPattern { name, source }),
    }
}

/// Backend selection; exactly one is active per pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    Tencent(TencentConfig),
    Baidu(BaiduConfig),
    Azure(AzureConfig),
    Chat(ChatConfig),
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Chat(ChatConfig::default())
    }
}

impl BackendConfig {
    pub fn name(&self) -> &'static str {
        match self {
            BackendConfig::Tencent(_) => "tencent",
            BackendConfig::Baidu(_) => "baidu",
            BackendConfig::Azure(_) => "azure",
            BackendConfig::Chat(_) => "chat",
        }
    }

    pub fn target_lang(&self) -> &str {
        match self {
            BackendConfig::Tencent(c) => &c.target_lang,
            BackendConfig::Baidu(c) => &c.target_lang,
            BackendConfig::Azure(c) => &c.target_lang,
            BackendConfig::Chat(c) => &c.target_lang,
        }
    }

    /// Fill any secret left empty in the file from its environment variable.
    pub fn fill_secrets_from_env(&mut self) {
        match self {
            BackendConfig::Tencent(c) => {
                fill_from_env(&mut c.secret_id, "TENCENT_SECRET_ID");
                fill_from_env(&mut c.secret_key, "TENCENT_SECRET_KEY");
            }
            BackendConfig::Baidu(c) => {
                fill_from_env(&mut c.app_id, "BAIDU_APP_ID");
                fill_from_env(&mut c.secret_key, "BAIDU_SECRET_KEY");
            }
            BackendConfig::Azure(c) => fill_from_env(&mut c.api_key, "AZURE_TRANSLATOR_KEY"),
            BackendConfig::Chat(c) => fill_from_env(&mut c.api_key, "CHAT_API_KEY"),
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        match self {
            BackendConfig::Tencent(c) => {
                require("tencent", "secret_id", "TENCENT_SECRET_ID", &c.secret_id)?;
                require("tencent", "secret_key", "TENCENT_SECRET_KEY", &c.secret_key)
            }
            BackendConfig::Baidu(c) => {
                require("baidu", "app_id", "BAIDU_APP_ID", &c.app_id)?;
                require("baidu", "secret_key", "BAIDU_SECRET_KEY", &c.secret_key)
            }
            BackendConfig::Azure(c) => {
                require("azure", "api_key", "AZURE_TRANSLATOR_KEY", &c.api_key)
            }
            BackendConfig::Chat(c) => {
                require("chat", "api_key", "CHAT_API_KEY", &c.api_key)?;
                if c.encoding == crate::translate::chat::ChatEncoding::Delimited
                    && c.delimiter.trim().is_empty()
                {
                    return Err(ConfigError::Invalid("chat delimiter must not be blank".into()));
                }
                Ok(())
            }
        }
    }
}

fn fill_from_env(slot: &mut Option<String>, var: &str) {
    if slot.as_deref().map_or(true, str::is_empty) {
        if let Ok(value) = std::env::var(var) {
            debug!(var, "secret taken from environment");
            *slot = Some(value);
        }
    }
}

fn require(
    backend: &'static str,
    field: &'static str,
    env: &'static str,
    value: &Option<String>,
) -> Result<(), ConfigError> {
    match value.as_deref() {
        Some(v) if !v.trim().is_empty() => Ok(()),
        _ => Err(ConfigError::MissingCredential { backend, field, env }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_missing_fields() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"max_chars_per_cycle": 50, "backend": {"kind": "azure", "target_lang": "de"}}"#,
        )
        .unwrap();
        assert_eq!(config.max_chars_per_cycle, 50);
        assert_eq!(config.retry.max_retry_count, 2);
        assert_eq!(config.cache_capacity, 10_000);
        assert_eq!(config.backend.name(), "azure");
        assert_eq!(config.backend.target_lang(), "de");
    }

    #[test]
    fn missing_credential_is_reported() {
        let config: PipelineConfig =
            serde_json::from_str(r#"{"backend": {"kind": "baidu", "app_id": "20240101"}}"#).unwrap();
        let err = config.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingCredential { backend: "baidu", field: "secret_key", .. }
        ));
    }

    #[test]
    fn invalid_pattern_is_reported() {
        let mut config = PipelineConfig::default();
        config.filters.ignore = Some("([unclosed".into());
        let err = config.filters.ignore_regex().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPattern { name: "ignore", .. }));
    }

    #[test]
    fn secrets_are_not_serialized() {
        let config: PipelineConfig = serde_json::from_str(
            r#"{"backend": {"kind": "tencent", "secret_id": "AKID", "secret_key": "shh"}}"#,
        )
        .unwrap();
        let out = serde_json::to_string(&config).unwrap();
        assert!(!out.contains("shh"));
        assert!(!out.contains("AKID"));
    }

    #[test]
    fn retry_policy_counts_first_attempt() {
        let policy = RetryPolicy {
            max_retry_count: 2,
            retry_interval_ms: 10,
        };
        assert_eq!(policy.max_attempts(), 3);
        assert_eq!(policy.interval(), Duration::from_millis(10));
    }
}
