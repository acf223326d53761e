//! Configuration management for delegate.
//!
//! Loads configuration from ${DELEGATE_HOME}/config.toml with sensible defaults.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub mod paths {
    //! Path resolution for delegate configuration and data directories.
    //!
    //! DELEGATE_HOME resolution order:
    //! 1. DELEGATE_HOME environment variable (if set)
    //! 2. $HOME/.config/delegate (default)
    //! 3. ./.delegate when no home directory is known

    use std::path::PathBuf;

    /// Returns the delegate home directory.
    pub fn delegate_home() -> PathBuf {
        if let Ok(home) = std::env::var("DELEGATE_HOME")
            && !home.trim().is_empty()
        {
            return PathBuf::from(home);
        }

        match std::env::var_os("HOME") {
            Some(home) => PathBuf::from(home).join(".config").join("delegate"),
            None => PathBuf::from(".delegate"),
        }
    }

    /// Returns the path to the config.toml file.
    pub fn config_path() -> PathBuf {
        delegate_home().join("config.toml")
    }

    /// Returns the default directory for persisted job records.
    pub fn jobs_dir() -> PathBuf {
        delegate_home().join("jobs")
    }
}

/// Anthropic provider settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AnthropicProviderConfig {
    /// API key. Falls back to `ANTHROPIC_API_KEY`.
    pub api_key: Option<String>,
    /// Base URL. `ANTHROPIC_BASE_URL` wins over this value.
    pub base_url: Option<String>,
}

/// Provider configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvidersConfig {
    pub anthropic: AnthropicProviderConfig,
}

/// How job progress is rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Minimum interval between chat message edits.
    pub debounce_ms: u64,
    /// Show full detail for every node and skip summaries.
    pub verbose: bool,
    /// Maximum characters per chat message before splitting.
    pub message_limit: usize,
    /// Base URL of the job inspector; the job id is appended.
    pub job_link_base: Option<String>,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 500,
            verbose: false,
            message_limit: 4096,
            job_link_base: None,
        }
    }
}

impl OutputConfig {
    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    /// Builds the inspector link for a job, if configured.
    pub fn job_link(&self, job_id: &str) -> Option<String> {
        self.job_link_base
            .as_deref()
            .map(str::trim)
            .filter(|base| !base.is_empty())
            .map(|base| format!("{}/{job_id}", base.trim_end_matches('/')))
    }
}

/// One-line summaries for finished calls.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SummarizerConfig {
    pub enabled: bool,
    pub model: String,
}

impl Default for SummarizerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            model: "claude-haiku-4-5".to_string(),
        }
    }
}

/// Job persistence.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct JobsConfig {
    pub store_dir: Option<PathBuf>,
}

impl JobsConfig {
    pub fn store_dir(&self) -> PathBuf {
        self.store_dir.clone().unwrap_or_else(paths::jobs_dir)
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Directory for daily rolling log files. Logs go to stderr when unset.
    pub dir: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            dir: None,
        }
    }
}

/// Telegram bot configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    /// Bot token for Telegram API.
    pub bot_token: Option<String>,
    /// Allowlist of numeric Telegram user IDs.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist_user_ids: Vec<i64>,
    /// Allowlist of numeric Telegram chat IDs (for groups/supergroups).
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowlist_chat_ids: Vec<i64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Model used by the demo agents.
    pub model: String,

    /// Maximum output tokens per model call.
    pub max_output_tokens: u32,

    /// Extended thinking budget in tokens (0 disables).
    pub thinking_budget: u32,

    /// Tool rounds allowed per agent run.
    pub max_tool_iterations: usize,

    /// Timeout for tool execution in seconds (0 disables).
    pub tool_timeout_secs: u64,

    pub providers: ProvidersConfig,
    pub output: OutputConfig,
    pub summarizer: SummarizerConfig,
    pub jobs: JobsConfig,
    pub logging: LoggingConfig,
    pub telegram: TelegramConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            model: Self::DEFAULT_MODEL.to_string(),
            max_output_tokens: Self::DEFAULT_MAX_OUTPUT_TOKENS,
            thinking_budget: 0,
            max_tool_iterations: Self::DEFAULT_MAX_TOOL_ITERATIONS,
            tool_timeout_secs: Self::DEFAULT_TOOL_TIMEOUT_SECS,
            providers: ProvidersConfig::default(),
            output: OutputConfig::default(),
            summarizer: SummarizerConfig::default(),
            jobs: JobsConfig::default(),
            logging: LoggingConfig::default(),
            telegram: TelegramConfig::default(),
        }
    }
}

impl Config {
    const DEFAULT_MODEL: &str = "claude-sonnet-4-5";
    const DEFAULT_MAX_OUTPUT_TOKENS: u32 = 8192;
    pub const DEFAULT_MAX_TOOL_ITERATIONS: usize = 10;
    const DEFAULT_TOOL_TIMEOUT_SECS: u64 = 120;

    /// Loads configuration from the default config path.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load() -> Result<Self> {
        Self::load_from(&paths::config_path())
    }

    /// Loads configuration from a specific path.
    /// Returns defaults if file doesn't exist.
    ///
    /// # Errors
    /// Returns an error if the file exists but cannot be read or parsed.
    pub fn load_from(path: &Path) -> Result<Self> {
        if path.exists() {
            let contents = fs::read_to_string(path)
                .with_context(|| format!("Failed to read config from {}", path.display()))?;
            toml::from_str(&contents)
                .with_context(|| format!("Failed to parse config from {}", path.display()))
        } else {
            Ok(Config::default())
        }
    }

    /// Per-call tool timeout, `None` when disabled.
    pub fn tool_timeout(&self) -> Option<Duration> {
        (self.tool_timeout_secs > 0).then(|| Duration::from_secs(self.tool_timeout_secs))
    }

    /// Extended thinking budget, `None` when disabled.
    pub fn thinking_budget(&self) -> Option<u32> {
        (self.thinking_budget > 0).then_some(self.thinking_budget)
    }
}

#[cfg(test)]
mod tests {
    use tempfile::tempdir;

    use super::*;

    #[test]
    fn missing_file_returns_defaults() {
        let dir = tempdir().unwrap();
        let config = Config::load_from(&dir.path().join("nope.toml")).unwrap();
        assert_eq!(config.model, "claude-sonnet-4-5");
        assert_eq!(config.max_tool_iterations, 10);
        assert_eq!(config.output.debounce_ms, 500);
        assert_eq!(config.output.message_limit, 4096);
        assert!(config.summarizer.enabled);
        assert_eq!(config.tool_timeout(), Some(Duration::from_secs(120)));
        assert_eq!(config.thinking_budget(), None);
    }

    #[test]
    fn partial_config_merges_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            r#"
model = "claude-opus-4-5"
tool_timeout_secs = 0

[output]
verbose = true

[telegram]
allowlist_user_ids = [42]
"#,
        )
        .unwrap();

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config.model, "claude-opus-4-5");
        assert_eq!(config.max_output_tokens, 8192);
        assert!(config.output.verbose);
        assert_eq!(config.output.debounce_ms, 500);
        assert_eq!(config.tool_timeout(), None);
        assert_eq!(config.telegram.allowlist_user_ids, vec![42]);
        assert!(config.telegram.bot_token.is_none());
    }

    #[test]
    fn invalid_toml_is_an_error() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(&path, "model = [").unwrap();

        let err = Config::load_from(&path).unwrap_err();
        assert!(err.to_string().contains("Failed to parse config"));
    }

    #[test]
    fn job_link_joins_base_and_id() {
        let output = OutputConfig {
            job_link_base: Some("https://inspect.example/jobs/".to_string()),
            ..OutputConfig::default()
        };
        assert_eq!(
            output.job_link("abc").as_deref(),
            Some("https://inspect.example/jobs/abc")
        );
        assert_eq!(OutputConfig::default().job_link("abc"), None);
    }
}
