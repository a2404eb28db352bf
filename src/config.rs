//! TOML configuration.
//!
//! Loaded once per process by [`load_config`] and passed by reference to
//! every component. Nothing writes back to the file; the sync watermark
//! lives in the store.
//!
//! ```toml
//! [db]
//! path = "./data/smoothbrain.sqlite"
//!
//! [readwise]
//! # api_key = "..."          # or READWISE_TOKEN
//!
//! [generation]
//! model = "gpt-4o-mini"
//! concurrency = 4
//!
//! [sync]
//! deck_name = "SmoothBrain"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const READWISE_TOKEN_ENV: &str = "READWISE_TOKEN";
pub const OPENAI_API_KEY_ENV: &str = "OPENAI_API_KEY";

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub readwise: ReadwiseConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReadwiseConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_readwise_base_url")]
    pub base_url: String,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for ReadwiseConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_readwise_base_url(),
            timeout_secs: None,
        }
    }
}

fn default_readwise_base_url() -> String {
    "https://readwise.io/api/v2".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default)]
    pub api_key: Option<String>,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_generation_base_url")]
    pub base_url: String,
    /// Simultaneous outstanding completion requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_max_output_tokens")]
    pub max_output_tokens: u32,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Per-request timeout. Absent means no timeout.
    #[serde(default)]
    pub timeout_secs: Option<u64>,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: default_model(),
            base_url: default_generation_base_url(),
            concurrency: default_concurrency(),
            max_output_tokens: default_max_output_tokens(),
            temperature: default_temperature(),
            max_retries: default_max_retries(),
            timeout_secs: None,
        }
    }
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}
fn default_generation_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_concurrency() -> usize {
    4
}
fn default_max_output_tokens() -> u32 {
    256
}
fn default_temperature() -> f32 {
    0.5
}
fn default_max_retries() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct SyncConfig {
    #[serde(default = "default_deck_name")]
    pub deck_name: String,
    /// Debug cap on documents processed per run.
    #[serde(default)]
    pub max_documents: Option<usize>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            deck_name: default_deck_name(),
            max_documents: None,
        }
    }
}

fn default_deck_name() -> String {
    "SmoothBrain".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_level")]
    pub level: String,
    /// `text` or `json`.
    #[serde(default = "default_format")]
    pub format: String,
    #[serde(default)]
    pub file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_level(),
            format: default_format(),
            file: None,
        }
    }
}

fn default_level() -> String {
    "info".to_string()
}
fn default_format() -> String {
    "text".to_string()
}

impl Config {
    /// Config with defaults everywhere and the database at `db_path`.
    pub fn with_db_path(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig {
                path: db_path.into(),
            },
            readwise: ReadwiseConfig::default(),
            generation: GenerationConfig::default(),
            sync: SyncConfig::default(),
            logging: LoggingConfig::default(),
        }
    }

    /// Readwise token from the file, else from `READWISE_TOKEN`.
    pub fn readwise_token(&self) -> Option<String> {
        non_empty(self.readwise.api_key.clone()).or_else(|| env_var(READWISE_TOKEN_ENV))
    }

    /// Completion key from the file, else from `OPENAI_API_KEY`.
    pub fn generation_api_key(&self) -> Option<String> {
        non_empty(self.generation.api_key.clone()).or_else(|| env_var(OPENAI_API_KEY_ENV))
    }

    /// Documents-per-run cap: the CLI flag wins over the config value.
    pub fn document_limit(&self, flag: Option<usize>) -> Option<usize> {
        flag.or(self.sync.max_documents)
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn env_var(name: &str) -> Option<String> {
    non_empty(std::env::var(name).ok())
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.generation.concurrency == 0 {
        anyhow::bail!("generation.concurrency must be >= 1");
    }

    if !(0.0..=2.0).contains(&config.generation.temperature) {
        anyhow::bail!("generation.temperature must be in [0.0, 2.0]");
    }

    if config.generation.max_output_tokens == 0 {
        anyhow::bail!("generation.max_output_tokens must be > 0");
    }

    if config.sync.deck_name.trim().is_empty() {
        anyhow::bail!("sync.deck_name must not be empty");
    }

    if config.sync.max_documents == Some(0) {
        anyhow::bail!("sync.max_documents must be >= 1 when set");
    }

    match config.logging.format.as_str() {
        "text" | "json" => {}
        other => anyhow::bail!(
            "Unknown logging.format: '{}'. Must be text or json.",
            other
        ),
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(body: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(body.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_minimal_config_gets_defaults() {
        let file = write_config("[db]\npath = \"./data/sb.sqlite\"\n");
        let cfg = load_config(file.path()).unwrap();

        assert_eq!(cfg.generation.concurrency, 4);
        assert_eq!(cfg.generation.max_output_tokens, 256);
        assert_eq!(cfg.generation.temperature, 0.5);
        assert!(cfg.generation.timeout_secs.is_none());
        assert_eq!(cfg.sync.deck_name, "SmoothBrain");
        assert_eq!(cfg.readwise.base_url, "https://readwise.io/api/v2");
        assert_eq!(cfg.logging.format, "text");
    }

    #[test]
    fn test_overrides_are_read() {
        let file = write_config(
            r#"
[db]
path = "sb.sqlite"

[generation]
model = "gpt-4o"
base_url = "http://localhost:9999/v1"
concurrency = 2
timeout_secs = 30

[sync]
deck_name = "Reading"
max_documents = 5
"#,
        );
        let cfg = load_config(file.path()).unwrap();
        assert_eq!(cfg.generation.model, "gpt-4o");
        assert_eq!(cfg.generation.concurrency, 2);
        assert_eq!(cfg.generation.timeout_secs, Some(30));
        assert_eq!(cfg.sync.deck_name, "Reading");
        assert_eq!(cfg.document_limit(None), Some(5));
        assert_eq!(cfg.document_limit(Some(1)), Some(1));
    }

    #[test]
    fn test_rejects_zero_concurrency() {
        let file = write_config("[db]\npath = \"a\"\n[generation]\nconcurrency = 0\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("concurrency"));
    }

    #[test]
    fn test_rejects_bad_temperature_and_format() {
        let file = write_config("[db]\npath = \"a\"\n[generation]\ntemperature = 3.5\n");
        assert!(load_config(file.path()).is_err());

        let file = write_config("[db]\npath = \"a\"\n[logging]\nformat = \"xml\"\n");
        assert!(load_config(file.path()).is_err());
    }

    #[test]
    fn test_file_key_wins_over_env() {
        let mut cfg = Config::with_db_path("a");
        cfg.readwise.api_key = Some("from-file".to_string());
        assert_eq!(cfg.readwise_token().as_deref(), Some("from-file"));
    }

    #[test]
    fn test_missing_file_errors() {
        let err = load_config(Path::new("/nonexistent/sb.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
