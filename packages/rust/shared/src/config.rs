//! Application configuration for Citelens.
//!
//! User config lives at `~/.citelens/citelens.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{CitelensError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "citelens.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".citelens";

/// Minimum similarity a query↔passage pair needs to be assignable.
pub const DEFAULT_ASSIGNMENT_THRESHOLD: f64 = 0.3;

// ---------------------------------------------------------------------------
// Config structs (matching citelens.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// OpenRouter settings for the structural reasoning service.
    #[serde(default)]
    pub openrouter: OpenRouterConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Minimum combined similarity (0–1) for a query to claim a passage.
    #[serde(default = "default_assignment_threshold")]
    pub assignment_threshold: f64,

    /// Queries processed concurrently during batch optimization.
    #[serde(default = "default_batch_concurrency")]
    pub batch_concurrency: u32,

    /// Token ceiling for a single chunk produced by `citelens chunk`.
    #[serde(default = "default_max_chunk_tokens")]
    pub max_chunk_tokens: usize,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            assignment_threshold: default_assignment_threshold(),
            batch_concurrency: default_batch_concurrency(),
            max_chunk_tokens: default_max_chunk_tokens(),
        }
    }
}

fn default_assignment_threshold() -> f64 {
    DEFAULT_ASSIGNMENT_THRESHOLD
}
fn default_batch_concurrency() -> u32 {
    3
}
fn default_max_chunk_tokens() -> usize {
    512
}

/// `[openrouter]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenRouterConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// Default model to use for structural analysis.
    #[serde(default = "default_model")]
    pub default_model: String,

    /// Base URL of the OpenAI-compatible API.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Request timeout in seconds.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OpenRouterConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            default_model: default_model(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OPENROUTER_API_KEY".into()
}
fn default_model() -> String {
    "moonshotai/kimi-k2.5".into()
}
fn default_base_url() -> String {
    "https://openrouter.ai/api/v1".into()
}
fn default_timeout_secs() -> u64 {
    120
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.citelens/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| CitelensError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.citelens/citelens.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| CitelensError::io(path, e))?;

    let config: AppConfig = toml::from_str(&content).map_err(|e| {
        CitelensError::config(format!("failed to parse {}: {e}", path.display()))
    })?;

    if !(0.0..=1.0).contains(&config.defaults.assignment_threshold) {
        return Err(CitelensError::config(format!(
            "assignment_threshold must be within 0.0..=1.0, got {}",
            config.defaults.assignment_threshold
        )));
    }
    if config.defaults.batch_concurrency == 0 {
        return Err(CitelensError::config("batch_concurrency must be at least 1"));
    }

    Ok(config)
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| CitelensError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| CitelensError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| CitelensError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the OpenRouter API key from the configured env var.
pub fn validate_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.openrouter.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(CitelensError::config(format!(
            "OpenRouter API key not found. Set the {var_name} environment variable.\n\
             Get a key at https://openrouter.ai/keys"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_serializes() {
        let config = AppConfig::default();
        let toml_str = toml::to_string_pretty(&config).expect("serialize default config");
        assert!(toml_str.contains("assignment_threshold"));
        assert!(toml_str.contains("OPENROUTER_API_KEY"));
    }

    #[test]
    fn partial_config_fills_defaults() {
        let toml_str = r#"
[defaults]
batch_concurrency = 8

[openrouter]
default_model = "openai/gpt-4o-mini"
"#;
        let config: AppConfig = toml::from_str(toml_str).expect("parse");
        assert_eq!(config.defaults.batch_concurrency, 8);
        assert_eq!(config.defaults.assignment_threshold, DEFAULT_ASSIGNMENT_THRESHOLD);
        assert_eq!(config.defaults.max_chunk_tokens, 512);
        assert_eq!(config.openrouter.default_model, "openai/gpt-4o-mini");
        assert_eq!(config.openrouter.base_url, "https://openrouter.ai/api/v1");
    }

    #[test]
    fn load_rejects_out_of_range_threshold() {
        let dir = std::env::temp_dir().join(format!("citelens-config-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bad.toml");
        std::fs::write(&path, "[defaults]\nassignment_threshold = 1.5\n").unwrap();

        let err = load_config_from(&path).unwrap_err();
        assert!(err.to_string().contains("assignment_threshold"));

        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn api_key_validation() {
        let mut config = AppConfig::default();
        // Use a unique env var name to avoid interfering with other tests
        config.openrouter.api_key_env = "CITELENS_TEST_NONEXISTENT_KEY_12345".into();
        let result = validate_api_key(&config);
        assert!(result.is_err());
        assert!(result.unwrap_err().to_string().contains("API key not found"));
    }
}
