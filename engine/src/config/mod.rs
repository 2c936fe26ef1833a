//! Configuration management
//!
//! This module handles loading, validation, and management of the Polyquery configuration.
//! Configuration is stored in TOML format at ~/.polyquery/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **llm**: Language-generation provider settings and preferences
//! - **stores**: Structured (SQLite) and document (Data API) store settings
//! - **orchestration**: Concurrency, retry and timeout policy for task execution
//!
//! # Path Expansion
//!
//! The configuration system automatically expands ~ to the user's home directory
//! for `core.data_dir` and `stores.structured.path`.
//!
//! # Examples
//!
//! ```no_run
//! use polyquery_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//!
//! println!("Structured store: {:?}", config.stores.structured.path);
//! println!("Default provider: {}", config.llm.default_provider);
//! # Ok(())
//! # }
//! ```

use sdk::errors::EngineError;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// LLM provider configuration
    pub llm: LLMConfig,

    /// Backing store configuration
    #[serde(default)]
    pub stores: StoresConfig,

    /// Task orchestration policy
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// LLM provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LLMConfig {
    /// Default LLM provider (ollama, openai)
    pub default_provider: String,

    /// Per-attempt timeout in seconds. When unset, local providers get 120s
    /// and cloud providers 30s.
    #[serde(default)]
    pub request_timeout_secs: Option<u64>,

    /// Sampling temperature passed to every provider
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Ollama provider settings
    #[serde(default)]
    pub ollama: OllamaConfig,

    /// OpenAI provider settings
    #[serde(default)]
    pub openai: OpenAIConfig,
}

/// Ollama provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OllamaConfig {
    /// Base URL for Ollama API
    #[serde(default = "default_ollama_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_ollama_model")]
    pub model: String,
}

/// OpenAI provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIConfig {
    /// Base URL for OpenAI API
    #[serde(default = "default_openai_base_url")]
    pub base_url: String,

    /// Model name
    #[serde(default = "default_openai_model")]
    pub model: String,

    /// Environment variable holding the API key
    #[serde(default = "default_openai_api_key_env")]
    pub api_key_env: String,
}

/// Backing store configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StoresConfig {
    /// Structured (SQLite) store
    #[serde(default)]
    pub structured: StructuredStoreConfig,

    /// Document store
    #[serde(default)]
    pub document: DocumentStoreConfig,
}

/// Structured store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StructuredStoreConfig {
    /// SQLite database file (supports ~ expansion)
    #[serde(default = "default_structured_path")]
    pub path: PathBuf,

    /// Maximum pooled connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
}

/// Document store configuration
///
/// The document store is reached over a JSON Data API
/// (`POST {base_url}/action/<operation>`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentStoreConfig {
    /// Base URL of the Data API endpoint
    #[serde(default = "default_document_base_url")]
    pub base_url: String,

    /// Cluster / data source name sent with every request
    #[serde(default = "default_data_source")]
    pub data_source: String,

    /// Database selected when a session opens
    #[serde(default = "default_document_database")]
    pub database: String,

    /// Databases reported by `list_databases`
    #[serde(default)]
    pub databases: Vec<String>,

    /// Collections known to exist in each database
    #[serde(default = "default_collections")]
    pub collections: Vec<String>,

    /// Environment variable holding the Data API key
    #[serde(default = "default_document_api_key_env")]
    pub api_key_env: String,

    /// Number of documents sampled per collection for schema inference
    #[serde(default = "default_sample_size")]
    pub sample_size: u32,
}

/// Orchestration policy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrchestrationConfig {
    /// In-flight tasks allowed per executor kind (1 = sequential per kind)
    #[serde(default = "default_max_concurrency_per_kind")]
    pub max_concurrency_per_kind: usize,

    /// Upper bound on per-task retries requested by a batch's error_handling
    #[serde(default)]
    pub max_task_retries: u32,

    /// LLM attempts allowed for producing a valid decomposition
    #[serde(default = "default_decompose_attempts")]
    pub decompose_attempts: u32,

    /// Deadline for a single store operation in seconds
    #[serde(default = "default_store_timeout_secs")]
    pub store_timeout_secs: u64,

    /// Inject tasks for stores whose schema matches the request but got no task
    #[serde(default = "default_true")]
    pub enforce_coverage: bool,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.polyquery")
}

fn default_temperature() -> f32 {
    0.7
}

fn default_ollama_base_url() -> String {
    "http://localhost:11434".to_string()
}

fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}

fn default_ollama_model() -> String {
    "llama3.1:8b".to_string()
}

fn default_openai_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_openai_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_structured_path() -> PathBuf {
    PathBuf::from("~/.polyquery/sales.db")
}

fn default_max_connections() -> u32 {
    5
}

fn default_document_base_url() -> String {
    "http://localhost:8080/api/v1".to_string()
}

fn default_data_source() -> String {
    "local".to_string()
}

fn default_document_database() -> String {
    "user_management_db".to_string()
}

fn default_collections() -> Vec<String> {
    vec![
        "users".to_string(),
        "roles".to_string(),
        "activity_logs".to_string(),
    ]
}

fn default_document_api_key_env() -> String {
    "POLYQUERY_DOCUMENT_API_KEY".to_string()
}

fn default_sample_size() -> u32 {
    100
}

fn default_max_concurrency_per_kind() -> usize {
    1
}

fn default_decompose_attempts() -> u32 {
    2
}

fn default_store_timeout_secs() -> u64 {
    30
}

impl Default for OllamaConfig {
    fn default() -> Self {
        Self {
            base_url: default_ollama_base_url(),
            model: default_ollama_model(),
        }
    }
}

impl Default for OpenAIConfig {
    fn default() -> Self {
        Self {
            base_url: default_openai_base_url(),
            model: default_openai_model(),
            api_key_env: default_openai_api_key_env(),
        }
    }
}

impl Default for StructuredStoreConfig {
    fn default() -> Self {
        Self {
            path: default_structured_path(),
            max_connections: default_max_connections(),
        }
    }
}

impl Default for DocumentStoreConfig {
    fn default() -> Self {
        Self {
            base_url: default_document_base_url(),
            data_source: default_data_source(),
            database: default_document_database(),
            databases: Vec::new(),
            collections: default_collections(),
            api_key_env: default_document_api_key_env(),
            sample_size: default_sample_size(),
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_kind: default_max_concurrency_per_kind(),
            max_task_retries: 0,
            decompose_attempts: default_decompose_attempts(),
            store_timeout_secs: default_store_timeout_secs(),
            enforce_coverage: true,
        }
    }
}

impl DocumentStoreConfig {
    /// Databases reported to callers; falls back to the configured default database
    pub fn known_databases(&self) -> Vec<String> {
        if self.databases.is_empty() {
            vec![self.database.clone()]
        } else {
            self.databases.clone()
        }
    }
}

impl Config {
    /// Load configuration from the default location (~/.polyquery/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - Configuration file cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    pub fn load_or_create() -> Result<Self, EngineError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = fs::read_to_string(path)
            .map_err(|e| EngineError::Config(format!("Failed to read config file: {}", e)))?;

        Self::from_toml_str(&contents)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(contents: &str) -> Result<Self, EngineError> {
        let mut config: Config = toml::from_str(contents)
            .map_err(|e| EngineError::Config(format!("Failed to parse config: {}", e)))?;

        config.validate_and_process()?;

        Ok(config)
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| {
                EngineError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let config = Self::default_config();

        // Persist the unexpanded form so ~ survives a move between machines
        let toml_string = toml::to_string_pretty(&config)
            .map_err(|e| EngineError::Config(format!("Failed to serialize config: {}", e)))?;

        fs::write(path, toml_string)
            .map_err(|e| EngineError::Config(format!("Failed to write config file: {}", e)))?;

        let mut config = config;
        config.validate_and_process()?;

        Ok(config)
    }

    /// Get the default configuration file path (~/.polyquery/config.toml)
    fn default_config_path() -> Result<PathBuf, EngineError> {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(".polyquery").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            llm: LLMConfig {
                default_provider: "ollama".to_string(),
                request_timeout_secs: None,
                temperature: default_temperature(),
                ollama: OllamaConfig::default(),
                openai: OpenAIConfig::default(),
            },
            stores: StoresConfig::default(),
            orchestration: OrchestrationConfig::default(),
        }
    }

    /// Validate and process configuration
    ///
    /// Validates enumerated fields and numeric bounds, then expands ~ in paths.
    fn validate_and_process(&mut self) -> Result<(), EngineError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let valid_providers = ["ollama", "openai"];
        if !valid_providers.contains(&self.llm.default_provider.as_str()) {
            return Err(EngineError::Config(format!(
                "Invalid default provider '{}'. Must be one of: {}",
                self.llm.default_provider,
                valid_providers.join(", ")
            )));
        }

        if !(0.0..=2.0).contains(&self.llm.temperature) {
            return Err(EngineError::Config(
                "temperature must be between 0.0 and 2.0".to_string(),
            ));
        }

        if self.llm.request_timeout_secs == Some(0) {
            return Err(EngineError::Config(
                "request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.stores.structured.max_connections == 0 {
            return Err(EngineError::Config(
                "stores.structured.max_connections must be at least 1".to_string(),
            ));
        }

        if self.orchestration.max_concurrency_per_kind == 0 {
            return Err(EngineError::Config(
                "orchestration.max_concurrency_per_kind must be at least 1".to_string(),
            ));
        }

        if self.orchestration.decompose_attempts == 0 {
            return Err(EngineError::Config(
                "orchestration.decompose_attempts must be at least 1".to_string(),
            ));
        }

        if self.orchestration.store_timeout_secs == 0 {
            return Err(EngineError::Config(
                "orchestration.store_timeout_secs must be greater than 0".to_string(),
            ));
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.stores.structured.path = expand_path(&self.stores.structured.path)?;

        Ok(())
    }
}

/// Expand ~ in path to user's home directory
///
/// # Examples
///
/// ```ignore
/// let path = PathBuf::from("~/data/sales.db");
/// let expanded = expand_path(&path)?;
/// // expanded is now /home/user/data/sales.db (on Unix)
/// ```
pub fn expand_path(path: &Path) -> Result<PathBuf, EngineError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| EngineError::Config("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))?;

        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| EngineError::Config("Could not determine home directory".to_string()))
    } else {
        Ok(path.to_path_buf())
    }
}
