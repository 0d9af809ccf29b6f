use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable holding the inference provider token (default name)
pub const DEFAULT_TOKEN_ENV: &str = "HF_API_TOKEN";

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// How submitted applications are launched and supervised
    #[serde(default)]
    pub runtime: RuntimeConfig,

    /// Inference provider settings for model dispatch
    #[serde(default)]
    pub inference: InferenceConfig,

    /// Model table, keyed by model id
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Public HTTP port (the PORT environment variable overrides this)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Bind address (default: 0.0.0.0)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Port for the internal admin API (0 disables it)
    #[serde(default = "default_admin_port")]
    pub admin_port: u16,

    /// Authentication token for the admin API
    /// If not set, a random token is generated at startup and logged
    pub admin_token: Option<String>,

    /// Base URL used when building application URLs (default: derived from Host)
    pub public_url: Option<String>,

    /// Maximum accepted size of a submitted program in bytes
    #[serde(default = "default_max_source_bytes")]
    pub max_source_bytes: usize,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_listen_port(),
            bind: default_bind_address(),
            admin_port: default_admin_port(),
            admin_token: None,
            public_url: None,
            max_source_bytes: default_max_source_bytes(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
        }
    }
}

/// Launch and supervision settings for submitted applications
///
/// # Security Warning
///
/// Submitted source is executed by `command` with the full privileges of the
/// gateway process. Nothing here isolates it.
#[derive(Debug, Deserialize, Clone)]
pub struct RuntimeConfig {
    /// Command line used to run a program; the source path is appended
    #[serde(default = "default_runtime_command")]
    pub command: String,

    /// File name the submitted source is written to
    #[serde(default = "default_source_file")]
    pub source_file: String,

    /// Directory holding one subdirectory per application
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,

    /// Extra environment variables for every backend
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Time a backend has to accept its first connection
    #[serde(default = "default_startup_timeout")]
    pub startup_timeout_secs: u64,

    /// Time a request waits for a starting backend before a 503
    #[serde(default = "default_start_wait")]
    pub start_wait_secs: u64,

    /// Interval between readiness probes in milliseconds
    #[serde(default = "default_health_interval")]
    pub health_check_interval_ms: u64,

    /// Maximum time to wait for a backend response
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Stop running backends idle for this long (0 disables)
    #[serde(default)]
    pub idle_timeout_secs: u64,

    /// Port allocations tried before a submission fails
    #[serde(default = "default_launch_attempts")]
    pub launch_attempts: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            command: default_runtime_command(),
            source_file: default_source_file(),
            data_dir: default_data_dir(),
            env: HashMap::new(),
            startup_timeout_secs: default_startup_timeout(),
            start_wait_secs: default_start_wait(),
            health_check_interval_ms: default_health_interval(),
            request_timeout_secs: default_request_timeout(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            idle_timeout_secs: 0,
            launch_attempts: default_launch_attempts(),
        }
    }
}

impl RuntimeConfig {
    /// Create a runtime config for the given command line with defaults
    pub fn new(command: &str, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.to_string(),
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Split the command line into program and arguments
    pub fn command_line(&self) -> anyhow::Result<Vec<String>> {
        let words = shell_words::split(&self.command)
            .map_err(|e| anyhow::anyhow!("invalid runtime command '{}': {}", self.command, e))?;
        if words.is_empty() {
            anyhow::bail!("runtime command is empty");
        }
        Ok(words)
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Bounded by the startup timeout so a request never outwaits the probe
    pub fn start_wait(&self) -> Duration {
        Duration::from_secs(self.start_wait_secs).min(self.startup_timeout())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.health_check_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    pub fn idle_timeout(&self) -> Option<Duration> {
        (self.idle_timeout_secs > 0).then(|| Duration::from_secs(self.idle_timeout_secs))
    }

    /// Validate the runtime configuration
    pub fn validate(&self) -> Result<(), String> {
        if let Err(e) = self.command_line() {
            return Err(e.to_string());
        }
        if self.source_file.is_empty() || self.source_file.contains('/') {
            return Err(format!(
                "runtime.source_file must be a plain file name, got '{}'",
                self.source_file
            ));
        }
        if self.launch_attempts == 0 {
            return Err("runtime.launch_attempts must be greater than 0".to_string());
        }
        if self.request_timeout_secs == 0 {
            return Err("runtime.request_timeout_secs must be greater than 0".to_string());
        }
        Ok(())
    }
}

/// Inference provider endpoints
#[derive(Debug, Deserialize, Clone)]
pub struct InferenceConfig {
    /// Environment variable holding the provider token
    #[serde(default = "default_token_env")]
    pub token_env: String,

    /// Endpoint for chat-style models
    #[serde(default = "default_chat_url")]
    pub chat_url: String,

    /// Base URL for text models; the model id is appended as a path segment
    #[serde(default = "default_inference_base_url")]
    pub inference_base_url: String,

    /// Timeout for one upstream call
    #[serde(default = "default_inference_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            token_env: default_token_env(),
            chat_url: default_chat_url(),
            inference_base_url: default_inference_base_url(),
            request_timeout_secs: default_inference_timeout(),
        }
    }
}

impl InferenceConfig {
    /// Read the provider token from the environment; missing or empty is an error
    pub fn load_token(&self) -> anyhow::Result<String> {
        match std::env::var(&self.token_env) {
            Ok(token) if !token.trim().is_empty() => Ok(token),
            _ => anyhow::bail!(
                "{} not set! Add it to .env (local) or the process environment",
                self.token_env
            ),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Request shape a model expects upstream
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    /// OpenAI-style chat completions
    #[default]
    Chat,
    /// Plain `{"inputs": ...}` inference
    Text,
}

/// One entry of the model table
#[derive(Debug, Deserialize, Clone)]
pub struct ModelConfig {
    /// Credential callers must present for this model
    pub api_key: String,

    /// Request shape
    #[serde(default, rename = "type")]
    pub kind: ModelKind,
}

// Default value functions
fn default_listen_port() -> u16 {
    8000
}

fn default_bind_address() -> String {
    "0.0.0.0".to_string()
}

fn default_admin_port() -> u16 {
    9999
}

fn default_max_source_bytes() -> usize {
    1024 * 1024
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_runtime_command() -> String {
    "python3 -u".to_string()
}

fn default_source_file() -> String {
    "app.py".to_string()
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./apps")
}

fn default_startup_timeout() -> u64 {
    30
}

fn default_start_wait() -> u64 {
    10
}

fn default_health_interval() -> u64 {
    100
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_grace_period() -> u64 {
    5
}

fn default_launch_attempts() -> u32 {
    3
}

fn default_token_env() -> String {
    DEFAULT_TOKEN_ENV.to_string()
}

fn default_chat_url() -> String {
    "https://router.huggingface.co/v1/chat/completions".to_string()
}

fn default_inference_base_url() -> String {
    "https://api-inference.huggingface.co/models".to_string()
}

fn default_inference_timeout() -> u64 {
    60
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply environment overrides (PORT)
    pub fn apply_env(&mut self) {
        if let Some(port) = std::env::var("PORT").ok().and_then(|p| p.parse().ok()) {
            self.server.port = port;
        }
    }

    /// Validate all configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if let Err(e) = self.runtime.validate() {
            errors.push(e);
        }

        if self.server.max_source_bytes == 0 {
            errors.push("server.max_source_bytes must be greater than 0".to_string());
        }

        for (model, entry) in &self.models {
            if entry.api_key.is_empty() {
                errors.push(format!("Model '{}': 'api_key' must not be empty", model));
            }
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
