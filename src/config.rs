use crate::error::{Error, Result};
use crate::llm::Provider;
use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const HOST_ENV: &str = "GRADIO_SERVER_HOST";
pub const PORT_ENV: &str = "GRADIO_SERVER_PORT";
pub const DATA_DIR_ENV: &str = "AGENT_LAB_DATA_DIR";

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub tools: ToolsConfig,
    #[serde(default)]
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LlmConfig {
    #[serde(default)]
    pub provider: Provider,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    pub api_key_env: Option<String>,
    pub base_url: Option<String>,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            provider: Provider::default(),
            model: default_model(),
            max_tokens: default_max_tokens(),
            api_key_env: None,
            base_url: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl LlmConfig {
    pub fn api_key_env(&self) -> String {
        self.api_key_env
            .clone()
            .unwrap_or_else(|| self.provider.default_api_key_env().into())
    }
}

/// Limits for one agent run (one user message and its tool round-trips).
#[derive(Debug, Clone, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_max_turns")]
    pub max_turns: u32,
    #[serde(default = "default_cost_limit")]
    pub cost_limit_usd: f64,
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            max_turns: default_max_turns(),
            cost_limit_usd: default_cost_limit(),
            system_prompt: default_system_prompt(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ToolsConfig {
    #[serde(default = "default_enabled_tools")]
    pub enabled: Vec<String>,
    #[serde(default = "default_allowed_domains")]
    pub allowed_domains: Vec<String>,
    #[serde(default = "default_max_fetch_chars")]
    pub max_fetch_chars: usize,
    #[serde(default = "default_fetch_timeout")]
    pub fetch_timeout_secs: u64,
}

impl Default for ToolsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_tools(),
            allowed_domains: default_allowed_domains(),
            max_fetch_chars: default_max_fetch_chars(),
            fetch_timeout_secs: default_fetch_timeout(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
        }
    }
}

impl StorageConfig {
    pub fn usage_log_path(&self) -> PathBuf {
        self.data_dir.join("usage.csv")
    }
}

// Defaults
fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    7860
}
fn default_model() -> String {
    "openai/gpt-4o-mini".into()
}
fn default_max_tokens() -> u32 {
    1024
}
fn default_request_timeout() -> u64 {
    300
}
fn default_max_turns() -> u32 {
    8
}
fn default_cost_limit() -> f64 {
    0.50
}
fn default_system_prompt() -> String {
    "You are a helpful assistant running inside Agent Lab. Use the available tools when \
     they help: `calculator` for arithmetic, `current_time` for the date or time, and \
     `web_fetch` for reading pages on allowed domains. Answer concisely."
        .into()
}
fn default_enabled_tools() -> Vec<String> {
    vec![
        "calculator".into(),
        "current_time".into(),
        "web_fetch".into(),
    ]
}
fn default_allowed_domains() -> Vec<String> {
    vec![
        "wikipedia.org".into(),
        "docs.rs".into(),
        "openrouter.ai".into(),
    ]
}
fn default_max_fetch_chars() -> usize {
    4000
}
fn default_fetch_timeout() -> u64 {
    10
}
fn default_data_dir() -> PathBuf {
    PathBuf::from("data")
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("Failed to read config {}: {e}", path.display())))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::config(format!("Failed to parse config: {e}")))
    }

    /// Load the file if it exists (defaults otherwise), then apply environment overrides.
    pub fn from_env_and_file(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(p) if p.exists() => Self::load(p)?,
            _ => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from an environment lookup. Takes a closure so tests need not touch the process env.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(host) = lookup(HOST_ENV).filter(|h| !h.trim().is_empty()) {
            self.server.host = host.trim().to_string();
        }
        if let Some(port) = lookup(PORT_ENV).filter(|p| !p.trim().is_empty()) {
            self.server.port = port
                .trim()
                .parse()
                .map_err(|e| Error::config(format!("{PORT_ENV}={port} is not a port: {e}")))?;
        }
        if let Some(dir) = lookup(DATA_DIR_ENV).filter(|d| !d.trim().is_empty()) {
            self.storage.data_dir = PathBuf::from(dir);
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.server.port == 0 {
            return Err(Error::config("server.port must be non-zero"));
        }
        if self.llm.model.trim().is_empty() {
            return Err(Error::config("llm.model must not be empty"));
        }
        if self.agent.max_turns == 0 {
            return Err(Error::config("agent.max_turns must be at least 1"));
        }
        if self.agent.cost_limit_usd < 0.0 {
            return Err(Error::config("agent.cost_limit_usd must not be negative"));
        }
        Ok(())
    }

    /// Chat needs a key; listing sessions or usage does not.
    pub fn validate_api_key(&self) -> Result<()> {
        let env_var = self.llm.api_key_env();
        match std::env::var(&env_var) {
            Ok(v) if !v.trim().is_empty() => Ok(()),
            _ => Err(Error::config(format!(
                "{env_var} not set. Export it or add it to .env"
            ))),
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}
