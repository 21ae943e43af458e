use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::client::{Endpoint, Protocol};

/// Errors that prevent a run from starting.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unknown protocol '{0}' (expected 'openai' or 'anthropic')")]
    UnknownProtocol(String),

    #[error("an API key is required for the {0} protocol")]
    MissingApiKey(String),

    #[error("invalid base URL '{url}': {reason}")]
    InvalidBaseUrl { url: String, reason: String },

    #[error("invalid configuration: {0}")]
    InvalidValue(String),

    #[error("failed to load tokenizer: {0}")]
    Tokenizer(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub endpoint: EndpointConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub request: RequestConfig,
    pub input: InputConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub runtime: RuntimeConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default = "default_protocol")]
    pub protocol: String,
    pub base_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
    /// Models to benchmark in order; empty means auto-detect
    #[serde(default)]
    pub models: Vec<String>,
    /// Per-request timeout in seconds
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default)]
    pub health_check_timeout: u64, // Total time to wait for server readiness in seconds (0 = disabled)
    #[serde(default = "default_health_check_interval")]
    pub health_check_interval: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadConfig {
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_requests")]
    pub requests: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestConfig {
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub thinking: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default = "default_thinking_budget")]
    pub thinking_budget: u32,
}

/// Exactly one prompt source must be set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InputConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub glob: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generate_tokens: Option<usize>,
    #[serde(default = "default_generate_count")]
    pub generate_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputConfig {
    #[serde(default = "default_output_format")]
    pub format: OutputFormat,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
    #[serde(default)]
    pub quiet: bool,
    /// Log request payloads and stream events
    #[serde(default)]
    pub verbose: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trace_log: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default = "default_worker_threads")]
    pub worker_threads: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: LogLevel,
    /// Per-module log level overrides (e.g., ["hyper=info", "rustls=warn"])
    #[serde(default)]
    pub filter: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn to_level_filter(&self) -> log::LevelFilter {
        match self {
            LogLevel::Error => log::LevelFilter::Error,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Trace => log::LevelFilter::Trace,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputFormat {
    Console,
    Json,
    Csv,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            requests: default_requests(),
        }
    }
}

impl Default for RequestConfig {
    fn default() -> Self {
        Self {
            stream: default_stream(),
            thinking: false,
            max_tokens: None,
            thinking_budget: default_thinking_budget(),
        }
    }
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            format: default_output_format(),
            file: None,
            quiet: false,
            verbose: false,
            trace_log: None,
        }
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            worker_threads: default_worker_threads(),
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            filter: Vec::new(),
        }
    }
}

fn default_protocol() -> String {
    "openai".to_string()
}

fn default_timeout() -> u64 {
    60
}

fn default_health_check_interval() -> u64 {
    5
}

fn default_concurrency() -> usize {
    10
}

fn default_requests() -> usize {
    100
}

fn default_stream() -> bool {
    true
}

fn default_thinking_budget() -> u32 {
    2048
}

fn default_generate_count() -> usize {
    1
}

fn default_output_format() -> OutputFormat {
    OutputFormat::Console
}

fn default_worker_threads() -> usize {
    num_cpus::get()
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

/// Environment variable consulted when no API key is configured.
fn api_key_env(protocol: Protocol) -> &'static str {
    match protocol {
        Protocol::OpenAi => "OPENAI_API_KEY",
        Protocol::Anthropic => "ANTHROPIC_API_KEY",
    }
}

impl Config {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&contents)?;
        config.fill_api_key_from_env();
        config.validate()?;
        Ok(config)
    }

    fn fill_api_key_from_env(&mut self) {
        if self.endpoint.api_key.is_some() {
            return;
        }
        if let Ok(protocol) = self.protocol() {
            self.endpoint.api_key = std::env::var(api_key_env(protocol))
                .ok()
                .filter(|key| !key.trim().is_empty());
        }
    }

    pub fn protocol(&self) -> Result<Protocol, ConfigError> {
        self.endpoint.protocol.parse()
    }

    /// Apply command line overrides on top of the file.
    pub fn apply_overrides(&mut self, models: &[String], verbose: bool, quiet: bool) {
        if !models.is_empty() {
            self.endpoint.models = models.to_vec();
        }
        self.output.verbose |= verbose;
        self.output.quiet |= quiet;
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let protocol = self.protocol()?;

        Endpoint::parse(&self.endpoint.base_url).map_err(|reason| ConfigError::InvalidBaseUrl {
            url: self.endpoint.base_url.clone(),
            reason,
        })?;

        if protocol.requires_api_key() && self.endpoint.api_key.is_none() {
            return Err(ConfigError::MissingApiKey(protocol.name().to_string()).into());
        }

        if self.endpoint.models.iter().any(|m| m.trim().is_empty()) {
            anyhow::bail!("model names must not be empty");
        }

        if self.endpoint.timeout == 0 {
            anyhow::bail!("timeout must be greater than 0");
        }

        if self.load.concurrency == 0 {
            anyhow::bail!("concurrency must be greater than 0");
        }

        if self.load.requests == 0 {
            anyhow::bail!("requests must be greater than 0");
        }

        let sources = [
            self.input.text.is_some(),
            self.input.file.is_some(),
            self.input.glob.is_some(),
            self.input.generate_tokens.is_some(),
        ]
        .iter()
        .filter(|set| **set)
        .count();
        if sources != 1 {
            anyhow::bail!(
                "exactly one of input.text, input.file, input.glob or input.generate_tokens must be specified"
            );
        }

        if self.input.generate_count == 0 {
            anyhow::bail!("generate_count must be greater than 0");
        }

        if self.request.thinking && protocol == Protocol::Anthropic && self.request.thinking_budget < 1024 {
            anyhow::bail!("thinking_budget must be at least 1024 tokens");
        }

        if self.runtime.worker_threads == 0 {
            anyhow::bail!("worker_threads must be greater than 0");
        }

        Ok(())
    }

    /// The immutable configuration for one run against `model`.
    pub fn run_config(&self, model: &str, run_id: &str) -> RunConfig {
        RunConfig {
            protocol: self.endpoint.protocol.clone(),
            base_url: self.endpoint.base_url.clone(),
            api_key: self.endpoint.api_key.clone(),
            model: model.to_string(),
            concurrency: self.load.concurrency,
            count: self.load.requests,
            stream: self.request.stream,
            timeout: Duration::from_secs(self.endpoint.timeout),
            thinking: self.request.thinking,
            verbose: self.output.verbose,
            max_tokens: self.request.max_tokens,
            thinking_budget: self.request.thinking_budget,
            run_id: run_id.to_string(),
        }
    }
}

/// Everything one benchmark run needs, fixed for its duration.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub protocol: String,
    pub base_url: String,
    pub api_key: Option<String>,
    pub model: String,
    pub concurrency: usize,
    pub count: usize,
    pub stream: bool,
    pub timeout: Duration,
    pub thinking: bool,
    pub verbose: bool,
    pub max_tokens: Option<u32>,
    pub thinking_budget: u32,
    /// Opaque identifier sent with every request
    pub run_id: String,
}

impl RunConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.concurrency == 0 {
            return Err(ConfigError::InvalidValue(
                "concurrency must be at least 1".to_string(),
            ));
        }
        if self.count == 0 {
            return Err(ConfigError::InvalidValue(
                "request count must be at least 1".to_string(),
            ));
        }
        if self.timeout.is_zero() {
            return Err(ConfigError::InvalidValue(
                "timeout must be greater than 0".to_string(),
            ));
        }
        if self.model.trim().is_empty() {
            return Err(ConfigError::InvalidValue("model must be set".to_string()));
        }
        Ok(())
    }
}
