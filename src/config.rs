//! Service configuration.
//!
//! Layers, lowest to highest precedence: built-in defaults, the TOML file
//! (`futureproof.toml` or `--config`), environment variables (a `.env` file
//! is loaded first), then command-line flags.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8000
//! db_path = "futureproof.db"
//! dev_mode = false
//!
//! [llm]
//! base_url = "https://api.groq.com/openai/v1"
//! model = "llama-3.3-70b-versatile"
//! timeout_secs = 30
//!
//! [analysis]
//! agent_timeout_secs = 60
//! clone_timeout_secs = 120
//! shutdown_grace_secs = 30
//!
//! [log]
//! level = "info"
//! json = false
//! ```

use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::errors::ConfigError;

/// Config file looked up in the working directory when `--config` is absent.
pub const DEFAULT_CONFIG_FILE: &str = "futureproof.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,
    /// Permissive CORS for a locally served frontend.
    #[serde(default)]
    pub dev_mode: bool,
    #[serde(default = "default_delivery_timeout_secs")]
    pub ws_delivery_timeout_secs: u64,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_db_path() -> PathBuf {
    PathBuf::from("futureproof.db")
}

fn default_delivery_timeout_secs() -> u64 {
    5
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            db_path: default_db_path(),
            dev_mode: false,
            ws_delivery_timeout_secs: default_delivery_timeout_secs(),
        }
    }
}

/// Settings for the chat-completions decision service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// Never written back to disk.
    #[serde(default, skip_serializing)]
    pub api_key: Option<String>,
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_llm_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
}

fn default_base_url() -> String {
    "https://api.groq.com/openai/v1".to_string()
}

fn default_model() -> String {
    "llama-3.3-70b-versatile".to_string()
}

fn default_llm_timeout_secs() -> u64 {
    30
}

fn default_temperature() -> f32 {
    0.7
}

fn default_max_tokens() -> u32 {
    1000
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            base_url: default_base_url(),
            model: default_model(),
            timeout_secs: default_llm_timeout_secs(),
            temperature: default_temperature(),
            max_tokens: default_max_tokens(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisSection {
    #[serde(default = "default_agent_timeout_secs")]
    pub agent_timeout_secs: u64,
    #[serde(default = "default_clone_timeout_secs")]
    pub clone_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
    /// Token for cloning private GitHub repositories.
    #[serde(default, skip_serializing)]
    pub github_token: Option<String>,
    /// Findings kept in each agent's result. Scores still count every finding.
    #[serde(default = "default_max_findings_per_agent")]
    pub max_findings_per_agent: usize,
}

fn default_agent_timeout_secs() -> u64 {
    60
}

fn default_clone_timeout_secs() -> u64 {
    120
}

fn default_shutdown_grace_secs() -> u64 {
    30
}

fn default_max_findings_per_agent() -> usize {
    10
}

impl Default for AnalysisSection {
    fn default() -> Self {
        Self {
            agent_timeout_secs: default_agent_timeout_secs(),
            clone_timeout_secs: default_clone_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
            github_token: None,
            max_findings_per_agent: default_max_findings_per_agent(),
        }
    }
}

impl AnalysisSection {
    pub fn agent_timeout(&self) -> Duration {
        Duration::from_secs(self.agent_timeout_secs)
    }

    pub fn clone_timeout(&self) -> Duration {
        Duration::from_secs(self.clone_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogSection {
    /// `EnvFilter` directive; `RUST_LOG` wins when set.
    #[serde(default = "default_log_level")]
    pub level: String,
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rotated log files, in addition to stderr.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSection {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: None,
        }
    }
}

/// The complete configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AppConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub llm: LlmConfig,
    #[serde(default)]
    pub analysis: AnalysisSection,
    #[serde(default)]
    pub log: LogSection,
}

/// Command-line overrides for `serve`.
#[derive(Debug, Clone, Default)]
pub struct CliOverrides {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub db_path: Option<PathBuf>,
    pub dev: bool,
}

impl AppConfig {
    /// Load configuration from a TOML file.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;
        Self::parse(&content)
            .with_context(|| format!("Failed to load config file: {}", path.display()))
    }

    /// Parse configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse configuration")
    }

    /// Load from `path`, or defaults when it does not exist.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// File (explicit path must exist) then environment.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();
        let mut config = match explicit {
            Some(path) => Self::load(path)?,
            None => Self::load_or_default(Path::new(DEFAULT_CONFIG_FILE))?,
        };
        config.apply_env()?;
        Ok(config)
    }

    /// Overlay values from the process environment.
    pub fn apply_env(&mut self) -> Result<(), ConfigError> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Overlay values from `lookup`. Empty values are ignored.
    pub fn apply_env_from(
        &mut self,
        lookup: impl Fn(&str) -> Option<String>,
    ) -> Result<(), ConfigError> {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(v) = get("FUTUREPROOF_HOST") {
            self.server.host = v;
        }
        if let Some(v) = get("FUTUREPROOF_PORT") {
            self.server.port = parse_env("FUTUREPROOF_PORT", &v)?;
        }
        if let Some(v) = get("FUTUREPROOF_DB_PATH") {
            self.server.db_path = PathBuf::from(v);
        }
        if let Some(v) = get("FUTUREPROOF_DEV_MODE") {
            self.server.dev_mode = parse_bool("FUTUREPROOF_DEV_MODE", &v)?;
        }
        if let Some(v) = get("GROQ_API_KEY") {
            self.llm.api_key = Some(v);
        }
        if let Some(v) = get("GROQ_MODEL") {
            self.llm.model = v;
        }
        if let Some(v) = get("LLM_BASE_URL") {
            self.llm.base_url = v;
        }
        if let Some(v) = get("GITHUB_TOKEN") {
            self.analysis.github_token = Some(v);
        }
        if let Some(v) = get("AGENT_TIMEOUT_SECS") {
            self.analysis.agent_timeout_secs = parse_env("AGENT_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("CLONE_TIMEOUT_SECS") {
            self.analysis.clone_timeout_secs = parse_env("CLONE_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log.level = v;
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log.json = v.eq_ignore_ascii_case("json");
        }
        if let Some(v) = get("LOG_DIR") {
            self.log.dir = Some(PathBuf::from(v));
        }
        Ok(())
    }

    pub fn apply_cli(&mut self, cli: &CliOverrides) {
        if let Some(host) = &cli.host {
            self.server.host = host.clone();
        }
        if let Some(port) = cli.port {
            self.server.port = port;
        }
        if let Some(db_path) = &cli.db_path {
            self.server.db_path = db_path.clone();
        }
        if cli.dev {
            self.server.dev_mode = true;
        }
    }

    /// Reject configuration the service cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();
        if self.server.port == 0 {
            problems.push("server.port must be non-zero".to_string());
        }
        if self.server.host.trim().is_empty() {
            problems.push("server.host is empty".to_string());
        }
        if self.llm.model.trim().is_empty() {
            problems.push("llm.model is empty".to_string());
        }
        if !(0.0..=2.0).contains(&self.llm.temperature) {
            problems.push(format!(
                "llm.temperature {} is outside [0, 2]",
                self.llm.temperature
            ));
        }
        for (name, value) in [
            ("llm.timeout_secs", self.llm.timeout_secs),
            ("analysis.agent_timeout_secs", self.analysis.agent_timeout_secs),
            ("analysis.clone_timeout_secs", self.analysis.clone_timeout_secs),
            ("server.ws_delivery_timeout_secs", self.server.ws_delivery_timeout_secs),
        ] {
            if value == 0 {
                problems.push(format!("{} must be greater than zero", name));
            }
        }
        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }

    /// Non-fatal observations worth logging at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        if self.llm.api_key.is_none() {
            warnings.push(
                "GROQ_API_KEY is not set; decisions will use the rule-based fallback".to_string(),
            );
        }
        if self.analysis.github_token.is_none() {
            warnings.push("GITHUB_TOKEN is not set; private repositories cannot be cloned".to_string());
        }
        if self.server.dev_mode {
            warnings.push("dev mode enabled: CORS allows any origin".to_string());
        }
        warnings
    }

    /// `host:port` for binding.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

fn parse_env<T: FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidEnv {
        var: var.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(var: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidEnv {
            var: var.to_string(),
            value: value.to_string(),
        }),
    }
}
