use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use url::Url;

use crate::browser::selectors::{DEFAULT_ANSWER_SELECTOR, DEFAULT_QUESTION_SELECTOR};

/// Upper bound for the HTTP timeout, in seconds
pub const MAX_HTTP_TIMEOUT_SECONDS: f64 = 300.0;

const REDACTED: &str = "<redacted>";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error("http_timeout_seconds must be in (0, 300], got {0}")]
    HttpTimeout(f64),

    #[error("max_concurrent_fetches must be at least 1")]
    Concurrency,

    #[error("drain_timeout_seconds must be positive, got {0}")]
    DrainTimeout(f64),

    #[error("unknown log level '{0}'")]
    LogLevel(String),

    #[error("invalid render_url_pattern: {0}")]
    RenderPattern(#[from] regex::Error),
}

/// Output format for log lines
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "text" | "pretty" => Ok(LogFormat::Text),
            "json" => Ok(LogFormat::Json),
            other => Err(format!("expected 'text' or 'json', got '{}'", other)),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogFormat::Text => write!(f, "text"),
            LogFormat::Json => write!(f, "json"),
        }
    }
}

/// Service settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Broker address; absent means degraded mode with synthetic tasks
    pub broker_url: Option<String>,
    pub request_topic: String,
    pub parsed_topic: String,

    /// Treat an unreachable broker as fatal instead of degrading
    pub require_broker: bool,

    /// Document store; absent disables persistence
    pub mongo_uri: Option<String>,
    pub mongo_db: String,
    pub mongo_collection: String,

    pub http_timeout_seconds: f64,
    pub max_concurrent_fetches: usize,
    pub user_agent: String,

    /// Use a headless browser for extraction instead of the fetched HTML
    pub enable_browser: bool,
    pub webdriver_url: String,

    /// URLs matching this regex go through extraction
    pub render_url_pattern: String,
    pub question_selector: String,
    pub answer_selector: String,

    /// Longest wait for in-flight tasks on shutdown; absent waits indefinitely
    pub drain_timeout_seconds: Option<f64>,

    pub log_level: String,
    pub log_format: LogFormat,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            broker_url: None,
            request_topic: "quora.fetch.requests".to_string(),
            parsed_topic: "quora.fetch.parsed".to_string(),
            require_broker: false,
            mongo_uri: None,
            mongo_db: "quorabroker".to_string(),
            mongo_collection: "pages".to_string(),
            http_timeout_seconds: 20.0,
            max_concurrent_fetches: 10,
            user_agent: "quorabroker/0.1".to_string(),
            enable_browser: false,
            webdriver_url: "http://localhost:4444".to_string(),
            render_url_pattern: r"quora\.com".to_string(),
            question_selector: DEFAULT_QUESTION_SELECTOR.to_string(),
            answer_selector: DEFAULT_ANSWER_SELECTOR.to_string(),
            drain_timeout_seconds: None,
            log_level: "INFO".to_string(),
            log_format: LogFormat::Text,
        }
    }
}

impl Settings {
    /// Load settings: defaults, then the YAML file, then `.env`, then the environment
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut settings = match path {
            Some(path) => Self::load_from_file(path)?,
            None => match Self::default_config_path() {
                Some(path) if path.exists() => Self::load_from_file(&path)?,
                _ => Self::default(),
            },
        };

        dotenvy::dotenv().ok();
        settings.apply_env(|key| std::env::var(key).ok())?;
        settings.validate()?;

        Ok(settings)
    }

    /// `<config dir>/quora-broker/config.yaml`
    pub fn default_config_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("com", "quora-broker", "quora-broker")
            .map(|dirs| dirs.config_dir().join("config.yaml"))
    }

    /// Load settings from a YAML file. Missing keys keep their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        debug!("Loading configuration from: {}", path.display());
        let contents = fs::read_to_string(path)
            .context(format!("Failed to read configuration file: {}", path.display()))?;

        let settings: Self = serde_yaml::from_str(&contents)
            .context(format!("Failed to parse configuration file: {}", path.display()))?;

        Ok(settings)
    }

    /// Overlay values from an environment lookup. Empty values count as unset.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        if let Some(v) = get("BROKER_URL").or_else(|| get("KAFKA_BOOTSTRAP_SERVERS")) {
            self.broker_url = Some(v);
        }
        if let Some(v) = get("REQUEST_TOPIC") {
            self.request_topic = v;
        }
        if let Some(v) = get("PARSED_TOPIC") {
            self.parsed_topic = v;
        }
        if let Some(v) = get("REQUIRE_BROKER") {
            self.require_broker = parse_bool("REQUIRE_BROKER", &v)?;
        }
        if let Some(v) = get("MONGO_URI") {
            self.mongo_uri = Some(v);
        }
        if let Some(v) = get("MONGO_DB") {
            self.mongo_db = v;
        }
        if let Some(v) = get("MONGO_COLLECTION") {
            self.mongo_collection = v;
        }
        if let Some(v) = get("HTTP_TIMEOUT_SECONDS") {
            self.http_timeout_seconds = parse_value("HTTP_TIMEOUT_SECONDS", &v)?;
        }
        if let Some(v) = get("MAX_CONCURRENT_FETCHES") {
            self.max_concurrent_fetches = parse_value("MAX_CONCURRENT_FETCHES", &v)?;
        }
        if let Some(v) = get("USER_AGENT") {
            self.user_agent = v;
        }
        if let Some(v) = get("ENABLE_BROWSER") {
            self.enable_browser = parse_bool("ENABLE_BROWSER", &v)?;
        }
        if let Some(v) = get("WEBDRIVER_URL") {
            self.webdriver_url = v;
        }
        if let Some(v) = get("RENDER_URL_PATTERN") {
            self.render_url_pattern = v;
        }
        if let Some(v) = get("QUESTION_SELECTOR") {
            self.question_selector = v;
        }
        if let Some(v) = get("ANSWER_SELECTOR") {
            self.answer_selector = v;
        }
        if let Some(v) = get("DRAIN_TIMEOUT_SECONDS") {
            self.drain_timeout_seconds = Some(parse_value("DRAIN_TIMEOUT_SECONDS", &v)?);
        }
        if let Some(v) = get("LOG_LEVEL") {
            self.log_level = v.to_uppercase();
        }
        if let Some(v) = get("LOG_FORMAT") {
            self.log_format = v.parse().map_err(|reason| ConfigError::InvalidValue {
                key: "LOG_FORMAT",
                value: v.clone(),
                reason,
            })?;
        }

        Ok(())
    }

    /// Check ranges and that patterns compile
    pub fn validate(&self) -> Result<(), ConfigError> {
        let timeout = self.http_timeout_seconds;
        if !(timeout > 0.0 && timeout <= MAX_HTTP_TIMEOUT_SECONDS) {
            return Err(ConfigError::HttpTimeout(timeout));
        }

        if self.max_concurrent_fetches == 0 {
            return Err(ConfigError::Concurrency);
        }

        if let Some(drain) = self.drain_timeout_seconds {
            if !(drain > 0.0 && drain.is_finite()) {
                return Err(ConfigError::DrainTimeout(drain));
            }
        }

        self.tracing_level()?;
        regex::Regex::new(&self.render_url_pattern)?;

        Ok(())
    }

    pub fn http_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.http_timeout_seconds)
    }

    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_seconds.map(Duration::from_secs_f64)
    }

    /// Configured level as a tracing directive
    pub fn tracing_level(&self) -> Result<&'static str, ConfigError> {
        match self.log_level.to_uppercase().as_str() {
            "TRACE" => Ok("trace"),
            "DEBUG" => Ok("debug"),
            "INFO" => Ok("info"),
            "WARN" | "WARNING" => Ok("warn"),
            "ERROR" | "CRITICAL" => Ok("error"),
            _ => Err(ConfigError::LogLevel(self.log_level.clone())),
        }
    }

    /// Copy safe to log or print: store URI and broker credentials removed
    pub fn redacted(&self) -> Self {
        let mut copy = self.clone();

        if copy.mongo_uri.is_some() {
            copy.mongo_uri = Some(REDACTED.to_string());
        }

        copy.broker_url = copy.broker_url.map(|broker| match Url::parse(&broker) {
            Ok(mut url) if url.password().is_some() => {
                let _ = url.set_password(Some(REDACTED));
                url.to_string()
            }
            Ok(_) => broker,
            Err(_) => REDACTED.to_string(),
        });

        copy
    }
}

fn parse_value<T>(key: &'static str, value: &str) -> Result<T, ConfigError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    value.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: e.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key,
            value: value.to_string(),
            reason: "expected a boolean".to_string(),
        }),
    }
}
