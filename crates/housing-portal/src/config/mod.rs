use std::env;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use crate::workflows::applications::flagging::FlaggingRule;
use crate::workflows::applications::transaction::RetryPolicy;

/// Distinguishes runtime behavior for different stages of the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppEnvironment {
    Development,
    Test,
    Production,
}

impl AppEnvironment {
    fn from_str(value: &str) -> Self {
        match value.trim().to_ascii_lowercase().as_str() {
            "prod" | "production" => Self::Production,
            "test" | "ci" => Self::Test,
            _ => Self::Development,
        }
    }
}

/// Top-level configuration for the application.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub environment: AppEnvironment,
    pub server: ServerConfig,
    pub telemetry: TelemetryConfig,
    pub database: DatabaseConfig,
    pub flagging: FlaggingConfig,
}

impl AppConfig {
    pub fn load() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let environment = AppEnvironment::from_str(
            &env::var("APP_ENV").unwrap_or_else(|_| "development".to_string()),
        );

        let host = env::var("APP_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
        let port = env::var("APP_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse::<u16>()
            .map_err(|_| ConfigError::InvalidPort)?;

        let log_level = env::var("APP_LOG_LEVEL").unwrap_or_else(|_| "info".to_string());
        let format = LogFormat::parse(
            &env::var("APP_LOG_FORMAT").unwrap_or_else(|_| "compact".to_string()),
        )?;

        let database = DatabaseConfig {
            url: env::var("DATABASE_URL")
                .ok()
                .filter(|value| !value.trim().is_empty()),
            max_connections: parse_number("DATABASE_MAX_CONNECTIONS", 5)?,
        };

        let flagging = FlaggingConfig::from_env()?;

        Ok(Self {
            environment,
            server: ServerConfig { host, port },
            telemetry: TelemetryConfig { log_level, format },
            database,
            flagging,
        })
    }
}

fn parse_number<T: std::str::FromStr>(key: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::InvalidNumber { key, value: raw }),
        Err(_) => Ok(default),
    }
}

/// Settings controlling the HTTP server binding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

impl ServerConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        if self.host.eq_ignore_ascii_case("localhost") {
            return Ok(SocketAddr::new(IpAddr::from([127, 0, 0, 1]), self.port));
        }

        let ip: IpAddr = self
            .host
            .parse()
            .map_err(|source| ConfigError::InvalidHost { source })?;

        Ok(SocketAddr::new(ip, self.port))
    }
}

/// Tracing controls.
#[derive(Debug, Clone)]
pub struct TelemetryConfig {
    pub log_level: String,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Compact,
    Json,
}

impl LogFormat {
    fn parse(value: &str) -> Result<Self, ConfigError> {
        match value.trim().to_ascii_lowercase().as_str() {
            "compact" | "text" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            _ => Err(ConfigError::InvalidLogFormat(value.to_string())),
        }
    }
}

/// Storage backend selection. Without a URL the service keeps everything in memory.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    pub url: Option<String>,
    pub max_connections: u32,
}

/// Duplicate-flagging rules and the retry envelope around every write cycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlaggingConfig {
    pub rules: Vec<FlaggingRule>,
    pub max_attempts: u32,
    pub min_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub jitter_ms: u64,
}

impl Default for FlaggingConfig {
    fn default() -> Self {
        Self {
            rules: FlaggingRule::ALL.to_vec(),
            max_attempts: 6,
            min_backoff_ms: 200,
            max_backoff_ms: 5_000,
            jitter_ms: 50,
        }
    }
}

impl FlaggingConfig {
    fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let rules = match env::var("AFS_RULES") {
            Ok(raw) => parse_rules(&raw)?,
            Err(_) => defaults.rules,
        };

        let config = Self {
            rules,
            max_attempts: parse_number("AFS_RETRY_ATTEMPTS", defaults.max_attempts)?,
            min_backoff_ms: parse_number("AFS_RETRY_MIN_BACKOFF_MS", defaults.min_backoff_ms)?,
            max_backoff_ms: parse_number("AFS_RETRY_MAX_BACKOFF_MS", defaults.max_backoff_ms)?,
            jitter_ms: parse_number("AFS_RETRY_JITTER_MS", defaults.jitter_ms)?,
        };

        if config.max_attempts == 0 {
            return Err(ConfigError::InvalidRetryBound);
        }
        if config.max_backoff_ms < config.min_backoff_ms {
            return Err(ConfigError::InvalidBackoffWindow {
                min_ms: config.min_backoff_ms,
                max_ms: config.max_backoff_ms,
            });
        }

        Ok(config)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            min_backoff: Duration::from_millis(self.min_backoff_ms),
            max_backoff: Duration::from_millis(self.max_backoff_ms),
            jitter: Duration::from_millis(self.jitter_ms),
        }
    }
}

fn parse_rules(raw: &str) -> Result<Vec<FlaggingRule>, ConfigError> {
    let mut rules = Vec::new();
    for token in raw.split(',').map(str::trim).filter(|token| !token.is_empty()) {
        let rule = FlaggingRule::from_key(token)
            .ok_or_else(|| ConfigError::UnknownRule(token.to_string()))?;
        if !rules.contains(&rule) {
            rules.push(rule);
        }
    }
    Ok(rules)
}

#[derive(Debug)]
pub enum ConfigError {
    InvalidPort,
    InvalidHost { source: std::net::AddrParseError },
    InvalidNumber { key: &'static str, value: String },
    InvalidLogFormat(String),
    InvalidRetryBound,
    InvalidBackoffWindow { min_ms: u64, max_ms: u64 },
    UnknownRule(String),
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidPort => write!(f, "APP_PORT must be a valid u16"),
            ConfigError::InvalidHost { .. } => {
                write!(f, "APP_HOST must parse to an IPv4 or IPv6 address")
            }
            ConfigError::InvalidNumber { key, value } => {
                write!(f, "{key} must be a non-negative integer, got '{value}'")
            }
            ConfigError::InvalidLogFormat(value) => {
                write!(f, "APP_LOG_FORMAT must be 'compact' or 'json', got '{value}'")
            }
            ConfigError::InvalidRetryBound => write!(f, "AFS_RETRY_ATTEMPTS must be at least 1"),
            ConfigError::InvalidBackoffWindow { min_ms, max_ms } => write!(
                f,
                "AFS_RETRY_MAX_BACKOFF_MS ({max_ms}) must not be below AFS_RETRY_MIN_BACKOFF_MS ({min_ms})"
            ),
            ConfigError::UnknownRule(rule) => write!(f, "AFS_RULES names unknown rule '{rule}'"),
        }
    }
}

impl std::error::Error for ConfigError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ConfigError::InvalidHost { source } => Some(source),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::{Mutex, OnceLock};

    fn env_guard() -> &'static Mutex<()> {
        static GUARD: OnceLock<Mutex<()>> = OnceLock::new();
        GUARD.get_or_init(|| Mutex::new(()))
    }

    fn reset_env() {
        for key in [
            "APP_ENV",
            "APP_HOST",
            "APP_PORT",
            "APP_LOG_LEVEL",
            "APP_LOG_FORMAT",
            "DATABASE_URL",
            "DATABASE_MAX_CONNECTIONS",
            "AFS_RULES",
            "AFS_RETRY_ATTEMPTS",
            "AFS_RETRY_MIN_BACKOFF_MS",
            "AFS_RETRY_MAX_BACKOFF_MS",
            "AFS_RETRY_JITTER_MS",
        ] {
            env::remove_var(key);
        }
    }

    #[test]
    fn load_uses_defaults_when_env_missing() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        let config = AppConfig::load().expect("config loads with defaults");
        assert_eq!(config.environment, AppEnvironment::Development);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.telemetry.log_level, "info");
        assert_eq!(config.telemetry.format, LogFormat::Compact);
        assert!(config.database.url.is_none());
        assert_eq!(config.flagging, FlaggingConfig::default());

        let policy = config.flagging.retry_policy();
        assert_eq!(policy.max_attempts, 6);
        assert_eq!(policy.min_backoff, Duration::from_millis(200));
    }

    #[test]
    fn accepts_localhost_host() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("APP_HOST", "localhost");
        let config = AppConfig::load().expect("config loads");
        let addr = config.server.socket_addr().expect("localhost resolves");
        assert_eq!(addr, SocketAddr::new(IpAddr::from([127, 0, 0, 1]), 3000));
        reset_env();
    }

    #[test]
    fn parses_rule_list_and_drops_repeats() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("AFS_RULES", "email, email ,name+dob");
        let config = AppConfig::load().expect("config loads");
        assert_eq!(
            config.flagging.rules,
            vec![FlaggingRule::Email, FlaggingRule::NameAndDob]
        );
        reset_env();
    }

    #[test]
    fn rejects_unknown_rules_and_zero_attempts() {
        let _lock = env_guard().lock().expect("env mutex poisoned");
        reset_env();
        env::set_var("AFS_RULES", "phone");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::UnknownRule(rule)) if rule == "phone"
        ));

        reset_env();
        env::set_var("AFS_RETRY_ATTEMPTS", "0");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidRetryBound)
        ));

        reset_env();
        env::set_var("AFS_RETRY_MIN_BACKOFF_MS", "900");
        env::set_var("AFS_RETRY_MAX_BACKOFF_MS", "100");
        assert!(matches!(
            AppConfig::load(),
            Err(ConfigError::InvalidBackoffWindow { .. })
        ));
        reset_env();
    }
}
