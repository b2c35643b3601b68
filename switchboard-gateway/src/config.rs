//! # Gateway Configuration
//!
//! TOML-backed configuration with environment overrides. The routing
//! entities themselves (providers, models, bindings) live in the database
//! and are managed by the admin layer; this file only configures the
//! process: listen address, database path, cache TTL, pool limits, auth
//! token and logging.
//!
//! ## Environment Variables
//!
//! - `SWITCHBOARD_HOST` / `SWITCHBOARD_PORT`: listen address override
//! - `SWITCHBOARD_DATABASE`: database file override
//! - `SWITCHBOARD_CACHE_TTL`: config cache TTL override (e.g. `5m`)
//! - `TOKEN`: static credential checked by the auth middleware; unset
//!   disables authentication
//! - `TZ`: honored by the process for daily usage bucketing

use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use switchboard_upstream::PoolConfig;

/// Default listen port. Fixed by the deployment contract.
pub const DEFAULT_PORT: u16 = 7070;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub cache: CacheConfig,
    pub pool: PoolSettings,
    pub auth: AuthConfig,
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            cache: CacheConfig::default(),
            pool: PoolSettings::default(),
            auth: AuthConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Inbound request timeout for non-routed endpoints. Routed requests
    /// are governed by the per-model budget instead.
    #[serde(with = "duration_string")]
    pub timeout: Duration,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("switchboard.db"),
        }
    }
}

/// Config cache refresh settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    #[serde(with = "duration_string")]
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(5 * 60),
        }
    }
}

/// Connection pool limits; mapped onto [`PoolConfig`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolSettings {
    pub max_conns_per_host: usize,
    pub max_idle_per_host: usize,
}

impl Default for PoolSettings {
    fn default() -> Self {
        let defaults = PoolConfig::default();
        Self {
            max_conns_per_host: defaults.max_conns_per_host,
            max_idle_per_host: defaults.max_idle_per_host,
        }
    }
}

impl PoolSettings {
    pub fn to_pool_config(&self) -> PoolConfig {
        PoolConfig {
            max_conns_per_host: self.max_conns_per_host,
            max_idle_per_host: self.max_idle_per_host,
            ..PoolConfig::default()
        }
    }
}

/// Authentication settings. A `None` token disables auth.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load from a TOML file, then apply environment overrides.
    pub fn load(path: &str) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&content)?;
        config.apply_env_overrides()?;
        Ok(config)
    }

    /// Defaults plus environment overrides, for running without a file.
    pub fn from_env() -> anyhow::Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides()?;
        Ok(config)
    }

    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        if let Ok(host) = env::var("SWITCHBOARD_HOST") {
            if !host.is_empty() {
                self.server.host = host;
            }
        }

        if let Ok(port) = env::var("SWITCHBOARD_PORT") {
            self.server.port = port
                .parse()
                .map_err(|_| anyhow::anyhow!("invalid SWITCHBOARD_PORT: {port}"))?;
        }

        if let Ok(path) = env::var("SWITCHBOARD_DATABASE") {
            if !path.is_empty() {
                self.database.path = PathBuf::from(path);
            }
        }

        if let Ok(ttl) = env::var("SWITCHBOARD_CACHE_TTL") {
            self.cache.ttl = parse_duration(&ttl)?;
        }

        if let Ok(token) = env::var("TOKEN") {
            if !token.is_empty() {
                self.auth.token = Some(token);
            }
        }

        Ok(())
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        if self.server.host.is_empty() {
            return Err(anyhow::anyhow!("server host cannot be empty"));
        }
        if self.server.port == 0 {
            return Err(anyhow::anyhow!("server port must be between 1 and 65535"));
        }
        if self.database.path.as_os_str().is_empty() {
            return Err(anyhow::anyhow!("database path cannot be empty"));
        }
        if self.cache.ttl.is_zero() {
            return Err(anyhow::anyhow!("cache TTL cannot be 0"));
        }
        if self.pool.max_conns_per_host == 0 {
            return Err(anyhow::anyhow!("pool max_conns_per_host cannot be 0"));
        }
        if self.auth.token.is_none() {
            tracing::warn!("no TOKEN configured; API authentication is disabled");
        }
        Ok(())
    }
}

/// Parse durations written as `500ms`, `30s`, `5m` or `2h`.
pub fn parse_duration(input: &str) -> anyhow::Result<Duration> {
    let input = input.trim();
    if input.is_empty() {
        return Err(anyhow::anyhow!("empty duration"));
    }

    let (number, unit) = input.split_at(
        input
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(input.len()),
    );
    let value: u64 = number
        .parse()
        .map_err(|_| anyhow::anyhow!("invalid duration: {input}"))?;

    match unit {
        "ms" => Ok(Duration::from_millis(value)),
        "s" | "" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        _ => Err(anyhow::anyhow!("invalid duration unit: {unit}")),
    }
}

mod duration_string {
    use super::parse_duration;
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{}s", value.as_secs()))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        let config = Config::default();
        assert_eq!(config.server.port, 7070);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn parse_duration_accepts_the_usual_suffixes() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30x").is_err());
        assert!(parse_duration("abc").is_err());
    }

    #[test]
    fn toml_round_trip() {
        let toml = r#"
            [server]
            host = "127.0.0.1"
            port = 9090
            timeout = "10s"

            [database]
            path = "/tmp/gw.db"

            [cache]
            ttl = "1m"

            [auth]
            token = "secret"
        "#;
        let config: Config = toml::from_str(toml).unwrap();
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.server.port, 9090);
        assert_eq!(config.cache.ttl, Duration::from_secs(60));
        assert_eq!(config.auth.token.as_deref(), Some("secret"));
        // Sections not present fall back to defaults.
        assert_eq!(config.pool.max_conns_per_host, 64);
    }

    #[test]
    fn validate_rejects_zero_port() {
        let mut config = Config::default();
        config.server.port = 0;
        assert!(config.validate().is_err());
    }
}
