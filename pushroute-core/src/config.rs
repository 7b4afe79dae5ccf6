use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub redis: RedisConfig,
    pub cluster: ClusterConfig,
    pub apns: Option<ApnsConfig>,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RedisConfig {
    /// Empty URL runs the router in single-node, in-memory mode
    pub url: String,
    pub key_prefix: String,
    pub timeout_secs: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_string(),
            key_prefix: "pushroute:".to_string(),
            timeout_secs: 5,
        }
    }
}

/// Routing, heartbeat and session settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Channel workers broadcast their `{serverId, paths}` heartbeats on
    pub heartbeat_channel: String,
    /// Routed events for a worker go to `{route_channel_prefix}{server_id}`
    pub route_channel_prefix: String,
    /// Channel used when no worker is known for a path
    pub default_channel: String,
    /// A server record older than this is dropped on the next heartbeat for its path
    pub stale_after_ms: u64,
    /// Interval of the background stale sweep; 0 keeps eviction lazy
    pub sweep_interval_secs: u64,
    pub session_ttl_secs: u64,
    pub token_ttl_secs: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_channel: "serverHeartbeat".to_string(),
            route_channel_prefix: "route#".to_string(),
            default_channel: "route#default".to_string(),
            stale_after_ms: 10_000,
            sweep_interval_secs: 0,
            session_ttl_secs: 3600 * 24 * 7,
            token_ttl_secs: 3600 * 24 * 7,
        }
    }
}

/// APNs provider-token configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApnsConfig {
    pub key_id: String,
    pub team_id: String,
    pub bundle_id: String,
    /// Path to the `.p8` signing key
    pub key_path: String,
    pub environment: ApnsEnvironment,
    /// Upper bound on concurrent in-flight APNs requests
    pub max_connections: usize,
    /// Offline notifications expire this many seconds after they are built
    pub notification_ttl_secs: u64,
}

impl Default for ApnsConfig {
    fn default() -> Self {
        Self {
            key_id: String::new(),
            team_id: String::new(),
            bundle_id: String::new(),
            key_path: "./keys/apns.p8".to_string(),
            environment: ApnsEnvironment::Sandbox,
            max_connections: 10,
            notification_ttl_secs: 600,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApnsEnvironment {
    #[default]
    Sandbox,
    Production,
}

impl ApnsEnvironment {
    #[must_use]
    pub const fn host(self) -> &'static str {
        match self {
            Self::Sandbox => "api.sandbox.push.apple.com",
            Self::Production => "api.push.apple.com",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: "pretty".to_string(),
            file_path: None,
        }
    }
}

impl Config {
    /// Load configuration from multiple sources with priority:
    /// 1. Environment variables (highest priority)
    /// 2. Config file (if provided)
    /// 3. Defaults (lowest priority)
    pub fn load(config_file: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = config_file {
            if Path::new(path).exists() {
                builder = builder.add_source(File::with_name(path));
            }
        }

        // PUSHROUTE_REDIS__URL, PUSHROUTE_CLUSTER__STALE_AFTER_MS, ...
        builder = builder.add_source(
            Environment::with_prefix("PUSHROUTE")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        config.try_deserialize()
    }

    /// Load from environment variables only (for Docker/K8s)
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::load(None)
    }

    /// Load from file path
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        Self::load(Some(path))
    }

    /// Whether the router runs without Redis
    #[must_use]
    pub fn is_single_node(&self) -> bool {
        self.redis.url.is_empty()
    }

    /// Check the configuration for values the router cannot run with.
    ///
    /// Returns every problem found rather than stopping at the first one.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.cluster.heartbeat_channel.is_empty() {
            errors.push("cluster.heartbeat_channel must not be empty".to_string());
        }
        if self.cluster.default_channel.is_empty() {
            errors.push("cluster.default_channel must not be empty".to_string());
        }
        if self.cluster.stale_after_ms == 0 {
            errors.push("cluster.stale_after_ms must be greater than 0".to_string());
        }
        if self.cluster.session_ttl_secs == 0 {
            errors.push("cluster.session_ttl_secs must be greater than 0".to_string());
        }
        if self.cluster.token_ttl_secs == 0 {
            errors.push("cluster.token_ttl_secs must be greater than 0".to_string());
        }

        if let Some(apns) = &self.apns {
            for (name, value) in [
                ("key_id", &apns.key_id),
                ("team_id", &apns.team_id),
                ("bundle_id", &apns.bundle_id),
                ("key_path", &apns.key_path),
            ] {
                if value.is_empty() {
                    errors.push(format!("apns.{name} must be set when apns is configured"));
                }
            }
            if apns.max_connections == 0 {
                errors.push("apns.max_connections must be greater than 0".to_string());
            }
        }

        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be \"json\" or \"pretty\", got \"{}\"",
                self.logging.format
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();

        assert!(!config.is_single_node());
        assert_eq!(config.cluster.heartbeat_channel, "serverHeartbeat");
        assert_eq!(config.cluster.route_channel_prefix, "route#");
        assert_eq!(config.cluster.default_channel, "route#default");
        assert_eq!(config.cluster.stale_after_ms, 10_000);
        assert_eq!(config.cluster.session_ttl_secs, 604_800);
        assert!(config.apns.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
[redis]
url = ""

[cluster]
stale_after_ms = 5000

[apns]
key_id = "KEY"
team_id = "TEAM"
bundle_id = "com.example.chat"
environment = "production"
"#
        )
        .unwrap();

        let config = Config::from_file(file.path().to_str().unwrap()).unwrap();

        assert!(config.is_single_node());
        assert_eq!(config.cluster.stale_after_ms, 5000);
        // untouched fields keep their defaults
        assert_eq!(config.cluster.heartbeat_channel, "serverHeartbeat");

        let apns = config.apns.unwrap();
        assert_eq!(apns.environment, ApnsEnvironment::Production);
        assert_eq!(apns.max_connections, 10);
        assert_eq!(apns.environment.host(), "api.push.apple.com");
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let config = Config {
            cluster: ClusterConfig {
                heartbeat_channel: String::new(),
                stale_after_ms: 0,
                ..Default::default()
            },
            apns: Some(ApnsConfig::default()),
            logging: LoggingConfig {
                format: "xml".to_string(),
                ..Default::default()
            },
            ..Default::default()
        };

        let errors = config.validate().unwrap_err();
        assert!(errors.iter().any(|e| e.contains("heartbeat_channel")));
        assert!(errors.iter().any(|e| e.contains("stale_after_ms")));
        assert!(errors.iter().any(|e| e.contains("apns.key_id")));
        assert!(errors.iter().any(|e| e.contains("apns.team_id")));
        assert!(errors.iter().any(|e| e.contains("logging.format")));
    }
}
