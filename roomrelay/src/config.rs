use config::{Config as ConfigBuilder, ConfigError, Environment, File};
use roomrelay_sfu::rtp::IceServer;
use roomrelay_sfu::{SfuConfig, WorkerLogLevel, WorkerSettings};
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};
use std::path::Path;

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub logging: LoggingConfig,
    pub media: MediaConfig,
    pub limits: LimitsConfig,
    /// STUN/TURN servers handed to browsers with every transport
    pub ice_servers: Vec<IceServer>,
    /// Seconds to keep running after the media worker dies
    pub worker_death_grace_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Largest accepted signaling frame in bytes
    pub max_message_size: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: String, // "json" or "pretty"
    pub file_path: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineKind {
    #[default]
    Local,
    Mediasoup,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MediaConfig {
    pub engine: EngineKind,
    pub listen_ip: IpAddr,
    /// Public address for ICE candidates when behind NAT
    pub announced_address: Option<String>,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub worker_log_level: WorkerLogLevel,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// 0 = unlimited
    pub max_rooms: usize,
    /// 0 = unlimited
    pub max_peers_per_room: usize,
    /// Outbound frames buffered per peer before notifications are dropped
    pub peer_queue_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            logging: LoggingConfig::default(),
            media: MediaConfig::default(),
            limits: LimitsConfig::default(),
            ice_servers: SfuConfig::default().ice_servers,
            worker_death_grace_secs: 2,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 3000,
            max_message_size: 64 * 1024,
        }
    }
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

impl Default for MediaConfig {
    fn default() -> Self {
        let sfu = SfuConfig::default();
        Self {
            engine: EngineKind::default(),
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            rtc_min_port: sfu.rtc_min_port,
            rtc_max_port: sfu.rtc_max_port,
            worker_log_level: WorkerLogLevel::default(),
        }
    }
}

impl Default for LimitsConfig {
    fn default() -> Self {
        let sfu = SfuConfig::default();
        Self {
            max_rooms: sfu.max_rooms,
            max_peers_per_room: sfu.max_peers_per_room,
            peer_queue_capacity: sfu.notification_queue_capacity,
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

        // ROOMRELAY_SERVER__PORT, ROOMRELAY_LIMITS__MAX_ROOMS, ...
        builder = builder.add_source(
            Environment::with_prefix("ROOMRELAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }

    #[must_use]
    pub fn http_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    /// Settings handed to the relay library
    #[must_use]
    pub fn sfu_config(&self) -> SfuConfig {
        SfuConfig {
            max_rooms: self.limits.max_rooms,
            max_peers_per_room: self.limits.max_peers_per_room,
            listen_ip: self.media.listen_ip,
            announced_address: self.media.announced_address.clone(),
            rtc_min_port: self.media.rtc_min_port,
            rtc_max_port: self.media.rtc_max_port,
            ice_servers: self.ice_servers.clone(),
            notification_queue_capacity: self.limits.peer_queue_capacity,
        }
    }

    #[must_use]
    pub fn worker_settings(&self) -> WorkerSettings {
        WorkerSettings {
            log_level: self.media.worker_log_level,
        }
    }

    /// Collect every configuration problem instead of failing on the first
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = self.sfu_config().validate().err().unwrap_or_default();

        if self.server.port == 0 {
            errors.push("server.port must be greater than 0".to_string());
        }
        if self.server.max_message_size < 1024 {
            errors.push(format!(
                "server.max_message_size ({}) must be at least 1024 bytes",
                self.server.max_message_size
            ));
        }
        if !matches!(self.logging.format.as_str(), "json" | "pretty") {
            errors.push(format!(
                "logging.format must be 'json' or 'pretty', got '{}'",
                self.logging.format
            ));
        }
        if crate::logging::parse_log_level(&self.logging.level).is_err() {
            errors.push(format!("logging.level '{}' is not a valid level", self.logging.level));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

/// Load configuration: explicit path, else `./config.yaml`, else defaults and environment
pub fn load_config(path: Option<&str>) -> anyhow::Result<Config> {
    let config_path = path.map(str::to_string).or_else(|| {
        let cwd = "config.yaml";
        Path::new(cwd).exists().then(|| cwd.to_string())
    });

    let config = match config_path {
        Some(path) => {
            eprintln!("Loading config from {path}");
            Config::load(Some(&path))
                .map_err(|e| anyhow::anyhow!("Failed to load config from {path}: {e}"))?
        }
        None => {
            eprintln!("No config file found, using defaults and environment variables");
            Config::load(None)?
        }
    };

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.http_address(), "0.0.0.0:3000");
        assert_eq!(config.worker_death_grace_secs, 2);
        assert_eq!(config.media.engine, EngineKind::Local);
    }

    #[test]
    fn test_load_from_yaml_file() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "server:\n  port: 4443\nmedia:\n  engine: mediasoup\n  announced_address: 203.0.113.7\nlimits:\n  max_rooms: 10\nice_servers:\n  - urls: turn:turn.example.com:3478\n    username: relay\n    credential: secret"
        )
        .unwrap();

        let config = Config::load(file.path().to_str()).unwrap();
        assert_eq!(config.server.port, 4443);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.media.engine, EngineKind::Mediasoup);

        let sfu = config.sfu_config();
        assert_eq!(sfu.max_rooms, 10);
        assert_eq!(sfu.announced_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(sfu.ice_servers.len(), 1);
        assert_eq!(sfu.ice_servers[0].username.as_deref(), Some("relay"));
    }

    #[test]
    fn test_missing_file_falls_back_to_defaults() {
        let config = Config::load(Some("/nonexistent/roomrelay.yaml")).unwrap();
        assert_eq!(config.server.port, ServerConfig::default().port);
    }

    #[test]
    fn test_validate_collects_all_errors() {
        let mut config = Config::default();
        config.server.port = 0;
        config.logging.format = "xml".to_string();
        config.logging.level = "loud".to_string();
        config.media.rtc_min_port = 50000;
        config.media.rtc_max_port = 40000;

        let errors = config.validate().unwrap_err();
        assert_eq!(errors.len(), 4);
        assert!(errors.iter().any(|e| e.contains("rtc_min_port")));
    }
}
