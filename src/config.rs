use crate::flood::{DiscoverySettings, FloodSettings};
use crate::harness::FleetSettings;
use crate::session::SessionSettings;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("Failed to parse {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Load run configuration. Every table and field may be omitted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadConfig {
    pub target: TargetSettings,
    pub fleet: FleetTable,
    pub timeouts: TimeoutSettings,
    pub flood: FloodTable,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TargetSettings {
    /// Game server `host:port`.
    pub tcp_address: String,
    /// URL hammered by the flood mode, or the game listing to search when
    /// `flood.target_player` is set.
    pub http_url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FleetTable {
    pub players: u64,
    pub max_concurrency: usize,
    pub first_id: u64,
    pub username_prefix: String,
    pub password_prefix: String,
    pub register_only: bool,
    pub progress_every: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutSettings {
    pub connect_ms: u64,
    pub read_write_ms: u64,
    pub activity_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FloodTable {
    pub workers: usize,
    pub duration_secs: u64,
    pub request_timeout_ms: u64,
    pub retry_delay_ms: u64,
    /// Flood the game this player sits in instead of `target.http_url`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_player: Option<String>,
    pub find_attempts: u32,
    pub find_delay_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: String,
    /// Also write logs to this file when set.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub file: Option<PathBuf>,
}

impl Default for TargetSettings {
    fn default() -> Self {
        Self {
            tcp_address: "127.0.0.1:8083".to_string(),
            http_url: "http://127.0.0.1:8082/api/v0/games".to_string(),
        }
    }
}

impl Default for FleetTable {
    fn default() -> Self {
        Self {
            players: 1000,
            max_concurrency: 100,
            first_id: 0,
            username_prefix: "player-".to_string(),
            password_prefix: "password".to_string(),
            register_only: false,
            progress_every: 100,
        }
    }
}

impl Default for TimeoutSettings {
    fn default() -> Self {
        Self {
            connect_ms: 10_000,
            read_write_ms: 10_000,
            activity_secs: 60,
        }
    }
}

impl Default for FloodTable {
    fn default() -> Self {
        Self {
            workers: 500,
            duration_secs: 30,
            request_timeout_ms: 10_000,
            retry_delay_ms: 50,
            target_player: None,
            find_attempts: 100,
            find_delay_ms: 1000,
        }
    }
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file: None,
        }
    }
}

impl LoadConfig {
    /// Read and parse `path`. Validation is left to the caller so that
    /// command-line overrides can be applied first.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Check the values the `play` and `register` modes rely on.
    pub fn validate_fleet(&self) -> Result<(), ConfigError> {
        if self.target.tcp_address.trim().is_empty() {
            return Err(ConfigError::Invalid("target.tcp_address is empty".to_string()));
        }
        if self.fleet.max_concurrency == 0 {
            return Err(ConfigError::Invalid(
                "fleet.max_concurrency must be at least 1".to_string(),
            ));
        }
        require_positive(&[
            ("timeouts.connect_ms", self.timeouts.connect_ms),
            ("timeouts.read_write_ms", self.timeouts.read_write_ms),
            ("timeouts.activity_secs", self.timeouts.activity_secs),
        ])
    }

    /// Check the values the `flood` mode relies on.
    pub fn validate_flood(&self) -> Result<(), ConfigError> {
        if self.target.http_url.trim().is_empty() {
            return Err(ConfigError::Invalid("target.http_url is empty".to_string()));
        }
        if self.flood.workers == 0 {
            return Err(ConfigError::Invalid("flood.workers must be at least 1".to_string()));
        }
        if let Some(player) = &self.flood.target_player {
            if player.trim().is_empty() {
                return Err(ConfigError::Invalid("flood.target_player is empty".to_string()));
            }
            if self.flood.find_attempts == 0 {
                return Err(ConfigError::Invalid(
                    "flood.find_attempts must be at least 1".to_string(),
                ));
            }
        }
        require_positive(&[("flood.request_timeout_ms", self.flood.request_timeout_ms)])
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.timeouts.connect_ms)
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            address: self.target.tcp_address.clone(),
            connect_timeout: self.connect_timeout(),
            io_timeout: Duration::from_millis(self.timeouts.read_write_ms),
            activity_timeout: Duration::from_secs(self.timeouts.activity_secs),
            register_only: self.fleet.register_only,
        }
    }

    pub fn fleet_settings(&self) -> FleetSettings {
        FleetSettings {
            players: self.fleet.players,
            first_id: self.fleet.first_id,
            max_concurrency: self.fleet.max_concurrency,
            username_prefix: self.fleet.username_prefix.clone(),
            password_prefix: self.fleet.password_prefix.clone(),
            progress_every: self.fleet.progress_every,
            session: self.session_settings(),
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.flood.request_timeout_ms)
    }

    /// Game discovery parameters, when a target player is configured.
    pub fn discovery_settings(&self) -> Option<DiscoverySettings> {
        self.flood
            .target_player
            .as_ref()
            .map(|player_id| DiscoverySettings {
                player_id: player_id.clone(),
                attempts: self.flood.find_attempts,
                delay: Duration::from_millis(self.flood.find_delay_ms),
            })
    }

    pub fn flood_settings(&self) -> FloodSettings {
        FloodSettings {
            workers: self.flood.workers,
            duration: Duration::from_secs(self.flood.duration_secs),
            retry_delay: Duration::from_millis(self.flood.retry_delay_ms),
        }
    }
}

fn require_positive(values: &[(&str, u64)]) -> Result<(), ConfigError> {
    match values.iter().find(|(_, value)| *value == 0) {
        Some((name, _)) => Err(ConfigError::Invalid(format!("{} must be positive", name))),
        None => Ok(()),
    }
}
