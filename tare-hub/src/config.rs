use std::net::{Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use tare_core::protocol::SENSOR_COUNT;

use crate::session::SessionSettings;
use crate::transport::mock::SimulatedBoard;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub feed: FeedConfig,
    pub session: SessionConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Static files, JSON API and `/feed`
    pub http_addr: SocketAddr,
    /// Dedicated feed listener where every path upgrades
    pub feed_addr: SocketAddr,
    pub static_root: PathBuf,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8000)),
            feed_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 8080)),
            static_root: PathBuf::from("public"),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct FeedConfig {
    pub period_ms: u64,
    /// Frames queued per consumer before frames are dropped for it
    pub client_buffer: usize,
    /// Consecutive drops before a consumer is evicted
    pub max_drops: u32,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            period_ms: 100,
            client_buffer: 16,
            max_drops: 50,
        }
    }
}

impl FeedConfig {
    pub fn period(&self) -> Duration {
        Duration::from_millis(self.period_ms)
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    pub light_on_connect: bool,
    pub reap_interval_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            light_on_connect: true,
            reap_interval_ms: 1_000,
        }
    }
}

impl SessionConfig {
    pub fn settings(&self) -> SessionSettings {
        SessionSettings {
            light_on_connect: self.light_on_connect,
        }
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum BackendConfig {
    Mock {
        #[serde(default = "default_poll_interval_ms")]
        poll_interval_ms: u64,
        #[serde(default)]
        boards: Vec<MockBoardConfig>,
    },
    Bluez {
        adapter: Option<String>,
        #[serde(default = "default_poll_interval_ms")]
        rescan_interval_ms: u64,
    },
}

fn default_poll_interval_ms() -> u64 {
    5_000
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::Mock {
            poll_interval_ms: default_poll_interval_ms(),
            boards: vec![
                MockBoardConfig {
                    address: "00:1F:C5:00:00:01".to_owned(),
                    load: [18.4, 17.9, 16.2, 17.5],
                    battery: default_battery(),
                    jitter: 4,
                },
                MockBoardConfig {
                    address: "00:1F:C5:00:00:02".to_owned(),
                    load: [3.1, 2.8, 3.4, 2.9],
                    battery: default_battery(),
                    jitter: 4,
                },
            ],
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MockBoardConfig {
    pub address: String,
    /// Kilograms on each sensor
    pub load: [f64; SENSOR_COUNT],
    #[serde(default = "default_battery")]
    pub battery: u8,
    /// Raw noise added to every reading
    #[serde(default)]
    pub jitter: u16,
}

fn default_battery() -> u8 {
    0xC0
}

impl MockBoardConfig {
    pub fn simulated(&self) -> SimulatedBoard {
        SimulatedBoard::new(self.address.as_str(), self.load)
            .with_battery(self.battery)
            .with_jitter(self.jitter)
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.feed.period_ms == 0 {
            return Err(ConfigError::Invalid("feed.period_ms must be positive".into()));
        }
        if self.feed.client_buffer == 0 {
            return Err(ConfigError::Invalid("feed.client_buffer must be positive".into()));
        }
        if self.session.reap_interval_ms == 0 {
            return Err(ConfigError::Invalid("session.reap_interval_ms must be positive".into()));
        }

        match &self.backend {
            BackendConfig::Mock {
                poll_interval_ms,
                boards,
            } => {
                if *poll_interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "backend.poll_interval_ms must be positive".into(),
                    ));
                }
                if let Some(board) = boards
                    .iter()
                    .find(|b| b.load.iter().any(|l| !l.is_finite() || *l < 0.0))
                {
                    return Err(ConfigError::Invalid(format!(
                        "board {} has a negative or non-finite load",
                        board.address
                    )));
                }
            }
            BackendConfig::Bluez {
                rescan_interval_ms, ..
            } => {
                if !cfg!(feature = "bluez") {
                    return Err(ConfigError::Invalid(
                        "backend type \"bluez\" needs a build with the `bluez` feature".into(),
                    ));
                }
                if *rescan_interval_ms == 0 {
                    return Err(ConfigError::Invalid(
                        "backend.rescan_interval_ms must be positive".into(),
                    ));
                }
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_uses_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.server.http_addr.port(), 8000);
        assert_eq!(config.server.feed_addr.port(), 8080);
        assert_eq!(config.feed.period(), Duration::from_millis(100));
        assert!(config.session.light_on_connect);
        assert!(matches!(
            config.backend,
            BackendConfig::Mock { ref boards, .. } if boards.len() == 2
        ));
    }

    #[test]
    fn parses_mock_backend() {
        let config = Config::parse(
            r#"
            [server]
            http_addr = "127.0.0.1:9000"
            feed_addr = "127.0.0.1:9001"
            static_root = "web"

            [feed]
            period_ms = 50

            [backend]
            type = "mock"
            poll_interval_ms = 250
            boards = [
                { address = "AA", load = [1.0, 2.0, 3.0, 4.0] },
                { address = "BB", load = [0.0, 0.0, 0.0, 0.0], battery = 12, jitter = 3 },
            ]
            "#,
        )
        .unwrap();

        assert_eq!(config.server.static_root, PathBuf::from("web"));
        assert_eq!(config.feed.period_ms, 50);
        assert_eq!(config.feed.client_buffer, 16);

        let BackendConfig::Mock { poll_interval_ms, boards } = config.backend else {
            panic!("expected mock backend");
        };
        assert_eq!(poll_interval_ms, 250);
        assert_eq!(boards[0].battery, 0xC0);
        assert_eq!(boards[1].battery, 12);
        assert_eq!(boards[1].jitter, 3);
    }

    #[test]
    fn rejects_zero_period() {
        let err = Config::parse("[feed]\nperiod_ms = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn rejects_negative_load() {
        let err = Config::parse(
            r#"
[backend]
type = "mock"
boards = [{ address = "AA", load = [1.0, -2.0, 0.0, 0.0] }]
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn unknown_backend_fails_to_parse() {
        let err = Config::parse("[backend]\ntype = \"serial\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[cfg(not(feature = "bluez"))]
    #[test]
    fn bluez_needs_the_feature() {
        let err = Config::parse("[backend]\ntype = \"bluez\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn load_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tare-hub.toml");
        std::fs::write(&path, "[session]\nlight_on_connect = false\n").unwrap();

        let config = Config::load(&path).unwrap();
        assert!(!config.session.light_on_connect);
        assert_eq!(config.session.reap_interval(), Duration::from_secs(1));
    }
}
