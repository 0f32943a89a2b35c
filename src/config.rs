//! Configuration: TOML file under the user's config directory, overridden from the command line

use crate::mqtt::config::{ReconnectPolicy, SessionSettings};
use clap::{Parser, ValueEnum};
use color_eyre::eyre::{eyre, Result, WrapErr};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn, Level};

const CONFIG_DIR: &str = "teleop-bridge";
const CONFIG_FILE: &str = "config.toml";

/// Drive a robot with WASD over MQTT and watch what it sends back
#[derive(Parser, Debug, Default)]
#[command(name = "teleop-bridge", version)]
pub struct Cli {
    /// Configuration file (defaults to the user config directory)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Broker address, e.g. tcp://192.168.4.1:1883
    #[arg(short, long, env = "TELEOP_BROKER")]
    pub broker: Option<String>,

    /// Topic used for commands and echoes
    #[arg(short, long, env = "TELEOP_TOPIC")]
    pub topic: Option<String>,

    /// MQTT client id (generated when absent)
    #[arg(long, env = "TELEOP_CLIENT_ID")]
    pub client_id: Option<String>,

    /// Ask the broker to keep session state across reconnects
    #[arg(long)]
    pub persistent_session: bool,

    /// Where keys come from
    #[arg(long, value_enum)]
    pub input: Option<InputMode>,

    /// trace, debug, info, warn or error
    #[arg(long)]
    pub log_level: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum InputMode {
    /// Terminal when stdin is a TTY, piped stdin otherwise
    #[default]
    Auto,
    Terminal,
    Stdin,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    pub clean_session: bool,
    pub keep_alive_secs: u64,
    pub connect_timeout_secs: u64,
    pub reconnect: ReconnectPolicy,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            address: "tcp://192.168.4.1:1883".to_string(),
            client_id: None,
            clean_session: true,
            keep_alive_secs: 60,
            connect_timeout_secs: 10,
            reconnect: ReconnectPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlConfig {
    pub topic: String,
    pub input: InputMode,
}

impl Default for ControlConfig {
    fn default() -> Self {
        Self {
            topic: "VR_control".to_string(),
            input: InputMode::Auto,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
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

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub control: ControlConfig,
    pub logging: LoggingConfig,
}

impl AppConfig {
    /// `<config dir>/teleop-bridge/config.toml`
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join(CONFIG_DIR).join(CONFIG_FILE))
    }

    /// Loads the file named on the command line, or the default file, then applies overrides
    pub async fn load(cli: &Cli) -> Result<Self> {
        let mut config = match &cli.config {
            Some(path) => Self::from_file(path).await?,
            None => match Self::default_path() {
                Some(path) => Self::load_or_create(&path).await?,
                None => {
                    warn!("No config directory available, using defaults");
                    Self::default()
                }
            },
        };

        config.apply_overrides(cli);
        config.validate()?;
        Ok(config)
    }

    pub async fn from_file(path: &Path) -> Result<Self> {
        let content = tokio::fs::read_to_string(path)
            .await
            .wrap_err_with(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content)
            .wrap_err_with(|| format!("Failed to parse config file {}", path.display()))
    }

    /// Reads `path`, writing the defaults there first when it does not exist
    pub async fn load_or_create(path: &Path) -> Result<Self> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|e| eyre!("Failed to check config file {}: {}", path.display(), e))?;
        if exists {
            return Self::from_file(path).await;
        }

        let config = Self::default();
        if let Err(e) = config.save(path).await {
            warn!("Could not write default config: {}", e);
        } else {
            info!("Wrote default config to {}", path.display());
        }
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| eyre!("Failed to create config directory: {}", e))?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| eyre!("Failed to serialize config: {}", e))?;
        tokio::fs::write(path, content)
            .await
            .map_err(|e| eyre!("Failed to write config file: {}", e))
    }

    pub fn apply_overrides(&mut self, cli: &Cli) {
        if let Some(broker) = &cli.broker {
            self.broker.address = broker.clone();
        }
        if let Some(topic) = &cli.topic {
            self.control.topic = topic.clone();
        }
        if let Some(client_id) = &cli.client_id {
            self.broker.client_id = Some(client_id.clone());
        }
        if cli.persistent_session {
            self.broker.clean_session = false;
        }
        if let Some(input) = cli.input {
            self.control.input = input;
        }
        if let Some(level) = &cli.log_level {
            self.logging.level = level.clone();
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.control.topic.is_empty() {
            return Err(eyre!("control.topic must not be empty"));
        }
        if self.control.topic.contains(['+', '#']) {
            return Err(eyre!(
                "control.topic '{}' must not contain wildcards, commands are published to it",
                self.control.topic
            ));
        }
        if self.broker.keep_alive_secs < 5 {
            return Err(eyre!(
                "broker.keep_alive_secs must be at least 5, got {}",
                self.broker.keep_alive_secs
            ));
        }
        if self.broker.connect_timeout_secs == 0 {
            return Err(eyre!("broker.connect_timeout_secs must be at least 1"));
        }
        self.log_level()?;
        Ok(())
    }

    pub fn log_level(&self) -> Result<Level> {
        self.logging
            .level
            .parse::<Level>()
            .map_err(|_| eyre!("Unknown log level '{}'", self.logging.level))
    }

    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            address: self.broker.address.clone(),
            client_id: self.broker.client_id.clone(),
            clean_session: self.broker.clean_session,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            connect_timeout: Duration::from_secs(self.broker.connect_timeout_secs),
            reconnect: self.broker.reconnect,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_robot_setup() {
        let config = AppConfig::default();
        assert_eq!(config.broker.address, "tcp://192.168.4.1:1883");
        assert_eq!(config.control.topic, "VR_control");
        assert!(config.broker.clean_session);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [broker]
            address = "tcp://10.0.0.2:1884"

            [broker.reconnect]
            max_attempts = 5

            [control]
            input = "stdin"
            "#,
        )
        .unwrap();

        assert_eq!(config.broker.address, "tcp://10.0.0.2:1884");
        assert_eq!(config.broker.reconnect.max_attempts, 5);
        assert_eq!(config.broker.reconnect.interval_ms, 1000);
        assert_eq!(config.control.input, InputMode::Stdin);
        assert_eq!(config.control.topic, "VR_control");
    }

    #[test]
    fn cli_overrides_file_values() {
        let mut config = AppConfig::default();
        let cli = Cli::parse_from([
            "teleop-bridge",
            "--broker",
            "mqtt://robot.local",
            "--topic",
            "rover/cmd",
            "--client-id",
            "console-1",
            "--persistent-session",
            "--input",
            "terminal",
            "--log-level",
            "debug",
        ]);
        config.apply_overrides(&cli);

        let settings = config.session_settings();
        assert_eq!(settings.address, "mqtt://robot.local");
        assert_eq!(settings.client_id.as_deref(), Some("console-1"));
        assert!(!settings.clean_session);
        assert_eq!(config.control.topic, "rover/cmd");
        assert_eq!(config.control.input, InputMode::Terminal);
        assert_eq!(config.log_level().unwrap(), Level::DEBUG);
    }

    #[test]
    fn validation_rejects_bad_values() {
        let mut config = AppConfig::default();
        config.control.topic.clear();
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.broker.keep_alive_secs = 1;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.logging.level = "loud".into();
        assert!(config.validate().is_err());

        for topic in ["rover/#", "rover/+/cmd", "#"] {
            let mut config = AppConfig::default();
            config.control.topic = topic.into();
            assert!(config.validate().is_err(), "{topic} should be rejected");
        }
    }

    #[tokio::test]
    async fn missing_file_is_created_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(CONFIG_FILE);

        let config = AppConfig::load_or_create(&path).await.unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(path.exists());

        let reloaded = AppConfig::from_file(&path).await.unwrap();
        assert_eq!(reloaded, config);
    }

    #[tokio::test]
    async fn explicit_missing_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let cli = Cli {
            config: Some(dir.path().join("absent.toml")),
            ..Cli::default()
        };
        assert!(AppConfig::load(&cli).await.is_err());
    }
}
