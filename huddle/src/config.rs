use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// STUN/TURN urls handed to the media backend
    pub ice_servers: Vec<String>,
    /// how long the Ended state lingers before the session reverts to Idle
    pub ended_linger_ms: u64,
    /// period of the in-call elapsed time counter
    pub elapsed_tick_ms: u64,
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ice_servers: vec!["stun:stun.l.google.com:19302".into()],
            ended_linger_ms: 800,
            elapsed_tick_ms: 1000,
            event_channel_capacity: 1024,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&file)
    }

    pub fn validate(&self) -> Result<()> {
        if self.ended_linger_ms == 0 {
            return Err(Error::InvalidConfig("ended_linger_ms must be positive".into()));
        }
        if self.elapsed_tick_ms == 0 {
            return Err(Error::InvalidConfig("elapsed_tick_ms must be positive".into()));
        }
        if self.event_channel_capacity == 0 {
            return Err(Error::InvalidConfig(
                "event_channel_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn ended_linger(&self) -> Duration {
        Duration::from_millis(self.ended_linger_ms)
    }

    pub fn elapsed_tick(&self) -> Duration {
        Duration::from_millis(self.elapsed_tick_ms)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn partial_toml_keeps_defaults() -> anyhow::Result<()> {
        let config = Config::from_toml_str("ended_linger_ms = 500\n")?;
        assert_eq!(config.ended_linger(), Duration::from_millis(500));
        assert_eq!(config.elapsed_tick(), Duration::from_secs(1));
        assert_eq!(config.ice_servers, Config::default().ice_servers);
        Ok(())
    }

    #[test]
    fn rejects_zero_linger() {
        let r = Config::from_toml_str("ended_linger_ms = 0\n");
        assert!(matches!(r, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn custom_ice_servers() -> anyhow::Result<()> {
        let config = Config::from_toml_str(
            r#"ice_servers = ["stun:stun.example.org:3478", "turn:turn.example.org"]"#,
        )?;
        assert_eq!(config.ice_servers.len(), 2);
        assert_eq!(config.event_channel_capacity, 1024);
        Ok(())
    }
}
