use std::path::Path;

use sazanami::StreamingConfig;
use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub streaming: StreamingConfig,
    pub playback: PlaybackConfig,
}

#[derive(Serialize, Deserialize)]
#[serde(default)]
pub struct PlaybackConfig {
    /// Seconds between two simulated player observations.
    pub tick_interval: f64,
    /// Simulated playback rate.
    pub speed: f64,
}

impl Default for PlaybackConfig {
    fn default() -> Self {
        Self {
            tick_interval: 1.,
            speed: 1.,
        }
    }
}

impl Config {
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let Some(file) = file else {
            return Ok(Self::default());
        };
        let data = std::fs::read_to_string(file)?;
        let config = toml::from_str(&data)?;
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: Config = toml::from_str(
            r#"
            [streaming.buffer]
            wanted_buffer_ahead = 12.0

            [playback]
            speed = 2.0
            "#,
        )
        .unwrap();
        assert_eq!(config.streaming.buffer.wanted_buffer_ahead, 12.);
        assert_eq!(config.streaming.buffer.max_concurrent_requests, 2);
        assert_eq!(config.playback.speed, 2.);
        assert_eq!(config.playback.tick_interval, 1.);
    }
}
