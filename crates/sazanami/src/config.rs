use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::retry::RetryOptions;

/// Everything a playback session can be tuned with.
///
/// Every field has a default, so a config file only needs to mention what it changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    pub buffer: BufferConfig,
    pub abr: AbrConfig,
    /// Backoff policy for segment requests.
    pub retry: RetryConfig,
    /// Backoff policy for manifest requests.
    pub manifest_retry: RetryConfig,
    pub on_codec_switch: CodecSwitchPolicy,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            buffer: BufferConfig::default(),
            abr: AbrConfig::default(),
            retry: RetryConfig::default(),
            manifest_retry: RetryConfig::manifest(),
            on_codec_switch: CodecSwitchPolicy::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Buffer goal: seconds of media to keep loaded ahead of the playback position.
    pub wanted_buffer_ahead: f64,
    /// Hard limit, in seconds, on how far ahead of the position segments may be requested.
    pub max_buffer_ahead: Option<f64>,
    /// Hard limit, in bytes, of media held by one buffer sink.
    pub max_buffer_size: Option<u64>,
    /// Buffered content of a bitrate under this threshold is replaced as soon
    /// as a better representation is chosen.
    pub fast_switch_threshold: Option<f64>,
    /// In-flight segment requests allowed per media type.
    pub max_concurrent_requests: usize,
    /// Delay between two evaluations when nothing happened in between.
    pub tick_interval_ms: u64,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            wanted_buffer_ahead: 30.,
            max_buffer_ahead: None,
            max_buffer_size: None,
            fast_switch_threshold: None,
            max_concurrent_requests: 2,
            tick_interval_ms: 500,
        }
    }
}

impl BufferConfig {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    /// Bitrate assumed before any bandwidth sample was collected.
    pub initial_bitrate: u64,
    pub min_bitrate: Option<u64>,
    pub max_bitrate: Option<u64>,
    /// Lock every choice to the highest representation under this bitrate.
    pub manual_bitrate: Option<u64>,
    /// Width of the rendering surface, representations wider than it are ignored.
    pub limit_to_screen_width: Option<u64>,

    pub fast_half_life: f64,
    pub slow_half_life: f64,
    /// Samples smaller than this are too noisy to be used.
    pub minimum_chunk_size: u64,
    /// No estimate is produced before this many bytes were sampled.
    pub minimum_total_bytes: u64,

    pub regular_factor: f64,
    pub starvation_factor: f64,
    pub starvation_gap: f64,
    pub out_of_starvation_gap: f64,
    /// Buffer gap at which the safety factor starts growing towards 1.
    pub buffer_bonus_low: f64,
    /// Buffer gap at which the safety factor reaches 1.
    pub buffer_bonus_high: f64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            initial_bitrate: 0,
            min_bitrate: None,
            max_bitrate: None,
            manual_bitrate: None,
            limit_to_screen_width: None,

            fast_half_life: 2.,
            slow_half_life: 10.,
            minimum_chunk_size: 16_000,
            minimum_total_bytes: 150_000,

            regular_factor: 0.8,
            starvation_factor: 0.72,
            starvation_gap: 5.,
            out_of_starvation_gap: 7.,
            buffer_bonus_low: 10.,
            buffer_bonus_high: 30.,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub total_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 200,
            max_delay_ms: 3_000,
            total_retries: 4,
        }
    }
}

impl RetryConfig {
    pub fn manifest() -> Self {
        Self {
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            total_retries: 5,
        }
    }

    pub fn to_options(&self) -> RetryOptions {
        RetryOptions {
            base_delay: Duration::from_millis(self.base_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            total_retries: self.total_retries,
        }
    }
}

/// What to do when the next representation cannot be decoded by the current buffer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecSwitchPolicy {
    /// Keep the sink and clean or flush the incompatible content.
    #[default]
    Continue,
    /// Tear the sink down and create a new one.
    Reload,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_config() {
        let config: StreamingConfig = serde_json::from_str(
            r#"{
                "buffer": { "wanted_buffer_ahead": 12.5 },
                "on_codec_switch": "reload"
            }"#,
        )
        .unwrap();

        assert_eq!(config.buffer.wanted_buffer_ahead, 12.5);
        assert_eq!(config.buffer.max_concurrent_requests, 2);
        assert_eq!(config.on_codec_switch, CodecSwitchPolicy::Reload);
        assert_eq!(config.abr.minimum_chunk_size, 16_000);
        assert_eq!(config.retry.total_retries, 4);
        assert_eq!(config.manifest_retry.total_retries, 5);
    }

    #[test]
    fn test_retry_options() {
        let options = RetryConfig::default().to_options();
        assert_eq!(options.base_delay, Duration::from_millis(200));
        assert_eq!(options.max_delay, Duration::from_secs(3));
    }
}
