//! Session configuration
//!
//! Defaults carry the reference constants; `from_env` layers environment
//! overrides on top for the binary.

use crate::prompt::SystemPrompt;
use std::time::Duration;

/// Highest accepted screen sampling rate
pub const MAX_FRAME_RATE: f64 = 60.0;

const DEFAULT_URL: &str = "wss://generativelanguage.googleapis.com/ws/google.ai.generativelanguage.v1beta.GenerativeService.BidiGenerateContent";

/// Configuration for a live session
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// WebSocket endpoint, without the key query parameter
    pub url: String,
    pub api_key: String,
    pub model: String,
    /// Prebuilt voice the agent speaks with
    pub voice: String,
    pub prompt: SystemPrompt,
    /// Wire rate of outbound PCM
    pub input_sample_rate: u32,
    /// Rate of inbound agent PCM and of the output timeline
    pub output_sample_rate: u32,
    /// Samples per capture block at the device's native rate
    pub block_size: usize,
    /// Screen samples per second
    pub frame_rate: f64,
    /// JPEG quality, 1..=100
    pub jpeg_quality: u8,
    /// Frames are downsampled so neither edge exceeds this
    pub max_frame_edge: Option<u32>,
    /// Bound on connect + setup
    pub connect_timeout: Duration,
    /// Outbound media queue depth; a full queue drops chunks
    pub outbound_queue: usize,
    /// Consecutive dropped audio blocks that count as a transport failure
    pub max_consecutive_drops: Option<u32>,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            api_key: String::new(),
            model: "models/gemini-2.5-flash-native-audio-preview-09-2025".to_string(),
            voice: "Zephyr".to_string(),
            prompt: SystemPrompt::default(),
            input_sample_rate: 16_000,
            output_sample_rate: 24_000,
            block_size: 4096,
            frame_rate: 5.0,
            jpeg_quality: 85,
            max_frame_edge: Some(1280),
            connect_timeout: Duration::from_secs(10),
            outbound_queue: 64,
            max_consecutive_drops: Some(64),
        }
    }
}

impl LiveConfig {
    /// Build a configuration from `GEMINI_API_KEY` and `SCREENLIVE_*` variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let api_key = lookup("GEMINI_API_KEY")
            .filter(|k| !k.trim().is_empty())
            .ok_or_else(|| anyhow::anyhow!("GEMINI_API_KEY is not set"))?;

        let mut config = Self {
            api_key,
            ..Default::default()
        };

        if let Some(model) = lookup("SCREENLIVE_MODEL") {
            config.model = if model.starts_with("models/") {
                model
            } else {
                format!("models/{}", model)
            };
        }
        if let Some(voice) = lookup("SCREENLIVE_VOICE") {
            config.voice = voice;
        }
        if let Some(rate) = lookup("SCREENLIVE_FRAME_RATE") {
            let rate: f64 = rate
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SCREENLIVE_FRAME_RATE {:?}: {}", rate, e))?;
            anyhow::ensure!(
                rate.is_finite() && rate > 0.0 && rate <= MAX_FRAME_RATE,
                "SCREENLIVE_FRAME_RATE must be in (0, {}], got {}",
                MAX_FRAME_RATE,
                rate
            );
            config.frame_rate = rate;
        }
        if let Some(drops) = lookup("SCREENLIVE_MAX_DROPS") {
            let drops: u32 = drops
                .parse()
                .map_err(|e| anyhow::anyhow!("invalid SCREENLIVE_MAX_DROPS {:?}: {}", drops, e))?;
            config.max_consecutive_drops = (drops > 0).then_some(drops);
        }

        config.prompt.user_name = lookup("SCREENLIVE_USER_NAME").filter(|s| !s.trim().is_empty());
        config.prompt.user_age = lookup("SCREENLIVE_USER_AGE").filter(|s| !s.trim().is_empty());
        if let Some(memory) = lookup("SCREENLIVE_MEMORY") {
            config.prompt.remembered_facts = memory
                .split(';')
                .map(str::trim)
                .filter(|fact| !fact.is_empty())
                .map(str::to_string)
                .collect();
        }

        Ok(config)
    }

    /// Endpoint URL with the API key attached.
    pub fn endpoint(&self) -> String {
        format!("{}?key={}", self.url, self.api_key)
    }

    /// Interval between screen samples. Rates outside `(0, MAX_FRAME_RATE]`
    /// are clamped so the interval is never zero.
    pub fn frame_interval(&self) -> Duration {
        let rate = if self.frame_rate.is_finite() && self.frame_rate > 0.0 {
            self.frame_rate.min(MAX_FRAME_RATE)
        } else {
            MAX_FRAME_RATE
        };
        Duration::from_secs_f64(1.0 / rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_requires_api_key() {
        assert!(LiveConfig::from_lookup(lookup(&[])).is_err());
        assert!(LiveConfig::from_lookup(lookup(&[("GEMINI_API_KEY", "  ")])).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = LiveConfig::from_lookup(lookup(&[
            ("GEMINI_API_KEY", "k"),
            ("SCREENLIVE_MODEL", "gemini-live-test"),
            ("SCREENLIVE_FRAME_RATE", "2"),
            ("SCREENLIVE_MAX_DROPS", "0"),
            ("SCREENLIVE_USER_NAME", "Ada"),
            ("SCREENLIVE_MEMORY", "likes tea; ;works nights"),
        ]))
        .unwrap();

        assert_eq!(config.model, "models/gemini-live-test");
        assert_eq!(config.frame_interval(), Duration::from_millis(500));
        assert_eq!(config.max_consecutive_drops, None);
        assert_eq!(config.prompt.user_name.as_deref(), Some("Ada"));
        assert_eq!(config.prompt.remembered_facts, vec!["likes tea", "works nights"]);
        assert!(config.endpoint().ends_with("BidiGenerateContent?key=k"));
    }

    #[test]
    fn test_rejects_bad_frame_rate() {
        for rate in ["-1", "0", "inf", "NaN", "1e12", "61"] {
            let result = LiveConfig::from_lookup(lookup(&[
                ("GEMINI_API_KEY", "k"),
                ("SCREENLIVE_FRAME_RATE", rate),
            ]));
            assert!(result.is_err(), "accepted frame rate {}", rate);
        }
    }

    #[test]
    fn test_frame_interval_is_never_zero() {
        for rate in [f64::INFINITY, f64::NAN, 0.0, 1e12] {
            let config = LiveConfig {
                frame_rate: rate,
                ..Default::default()
            };
            assert!(config.frame_interval() >= Duration::from_secs_f64(1.0 / MAX_FRAME_RATE));
        }
    }

    #[test]
    fn test_defaults() {
        let config = LiveConfig::default();
        assert_eq!(config.input_sample_rate, 16_000);
        assert_eq!(config.output_sample_rate, 24_000);
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.frame_interval(), Duration::from_millis(200));
        assert_eq!(config.jpeg_quality, 85);
    }
}
