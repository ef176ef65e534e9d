//! Renderer configuration
//!
//! Startup settings for the video backend, loadable from TOML through the
//! [`crate::config::Config`] trait.

use serde::{Deserialize, Serialize};

use crate::config::Config;
use crate::render::api::VideoApi;

/// Renderer startup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Which video backend to initialize
    pub api: VideoApi,
    /// Enable the Vulkan validation layer and route its messages to `log`
    pub validation: bool,
    /// Number of frames that may be in flight simultaneously
    pub frames_in_flight: usize,
    /// Prefer a vsync'd FIFO present mode over low-latency MAILBOX
    pub vsync: bool,
    /// Clear colour applied when a framebuffer pass begins
    pub clear_color: [f32; 4],
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            api: VideoApi::Vulkan,
            validation: cfg!(debug_assertions),
            frames_in_flight: 3,
            vsync: false,
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }
}

impl Config for RendererConfig {}

impl RendererConfig {
    /// Clamp nonsensical values to workable ones, warning when they change
    pub fn sanitized(mut self) -> Self {
        if self.frames_in_flight == 0 || self.frames_in_flight > 8 {
            log::warn!(
                "frames_in_flight {} out of range, using 3",
                self.frames_in_flight
            );
            self.frames_in_flight = 3;
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 3);
        assert_eq!(config.clear_color, [0.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_sanitize_frames_in_flight() {
        let config = RendererConfig {
            frames_in_flight: 0,
            ..Default::default()
        };
        assert_eq!(config.sanitized().frames_in_flight, 3);

        let config = RendererConfig {
            frames_in_flight: 2,
            ..Default::default()
        };
        assert_eq!(config.sanitized().frames_in_flight, 2);
    }

    #[test]
    fn test_toml_round_trip() {
        let config = RendererConfig {
            api: VideoApi::Null,
            validation: false,
            frames_in_flight: 2,
            vsync: true,
            clear_color: [0.1, 0.2, 0.3, 1.0],
        };
        let text = toml::to_string_pretty(&config).unwrap();
        let back: RendererConfig = toml::from_str(&text).unwrap();
        assert_eq!(back.frames_in_flight, 2);
        assert!(back.vsync);
        assert_eq!(back.api, VideoApi::Null);
    }
}
