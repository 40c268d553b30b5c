//! Configuration loaded from `cadence.toml`.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Config {
    #[serde(default)]
    pub renderer: RendererConfig,
    #[serde(default)]
    pub window: WindowConfig,
}

/// Frame pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RendererConfig {
    /// Number of frame slots (1..=3)
    #[serde(default = "default_frames_in_flight")]
    pub frames_in_flight: usize,
    /// How long to wait on a frame fence before declaring the device hung
    #[serde(default = "default_fence_timeout_ms")]
    pub fence_timeout_ms: u64,
    /// How long to wait for a presentable image before treating the swapchain as stale
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,
    /// Depth target format, or none
    #[serde(default)]
    pub depth_format: DepthFormat,
    /// Enable the Khronos validation layer when available
    #[serde(default = "default_true")]
    pub validation: bool,
    /// Allocate one offscreen color target per swapchain image
    #[serde(default)]
    pub offscreen_targets: bool,
    /// Allocate one host-readable viewport image per swapchain image
    #[serde(default)]
    pub viewport_targets: bool,
}

/// Depth target selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DepthFormat {
    /// 32-bit float depth
    #[default]
    D32,
    /// 24-bit depth with 8-bit stencil
    D24S8,
    /// No depth target
    None,
}

/// Initial window settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WindowConfig {
    #[serde(default = "default_width")]
    pub width: u32,
    #[serde(default = "default_height")]
    pub height: u32,
    #[serde(default = "default_title")]
    pub title: String,
}

impl Config {
    /// Reads and validates a TOML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text).map_err(|e| Error::ConfigParse {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?;
        config.validate()?;
        tracing::info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    /// Parses and validates configuration from a TOML string.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Config = toml::from_str(text).map_err(|e| Error::ConfigParse {
            path: "<inline>".into(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Checks value ranges that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let frames = self.renderer.frames_in_flight;
        if !(1..=3).contains(&frames) {
            return Err(Error::Config(format!(
                "frames_in_flight must be between 1 and 3, got {frames}"
            )));
        }
        if self.renderer.fence_timeout_ms == 0 {
            return Err(Error::Config("fence_timeout_ms must be non-zero".into()));
        }
        // A zero wait makes every acquire report not-ready.
        if self.renderer.acquire_timeout_ms == 0 {
            return Err(Error::Config("acquire_timeout_ms must be non-zero".into()));
        }
        if self.window.width == 0 || self.window.height == 0 {
            return Err(Error::Config(format!(
                "window size must be non-zero, got {}x{}",
                self.window.width, self.window.height
            )));
        }
        Ok(())
    }
}

impl RendererConfig {
    pub fn fence_timeout(&self) -> Duration {
        Duration::from_millis(self.fence_timeout_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: default_frames_in_flight(),
            fence_timeout_ms: default_fence_timeout_ms(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            depth_format: DepthFormat::default(),
            validation: default_true(),
            offscreen_targets: false,
            viewport_targets: false,
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            width: default_width(),
            height: default_height(),
            title: default_title(),
        }
    }
}

fn default_frames_in_flight() -> usize {
    2
}

fn default_fence_timeout_ms() -> u64 {
    5_000
}

fn default_acquire_timeout_ms() -> u64 {
    1_000
}

fn default_true() -> bool {
    true
}

fn default_width() -> u32 {
    1280
}

fn default_height() -> u32 {
    720
}

fn default_title() -> String {
    "Cadence".to_string()
}
