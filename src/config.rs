// Configuration loaded from config.toml
//
// Missing file or missing keys fall back to defaults; a malformed file is
// logged and ignored rather than aborting startup.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use kindling::gpu::GpuConfig;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Kindling".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.05, 0.05, 0.08, 1.0],
            frames_in_flight: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation: bool,
    pub object_names: bool,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
            object_names: cfg!(debug_assertions),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load from config.toml next to the executable, defaults on any
    /// failure.
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {}. Using defaults.", e);
            Config::default()
        })
    }

    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: Config = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    /// Present mode preference, or None to let the swapchain pick.
    pub fn present_mode(&self) -> Option<ash::vk::PresentModeKHR> {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => Some(ash::vk::PresentModeKHR::IMMEDIATE),
            "mailbox" => Some(ash::vk::PresentModeKHR::MAILBOX),
            "fifo" => Some(ash::vk::PresentModeKHR::FIFO),
            "fifo_relaxed" => Some(ash::vk::PresentModeKHR::FIFO_RELAXED),
            other => {
                log::warn!("Unknown present mode '{}', using the default", other);
                None
            }
        }
    }

    pub fn gpu(&self) -> GpuConfig {
        GpuConfig {
            validation: self.debug.validation,
            debug_names: self.debug.object_names,
            frames_in_flight: self.graphics.frames_in_flight,
            preferred_present_mode: self.present_mode(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_keys_fall_back_to_defaults() {
        let config: Config = toml::from_str("[window]\nwidth = 800\n").unwrap();
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, 3);
    }

    #[test]
    fn present_mode_strings_map_to_native_modes() {
        let mut config = Config::default();
        config.graphics.present_mode = "FIFO".to_string();
        assert_eq!(config.present_mode(), Some(ash::vk::PresentModeKHR::FIFO));
        config.graphics.present_mode = "warp-drive".to_string();
        assert_eq!(config.present_mode(), None);
    }
}
