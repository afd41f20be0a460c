// =============================================================================
// CONFIGURATION - Load settings from gpu.toml
// =============================================================================
//
// Heap sizes, buffering depth and debug toggles. Defaults are production
// values; a missing or partial file is not an error.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::types::MAX_BUFFERED_FRAMES;

/// Root configuration structure
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct GpuConfig {
    pub frame: FrameConfig,
    pub heap: HeapConfig,
    pub debug: DebugConfig,
}

/// Frame pacing and presentation
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct FrameConfig {
    pub buffered_frames: usize,
    pub present_mode: String,
}

impl Default for FrameConfig {
    fn default() -> Self {
        Self {
            buffered_frames: MAX_BUFFERED_FRAMES,
            present_mode: "mailbox".to_string(),
        }
    }
}

/// Descriptor heap and upload memory sizing
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct HeapConfig {
    /// Total bindless descriptor slots.
    pub descriptor_capacity: u32,
    /// Slots reserved per buffered frame for transient views.
    pub linear_descriptors_per_frame: u32,
    /// Slots in the per-draw table ring.
    pub ring_descriptors: u32,
    pub upload_page_size: u64,
    pub max_resources: u32,
    pub max_shaders: u32,
    pub max_psos: u32,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            descriptor_capacity: 64 * 1024,
            linear_descriptors_per_frame: 2048,
            ring_descriptors: 16 * 1024,
            upload_page_size: 16 * 1024 * 1024,
            max_resources: 4096,
            max_shaders: 512,
            max_psos: 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub debug_names: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: cfg!(debug_assertions),
            debug_names: true,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PresentModePreference {
    Immediate,
    Mailbox,
    Fifo,
}

impl GpuConfig {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("gpu.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load gpu.toml: {}. Using defaults.", e);
            GpuConfig::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(GpuConfig::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config: GpuConfig = toml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn present_mode(&self) -> PresentModePreference {
        match self.frame.present_mode.to_lowercase().as_str() {
            "immediate" => PresentModePreference::Immediate,
            "mailbox" => PresentModePreference::Mailbox,
            "fifo" | "vsync" => PresentModePreference::Fifo,
            other => {
                log::warn!("Unknown present mode '{}', defaulting to mailbox", other);
                PresentModePreference::Mailbox
            }
        }
    }

    /// Buffered frame count, clamped to the compiled-in maximum.
    pub fn buffered_frames(&self) -> usize {
        self.frame.buffered_frames.clamp(2, MAX_BUFFERED_FRAMES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_toml_keeps_other_defaults() {
        let config: GpuConfig =
            toml::from_str("[heap]\ndescriptor_capacity = 1024\n").unwrap();
        assert_eq!(config.heap.descriptor_capacity, 1024);
        assert_eq!(config.heap.ring_descriptors, HeapConfig::default().ring_descriptors);
        assert_eq!(config.frame.buffered_frames, MAX_BUFFERED_FRAMES);
    }

    #[test]
    fn present_mode_parsing() {
        let mut config = GpuConfig::default();
        config.frame.present_mode = "FIFO".to_string();
        assert_eq!(config.present_mode(), PresentModePreference::Fifo);
        config.frame.present_mode = "garbage".to_string();
        assert_eq!(config.present_mode(), PresentModePreference::Mailbox);
    }

    #[test]
    fn buffered_frames_clamped() {
        let mut config = GpuConfig::default();
        config.frame.buffered_frames = 17;
        assert_eq!(config.buffered_frames(), MAX_BUFFERED_FRAMES);
        config.frame.buffered_frames = 0;
        assert_eq!(config.buffered_frames(), 2);
    }
}
