// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// This module handles loading and parsing configuration from config.toml.
// Provides sensible defaults if config file is missing or has errors.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub instance: InstanceConfig,
    pub output: OutputConfig,
    pub clear: ClearConfig,
    pub debug: DebugConfig,
}

/// Instance bootstrap settings: layers and extensions
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct InstanceConfig {
    pub app_name: String,
    pub enable_validation: bool,
    pub enable_windowing: bool,
    pub extra_extensions: BTreeSet<String>,
    pub validation_layer: String,
}

impl Default for InstanceConfig {
    fn default() -> Self {
        Self {
            app_name: "vk-clear-png".to_string(),
            enable_validation: true,
            enable_windowing: false,
            extra_extensions: BTreeSet::new(),
            validation_layer: "VK_LAYER_KHRONOS_validation".to_string(),
        }
    }
}

/// Where and how big the PNG is
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct OutputConfig {
    /// Relative paths are taken from the executable's directory
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("resources/out.png"),
            width: 512,
            height: 512,
        }
    }
}

impl OutputConfig {
    /// Output path anchored at the executable's directory
    pub fn resolved_path(&self) -> PathBuf {
        let exe = std::env::current_exe().ok();
        resolve_output_path(&self.path, exe.as_deref().and_then(Path::parent))
    }
}

/// Join a relative `path` onto `exe_dir`. Absolute paths, or no known
/// executable directory, leave `path` as is.
pub fn resolve_output_path(path: &Path, exe_dir: Option<&Path>) -> PathBuf {
    match exe_dir {
        Some(dir) if path.is_relative() => dir.join(path),
        _ => path.to_path_buf(),
    }
}

/// Values written by the GPU
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ClearConfig {
    /// RGBA, 0-1 range
    pub clear_color: [f32; 4],
    /// 32-bit word written by vkCmdFillBuffer
    pub fill_value: u32,
    pub buffer_size: u64,
}

impl Default for ClearConfig {
    fn default() -> Self {
        Self {
            clear_color: [1.0, 1.0, 1.0, 1.0],
            fill_value: 0xdead_beef,
            buffer_size: 64 * 1024,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub report: ReportFilter,
    pub log_to_file: bool,
    pub log_file: String,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            report: ReportFilter::default(),
            log_to_file: false,
            log_file: "vulkan_debug.log".to_string(),
        }
    }
}

/// Which validation report categories reach the callback
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ReportFilter {
    pub error: bool,
    pub warning: bool,
    pub performance: bool,
    pub information: bool,
    pub debug: bool,
}

impl Default for ReportFilter {
    fn default() -> Self {
        Self {
            error: true,
            warning: true,
            performance: true,
            information: false,
            debug: false,
        }
    }
}

impl ReportFilter {
    pub fn to_flags(self) -> vk::DebugReportFlagsEXT {
        let mut flags = vk::DebugReportFlagsEXT::empty();
        if self.error {
            flags |= vk::DebugReportFlagsEXT::ERROR;
        }
        if self.warning {
            flags |= vk::DebugReportFlagsEXT::WARNING;
        }
        if self.performance {
            flags |= vk::DebugReportFlagsEXT::PERFORMANCE_WARNING;
        }
        if self.information {
            flags |= vk::DebugReportFlagsEXT::INFORMATION;
        }
        if self.debug {
            flags |= vk::DebugReportFlagsEXT::DEBUG;
        }
        flags
    }
}

impl Config {
    /// Load config.toml, falling back to defaults.
    ///
    /// Runs before logging is up, so a load failure is handed back for the
    /// caller to report instead of being logged here.
    pub fn load_or_default() -> (Self, Option<anyhow::Error>) {
        Self::load_or_default_from("config.toml")
    }

    pub fn load_or_default_from<P: AsRef<Path>>(path: P) -> (Self, Option<anyhow::Error>) {
        match Self::load_from_path(path) {
            Ok(config) => (config, None),
            Err(e) => (Config::default(), Some(e)),
        }
    }

    /// Load configuration from a specific path; a missing file means defaults
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        if config.output.width == 0 || config.output.height == 0 {
            anyhow::bail!(
                "Output size must be non-zero, got {}x{}",
                config.output.width,
                config.output.height
            );
        }
        if config.clear.buffer_size == 0 || config.clear.buffer_size % 4 != 0 {
            anyhow::bail!(
                "Buffer size must be a non-zero multiple of 4, got {}",
                config.clear.buffer_size
            );
        }
        Ok(config)
    }
}
