//! Engine configuration: defaults, TOML file loading, and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("config read {0}: {1}")]
    Read(String, std::io::Error),

    /// The file is not valid TOML for this schema.
    #[error("config parse: {0}")]
    Parse(String),
}

/// Top-level engine configuration. Loaded from `kiln.toml` when present;
/// every field has a default so a missing file is fine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Window settings.
    pub window: WindowConfig,
    /// Renderer settings.
    pub renderer: RendererConfig,
    /// Module host settings.
    pub module: ModuleConfig,
}

/// Window settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Title bar text.
    pub title: String,
    /// Initial framebuffer width.
    pub width: u32,
    /// Initial framebuffer height.
    pub height: u32,
}

/// Renderer settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Request validation layers (honored only if the layer is installed).
    pub validation: bool,
}

/// Module host settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleConfig {
    /// Base name of the module library (`game` -> `libgame.so`).
    pub name: String,
    /// Directory holding the module library; defaults to the executable's
    /// directory when empty.
    pub dir: Option<PathBuf>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig::default(),
            renderer: RendererConfig::default(),
            module: ModuleConfig::default(),
        }
    }
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "kiln".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            validation: cfg!(debug_assertions),
        }
    }
}

impl Default for ModuleConfig {
    fn default() -> Self {
        Self {
            name: "game".to_string(),
            dir: None,
        }
    }
}

impl EngineConfig {
    /// Load from a TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.display().to_string(), e))?;
        toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load `kiln.toml` from the working directory or the executable's
    /// directory if either exists, else defaults.
    pub fn load_or_default() -> Self {
        let mut candidates = vec![PathBuf::from("kiln.toml")];
        if let Ok(exe) = std::env::current_exe() {
            if let Some(dir) = exe.parent() {
                candidates.push(dir.join("kiln.toml"));
            }
        }
        for path in candidates {
            if path.exists() {
                match Self::load_from_file(&path) {
                    Ok(config) => {
                        log::info!("loaded config from {:?}", path);
                        return config;
                    }
                    Err(e) => {
                        log::warn!("ignoring bad config {:?}: {}", path, e);
                    }
                }
            }
        }
        Self::default()
    }

    /// Directory to look for the module library in.
    pub fn module_dir(&self) -> PathBuf {
        if let Some(dir) = &self.module.dir {
            return dir.clone();
        }
        std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(Path::to_path_buf))
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = EngineConfig::default();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.module.name, "game");
    }

    #[test]
    fn partial_toml_fills_in_defaults() {
        let config: EngineConfig = toml::from_str(
            r#"
            [window]
            title = "demo"
            width = 640
            "#,
        )
        .unwrap();
        assert_eq!(config.window.title, "demo");
        assert_eq!(config.window.width, 640);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.module.name, "game");
    }
}
