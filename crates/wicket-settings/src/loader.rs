//! Layered configuration loading.
//!
//! Loads and merges configuration from two locations:
//! 1. Global: `~/.config/wicket/wicket.toml`
//! 2. Project: `<workspace>/.wicket/wicket.toml`
//!
//! Project values take precedence for scalar fields.

use crate::WicketConfig;
use std::path::{Path, PathBuf};

/// Loads and merges `WicketConfig` from global and project-level files.
pub struct ConfigLoader;

impl ConfigLoader {
    /// Load the merged configuration for the given workspace.
    ///
    /// Reads the global config (`~/.config/wicket/wicket.toml`), then the
    /// project config (`<workspace>/.wicket/wicket.toml`), and merges them.
    /// Missing files are silently skipped. Parse errors emit a warning to
    /// stderr and the file is treated as if absent.
    pub fn load(workspace: &Path) -> WicketConfig {
        let global = Self::load_optional(&Self::global_config_path());
        let project = Self::load_optional(&Self::project_config_path(workspace));
        global.merge(project)
    }

    /// Absolute path to the global config file.
    pub fn global_config_path() -> PathBuf {
        Self::global_config_dir()
            .unwrap_or_else(|| PathBuf::from(".wicket"))
            .join("wicket.toml")
    }

    /// Absolute path to the project config file for the given workspace.
    pub fn project_config_path(workspace: &Path) -> PathBuf {
        workspace.join(".wicket").join("wicket.toml")
    }

    fn global_config_dir() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join("wicket"))
    }

    fn load_optional(path: &Path) -> WicketConfig {
        if !path.exists() {
            return WicketConfig::default();
        }
        match WicketConfig::load(path) {
            Ok(config) => config,
            Err(err) => {
                // Warn but don't fail: a malformed config shouldn't block startup.
                eprintln!("wicket-settings: warning: failed to parse {path:?}: {err}");
                WicketConfig::default()
            }
        }
    }
}
