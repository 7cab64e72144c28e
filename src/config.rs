use crate::binary::{Architecture, BinaryLocator};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Application directory name under the user's config/data dirs
pub const APP_DIR: &str = "proxydeck";

/// Daemon settings
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Settings {
    /// Process supervision settings
    #[serde(default)]
    pub supervisor: SupervisorSettings,

    /// Configuration store settings
    #[serde(default)]
    pub store: StoreSettings,

    /// Log output settings
    #[serde(default)]
    pub logging: LoggingSettings,
}

/// How the application is deployed, which decides where bundled binaries live
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum PackagingMode {
    /// Running from a source checkout (default)
    #[default]
    Development,
    /// Running from an installed bundle
    Packaged,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorSettings {
    /// Packaging mode: "development" (default) or "packaged"
    #[serde(default)]
    pub packaging: PackagingMode,

    /// Root of bundled resources (overrides the packaging-mode default)
    pub resource_dir: Option<String>,

    /// Proxy executable name, without platform suffix (default: frpc)
    #[serde(default = "default_binary_name")]
    pub binary_name: String,

    /// Directory for the per-configuration files handed to the proxy
    pub runtime_dir: Option<String>,

    /// Argument preceding the configuration file path (default: -c)
    #[serde(default = "default_config_flag")]
    pub config_flag: String,

    /// Grace period in seconds between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            packaging: PackagingMode::default(),
            resource_dir: None,
            binary_name: default_binary_name(),
            runtime_dir: None,
            config_flag: default_config_flag(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl SupervisorSettings {
    /// Resource root for the configured packaging mode
    pub fn resource_dir(&self) -> PathBuf {
        if let Some(ref dir) = self.resource_dir {
            return PathBuf::from(dir);
        }

        match self.packaging {
            PackagingMode::Development => PathBuf::from("resources"),
            PackagingMode::Packaged => {
                let exe_dir = std::env::current_exe()
                    .ok()
                    .and_then(|exe| exe.parent().map(Path::to_path_buf))
                    .unwrap_or_else(|| PathBuf::from("."));
                if cfg!(target_os = "macos") {
                    exe_dir.join("..").join("Resources")
                } else {
                    exe_dir.join("resources")
                }
            }
        }
    }

    pub fn runtime_dir(&self) -> PathBuf {
        self.runtime_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("run"))
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }

    /// Binary locator for the host architecture
    pub fn locator(&self) -> BinaryLocator {
        BinaryLocator::new(self.resource_dir(), &self.binary_name, Architecture::current())
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct StoreSettings {
    /// Path of the persisted configuration set
    pub path: Option<String>,
}

impl StoreSettings {
    pub fn path(&self) -> PathBuf {
        self.path
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("configs.json"))
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingSettings {
    /// Default log directive, combined with RUST_LOG
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
        }
    }
}

// Default value functions
fn default_binary_name() -> String {
    "frpc".to_string()
}

fn default_config_flag() -> String {
    "-c".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    5 // 5 seconds between SIGTERM and SIGKILL
}

fn default_log_filter() -> String {
    "proxydeck=debug".to_string()
}

fn data_dir() -> PathBuf {
    dirs_next::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(APP_DIR)
}

impl Settings {
    /// Default settings file location
    pub fn default_path() -> PathBuf {
        dirs_next::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("settings.toml")
    }

    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read settings file {}", path.display()))?;
        let settings: Settings = toml::from_str(&content)
            .with_context(|| format!("Failed to parse settings file {}", path.display()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings, falling back to defaults when the file does not exist
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Validate all settings
    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.supervisor.binary_name.trim().is_empty() {
            errors.push("supervisor.binary_name must not be empty".to_string());
        }
        if self.supervisor.config_flag.trim().is_empty() {
            errors.push("supervisor.config_flag must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Settings errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
