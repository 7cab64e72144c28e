//! Durable registry of proxy configurations
//!
//! The store keeps every [`Configuration`] in memory, in insertion order, and
//! mirrors the full set to a single JSON document on every mutation. It has no
//! knowledge of running processes; run state lives in the supervisor.

use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Schema version written into the persisted document
pub const STORE_VERSION: u32 = 1;

/// A named proxy configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    /// Opaque unique id; empty until the store mints one
    #[serde(default)]
    pub id: String,
    /// Display label
    pub name: String,
    /// Proxy configuration document (TOML)
    pub body: String,
    /// Start this configuration when the supervisor boots
    #[serde(default)]
    pub auto_start: bool,
    /// Parsed form of `body`, recomputed on every save
    #[serde(skip)]
    pub parsed: Option<toml::Table>,
}

impl Configuration {
    /// Create a new configuration without an id
    pub fn new(name: &str, body: &str) -> Self {
        Self {
            id: String::new(),
            name: name.to_string(),
            body: body.to_string(),
            auto_start: false,
            parsed: None,
        }
    }

    /// Set the id (builder pattern)
    pub fn with_id(mut self, id: &str) -> Self {
        self.id = id.to_string();
        self
    }

    /// Set the auto-start flag (builder pattern)
    pub fn with_auto_start(mut self, auto_start: bool) -> Self {
        self.auto_start = auto_start;
        self
    }

    pub fn has_id(&self) -> bool {
        !self.id.is_empty()
    }
}

/// Validate a configuration document against the TOML grammar
pub fn parse_body(body: &str) -> Result<toml::Table> {
    toml::from_str::<toml::Table>(body)
        .map_err(|e| Error::InvalidConfig(e.message().to_string()))
}

#[derive(Serialize)]
struct PersistedRef<'a> {
    version: u32,
    configs: &'a [Configuration],
}

#[derive(Deserialize)]
struct Persisted {
    #[serde(default)]
    version: u32,
    #[serde(default)]
    configs: Vec<Configuration>,
}

/// Configuration registry backed by a JSON file
pub struct ConfigStore {
    path: PathBuf,
    configs: RwLock<Vec<Configuration>>,
}

impl ConfigStore {
    /// Open the store at `path`, loading any previously persisted state.
    ///
    /// A missing or unreadable file yields an empty registry.
    pub fn open<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref().to_path_buf();
        let configs = load_file(&path);
        info!(path = %path.display(), count = configs.len(), "Configuration store opened");
        Self {
            path,
            configs: RwLock::new(configs),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Snapshot of all configurations in insertion order
    pub fn list(&self) -> Vec<Configuration> {
        self.configs.read().clone()
    }

    pub fn len(&self) -> usize {
        self.configs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.read().is_empty()
    }

    pub fn get(&self, id: &str) -> Result<Configuration> {
        self.configs
            .read()
            .iter()
            .find(|c| c.id == id)
            .cloned()
            .ok_or_else(|| Error::NotFound(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.configs.read().iter().any(|c| c.id == id)
    }

    /// Validate and upsert a configuration, then persist the full set.
    ///
    /// Returns the stored record, including a freshly minted id when the
    /// input had none. On any failure the in-memory set is left unchanged.
    pub fn save(&self, mut config: Configuration) -> Result<Configuration> {
        config.parsed = Some(parse_body(&config.body)?);
        if !config.has_id() {
            config.id = uuid::Uuid::new_v4().to_string();
        }

        let mut configs = self.configs.write();
        let mut next = configs.clone();
        match next.iter_mut().find(|c| c.id == config.id) {
            Some(existing) => *existing = config.clone(),
            None => next.push(config.clone()),
        }

        self.persist(&next)?;
        *configs = next;

        debug!(config_id = %config.id, name = %config.name, "Configuration saved");
        Ok(config)
    }

    /// Remove a configuration. Returns whether a record was removed.
    pub fn delete(&self, id: &str) -> Result<bool> {
        let mut configs = self.configs.write();
        if !configs.iter().any(|c| c.id == id) {
            return Ok(false);
        }

        let next: Vec<Configuration> = configs.iter().filter(|c| c.id != id).cloned().collect();
        self.persist(&next)?;
        *configs = next;

        debug!(config_id = %id, "Configuration deleted");
        Ok(true)
    }

    /// Re-read the persisted file, replacing the in-memory set
    pub fn reload(&self) -> usize {
        let loaded = load_file(&self.path);
        let count = loaded.len();
        *self.configs.write() = loaded;
        info!(path = %self.path.display(), count, "Configuration store reloaded");
        count
    }

    /// Write the set to a temp file and rename it over the store file
    fn persist(&self, configs: &[Configuration]) -> Result<()> {
        let failure = |source: std::io::Error| Error::PersistenceFailure {
            path: self.path.display().to_string(),
            source,
        };

        let content = serde_json::to_string_pretty(&PersistedRef {
            version: STORE_VERSION,
            configs,
        })
        .map_err(|e| failure(e.into()))?;

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(failure)?;
            }
        }

        let tmp_path = self.path.with_extension("tmp");
        std::fs::write(&tmp_path, &content).map_err(failure)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&tmp_path, std::fs::Permissions::from_mode(0o600))
                .map_err(failure)?;
        }

        if let Err(e) = std::fs::rename(&tmp_path, &self.path) {
            let _ = std::fs::remove_file(&tmp_path);
            return Err(failure(e));
        }

        Ok(())
    }
}

fn load_file(path: &Path) -> Vec<Configuration> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            debug!(path = %path.display(), "No persisted configurations, starting empty");
            return Vec::new();
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read configuration store, starting empty");
            return Vec::new();
        }
    };

    let persisted: Persisted = match serde_json::from_str(&content) {
        Ok(p) => p,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Corrupt configuration store, starting empty");
            return Vec::new();
        }
    };

    if persisted.version > STORE_VERSION {
        warn!(
            path = %path.display(),
            version = persisted.version,
            supported = STORE_VERSION,
            "Configuration store written by a newer version, starting empty"
        );
        return Vec::new();
    }

    let mut seen = HashSet::new();
    persisted
        .configs
        .into_iter()
        .filter(|c| {
            if !c.has_id() || !seen.insert(c.id.clone()) {
                warn!(config_id = %c.id, name = %c.name, "Skipping record with missing or duplicate id");
                return false;
            }
            true
        })
        .map(|mut c| {
            c.parsed = parse_body(&c.body).ok();
            c
        })
        .collect()
}
