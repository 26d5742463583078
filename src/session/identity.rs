//! Device name → UUID bindings.
//!
//! A device keeps its UUID across restarts. The file store keeps one TOML
//! table mapping names to UUIDs:
//!
//! ```toml
//! oven = "0b6c2f0e-5d0e-4a57-8c53-d3c1a4a5e8f1"
//! fridge = "5f0d3c52-1f4e-4d0b-9a4a-0f5e3b2a1c9d"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use uuid::Uuid;

use crate::config::DeviceConfig;
use crate::error::{LyncnatError, Result};

/// Persistent name → UUID map.
pub trait IdentityStore: Send + Sync {
    fn get(&self, name: &str) -> Result<Option<Uuid>>;
    fn set(&self, name: &str, uuid: Uuid) -> Result<()>;
}

/// Process-local store, lost on exit.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    entries: Mutex<HashMap<String, Uuid>>,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn get(&self, name: &str) -> Result<Option<Uuid>> {
        let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(entries.get(name).copied())
    }

    fn set(&self, name: &str, uuid: Uuid) -> Result<()> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        entries.insert(name.to_string(), uuid);
        Ok(())
    }
}

/// TOML file store.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
    // Serializes read-modify-write cycles within the process
    lock: Mutex<()>,
}

impl FileIdentityStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn load(&self) -> Result<BTreeMap<String, Uuid>> {
        match std::fs::read_to_string(&self.path) {
            Ok(content) => toml::from_str(&content).map_err(|e| {
                LyncnatError::Config(format!(
                    "Failed to parse identity file {:?}: {}",
                    self.path, e
                ))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }
}

impl IdentityStore for FileIdentityStore {
    fn get(&self, name: &str) -> Result<Option<Uuid>> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(self.load()?.get(name).copied())
    }

    fn set(&self, name: &str, uuid: Uuid) -> Result<()> {
        let _guard = self.lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut entries = self.load()?;
        entries.insert(name.to_string(), uuid);

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&self.path, toml::to_string(&entries)?)?;
        tracing::debug!("Stored UUID {} for '{}' in {:?}", uuid, name, self.path);
        Ok(())
    }
}

/// File store at the configured identity file, or a memory store when
/// there is none.
pub fn identity_store(config: &DeviceConfig) -> Box<dyn IdentityStore> {
    match &config.identity_file {
        Some(path) => Box::new(FileIdentityStore::new(path)),
        None => {
            tracing::warn!("No identity file configured, device UUIDs will not persist");
            Box::new(MemoryIdentityStore::new())
        }
    }
}
