use super::Config;
use anyhow::Result;
use parking_lot::RwLock;
use std::path::{Path, PathBuf};
use tracing::info;

/// Owns the configuration document and its on-disk location.
///
/// The engine and the management API both hold an `Arc<ConfigStore>`; neither
/// reaches for a global. Mutations go through [`ConfigStore::update`], which
/// persists before committing, so the in-memory document never runs ahead of
/// the file.
pub struct ConfigStore {
    path: PathBuf,
    current: RwLock<Config>,
}

impl ConfigStore {
    /// Loads the document at `path`, creating a default one if none exists.
    /// The loaded document is written back once, which also persists any
    /// backfilled ids.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let config = if path.exists() {
            Config::load(&path)?
        } else {
            info!("No config file at {:?}, writing defaults", path);
            Config::initial()
        };
        config.save(&path)?;

        Ok(Self {
            path,
            current: RwLock::new(config),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the current document.
    pub fn get(&self) -> Config {
        self.current.read().clone()
    }

    /// Applies `mutate` to a copy of the document, persists the result, then
    /// commits it. A failing mutation or a failing save leaves the store
    /// untouched.
    pub fn update<T>(&self, mutate: impl FnOnce(&mut Config) -> Result<T>) -> Result<T> {
        let mut guard = self.current.write();
        let mut next = guard.clone();
        let out = mutate(&mut next)?;
        next.save(&self.path)?;
        *guard = next;
        Ok(out)
    }

    /// Replaces the in-memory document without persisting; used when the file
    /// itself changed on disk.
    pub fn replace(&self, config: Config) {
        *self.current.write() = config;
    }
}
