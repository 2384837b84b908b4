use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::error::{MemError, Result};

pub const DEFAULT_ROOT: &str = ".memfolder";

pub const ENV_PATH: &str = "MEMCORE_PATH";
pub const ENV_ENCRYPTION_KEY: &str = "MEMCORE_ENCRYPTION_KEY";
pub const ENV_PROJECTION_LEVEL: &str = "MEMCORE_PROJECTION_LEVEL";

/// Settings for one memory folder.
#[derive(Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct MemCoreConfig {
    pub root: PathBuf,
    /// Passphrase for field encryption. Records can only be stored
    /// encrypted when this is set.
    pub encryption_key: Option<String>,
    /// Dimension reduction factor of the random projection applied before
    /// facade vector search. `None` searches the raw vectors.
    pub projection_level: Option<usize>,
}

impl Default for MemCoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_ROOT),
            encryption_key: None,
            projection_level: None,
        }
    }
}

impl fmt::Debug for MemCoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemCoreConfig")
            .field("root", &self.root)
            .field("encryption_key", &self.encryption_key.as_ref().map(|_| "<redacted>"))
            .field("projection_level", &self.projection_level)
            .finish()
    }
}

impl MemCoreConfig {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into(), ..Self::default() }
    }

    pub fn with_encryption_key(mut self, key: impl Into<String>) -> Self {
        self.encryption_key = Some(key.into());
        self
    }

    pub fn with_projection_level(mut self, level: usize) -> Self {
        self.projection_level = Some(level);
        self
    }

    /// Reads a JSON config file. Missing keys take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        if let Some(root) = lookup(ENV_PATH).filter(|v| !v.is_empty()) {
            config.root = PathBuf::from(root);
        }
        config.encryption_key = lookup(ENV_ENCRYPTION_KEY).filter(|v| !v.is_empty());
        if let Some(level) = lookup(ENV_PROJECTION_LEVEL).filter(|v| !v.is_empty()) {
            let level = level.trim().parse::<usize>().map_err(|_| {
                MemError::Validation(format!("{} must be a positive integer, got '{}'", ENV_PROJECTION_LEVEL, level))
            })?;
            config.projection_level = Some(level);
        }
        Ok(config)
    }
}
