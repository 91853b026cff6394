use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::errors::AppResult;
use crate::users::{write_replacing, CoordinateResult};

/// Normalized location text mapped to the first coordinates resolved for it.
#[derive(Debug, Clone)]
pub struct GeocodeCache {
    path: PathBuf,
    entries: BTreeMap<String, CoordinateResult>,
}

impl GeocodeCache {
    /// Never fails: a missing or unreadable cache starts the run cold.
    pub fn load(path: &Path) -> Self {
        let entries = match fs::read_to_string(path) {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(entries) => entries,
                Err(err) => {
                    warn!(
                        target: "geocode_cache",
                        error = ?err,
                        path = %path.display(),
                        "failed to parse cache file; starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(target: "geocode_cache", path = %path.display(), "no cache file yet");
                BTreeMap::new()
            }
            Err(err) => {
                warn!(
                    target: "geocode_cache",
                    error = ?err,
                    path = %path.display(),
                    "failed to read cache file; starting empty"
                );
                BTreeMap::new()
            }
        };

        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    pub fn get(&self, key: &str) -> Option<CoordinateResult> {
        self.entries.get(key).copied()
    }

    /// First write wins. Returns `false` when the key was already cached.
    pub fn insert(&mut self, key: String, result: CoordinateResult) -> bool {
        if self.entries.contains_key(&key) {
            return false;
        }
        self.entries.insert(key, result);
        true
    }

    pub fn save(&self) -> AppResult<()> {
        let serialized = serde_json::to_string_pretty(&self.entries)?;
        write_replacing(&self.path, serialized.as_bytes())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
