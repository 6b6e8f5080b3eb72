//! Read-only store for the chart templates and values files shipped with the operator
//!
//! Assets are loaded once (from the image's asset directory or from memory in tests)
//! and then only read. Paths are relative and always use `/` as separator.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{Error, Result};

/// Immutable, content-addressable view of the operator's asset files
#[derive(Clone, Debug, Default)]
pub struct AssetStore {
    files: BTreeMap<String, Vec<u8>>,
}

impl AssetStore {
    /// Load every regular file below `root`
    pub fn from_dir(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref();
        let mut files = BTreeMap::new();

        for entry in WalkDir::new(root).sort_by_file_name() {
            let entry = entry.map_err(|e| {
                Error::io(
                    root,
                    e.into_io_error()
                        .unwrap_or_else(|| std::io::Error::other("filesystem loop")),
                )
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(root)
                .map_err(|e| Error::ConfigError(e.to_string()))?;
            let key = normalize(relative);
            let bytes = std::fs::read(entry.path()).map_err(|e| Error::io(entry.path(), e))?;
            files.insert(key, bytes);
        }

        debug!(root = %root.display(), count = files.len(), "Loaded assets");
        Ok(Self { files })
    }

    /// Build a store from in-memory entries
    pub fn from_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Vec<u8>>,
    {
        Self {
            files: entries
                .into_iter()
                .map(|(k, v)| (k.into().trim_start_matches('/').to_string(), v.into()))
                .collect(),
        }
    }

    /// Read one asset
    pub fn read(&self, path: &str) -> Result<&[u8]> {
        self.files
            .get(path.trim_start_matches('/'))
            .map(Vec::as_slice)
            .ok_or_else(|| Error::ConfigError(format!("asset {path} not found")))
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path.trim_start_matches('/'))
    }

    /// All asset paths below `dir`, in lexicographic order
    pub fn walk<'a>(&'a self, dir: &str) -> impl Iterator<Item = &'a str> + 'a {
        let prefix = match dir.trim_matches('/') {
            "" => String::new(),
            d => format!("{d}/"),
        };
        self.files
            .keys()
            .filter(move |k| k.starts_with(&prefix))
            .map(String::as_str)
    }

    /// sha256 over the paths and contents below `dir`
    pub fn digest(&self, dir: &str) -> String {
        let mut hasher = Sha256::new();
        for path in self.walk(dir) {
            hasher.update(path.as_bytes());
            hasher.update([0u8]);
            if let Some(bytes) = self.files.get(path) {
                hasher.update(bytes);
            }
            hasher.update([0u8]);
        }
        hex::encode(hasher.finalize())
    }

    /// Write the assets below `dir` to `dest`, keeping their relative layout
    pub fn materialize(&self, dir: &str, dest: &Path) -> Result<Vec<PathBuf>> {
        let strip = match dir.trim_matches('/') {
            "" => String::new(),
            d => format!("{d}/"),
        };
        let mut written = Vec::new();
        for path in self.walk(dir) {
            let target = dest.join(path.strip_prefix(strip.as_str()).unwrap_or(path));
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent).map_err(|e| Error::io(parent, e))?;
            }
            let bytes = self.read(path)?;
            std::fs::write(&target, bytes).map_err(|e| Error::io(&target, e))?;
            written.push(target);
        }
        Ok(written)
    }
}

fn normalize(path: &Path) -> String {
    path.components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}
