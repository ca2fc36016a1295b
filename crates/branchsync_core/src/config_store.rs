//! Keyed store of branch configurations.

use crate::config::BranchConfig;
use crate::error::{ConfigError, ConfigResult};
use crate::persist;
use crate::types::BranchId;
use parking_lot::{Mutex, RwLock};
use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// Holds per-branch connection parameters and sync scope.
///
/// The store has no business logic beyond validating required fields on
/// [`put`](Self::put). When opened on a file, every successful `put` rewrites
/// the file atomically as a JSON array ordered by branch id.
///
/// # Thread Safety
///
/// Reads take a shared lock and never wait on file I/O. Writes serialize on
/// a separate writer lock and take the map's exclusive lock only to swap in
/// the new contents.
#[derive(Debug, Default)]
pub struct BranchConfigStore {
    branches: RwLock<BTreeMap<BranchId, BranchConfig>>,
    writer: Mutex<()>,
    path: Option<PathBuf>,
}

impl BranchConfigStore {
    /// Creates an empty store that lives only in memory.
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Opens a store backed by a JSON file, loading it if it exists.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or decoded,
    /// or if a stored configuration fails validation.
    pub fn open(path: &Path) -> ConfigResult<Self> {
        let branches = match fs::read(path) {
            Ok(bytes) if bytes.iter().all(u8::is_ascii_whitespace) => BTreeMap::new(),
            Ok(bytes) => {
                let configs: Vec<BranchConfig> = serde_json::from_slice(&bytes)?;
                let mut branches = BTreeMap::new();
                for config in configs {
                    config.validate()?;
                    branches.insert(config.branch.clone(), config);
                }
                branches
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        tracing::debug!(path = %path.display(), count = branches.len(), "loaded branch configs");

        Ok(Self {
            branches: RwLock::new(branches),
            writer: Mutex::new(()),
            path: Some(path.to_path_buf()),
        })
    }

    /// Returns the configuration for `branch`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::NotFound`] if the branch is unknown.
    pub fn get(&self, branch: &BranchId) -> ConfigResult<BranchConfig> {
        self.branches
            .read()
            .get(branch)
            .cloned()
            .ok_or_else(|| ConfigError::NotFound(branch.clone()))
    }

    /// Inserts or replaces a configuration.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Validation`] on missing fields, or an I/O error
    /// if the backing file cannot be written. A failed write leaves the
    /// store unchanged.
    pub fn put(&self, config: BranchConfig) -> ConfigResult<()> {
        config.validate()?;

        // Writers queue here so the file is written without holding the
        // map lock; readers only wait for the final swap.
        let _writer = self.writer.lock();
        match &self.path {
            Some(path) => {
                let mut next = self.branches.read().clone();
                next.insert(config.branch.clone(), config);
                let snapshot: Vec<&BranchConfig> = next.values().collect();
                let bytes = serde_json::to_vec_pretty(&snapshot)?;
                persist::write_atomic(path, &bytes)?;
                *self.branches.write() = next;
            }
            None => {
                self.branches.write().insert(config.branch.clone(), config);
            }
        }

        Ok(())
    }

    /// Returns all configurations ordered by branch id.
    pub fn list(&self) -> Vec<BranchConfig> {
        self.branches.read().values().cloned().collect()
    }

    /// Returns the backing file, if any.
    #[must_use]
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CredentialRef;
    use tempfile::tempdir;

    fn config(branch: &str) -> BranchConfig {
        BranchConfig::new(branch, "10.0.0.1", "ERP", CredentialRef::inline("sa", "pw"))
    }

    #[test]
    fn get_put_list() {
        let store = BranchConfigStore::in_memory();
        assert!(matches!(
            store.get(&BranchId::new("b2")),
            Err(ConfigError::NotFound(_))
        ));

        store.put(config("b2")).unwrap();
        store.put(config("b1")).unwrap();

        assert_eq!(store.get(&BranchId::new("b2")).unwrap().database, "ERP");
        let ids: Vec<String> = store.list().into_iter().map(|c| c.branch.to_string()).collect();
        assert_eq!(ids, vec!["b1", "b2"]);
    }

    #[test]
    fn put_rejects_invalid_config() {
        let store = BranchConfigStore::in_memory();
        let mut bad = config("b1");
        bad.host.clear();

        let err = store.put(bad).unwrap_err();
        assert!(matches!(err, ConfigError::Validation(ref v) if v.field == "host"));
        assert!(store.list().is_empty());
    }

    #[test]
    fn file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("branches.json");

        {
            let store = BranchConfigStore::open(&path).unwrap();
            store.put(config("b1")).unwrap();
            store.put(config("b1").with_name("Main street")).unwrap();
        }

        let reopened = BranchConfigStore::open(&path).unwrap();
        let all = reopened.list();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].name, "Main street");
    }

    #[test]
    fn reads_proceed_while_a_write_is_in_progress() {
        let dir = tempdir().unwrap();
        let store = BranchConfigStore::open(&dir.path().join("branches.json")).unwrap();
        store.put(config("b1")).unwrap();

        let _writing = store.writer.lock();
        assert_eq!(store.get(&BranchId::new("b1")).unwrap().host, "10.0.0.1");
        assert_eq!(store.list().len(), 1);
    }

    #[test]
    fn concurrent_puts_all_reach_the_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("branches.json");
        let store = std::sync::Arc::new(BranchConfigStore::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let store = std::sync::Arc::clone(&store);
                std::thread::spawn(move || store.put(config(&format!("b{i}"))).unwrap())
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(store.list().len(), 8);
        assert_eq!(BranchConfigStore::open(&path).unwrap().list().len(), 8);
    }
}
