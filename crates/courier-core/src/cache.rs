//! In-memory index of signed service discovery records.
//!
//! The cache loads a discovery file (see [`crate::record`]) and maintains
//! two indexes over the resulting proxies:
//!
//! - `ident_index`: service identity → proxy, latest stored wins,
//! - `action_index`: munged action key → proxies advertising that action.
//!
//! # Invariants
//!
//! - Every proxy reachable from the action index also appears in the ident
//!   index.
//! - Both indexes are guarded by a single mutex and only ever observed
//!   together; `refresh()` holds the lock for the entire parse and swaps
//!   the indexes in atomically, so a failed reload leaves the prior
//!   contents untouched.
//!
//! Overwriting an ident leaves the superseded proxy's action-index entries
//! in place until the next `refresh()`. Sweeping them eagerly would need a
//! reverse index; the stale entries are bounded by the announce cadence.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::trace;

use crate::record::{self, RecordError, ServiceProxy, search_key};

/// Errors surfaced by cache operations.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    /// The configured cache path exists but is a directory.
    #[error("cannot use cache path: `{path}` is a directory")]
    PathIsDirectory {
        /// The offending path.
        path: PathBuf,
    },

    /// Reading the cache file failed.
    #[error("failed to read cache file `{path}`: {source}")]
    Io {
        /// The cache file path.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The cache file contains a malformed record block.
    #[error(transparent)]
    Record(#[from] RecordError),
}

#[derive(Default)]
struct CacheIndexes {
    ident_index: HashMap<String, Arc<ServiceProxy>>,
    action_index: HashMap<String, Vec<Arc<ServiceProxy>>>,
}

impl CacheIndexes {
    fn store(&mut self, proxy: Arc<ServiceProxy>) {
        // Latest record for an ident wins; prior action entries linger
        // until the next refresh.
        self.ident_index
            .insert(proxy.ident().to_string(), Arc::clone(&proxy));

        for key in proxy.store_keys() {
            self.action_index
                .entry(key)
                .or_default()
                .push(Arc::clone(&proxy));
        }
    }
}

/// Searchable index of signed service records, loaded from a cache file.
pub struct ServiceCache {
    path: PathBuf,
    verify_records: bool,
    indexes: Mutex<CacheIndexes>,
}

impl ServiceCache {
    /// Creates an empty cache reading from `path`. Record verification is
    /// enabled by default.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            verify_records: true,
            indexes: Mutex::new(CacheIndexes::default()),
        }
    }

    /// Disables signature verification on refresh.
    ///
    /// Verification dominates refresh cost; callers loading a trusted file
    /// repeatedly may opt out.
    pub fn disable_record_verification(&mut self) {
        self.verify_records = false;
    }

    /// Enables signature verification on refresh.
    pub fn enable_record_verification(&mut self) {
        self.verify_records = true;
    }

    /// The path this cache refreshes from.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Inserts or overwrites a proxy in both indexes.
    pub fn store(&self, proxy: ServiceProxy) {
        self.indexes.lock().store(Arc::new(proxy));
    }

    /// Looks up a proxy by service identity.
    #[must_use]
    pub fn retrieve(&self, ident: &str) -> Option<Arc<ServiceProxy>> {
        self.indexes.lock().ident_index.get(ident).cloned()
    }

    /// Looks up the proxies advertising `action` (a joined `Class.action`
    /// composite) in `sector` at `version` over `envelope`.
    #[must_use]
    pub fn search_by_action(
        &self,
        sector: &str,
        action: &str,
        version: i64,
        envelope: &str,
    ) -> Vec<Arc<ServiceProxy>> {
        let key = search_key(sector, action, version, envelope);
        self.indexes
            .lock()
            .action_index
            .get(&key)
            .cloned()
            .unwrap_or_default()
    }

    /// Number of distinct service identities currently indexed.
    #[must_use]
    pub fn size(&self) -> usize {
        self.indexes.lock().ident_index.len()
    }

    /// Snapshot of all indexed proxies.
    #[must_use]
    pub fn all(&self) -> Vec<Arc<ServiceProxy>> {
        self.indexes.lock().ident_index.values().cloned().collect()
    }

    /// Reloads the cache file, replacing both indexes atomically.
    ///
    /// Proxies failing signature verification are dropped and the parse
    /// continues; a malformed record aborts the reload and the prior
    /// indexes are retained.
    ///
    /// # Errors
    ///
    /// Returns [`CacheError::PathIsDirectory`], [`CacheError::Io`], or a
    /// wrapped [`RecordError`] for malformed content.
    pub fn refresh(&self) -> Result<(), CacheError> {
        let mut indexes = self.indexes.lock();

        let metadata = std::fs::metadata(&self.path).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;
        if metadata.is_dir() {
            return Err(CacheError::PathIsDirectory {
                path: self.path.clone(),
            });
        }

        let contents = std::fs::read_to_string(&self.path).map_err(|source| CacheError::Io {
            path: self.path.clone(),
            source,
        })?;

        let mut fresh = CacheIndexes::default();
        for block in record::parse_record_blocks(&contents)? {
            let proxy = ServiceProxy::from_block(&block)?;

            if self.verify_records {
                if let Err(error) = proxy.validate() {
                    trace!(
                        ident = proxy.ident(),
                        %error,
                        "dropping record that failed signature verification"
                    );
                    continue;
                }
            }

            fresh.store(Arc::new(proxy));
        }

        *indexes = fresh;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::{ActionRecord, ClassRecord, ClassRecords, RecordBlock};

    fn proxy(ident: &str, sector: &str, class: &str, action: &str) -> ServiceProxy {
        let records = ClassRecords {
            version: 3,
            ident: ident.to_string(),
            sector: sector.to_string(),
            weight: 1,
            announce_interval: 15,
            connspec: "127.0.0.1:30100".to_string(),
            protocols: vec!["json".to_string()],
            classes: vec![ClassRecord {
                name: class.to_string(),
                actions: vec![ActionRecord {
                    name: action.to_string(),
                    crud_tags: String::new(),
                    version: 1,
                }],
            }],
        };
        ServiceProxy::from_block(&RecordBlock {
            class_records: serde_json::to_string(&records).unwrap(),
            certificate: "-----BEGIN CERTIFICATE-----\nAA\n-----END CERTIFICATE-----".to_string(),
            signature: "c2ln".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn store_and_retrieve_by_ident() {
        let cache = ServiceCache::new("/nonexistent");
        cache.store(proxy("svc-1", "main", "Cls", "do"));

        assert_eq!(cache.size(), 1);
        assert_eq!(cache.retrieve("svc-1").unwrap().ident(), "svc-1");
        assert!(cache.retrieve("svc-2").is_none());
    }

    #[test]
    fn search_by_joined_action_key() {
        let cache = ServiceCache::new("/nonexistent");
        cache.store(proxy("svc-1", "main", "Cls", "do"));

        let hits = cache.search_by_action("main", "Cls.do", 1, "json");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].ident(), "svc-1");

        assert!(cache.search_by_action("main", "Cls.do", 2, "json").is_empty());
        assert!(cache.search_by_action("other", "Cls.do", 1, "json").is_empty());
        assert!(cache.search_by_action("main", "Cls.do", 1, "jsonstore").is_empty());
    }

    #[test]
    fn overwriting_an_ident_keeps_latest() {
        let cache = ServiceCache::new("/nonexistent");
        cache.store(proxy("svc-1", "main", "Cls", "do"));
        cache.store(proxy("svc-1", "main", "Cls", "redo"));

        assert_eq!(cache.size(), 1);
        let stored = cache.retrieve("svc-1").unwrap();
        assert_eq!(stored.records().classes[0].actions[0].name, "redo");

        // The superseded action entry lingers until the next refresh.
        assert_eq!(cache.search_by_action("main", "Cls.do", 1, "json").len(), 1);
        assert_eq!(cache.search_by_action("main", "Cls.redo", 1, "json").len(), 1);
    }

    #[test]
    fn every_action_hit_is_retrievable_by_ident() {
        let cache = ServiceCache::new("/nonexistent");
        cache.store(proxy("svc-1", "main", "Cls", "do"));
        cache.store(proxy("svc-2", "main", "Cls", "do"));

        for hit in cache.search_by_action("main", "Cls.do", 1, "json") {
            assert!(cache.retrieve(hit.ident()).is_some());
        }
    }

    #[test]
    fn refresh_rejects_directories() {
        let dir = tempfile::tempdir().unwrap();
        let cache = ServiceCache::new(dir.path());
        assert!(matches!(
            cache.refresh(),
            Err(CacheError::PathIsDirectory { .. })
        ));
    }

    #[test]
    fn refresh_missing_file_is_io_error() {
        let cache = ServiceCache::new("/nonexistent/courier.cache");
        assert!(matches!(cache.refresh(), Err(CacheError::Io { .. })));
    }
}
