//! Embedding cache: an immutable snapshot of every registered identity's
//! embedding, swapped wholesale on rebuild.

use crate::store::{IdentityStore, StoreError};
use crate::types::Embedding;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache refresh failed, serving previous snapshot: {0}")]
    Refresh(#[from] StoreError),
}

/// Identity fields the matcher reports back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityRef {
    pub id: String,
    pub display_name: String,
}

/// Immutable, fully built view of the gallery.
///
/// `identities[i]` and `vectors[i]` always describe the same person; the
/// only way to build one keeps them in lockstep.
#[derive(Debug, Default)]
pub struct Snapshot {
    identities: Vec<IdentityRef>,
    vectors: Vec<Embedding>,
    generation: u64,
}

impl Snapshot {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn from_entries(entries: impl IntoIterator<Item = (IdentityRef, Embedding)>) -> Self {
        let (identities, vectors) = entries.into_iter().unzip();
        Self {
            identities,
            vectors,
            generation: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.vectors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.vectors.is_empty()
    }

    pub fn identities(&self) -> &[IdentityRef] {
        &self.identities
    }

    pub fn vectors(&self) -> &[Embedding] {
        &self.vectors
    }

    pub fn identity(&self, index: usize) -> Option<&IdentityRef> {
        self.identities.get(index)
    }

    /// Rebuild counter; 0 for snapshots never published by a cache.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

/// Read-mostly holder of the current [`Snapshot`].
///
/// Readers clone the `Arc` and keep matching against it even while a
/// rebuild publishes a newer one.
pub struct EmbeddingCache {
    current: RwLock<Arc<Snapshot>>,
    generation: AtomicU64,
    /// Serializes rebuilds so a slower, older read never replaces a newer
    /// snapshot.
    rebuilding: Mutex<()>,
}

impl Default for EmbeddingCache {
    fn default() -> Self {
        Self::new()
    }
}

impl EmbeddingCache {
    pub fn new() -> Self {
        Self {
            current: RwLock::new(Arc::new(Snapshot::empty())),
            generation: AtomicU64::new(0),
            rebuilding: Mutex::new(()),
        }
    }

    /// Latest complete snapshot (empty if never built).
    pub fn current(&self) -> Arc<Snapshot> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Reload every identity and embedding from `store` and publish the
    /// result. On failure the previous snapshot stays in place.
    ///
    /// Concurrent callers run one after another; readers are never blocked.
    pub fn rebuild(&self, store: &dyn IdentityStore) -> Result<Arc<Snapshot>, CacheError> {
        let _guard = self.rebuilding.lock().unwrap_or_else(|e| e.into_inner());
        let identities = store.list_all()?;

        let mut entries = Vec::with_capacity(identities.len());
        let mut skipped = 0usize;
        for identity in identities {
            match store.get_embedding(&identity.id)? {
                Some(embedding) => entries.push((
                    IdentityRef {
                        id: identity.id,
                        display_name: identity.display_name,
                    },
                    embedding,
                )),
                None => {
                    skipped += 1;
                    tracing::warn!(id = %identity.id, "identity has no embedding; left out of cache");
                }
            }
        }

        let mut snapshot = Snapshot::from_entries(entries);
        snapshot.generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = Arc::new(snapshot);

        *self.current.write().unwrap_or_else(|e| e.into_inner()) = snapshot.clone();

        tracing::info!(
            identities = snapshot.len(),
            skipped,
            generation = snapshot.generation,
            "embedding cache rebuilt"
        );
        Ok(snapshot)
    }
}
