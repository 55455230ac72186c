//! Identity store contract and an in-memory implementation.

use crate::types::{DetectionRecord, Emotion, Embedding, Identity, Registration};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("store unavailable: {0}")]
    Unavailable(String),
    #[error("an identity with email {0} is already registered")]
    DuplicateEmail(String),
    #[error("identity not found: {0}")]
    NotFound(String),
    #[error("corrupt record: {0}")]
    Corrupt(String),
}

impl StoreError {
    /// Validation failures are the caller's fault and must not be retried.
    pub fn is_validation(&self) -> bool {
        matches!(self, StoreError::DuplicateEmail(_))
    }
}

/// Persistent storage for identities and detection history.
pub trait IdentityStore: Send + Sync {
    /// Register a new identity. Fails with [`StoreError::DuplicateEmail`]
    /// if the email is already taken.
    fn register(
        &self,
        registration: &Registration,
        embedding: &Embedding,
    ) -> Result<Identity, StoreError>;

    /// All identities in registration order.
    fn list_all(&self) -> Result<Vec<Identity>, StoreError>;

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError>;

    fn get_embedding(&self, id: &str) -> Result<Option<Embedding>, StoreError>;

    fn append_detection(
        &self,
        identity_id: &str,
        label: Emotion,
        confidence: f32,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    /// Detections at or after `since`, oldest first, optionally for one identity.
    fn query_detections(
        &self,
        identity_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DetectionRecord>, StoreError>;

    /// Detection count per label, optionally for one identity.
    fn emotion_stats(&self, identity_id: Option<&str>) -> Result<BTreeMap<Emotion, u64>, StoreError>;
}

#[derive(Default)]
struct MemoryInner {
    identities: Vec<(Identity, Embedding)>,
    detections: Vec<DetectionRecord>,
    next_id: u64,
    unavailable: bool,
}

/// Volatile store, useful for tests and for running without a database.
#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.lock().unavailable = unavailable;
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn available(&self) -> Result<std::sync::MutexGuard<'_, MemoryInner>, StoreError> {
        let inner = self.lock();
        if inner.unavailable {
            return Err(StoreError::Unavailable("memory store offline".into()));
        }
        Ok(inner)
    }
}

impl IdentityStore for MemoryStore {
    fn register(
        &self,
        registration: &Registration,
        embedding: &Embedding,
    ) -> Result<Identity, StoreError> {
        let mut inner = self.available()?;
        if inner
            .identities
            .iter()
            .any(|(i, _)| i.email.eq_ignore_ascii_case(&registration.email))
        {
            return Err(StoreError::DuplicateEmail(registration.email.clone()));
        }

        inner.next_id += 1;
        let identity = Identity {
            id: format!("mem-{}", inner.next_id),
            display_name: registration.display_name.clone(),
            email: registration.email.clone(),
            created_at: Utc::now(),
        };
        inner.identities.push((identity.clone(), embedding.clone()));
        Ok(identity)
    }

    fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        Ok(self.available()?.identities.iter().map(|(i, _)| i.clone()).collect())
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        Ok(self
            .available()?
            .identities
            .iter()
            .find(|(i, _)| i.id == id)
            .map(|(i, _)| i.clone()))
    }

    fn get_embedding(&self, id: &str) -> Result<Option<Embedding>, StoreError> {
        Ok(self
            .available()?
            .identities
            .iter()
            .find(|(i, _)| i.id == id)
            .map(|(_, e)| e.clone()))
    }

    fn append_detection(
        &self,
        identity_id: &str,
        label: Emotion,
        confidence: f32,
        timestamp: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut inner = self.available()?;
        if !inner.identities.iter().any(|(i, _)| i.id == identity_id) {
            return Err(StoreError::NotFound(identity_id.to_string()));
        }
        let id = inner.detections.len() as i64 + 1;
        inner.detections.push(DetectionRecord {
            id,
            identity_id: identity_id.to_string(),
            label,
            confidence,
            timestamp,
        });
        Ok(())
    }

    fn query_detections(
        &self,
        identity_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let inner = self.available()?;
        let mut records: Vec<DetectionRecord> = inner
            .detections
            .iter()
            .filter(|d| identity_id.map_or(true, |id| d.identity_id == id))
            .filter(|d| d.timestamp >= since)
            .cloned()
            .collect();
        records.sort_by_key(|d| (d.timestamp, d.id));
        Ok(records)
    }

    fn emotion_stats(&self, identity_id: Option<&str>) -> Result<BTreeMap<Emotion, u64>, StoreError> {
        let inner = self.available()?;
        let mut stats = BTreeMap::new();
        for d in inner
            .detections
            .iter()
            .filter(|d| identity_id.map_or(true, |id| d.identity_id == id))
        {
            *stats.entry(d.label).or_insert(0) += 1;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn emb(v: f32) -> Embedding {
        Embedding::new(vec![v; 4])
    }

    #[test]
    fn test_register_rejects_duplicate_email() {
        let store = MemoryStore::new();
        store.register(&Registration::new("Ana", "ana@example.com"), &emb(1.0)).unwrap();
        let err = store
            .register(&Registration::new("Ana B", "ANA@example.com"), &emb(2.0))
            .unwrap_err();
        assert!(err.is_validation());
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_embedding_lookup() {
        let store = MemoryStore::new();
        let ana = store.register(&Registration::new("Ana", "ana@example.com"), &emb(1.0)).unwrap();
        assert_eq!(store.get_embedding(&ana.id).unwrap(), Some(emb(1.0)));
        assert_eq!(store.get_embedding("missing").unwrap(), None);
        assert_eq!(store.get_identity(&ana.id).unwrap().unwrap().display_name, "Ana");
    }

    #[test]
    fn test_detections_filtered_and_counted() {
        let store = MemoryStore::new();
        let ana = store.register(&Registration::new("Ana", "ana@example.com"), &emb(1.0)).unwrap();
        let bo = store.register(&Registration::new("Bo", "bo@example.com"), &emb(2.0)).unwrap();
        let now = Utc::now();
        store.append_detection(&ana.id, Emotion::Happy, 0.9, now - Duration::days(40)).unwrap();
        store.append_detection(&ana.id, Emotion::Happy, 0.8, now).unwrap();
        store.append_detection(&ana.id, Emotion::Sad, 0.6, now).unwrap();
        store.append_detection(&bo.id, Emotion::Neutral, 0.7, now).unwrap();

        let recent = store.query_detections(Some(&ana.id), now - Duration::days(30)).unwrap();
        assert_eq!(recent.len(), 2);
        let all_recent = store.query_detections(None, now - Duration::days(30)).unwrap();
        assert_eq!(all_recent.len(), 3);

        let stats = store.emotion_stats(Some(&ana.id)).unwrap();
        assert_eq!(stats.get(&Emotion::Happy), Some(&2));
        assert_eq!(stats.get(&Emotion::Sad), Some(&1));
        assert_eq!(store.emotion_stats(None).unwrap().values().sum::<u64>(), 4);
    }

    #[test]
    fn test_unavailable() {
        let store = MemoryStore::new();
        store.set_unavailable(true);
        assert!(matches!(store.list_all(), Err(StoreError::Unavailable(_))));
        store.set_unavailable(false);
        assert!(store.list_all().unwrap().is_empty());
    }
}
