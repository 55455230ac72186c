//! SQLite-backed identity store.

use chrono::{DateTime, SecondsFormat, Utc};
use moodwatch_core::codec;
use moodwatch_core::store::{IdentityStore, StoreError};
use moodwatch_core::{DetectionRecord, Embedding, Emotion, Identity, Registration};
use rusqlite::{params, Connection, ErrorCode, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id           TEXT PRIMARY KEY,
    display_name TEXT NOT NULL,
    email        TEXT NOT NULL UNIQUE COLLATE NOCASE,
    embedding    BLOB NOT NULL,
    created_at   TEXT NOT NULL
);
CREATE TABLE IF NOT EXISTS detections (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id TEXT NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    label       TEXT NOT NULL,
    confidence  REAL NOT NULL,
    timestamp   TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_detections_identity_time ON detections(identity_id, timestamp);
";

pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (creating if needed) the database at `path`.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)
                .map_err(|e| StoreError::Unavailable(format!("{}: {e}", dir.display())))?;
        }
        let conn = Connection::open(path).map_err(unavailable)?;
        tracing::info!(path = %path.display(), "opened identity database");
        Self::init(conn)
    }

    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().map_err(unavailable)?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.pragma_update(None, "foreign_keys", true).map_err(unavailable)?;
        conn.execute_batch(SCHEMA).map_err(unavailable)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn unavailable(e: rusqlite::Error) -> StoreError {
    StoreError::Unavailable(e.to_string())
}

/// Fixed-width UTC timestamps so text order matches time order.
fn timestamp(t: &DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, StoreError> {
    DateTime::parse_from_rfc3339(raw)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("timestamp {raw:?}: {e}")))
}

fn parse_label(raw: &str) -> Result<Emotion, StoreError> {
    raw.parse()
        .map_err(|e| StoreError::Corrupt(format!("{e}")))
}

type IdentityRow = (String, String, String, String);

fn identity_from_row((id, display_name, email, created_at): IdentityRow) -> Result<Identity, StoreError> {
    Ok(Identity {
        id,
        display_name,
        email,
        created_at: parse_timestamp(&created_at)?,
    })
}

impl IdentityStore for SqliteStore {
    fn register(
        &self,
        registration: &Registration,
        embedding: &Embedding,
    ) -> Result<Identity, StoreError> {
        let identity = Identity {
            id: uuid::Uuid::new_v4().to_string(),
            display_name: registration.display_name.clone(),
            email: registration.email.clone(),
            created_at: Utc::now(),
        };
        let inserted = self.conn().execute(
            "INSERT INTO identities (id, display_name, email, embedding, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                identity.id,
                identity.display_name,
                identity.email,
                codec::encode(embedding),
                timestamp(&identity.created_at),
            ],
        );
        match inserted {
            Ok(_) => {
                tracing::info!(id = %identity.id, name = %identity.display_name, "identity registered");
                Ok(identity)
            }
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::DuplicateEmail(registration.email.clone()))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    fn list_all(&self) -> Result<Vec<Identity>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT id, display_name, email, created_at FROM identities ORDER BY created_at, rowid")
            .map_err(unavailable)?;
        let rows = stmt
            .query_map([], |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)))
            .map_err(unavailable)?
            .collect::<Result<Vec<IdentityRow>, _>>()
            .map_err(unavailable)?;
        rows.into_iter().map(identity_from_row).collect()
    }

    fn get_identity(&self, id: &str) -> Result<Option<Identity>, StoreError> {
        let row: Option<IdentityRow> = self
            .conn()
            .query_row(
                "SELECT id, display_name, email, created_at FROM identities WHERE id = ?1",
                params![id],
                |r| Ok((r.get(0)?, r.get(1)?, r.get(2)?, r.get(3)?)),
            )
            .optional()
            .map_err(unavailable)?;
        row.map(identity_from_row).transpose()
    }

    fn get_embedding(&self, id: &str) -> Result<Option<Embedding>, StoreError> {
        let blob: Option<Vec<u8>> = self
            .conn()
            .query_row(
                "SELECT embedding FROM identities WHERE id = ?1",
                params![id],
                |r| r.get(0),
            )
            .optional()
            .map_err(unavailable)?;
        blob.map(|b| codec::decode(&b).map_err(|e| StoreError::Corrupt(format!("identity {id}: {e}"))))
            .transpose()
    }

    fn append_detection(
        &self,
        identity_id: &str,
        label: Emotion,
        confidence: f32,
        at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let inserted = self.conn().execute(
            "INSERT INTO detections (identity_id, label, confidence, timestamp) VALUES (?1, ?2, ?3, ?4)",
            params![identity_id, label.as_str(), confidence as f64, timestamp(&at)],
        );
        match inserted {
            Ok(_) => Ok(()),
            Err(rusqlite::Error::SqliteFailure(err, _)) if err.code == ErrorCode::ConstraintViolation => {
                Err(StoreError::NotFound(identity_id.to_string()))
            }
            Err(e) => Err(unavailable(e)),
        }
    }

    fn query_detections(
        &self,
        identity_id: Option<&str>,
        since: DateTime<Utc>,
    ) -> Result<Vec<DetectionRecord>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT id, identity_id, label, confidence, timestamp FROM detections
                 WHERE (?1 IS NULL OR identity_id = ?1) AND timestamp >= ?2
                 ORDER BY timestamp, id",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![identity_id, timestamp(&since)], |r| {
                Ok((
                    r.get::<_, i64>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, String>(2)?,
                    r.get::<_, f64>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        rows.into_iter()
            .map(|(id, identity_id, label, confidence, at)| {
                Ok(DetectionRecord {
                    id,
                    identity_id,
                    label: parse_label(&label)?,
                    confidence: confidence as f32,
                    timestamp: parse_timestamp(&at)?,
                })
            })
            .collect()
    }

    fn emotion_stats(&self, identity_id: Option<&str>) -> Result<BTreeMap<Emotion, u64>, StoreError> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT label, COUNT(*) FROM detections
                 WHERE (?1 IS NULL OR identity_id = ?1)
                 GROUP BY label",
            )
            .map_err(unavailable)?;
        let rows = stmt
            .query_map(params![identity_id], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)?)))
            .map_err(unavailable)?
            .collect::<Result<Vec<_>, _>>()
            .map_err(unavailable)?;

        let mut stats = BTreeMap::new();
        for (label, count) in rows {
            *stats.entry(parse_label(&label)?).or_insert(0) += count.max(0) as u64;
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn store_with_ana() -> (SqliteStore, Identity) {
        let store = SqliteStore::open_in_memory().unwrap();
        let ana = store
            .register(&Registration::new("Ana", "ana@example.com"), &Embedding::new(vec![0.25, -1.0, 3.5]))
            .unwrap();
        (store, ana)
    }

    #[test]
    fn test_register_and_fetch() {
        let (store, ana) = store_with_ana();
        assert!(uuid::Uuid::parse_str(&ana.id).is_ok());

        let fetched = store.get_identity(&ana.id).unwrap().unwrap();
        assert_eq!(fetched.display_name, "Ana");
        assert_eq!(fetched.email, "ana@example.com");
        assert_eq!(
            store.get_embedding(&ana.id).unwrap(),
            Some(Embedding::new(vec![0.25, -1.0, 3.5]))
        );
        assert!(store.get_identity("nope").unwrap().is_none());
        assert!(store.get_embedding("nope").unwrap().is_none());
    }

    #[test]
    fn test_duplicate_email_is_validation_error() {
        let (store, _) = store_with_ana();
        let err = store
            .register(&Registration::new("Other", "ANA@example.com"), &Embedding::new(vec![1.0]))
            .unwrap_err();
        assert!(matches!(err, StoreError::DuplicateEmail(_)));
        assert!(err.is_validation());
        assert_eq!(store.list_all().unwrap().len(), 1);
    }

    #[test]
    fn test_list_in_registration_order() {
        let (store, _) = store_with_ana();
        store
            .register(&Registration::new("Bo", "bo@example.com"), &Embedding::new(vec![1.0]))
            .unwrap();
        let names: Vec<String> = store.list_all().unwrap().into_iter().map(|i| i.display_name).collect();
        assert_eq!(names, vec!["Ana", "Bo"]);
    }

    #[test]
    fn test_detections_history_and_stats() {
        let (store, ana) = store_with_ana();
        let bo = store
            .register(&Registration::new("Bo", "bo@example.com"), &Embedding::new(vec![1.0]))
            .unwrap();
        let now = Utc::now();
        store.append_detection(&ana.id, Emotion::Happy, 0.9, now - Duration::days(40)).unwrap();
        store.append_detection(&ana.id, Emotion::Happy, 0.8, now - Duration::days(2)).unwrap();
        store.append_detection(&ana.id, Emotion::Sad, 0.7, now - Duration::days(1)).unwrap();
        store.append_detection(&bo.id, Emotion::Angry, 0.6, now).unwrap();

        let recent = store.query_detections(Some(&ana.id), now - Duration::days(30)).unwrap();
        let labels: Vec<Emotion> = recent.iter().map(|d| d.label).collect();
        assert_eq!(labels, vec![Emotion::Happy, Emotion::Sad]);
        assert!((recent[0].confidence - 0.8).abs() < 1e-6);

        let everyone = store.query_detections(None, now - Duration::days(30)).unwrap();
        assert_eq!(everyone.len(), 3);

        let stats = store.emotion_stats(Some(&ana.id)).unwrap();
        assert_eq!(stats.get(&Emotion::Happy), Some(&2));
        assert_eq!(stats.get(&Emotion::Sad), Some(&1));
        assert_eq!(stats.get(&Emotion::Angry), None);

        let global = store.emotion_stats(None).unwrap();
        assert_eq!(global.values().sum::<u64>(), 4);
    }

    #[test]
    fn test_detection_for_unknown_identity_rejected() {
        let (store, _) = store_with_ana();
        let err = store
            .append_detection("ghost", Emotion::Fear, 0.5, Utc::now())
            .unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[test]
    fn test_corrupt_embedding_reported() {
        let (store, ana) = store_with_ana();
        store
            .conn()
            .execute("UPDATE identities SET embedding = x'0203' WHERE id = ?1", params![ana.id])
            .unwrap();
        assert!(matches!(store.get_embedding(&ana.id), Err(StoreError::Corrupt(_))));
    }

    #[test]
    fn test_reopen_file_keeps_data() {
        let path = std::env::temp_dir().join(format!("moodwatch-test-{}.db", uuid::Uuid::new_v4()));
        let id = {
            let store = SqliteStore::open(&path).unwrap();
            store
                .register(&Registration::new("Ana", "ana@example.com"), &Embedding::new(vec![1.0, 2.0]))
                .unwrap()
                .id
        };
        let store = SqliteStore::open(&path).unwrap();
        assert_eq!(store.get_embedding(&id).unwrap(), Some(Embedding::new(vec![1.0, 2.0])));
        drop(store);
        let _ = std::fs::remove_file(&path);
    }
}
