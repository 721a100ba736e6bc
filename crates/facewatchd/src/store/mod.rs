//! SQLite persistence for known faces, unknown faces, recognition history
//! and settings.
//!
//! Everything, images included, lives in one database file. Each mutating
//! operation runs in a single transaction, so a promotion or a recognition
//! record is either fully visible or not at all.

mod history;
mod known;
mod unknown;

pub use history::{EventImage, FaceResult, NewRecognitionEvent, RecognitionEvent, RecordedFace};
pub use known::{KnownIdentity, KnownImage};
pub use unknown::{NewUnknownFace, UnknownFace, UnknownImage};

use crate::settings::Settings;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use serde::de::DeserializeOwned;
use std::path::Path;
use thiserror::Error;
use tokio_rusqlite::Connection;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS identities (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL UNIQUE,
    created_at  TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS encodings (
    id           INTEGER PRIMARY KEY AUTOINCREMENT,
    identity_id  INTEGER NOT NULL REFERENCES identities(id) ON DELETE CASCADE,
    filename     TEXT NOT NULL,
    encoding     TEXT NOT NULL,
    image        BLOB NOT NULL,
    created_at   TEXT NOT NULL,
    UNIQUE (identity_id, filename)
);

CREATE TABLE IF NOT EXISTS unknown_faces (
    id            TEXT PRIMARY KEY,
    captured_at   TEXT NOT NULL,
    source_image  BLOB NOT NULL,
    face_image    BLOB,
    encoding      TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS recognition_events (
    event_id      TEXT PRIMARY KEY,
    captured_at   TEXT NOT NULL,
    source_image  BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS recognition_faces (
    event_id      TEXT NOT NULL REFERENCES recognition_events(event_id) ON DELETE CASCADE,
    face_index    INTEGER NOT NULL,
    known_person  INTEGER NOT NULL,
    name_person   TEXT,
    distance      REAL,
    bbox          TEXT NOT NULL,
    encoding      TEXT NOT NULL,
    face_image    BLOB,
    PRIMARY KEY (event_id, face_index)
);

CREATE TABLE IF NOT EXISTS settings (
    id    INTEGER PRIMARY KEY CHECK (id = 1),
    body  TEXT NOT NULL
);
";

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),
    #[error("database error: {0}")]
    Database(#[from] tokio_rusqlite::Error),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Async handle to the face database. Cheap to clone.
#[derive(Clone)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (or create) the database at `path`, creating parent directories.
    pub async fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path.to_path_buf()).await?;
        let store = Self::init(conn).await?;
        tracing::info!(path = %path.display(), "face database opened");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory().await?).await
    }

    async fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.call(|conn| {
            conn.pragma_update(None, "foreign_keys", "ON")?;
            conn.execute_batch(SCHEMA)?;
            Ok(())
        })
        .await?;
        Ok(Self { conn })
    }

    pub async fn load_settings(&self) -> Result<Option<Settings>, StoreError> {
        let body: Option<String> = self
            .conn
            .call(|conn| {
                use rusqlite::OptionalExtension;
                let body = conn
                    .query_row("SELECT body FROM settings WHERE id = 1", [], |row| row.get(0))
                    .optional()?;
                Ok(body)
            })
            .await?;
        Ok(body.map(|b| serde_json::from_str(&b)).transpose()?)
    }

    pub async fn save_settings(&self, settings: &Settings) -> Result<(), StoreError> {
        let body = serde_json::to_string(settings)?;
        self.conn
            .call(move |conn| {
                conn.execute(
                    "INSERT INTO settings (id, body) VALUES (1, ?1)
                     ON CONFLICT(id) DO UPDATE SET body = excluded.body",
                    [body],
                )?;
                Ok(())
            })
            .await?;
        Ok(())
    }
}

/// Decode a JSON text column inside a row mapper.
fn json_column<T: DeserializeOwned>(idx: usize, text: &str) -> rusqlite::Result<T> {
    serde_json::from_str(text).map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

/// Stored image name: capture time plus a random suffix, keeping the
/// extension of the detected image format.
fn image_filename(now: DateTime<Utc>, image: &[u8]) -> String {
    let extension = image::guess_format(image)
        .ok()
        .and_then(|format| format.extensions_str().first().copied())
        .unwrap_or("bin");
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("{}_{}.{extension}", now.format("%Y%m%d_%H%M%S_%3f"), &suffix[..8])
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use facewatch_core::{BoundingBox, Embedding};

    pub fn jpeg(shade: u8) -> Vec<u8> {
        let image = image::RgbImage::from_pixel(8, 8, image::Rgb([shade, shade, shade]));
        facewatch_core::encoder::encode_jpeg(&image).unwrap()
    }

    pub fn bbox(x: f32) -> BoundingBox {
        BoundingBox {
            x,
            y: 0.0,
            width: 10.0,
            height: 10.0,
            confidence: 0.95,
            landmarks: None,
        }
    }

    pub fn unknown(id: &str, values: Vec<f32>) -> NewUnknownFace {
        NewUnknownFace {
            id: id.to_string(),
            timestamp: Utc::now(),
            source_image: jpeg(10),
            face_image: Some(jpeg(200)),
            encoding: Embedding::new(values),
        }
    }

    pub fn event(event_id: &str, faces: Vec<(Option<&str>, Vec<f32>)>) -> NewRecognitionEvent {
        NewRecognitionEvent {
            event_id: event_id.to_string(),
            timestamp: Utc::now(),
            source_image: jpeg(30),
            faces: faces
                .into_iter()
                .enumerate()
                .map(|(face_index, (name, values))| RecordedFace {
                    result: FaceResult {
                        face_index,
                        known_person: name.is_some(),
                        name_person: name.map(str::to_string),
                        distance: Some(0.3),
                        bbox: bbox(face_index as f32 * 20.0),
                    },
                    encoding: Embedding::new(values),
                    face_image: Some(jpeg(100 + face_index as u8)),
                })
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::jpeg;
    use super::*;
    use facewatch_core::Embedding;

    #[tokio::test]
    async fn test_settings_absent_then_roundtrip() {
        let store = Store::open_in_memory().await.unwrap();
        assert!(store.load_settings().await.unwrap().is_none());

        let settings = Settings {
            webhook_url: "http://hooks.local".into(),
            webhook_enabled: true,
            tolerance: 0.6,
        };
        store.save_settings(&settings).await.unwrap();
        store.save_settings(&settings).await.unwrap();
        assert_eq!(store.load_settings().await.unwrap(), Some(settings));
    }

    #[tokio::test]
    async fn test_file_store_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/faces.db");
        {
            let store = Store::open(&path).await.unwrap();
            store
                .add_known_face("Alice", Embedding::new(vec![0.1, 0.2]), jpeg(50))
                .await
                .unwrap();
        }
        let store = Store::open(&path).await.unwrap();
        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.entries()[0].name, "Alice");
        assert_eq!(gallery.entries()[0].encodings[0].values, vec![0.1, 0.2]);
    }

    #[test]
    fn test_image_filename_extension() {
        let now = Utc::now();
        assert!(image_filename(now, &jpeg(1)).ends_with(".jpg"));
        assert!(image_filename(now, b"????").ends_with(".bin"));
        assert_ne!(image_filename(now, &jpeg(1)), image_filename(now, &jpeg(1)));
    }
}
