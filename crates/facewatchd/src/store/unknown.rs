use super::known::{attach_encoding, KnownIdentity};
use super::{Store, StoreError};
use chrono::{DateTime, Utc};
use facewatch_core::Embedding;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// An unmatched face awaiting a name.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UnknownFace {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub has_face_image: bool,
}

pub struct NewUnknownFace {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub source_image: Vec<u8>,
    pub face_image: Option<Vec<u8>>,
    pub encoding: Embedding,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownImage {
    /// The full upload the face was found in.
    Source,
    /// The face crop, or the full upload if no crop was stored.
    Face,
}

impl Store {
    /// Unknown faces, newest first.
    pub async fn list_unknown(&self) -> Result<Vec<UnknownFace>, StoreError> {
        let faces = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT id, captured_at, face_image IS NOT NULL FROM unknown_faces
                     ORDER BY captured_at DESC, rowid DESC",
                )?;
                let faces = stmt
                    .query_map([], |row| {
                        Ok(UnknownFace {
                            id: row.get(0)?,
                            timestamp: row.get(1)?,
                            has_face_image: row.get(2)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(faces)
            })
            .await?;
        Ok(faces)
    }

    pub async fn unknown_image(&self, id: &str, kind: UnknownImage) -> Result<Vec<u8>, StoreError> {
        let sql = match kind {
            UnknownImage::Source => "SELECT source_image FROM unknown_faces WHERE id = ?1",
            UnknownImage::Face => "SELECT COALESCE(face_image, source_image) FROM unknown_faces WHERE id = ?1",
        };
        let owned = id.to_string();
        let image: Option<Vec<u8>> = self
            .conn
            .call(move |conn| Ok(conn.query_row(sql, [owned], |row| row.get(0)).optional()?))
            .await?;
        image.ok_or_else(|| StoreError::NotFound(format!("unknown face {id:?}")))
    }

    pub async fn delete_unknown(&self, id: &str) -> Result<(), StoreError> {
        let owned = id.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM unknown_faces WHERE id = ?1", [owned])?))
            .await?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("unknown face {id:?}")));
        }
        tracing::info!(id, "unknown face deleted");
        Ok(())
    }

    /// Name an unknown face: its encoding and image join `name` (created if
    /// needed) and the unknown record is removed, all in one transaction.
    pub async fn promote(&self, id: &str, name: &str) -> Result<KnownIdentity, StoreError> {
        let (owned_id, owned_name) = (id.to_string(), name.to_string());
        let identity = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let row: Option<(String, Vec<u8>)> = tx
                    .query_row(
                        "SELECT encoding, COALESCE(face_image, source_image) FROM unknown_faces WHERE id = ?1",
                        [&owned_id],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((encoding, image)) = row else {
                    return Ok(None);
                };
                let identity = attach_encoding(&tx, &owned_name, &encoding, &image)?;
                tx.execute("DELETE FROM unknown_faces WHERE id = ?1", [&owned_id])?;
                tx.commit()?;
                Ok(Some(identity))
            })
            .await?;

        let identity = identity.ok_or_else(|| StoreError::NotFound(format!("unknown face {id:?}")))?;
        tracing::info!(id, name = %identity.name, images = identity.image_count, "unknown face promoted");
        Ok(identity)
    }
}

/// Insert an unknown face inside an open transaction.
pub(super) fn insert_unknown(conn: &Connection, face: &NewUnknownFace, encoding_json: &str) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO unknown_faces (id, captured_at, source_image, face_image, encoding)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![face.id, face.timestamp, face.source_image, face.face_image, encoding_json],
    )?;
    Ok(())
}
