use super::known::{attach_encoding, KnownIdentity};
use super::unknown::{insert_unknown, NewUnknownFace};
use super::{json_column, Store, StoreError};
use chrono::{DateTime, Utc};
use facewatch_core::{BoundingBox, Embedding};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Outcome for one face of a recognition request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FaceResult {
    pub face_index: usize,
    pub known_person: bool,
    pub name_person: Option<String>,
    /// Distance to the chosen identity, or to the nearest one when unmatched.
    pub distance: Option<f32>,
    pub bbox: BoundingBox,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub total_faces: usize,
    pub faces: Vec<FaceResult>,
}

pub struct RecordedFace {
    pub result: FaceResult,
    pub encoding: Embedding,
    pub face_image: Option<Vec<u8>>,
}

pub struct NewRecognitionEvent {
    pub event_id: String,
    pub timestamp: DateTime<Utc>,
    pub source_image: Vec<u8>,
    pub faces: Vec<RecordedFace>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventImage {
    Original,
    /// Crop of the face at this index, or the original if none was stored.
    Face(usize),
}

const EVENT_FACES_SQL: &str = "SELECT event_id, face_index, known_person, name_person, distance, bbox
                               FROM recognition_faces";

impl Store {
    /// Persist a recognition event and the unknown faces it produced in a
    /// single transaction.
    pub async fn record_recognition(
        &self,
        event: NewRecognitionEvent,
        unknowns: Vec<NewUnknownFace>,
    ) -> Result<(), StoreError> {
        let faces = event
            .faces
            .iter()
            .map(|face| -> Result<_, serde_json::Error> {
                Ok((serde_json::to_string(&face.result.bbox)?, serde_json::to_string(&face.encoding)?))
            })
            .collect::<Result<Vec<(String, String)>, _>>()?;
        let unknown_encodings = unknowns
            .iter()
            .map(|face| serde_json::to_string(&face.encoding))
            .collect::<Result<Vec<_>, _>>()?;

        self.conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                tx.execute(
                    "INSERT INTO recognition_events (event_id, captured_at, source_image) VALUES (?1, ?2, ?3)",
                    params![event.event_id, event.timestamp, event.source_image],
                )?;
                for (face, (bbox, encoding)) in event.faces.iter().zip(&faces) {
                    tx.execute(
                        "INSERT INTO recognition_faces
                         (event_id, face_index, known_person, name_person, distance, bbox, encoding, face_image)
                         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                        params![
                            event.event_id,
                            face.result.face_index as i64,
                            face.result.known_person,
                            face.result.name_person,
                            face.result.distance.map(f64::from),
                            bbox,
                            encoding,
                            face.face_image,
                        ],
                    )?;
                }
                for (face, encoding) in unknowns.iter().zip(&unknown_encodings) {
                    insert_unknown(&tx, face, encoding)?;
                }
                tx.commit()?;
                Ok(())
            })
            .await?;
        Ok(())
    }

    /// All recognition events, newest first.
    pub async fn list_events(&self) -> Result<Vec<RecognitionEvent>, StoreError> {
        let events = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT event_id, captured_at FROM recognition_events
                     ORDER BY captured_at DESC, rowid DESC",
                )?;
                let headers = stmt
                    .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<(String, DateTime<Utc>)>, _>>()?;

                let mut faces = load_faces(conn, &format!("{EVENT_FACES_SQL} ORDER BY event_id, face_index"), params![])?;
                let events = headers
                    .into_iter()
                    .map(|(event_id, timestamp)| {
                        let faces = faces.remove(&event_id).unwrap_or_default();
                        RecognitionEvent {
                            event_id,
                            timestamp,
                            total_faces: faces.len(),
                            faces,
                        }
                    })
                    .collect();
                Ok(events)
            })
            .await?;
        Ok(events)
    }

    pub async fn get_event(&self, event_id: &str) -> Result<RecognitionEvent, StoreError> {
        let owned = event_id.to_string();
        let event = self
            .conn
            .call(move |conn| {
                let timestamp: Option<DateTime<Utc>> = conn
                    .query_row(
                        "SELECT captured_at FROM recognition_events WHERE event_id = ?1",
                        [&owned],
                        |row| row.get(0),
                    )
                    .optional()?;
                let Some(timestamp) = timestamp else {
                    return Ok(None);
                };
                let faces = load_faces(
                    conn,
                    &format!("{EVENT_FACES_SQL} WHERE event_id = ?1 ORDER BY face_index"),
                    [&owned],
                )?
                .remove(&owned)
                .unwrap_or_default();
                Ok(Some(RecognitionEvent {
                    event_id: owned,
                    timestamp,
                    total_faces: faces.len(),
                    faces,
                }))
            })
            .await?;
        event.ok_or_else(|| StoreError::NotFound(format!("recognition event {event_id:?}")))
    }

    pub async fn event_image(&self, event_id: &str, which: EventImage) -> Result<Vec<u8>, StoreError> {
        let owned = event_id.to_string();
        let image: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                let image = match which {
                    EventImage::Original => conn
                        .query_row(
                            "SELECT source_image FROM recognition_events WHERE event_id = ?1",
                            [&owned],
                            |row| row.get(0),
                        )
                        .optional()?,
                    EventImage::Face(index) => conn
                        .query_row(
                            "SELECT COALESCE(f.face_image, e.source_image) FROM recognition_faces f
                             JOIN recognition_events e ON e.event_id = f.event_id
                             WHERE f.event_id = ?1 AND f.face_index = ?2",
                            params![owned, index as i64],
                            |row| row.get(0),
                        )
                        .optional()?,
                };
                Ok(image)
            })
            .await?;
        image.ok_or_else(|| match which {
            EventImage::Original => StoreError::NotFound(format!("recognition event {event_id:?}")),
            EventImage::Face(index) => StoreError::NotFound(format!("face {index} of event {event_id:?}")),
        })
    }

    /// Delete an event with its faces and images. Unknown faces recorded
    /// from it keep their own copies.
    pub async fn delete_event(&self, event_id: &str) -> Result<(), StoreError> {
        let owned = event_id.to_string();
        let removed = self
            .conn
            .call(move |conn| {
                Ok(conn.execute("DELETE FROM recognition_events WHERE event_id = ?1", [owned])?)
            })
            .await?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("recognition event {event_id:?}")));
        }
        tracing::info!(event_id, "recognition event deleted");
        Ok(())
    }

    /// Enroll one face of a past event under `name`. The event itself is
    /// left unchanged.
    pub async fn add_event_face_to_known(
        &self,
        event_id: &str,
        face_index: usize,
        name: &str,
    ) -> Result<KnownIdentity, StoreError> {
        let (owned_event, owned_name) = (event_id.to_string(), name.to_string());
        let identity = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let row: Option<(String, Vec<u8>)> = tx
                    .query_row(
                        "SELECT f.encoding, COALESCE(f.face_image, e.source_image) FROM recognition_faces f
                         JOIN recognition_events e ON e.event_id = f.event_id
                         WHERE f.event_id = ?1 AND f.face_index = ?2",
                        params![owned_event, face_index as i64],
                        |row| Ok((row.get(0)?, row.get(1)?)),
                    )
                    .optional()?;
                let Some((encoding, image)) = row else {
                    return Ok(None);
                };
                let identity = attach_encoding(&tx, &owned_name, &encoding, &image)?;
                tx.commit()?;
                Ok(Some(identity))
            })
            .await?;

        let identity = identity
            .ok_or_else(|| StoreError::NotFound(format!("face {face_index} of event {event_id:?}")))?;
        tracing::info!(event_id, face_index, name = %identity.name, "history face added to known faces");
        Ok(identity)
    }
}

/// Run a face query and group the rows by event id, keeping row order.
fn load_faces<P: rusqlite::Params>(
    conn: &Connection,
    sql: &str,
    params: P,
) -> rusqlite::Result<HashMap<String, Vec<FaceResult>>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt
        .query_map(params, |row| {
            let bbox: String = row.get(5)?;
            Ok((
                row.get::<_, String>(0)?,
                FaceResult {
                    face_index: row.get::<_, i64>(1)? as usize,
                    known_person: row.get(2)?,
                    name_person: row.get(3)?,
                    distance: row.get::<_, Option<f64>>(4)?.map(|d| d as f32),
                    bbox: json_column(5, &bbox)?,
                },
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut grouped: HashMap<String, Vec<FaceResult>> = HashMap::new();
    for (event_id, face) in rows {
        grouped.entry(event_id).or_default().push(face);
    }
    Ok(grouped)
}
