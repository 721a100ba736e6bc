use super::{image_filename, Store, StoreError};
use chrono::{DateTime, Utc};
use facewatch_core::{Embedding, Gallery};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;

/// A named identity and how many reference images it has.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownIdentity {
    pub name: String,
    pub image_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct KnownImage {
    pub filename: String,
    pub created_at: DateTime<Utc>,
}

impl Store {
    /// Every stored encoding, grouped by identity in enrollment order.
    pub async fn gallery(&self) -> Result<Gallery, StoreError> {
        let rows: Vec<(String, String)> = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT i.name, e.encoding FROM encodings e
                     JOIN identities i ON i.id = e.identity_id
                     ORDER BY i.id, e.id",
                )?;
                let rows = stmt
                    .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(rows)
            })
            .await?;

        rows.into_iter()
            .map(|(name, encoding)| -> Result<_, StoreError> {
                Ok((name, serde_json::from_str::<Embedding>(&encoding)?))
            })
            .collect()
    }

    pub async fn list_known(&self) -> Result<Vec<KnownIdentity>, StoreError> {
        let known = self
            .conn
            .call(|conn| {
                let mut stmt = conn.prepare(
                    "SELECT i.name, COUNT(e.id) FROM identities i
                     LEFT JOIN encodings e ON e.identity_id = i.id
                     GROUP BY i.id ORDER BY i.id",
                )?;
                let known = stmt
                    .query_map([], |row| {
                        Ok(KnownIdentity {
                            name: row.get(0)?,
                            image_count: row.get::<_, i64>(1)? as usize,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(known)
            })
            .await?;
        Ok(known)
    }

    /// Attach a reference image and its encoding to `name`, creating the
    /// identity if it does not exist yet.
    pub async fn add_known_face(
        &self,
        name: &str,
        encoding: Embedding,
        image: Vec<u8>,
    ) -> Result<KnownIdentity, StoreError> {
        let name = name.to_string();
        let encoding = serde_json::to_string(&encoding)?;
        let identity = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let identity = attach_encoding(&tx, &name, &encoding, &image)?;
                tx.commit()?;
                Ok(identity)
            })
            .await?;
        tracing::info!(name = %identity.name, images = identity.image_count, "known face added");
        Ok(identity)
    }

    /// Remove an identity together with all of its images and encodings.
    pub async fn delete_identity(&self, name: &str) -> Result<(), StoreError> {
        let owned = name.to_string();
        let removed = self
            .conn
            .call(move |conn| Ok(conn.execute("DELETE FROM identities WHERE name = ?1", [owned])?))
            .await?;
        if removed == 0 {
            return Err(StoreError::NotFound(format!("person {name:?}")));
        }
        tracing::info!(name, "identity deleted");
        Ok(())
    }

    /// Reference images of one identity, newest first.
    pub async fn list_known_images(&self, name: &str) -> Result<Vec<KnownImage>, StoreError> {
        let owned = name.to_string();
        let images = self
            .conn
            .call(move |conn| {
                let Some(identity_id) = identity_id(conn, &owned)? else {
                    return Ok(None);
                };
                let mut stmt = conn.prepare(
                    "SELECT filename, created_at FROM encodings
                     WHERE identity_id = ?1 ORDER BY created_at DESC, id DESC",
                )?;
                let images = stmt
                    .query_map([identity_id], |row| {
                        Ok(KnownImage {
                            filename: row.get(0)?,
                            created_at: row.get(1)?,
                        })
                    })?
                    .collect::<Result<Vec<_>, _>>()?;
                Ok(Some(images))
            })
            .await?;
        images.ok_or_else(|| StoreError::NotFound(format!("person {name:?}")))
    }

    pub async fn known_image(&self, name: &str, filename: &str) -> Result<Vec<u8>, StoreError> {
        let (owned_name, owned_file) = (name.to_string(), filename.to_string());
        let image: Option<Vec<u8>> = self
            .conn
            .call(move |conn| {
                let image = conn
                    .query_row(
                        "SELECT e.image FROM encodings e
                         JOIN identities i ON i.id = e.identity_id
                         WHERE i.name = ?1 AND e.filename = ?2",
                        [owned_name, owned_file],
                        |row| row.get(0),
                    )
                    .optional()?;
                Ok(image)
            })
            .await?;
        image.ok_or_else(|| StoreError::NotFound(format!("image {filename:?} of {name:?}")))
    }

    /// Delete one reference image and its encoding. Removing the last
    /// image also removes the identity; returns whether that happened.
    pub async fn delete_known_image(&self, name: &str, filename: &str) -> Result<bool, StoreError> {
        let (owned_name, owned_file) = (name.to_string(), filename.to_string());
        let outcome = self
            .conn
            .call(move |conn| {
                let tx = conn.transaction()?;
                let Some(identity_id) = identity_id(&tx, &owned_name)? else {
                    return Ok(None);
                };
                let removed = tx.execute(
                    "DELETE FROM encodings WHERE identity_id = ?1 AND filename = ?2",
                    params![identity_id, owned_file],
                )?;
                if removed == 0 {
                    return Ok(None);
                }
                let identity_removed = count_images(&tx, identity_id)? == 0;
                if identity_removed {
                    tx.execute("DELETE FROM identities WHERE id = ?1", [identity_id])?;
                }
                tx.commit()?;
                Ok(Some(identity_removed))
            })
            .await?;

        let identity_removed =
            outcome.ok_or_else(|| StoreError::NotFound(format!("image {filename:?} of {name:?}")))?;
        tracing::info!(name, filename, identity_removed, "known image deleted");
        Ok(identity_removed)
    }
}

/// Insert an encoding for `name` inside an open transaction.
pub(super) fn attach_encoding(
    conn: &Connection,
    name: &str,
    encoding_json: &str,
    image: &[u8],
) -> rusqlite::Result<KnownIdentity> {
    let now = Utc::now();
    conn.execute(
        "INSERT INTO identities (name, created_at) VALUES (?1, ?2) ON CONFLICT(name) DO NOTHING",
        params![name, now],
    )?;
    let identity_id: i64 = conn.query_row("SELECT id FROM identities WHERE name = ?1", [name], |row| row.get(0))?;
    conn.execute(
        "INSERT INTO encodings (identity_id, filename, encoding, image, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![identity_id, image_filename(now, image), encoding_json, image, now],
    )?;
    Ok(KnownIdentity {
        name: name.to_string(),
        image_count: count_images(conn, identity_id)?,
    })
}

fn identity_id(conn: &Connection, name: &str) -> rusqlite::Result<Option<i64>> {
    conn.query_row("SELECT id FROM identities WHERE name = ?1", [name], |row| row.get(0))
        .optional()
}

fn count_images(conn: &Connection, identity_id: i64) -> rusqlite::Result<usize> {
    let count: i64 = conn.query_row(
        "SELECT COUNT(*) FROM encodings WHERE identity_id = ?1",
        [identity_id],
        |row| row.get(0),
    )?;
    Ok(count as usize)
}

#[cfg(test)]
mod tests {
    use super::super::testing::jpeg;
    use super::*;

    fn enc(values: &[f32]) -> Embedding {
        Embedding::new(values.to_vec())
    }

    #[tokio::test]
    async fn test_add_known_face_creates_then_appends() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.add_known_face("Alice", enc(&[0.0, 0.0]), jpeg(1)).await.unwrap();
        assert_eq!(first.image_count, 1);
        let second = store.add_known_face("Alice", enc(&[0.1, 0.0]), jpeg(2)).await.unwrap();
        assert_eq!(second.image_count, 2);
        store.add_known_face("Bob", enc(&[1.0, 1.0]), jpeg(3)).await.unwrap();

        let known = store.list_known().await.unwrap();
        assert_eq!(
            known,
            vec![
                KnownIdentity { name: "Alice".into(), image_count: 2 },
                KnownIdentity { name: "Bob".into(), image_count: 1 },
            ]
        );

        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery.len(), 2);
        assert_eq!(gallery.encoding_count(), 3);
        assert_eq!(gallery.entries()[0].name, "Alice");
    }

    #[tokio::test]
    async fn test_delete_identity_leaves_others() {
        let store = Store::open_in_memory().await.unwrap();
        store.add_known_face("Alice", enc(&[0.0]), jpeg(1)).await.unwrap();
        store.add_known_face("Bob", enc(&[1.0]), jpeg(2)).await.unwrap();

        store.delete_identity("Alice").await.unwrap();
        let err = store.delete_identity("Alice").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));

        let gallery = store.gallery().await.unwrap();
        assert_eq!(gallery.len(), 1);
        assert_eq!(gallery.entries()[0].name, "Bob");
        assert_eq!(gallery.encoding_count(), 1);
    }

    #[tokio::test]
    async fn test_known_images_fetch_and_delete() {
        let store = Store::open_in_memory().await.unwrap();
        store.add_known_face("Alice", enc(&[0.0]), jpeg(1)).await.unwrap();
        store.add_known_face("Alice", enc(&[0.5]), jpeg(2)).await.unwrap();

        let images = store.list_known_images("Alice").await.unwrap();
        assert_eq!(images.len(), 2);
        let bytes = store.known_image("Alice", &images[0].filename).await.unwrap();
        assert_eq!(image::guess_format(&bytes).unwrap(), image::ImageFormat::Jpeg);

        let removed = store.delete_known_image("Alice", &images[0].filename).await.unwrap();
        assert!(!removed);
        assert_eq!(store.gallery().await.unwrap().encoding_count(), 1);

        let err = store.delete_known_image("Alice", &images[0].filename).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_deleting_last_image_removes_identity() {
        let store = Store::open_in_memory().await.unwrap();
        store.add_known_face("Alice", enc(&[0.0]), jpeg(1)).await.unwrap();
        let filename = store.list_known_images("Alice").await.unwrap()[0].filename.clone();

        assert!(store.delete_known_image("Alice", &filename).await.unwrap());
        assert!(store.list_known().await.unwrap().is_empty());
        assert!(matches!(
            store.list_known_images("Alice").await.unwrap_err(),
            StoreError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_known_image_missing() {
        let store = Store::open_in_memory().await.unwrap();
        let err = store.known_image("Nobody", "x.jpg").await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }
}
