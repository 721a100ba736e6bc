use crate::store::{KnownImage, UnknownFace};
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde::{Deserialize, Serialize};

/// Absolute API path built from `segments`, each percent-encoded so names
/// like `Who?` or `100%` survive the round trip.
pub fn api_path<'a>(segments: impl IntoIterator<Item = &'a str>) -> String {
    let segments: Vec<&str> = segments.into_iter().collect();
    Url::parse("http://facewatch.invalid/api")
        .ok()
        .and_then(|mut url| {
            url.path_segments_mut().ok()?.extend(&segments);
            Some(url.path().to_string())
        })
        .unwrap_or_else(|| format!("/api/{}", segments.join("/")))
}

/// Body of the naming endpoints.
#[derive(Debug, Deserialize)]
pub struct NameRequest {
    pub name: String,
}

/// `?name=` accepted by the enroll endpoint as an alternative to a form field.
#[derive(Debug, Default, Deserialize)]
pub struct NameQuery {
    pub name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct Message {
    pub message: String,
}

impl Message {
    pub fn new(message: impl Into<String>) -> Self {
        Self { message: message.into() }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub engine_running: bool,
    pub known_identities: usize,
    pub known_encodings: usize,
    pub metric: String,
}

#[derive(Debug, Serialize)]
pub struct KnownImageView {
    pub filename: String,
    pub created_at: DateTime<Utc>,
    pub url: String,
}

impl KnownImageView {
    pub fn new(name: &str, image: KnownImage) -> Self {
        Self {
            url: api_path(["known-faces", name, "image", &image.filename]),
            filename: image.filename,
            created_at: image.created_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct UnknownFaceView {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub image_url: String,
    pub face_url: String,
}

impl From<UnknownFace> for UnknownFaceView {
    fn from(face: UnknownFace) -> Self {
        Self {
            image_url: api_path(["unknown-faces", &face.id, "image"]),
            face_url: api_path(["unknown-faces", &face.id, "face"]),
            id: face.id,
            timestamp: face.timestamp,
        }
    }
}
