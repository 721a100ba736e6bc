use std::sync::Arc;

use axum::extract::{Multipart, Path, Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::Json;

use super::error::{JsonBody, Result};
use super::state::AppState;
use super::types::*;
use crate::error::ServiceError;
use crate::pipeline::{RecognitionOutcome, RecognizeResponse};
use crate::settings::{Settings, SettingsUpdate};
use crate::store::{EventImage, KnownIdentity, RecognitionEvent, UnknownImage};

/// Fields pulled out of a multipart upload.
#[derive(Default)]
struct Upload {
    image: Option<Vec<u8>>,
    name: Option<String>,
}

impl Upload {
    async fn read(mut multipart: Multipart) -> Result<Self> {
        let mut upload = Upload::default();
        while let Some(field) = multipart.next_field().await? {
            let field_name = field.name().map(str::to_owned);
            match field_name.as_deref() {
                Some("name") => upload.name = Some(field.text().await?),
                Some("file") | Some("image") => upload.image = Some(field.bytes().await?.to_vec()),
                _ if field.file_name().is_some() && upload.image.is_none() => {
                    upload.image = Some(field.bytes().await?.to_vec())
                }
                _ => {}
            }
        }
        Ok(upload)
    }

    fn require_image(&mut self) -> Result<Vec<u8>> {
        match self.image.take() {
            Some(image) if !image.is_empty() => Ok(image),
            _ => Err(ServiceError::Validation("no image file in upload".into())),
        }
    }
}

fn image_response(bytes: Vec<u8>) -> Response {
    let mime = image::guess_format(&bytes)
        .map(|format| format.to_mime_type())
        .unwrap_or("application/octet-stream");
    ([(header::CONTENT_TYPE, mime)], bytes).into_response()
}

pub async fn health_handler(State(state): State<Arc<AppState>>) -> Result<Json<HealthResponse>> {
    let gallery = state.store.gallery().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        engine_running: state.pipeline.engine().is_running(),
        known_identities: gallery.len(),
        known_encodings: gallery.encoding_count(),
        metric: state.pipeline.metric().to_string(),
    }))
}

/// Compact answer: whether anyone known was seen, and who.
pub async fn recognize_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<RecognizeResponse>> {
    let image = Upload::read(multipart).await?.require_image()?;
    let outcome = state.pipeline.recognize(image).await?;
    Ok(Json(outcome.respond(state.response_style)))
}

/// Detailed answer with one entry per detected face.
pub async fn recognize_all_handler(
    State(state): State<Arc<AppState>>,
    multipart: Multipart,
) -> Result<Json<RecognitionOutcome>> {
    let image = Upload::read(multipart).await?.require_image()?;
    Ok(Json(state.pipeline.recognize(image).await?))
}

pub async fn list_known_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<KnownIdentity>>> {
    Ok(Json(state.store.list_known().await?))
}

pub async fn add_known_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<NameQuery>,
    multipart: Multipart,
) -> Result<Json<KnownIdentity>> {
    let mut upload = Upload::read(multipart).await?;
    let image = upload.require_image()?;
    let name = upload
        .name
        .or(query.name)
        .ok_or_else(|| ServiceError::Validation("missing name".into()))?;
    Ok(Json(state.pipeline.enroll(&name, image).await?))
}

pub async fn delete_known_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Message>> {
    state.store.delete_identity(&name).await?;
    Ok(Json(Message::new(format!("deleted {name}"))))
}

pub async fn list_known_images_handler(
    State(state): State<Arc<AppState>>,
    Path(name): Path<String>,
) -> Result<Json<Vec<KnownImageView>>> {
    let images = state.store.list_known_images(&name).await?;
    Ok(Json(images.into_iter().map(|image| KnownImageView::new(&name, image)).collect()))
}

pub async fn known_image_handler(
    State(state): State<Arc<AppState>>,
    Path((name, filename)): Path<(String, String)>,
) -> Result<Response> {
    Ok(image_response(state.store.known_image(&name, &filename).await?))
}

pub async fn delete_known_image_handler(
    State(state): State<Arc<AppState>>,
    Path((name, filename)): Path<(String, String)>,
) -> Result<Json<Message>> {
    let identity_removed = state.store.delete_known_image(&name, &filename).await?;
    let message = if identity_removed {
        format!("deleted {filename}; {name} has no images left and was removed")
    } else {
        format!("deleted {filename}")
    };
    Ok(Json(Message::new(message)))
}

pub async fn list_unknown_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<UnknownFaceView>>> {
    let faces = state.store.list_unknown().await?;
    Ok(Json(faces.into_iter().map(UnknownFaceView::from).collect()))
}

pub async fn unknown_image_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response> {
    Ok(image_response(state.store.unknown_image(&id, UnknownImage::Source).await?))
}

pub async fn unknown_face_handler(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Result<Response> {
    Ok(image_response(state.store.unknown_image(&id, UnknownImage::Face).await?))
}

pub async fn name_unknown_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    JsonBody(body): JsonBody<NameRequest>,
) -> Result<Json<KnownIdentity>> {
    Ok(Json(state.pipeline.promote(&id, &body.name).await?))
}

pub async fn delete_unknown_handler(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<Json<Message>> {
    state.store.delete_unknown(&id).await?;
    Ok(Json(Message::new(format!("deleted {id}"))))
}

pub async fn list_history_handler(State(state): State<Arc<AppState>>) -> Result<Json<Vec<RecognitionEvent>>> {
    Ok(Json(state.store.list_events().await?))
}

pub async fn get_event_handler(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<Json<RecognitionEvent>> {
    Ok(Json(state.store.get_event(&event_id).await?))
}

pub async fn delete_event_handler(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<Json<Message>> {
    state.store.delete_event(&event_id).await?;
    Ok(Json(Message::new(format!("deleted {event_id}"))))
}

pub async fn event_original_handler(
    State(state): State<Arc<AppState>>,
    Path(event_id): Path<String>,
) -> Result<Response> {
    Ok(image_response(state.store.event_image(&event_id, EventImage::Original).await?))
}

pub async fn event_face_handler(
    State(state): State<Arc<AppState>>,
    Path((event_id, face_index)): Path<(String, usize)>,
) -> Result<Response> {
    Ok(image_response(
        state.store.event_image(&event_id, EventImage::Face(face_index)).await?,
    ))
}

pub async fn event_face_to_known_handler(
    State(state): State<Arc<AppState>>,
    Path((event_id, face_index)): Path<(String, usize)>,
    JsonBody(body): JsonBody<NameRequest>,
) -> Result<Json<KnownIdentity>> {
    Ok(Json(
        state
            .pipeline
            .add_event_face_to_known(&event_id, face_index, &body.name)
            .await?,
    ))
}

pub async fn get_settings_handler(State(state): State<Arc<AppState>>) -> Json<Settings> {
    Json(state.settings.current().await)
}

pub async fn update_settings_handler(
    State(state): State<Arc<AppState>>,
    JsonBody(update): JsonBody<SettingsUpdate>,
) -> Result<Json<Settings>> {
    Ok(Json(state.settings.update(update).await?))
}
