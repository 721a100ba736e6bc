//! Recognition orchestration: detect, match, record, notify.

use crate::engine::EngineHandle;
use crate::error::ServiceError;
use crate::settings::SettingsHandle;
use crate::store::{FaceResult, KnownIdentity, NewRecognitionEvent, NewUnknownFace, RecordedFace, Store};
use crate::webhook::{Notification, Notifier};
use chrono::{DateTime, Utc};
use facewatch_core::{DistanceMatcher, Matcher, Metric};
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use uuid::Uuid;

/// Shape of the compact `/api/recognize` answer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResponseStyle {
    /// `{known_person, name_persons: [..]}`
    #[default]
    Plural,
    /// `{known_person, name_person: ".."}` with the first recognized name.
    Singular,
}

impl FromStr for ResponseStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "plural" => Ok(ResponseStyle::Plural),
            "singular" => Ok(ResponseStyle::Singular),
            other => Err(format!("unknown response style {other:?} (expected plural or singular)")),
        }
    }
}

impl fmt::Display for ResponseStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ResponseStyle::Plural => "plural",
            ResponseStyle::Singular => "singular",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum RecognizeResponse {
    Plural { known_person: bool, name_persons: Vec<String> },
    Singular { known_person: bool, name_person: String },
}

/// Result of one recognition request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionOutcome {
    pub faces: Vec<FaceResult>,
    pub total_faces: usize,
    /// `None` when nothing was recorded (no faces found).
    pub event_id: Option<String>,
}

impl RecognitionOutcome {
    pub fn known_person(&self) -> bool {
        self.faces.iter().any(|f| f.known_person)
    }

    /// Distinct recognized names in order of first appearance.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for name in self.faces.iter().filter_map(|f| f.name_person.as_ref()) {
            if !names.contains(name) {
                names.push(name.clone());
            }
        }
        names
    }

    pub fn respond(&self, style: ResponseStyle) -> RecognizeResponse {
        let known_person = self.known_person();
        let names = self.names();
        match style {
            ResponseStyle::Plural => RecognizeResponse::Plural {
                known_person,
                name_persons: names,
            },
            ResponseStyle::Singular => RecognizeResponse::Singular {
                known_person,
                name_person: names.into_iter().next().unwrap_or_default(),
            },
        }
    }
}

pub struct Pipeline {
    store: Store,
    engine: EngineHandle,
    settings: SettingsHandle,
    matcher: DistanceMatcher,
    notifier: Notifier,
    record_empty_events: bool,
}

impl Pipeline {
    pub fn new(
        store: Store,
        engine: EngineHandle,
        settings: SettingsHandle,
        matcher: DistanceMatcher,
        notifier: Notifier,
        record_empty_events: bool,
    ) -> Self {
        Self {
            store,
            engine,
            settings,
            matcher,
            notifier,
            record_empty_events,
        }
    }

    pub fn engine(&self) -> &EngineHandle {
        &self.engine
    }

    pub fn metric(&self) -> Metric {
        self.matcher.metric()
    }

    /// Recognize every face in `image`.
    ///
    /// Settings and the gallery are snapshotted once, so concurrent edits
    /// never produce a mixed result. Unmatched faces become unknown faces and
    /// the whole request is written as one history event. The webhook is
    /// fired in the background after the event is stored.
    pub async fn recognize(&self, image: Vec<u8>) -> Result<RecognitionOutcome, ServiceError> {
        let settings = self.settings.current().await;
        let gallery = self.store.gallery().await?;
        let image: Arc<[u8]> = image.into();

        let detected = self.engine.detect(image.clone()).await?;
        let timestamp = Utc::now();

        if detected.is_empty() && !self.record_empty_events {
            tracing::info!("recognize: no faces detected, nothing recorded");
            return Ok(RecognitionOutcome {
                faces: Vec::new(),
                total_faces: 0,
                event_id: None,
            });
        }

        let mut recorded = Vec::with_capacity(detected.len());
        let mut unknowns = Vec::new();
        for (face_index, face) in detected.into_iter().enumerate() {
            let result = self.matcher.compare(&face.encoding, &gallery, settings.tolerance)?;
            tracing::debug!(
                face_index,
                identity = result.identity().unwrap_or("-"),
                distance = ?result.distance(),
                "recognize: face matched"
            );
            if !result.is_match() {
                unknowns.push(NewUnknownFace {
                    id: new_unknown_id(),
                    timestamp,
                    source_image: image.to_vec(),
                    face_image: face.crop.clone(),
                    encoding: face.encoding.clone(),
                });
            }
            recorded.push(RecordedFace {
                result: FaceResult {
                    face_index,
                    known_person: result.is_match(),
                    name_person: result.identity().map(str::to_string),
                    distance: result.distance(),
                    bbox: face.bbox,
                },
                encoding: face.encoding,
                face_image: face.crop,
            });
        }

        let event_id = new_event_id(timestamp);
        let faces: Vec<FaceResult> = recorded.iter().map(|f| f.result.clone()).collect();
        let unknown_count = unknowns.len();
        self.store
            .record_recognition(
                NewRecognitionEvent {
                    event_id: event_id.clone(),
                    timestamp,
                    source_image: image.to_vec(),
                    faces: recorded,
                },
                unknowns,
            )
            .await?;

        let outcome = RecognitionOutcome {
            total_faces: faces.len(),
            faces,
            event_id: Some(event_id.clone()),
        };
        let names = outcome.names();
        tracing::info!(
            event_id = %event_id,
            faces = outcome.total_faces,
            unknown = unknown_count,
            names = ?names,
            "recognize: event recorded"
        );

        if !names.is_empty() {
            self.notifier.notify(
                &settings,
                Notification {
                    names,
                    total_faces: outcome.total_faces,
                    event_id,
                },
            );
        }
        Ok(outcome)
    }

    /// Enroll `image` under `name` using its most confident face.
    pub async fn enroll(&self, name: &str, image: Vec<u8>) -> Result<KnownIdentity, ServiceError> {
        let name = normalize_name(name)?;
        let detected = self.engine.detect(image.clone().into()).await?;
        let total = detected.len();
        let Some(face) = detected.into_iter().next() else {
            return Err(ServiceError::Validation("no face found in image".into()));
        };
        if total > 1 {
            tracing::warn!(name = %name, faces = total, "enroll: several faces in image, using the most confident");
        }
        Ok(self.store.add_known_face(&name, face.encoding, image).await?)
    }

    pub async fn promote(&self, unknown_id: &str, name: &str) -> Result<KnownIdentity, ServiceError> {
        let name = normalize_name(name)?;
        Ok(self.store.promote(unknown_id, &name).await?)
    }

    pub async fn add_event_face_to_known(
        &self,
        event_id: &str,
        face_index: usize,
        name: &str,
    ) -> Result<KnownIdentity, ServiceError> {
        let name = normalize_name(name)?;
        Ok(self.store.add_event_face_to_known(event_id, face_index, &name).await?)
    }
}

/// Trimmed, non-empty identity name without path separators.
pub fn normalize_name(name: &str) -> Result<String, ServiceError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(ServiceError::Validation("name must not be empty".into()));
    }
    if name.contains(['/', '\\']) || name.chars().any(char::is_control) {
        return Err(ServiceError::Validation(format!("invalid name {name:?}")));
    }
    Ok(name.to_string())
}

fn new_event_id(timestamp: DateTime<Utc>) -> String {
    let suffix = Uuid::new_v4().simple().to_string();
    format!("recognition_{}_{}", timestamp.format("%Y%m%d_%H%M%S_%6f"), &suffix[..8])
}

fn new_unknown_id() -> String {
    format!("unknown_{}", Uuid::new_v4().simple())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::engine::spawn_engine;
    use crate::engine::testing::ScriptedEncoder;
    use crate::settings::{Settings, SettingsUpdate};
    use crate::webhook::WebhookStyle;
    use facewatch_core::EncodedFace;
    use std::time::Duration;

    pub async fn pipeline(script: Vec<Vec<EncodedFace>>, record_empty_events: bool) -> (Pipeline, Store, SettingsHandle) {
        let store = Store::open_in_memory().await.unwrap();
        let settings = SettingsHandle::load(store.clone(), Settings::default()).await.unwrap();
        let engine = spawn_engine(Box::new(ScriptedEncoder::new(script)), Duration::from_secs(5)).unwrap();
        let notifier = Notifier::new(WebhookStyle::Query, Duration::from_secs(5)).unwrap();
        let pipeline = Pipeline::new(
            store.clone(),
            engine,
            settings.clone(),
            DistanceMatcher::new(Metric::Euclidean),
            notifier,
            record_empty_events,
        );
        (pipeline, store, settings)
    }

    pub async fn enable_webhook(settings: &SettingsHandle, url: &str) {
        settings
            .update(SettingsUpdate {
                webhook_url: Some(url.to_string()),
                webhook_enabled: Some(true),
                tolerance: None,
            })
            .await
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::testing::{enable_webhook, pipeline};
    use super::*;
    use crate::engine::testing::{face, png};
    use crate::store::{EventImage, UnknownImage};
    use crate::webhook::testing::capture_server;
    use facewatch_core::Embedding;
    use std::time::{Duration, Instant};

    async fn enroll_alice(store: &Store) {
        store
            .add_known_face("Alice", Embedding::new(vec![0.0, 0.0]), png(4, 4))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_recognize_known_face() {
        let (pipeline, store, _) = pipeline(vec![vec![face(0.0, vec![0.4, 0.0])]], false).await;
        enroll_alice(&store).await;

        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert!(outcome.known_person());
        assert_eq!(outcome.names(), vec!["Alice".to_string()]);
        assert!((outcome.faces[0].distance.unwrap() - 0.4).abs() < 1e-6);
        assert_eq!(
            outcome.respond(ResponseStyle::Singular),
            RecognizeResponse::Singular {
                known_person: true,
                name_person: "Alice".into()
            }
        );
        assert!(store.list_unknown().await.unwrap().is_empty());

        let event_id = outcome.event_id.unwrap();
        assert!(event_id.starts_with("recognition_"));
        let event = store.get_event(&event_id).await.unwrap();
        assert_eq!(event.faces[0].name_person.as_deref(), Some("Alice"));
    }

    #[tokio::test]
    async fn test_recognize_unknown_face_records_it() {
        let (pipeline, store, _) = pipeline(vec![vec![face(0.0, vec![0.9, 0.0])]], false).await;
        enroll_alice(&store).await;

        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert!(!outcome.known_person());
        assert_eq!(
            outcome.respond(ResponseStyle::Plural),
            RecognizeResponse::Plural {
                known_person: false,
                name_persons: vec![]
            }
        );

        let unknown = store.list_unknown().await.unwrap();
        assert_eq!(unknown.len(), 1);
        assert!(unknown[0].id.starts_with("unknown_"));
        assert!(unknown[0].has_face_image);
        let history = store.list_events().await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].faces[0].name_person, None);
    }

    #[tokio::test]
    async fn test_recognize_mixed_faces() {
        let script = vec![vec![
            face(0.0, vec![0.1, 0.0]),
            face(10.0, vec![5.0, 5.0]),
            face(20.0, vec![0.2, 0.0]),
        ]];
        let (pipeline, store, _) = pipeline(script, false).await;
        enroll_alice(&store).await;

        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert_eq!(outcome.total_faces, 3);
        assert_eq!(
            outcome.faces.iter().map(|f| f.face_index).collect::<Vec<_>>(),
            vec![0, 1, 2]
        );
        // Repeated names are reported once.
        assert_eq!(outcome.names(), vec!["Alice".to_string()]);
        assert_eq!(store.list_unknown().await.unwrap().len(), 1);

        let event_id = outcome.event_id.unwrap();
        let crop = store.event_image(&event_id, EventImage::Face(1)).await.unwrap();
        assert_eq!(image::guess_format(&crop).unwrap(), image::ImageFormat::Jpeg);
    }

    #[tokio::test]
    async fn test_recognize_with_empty_gallery() {
        let (pipeline, store, _) = pipeline(vec![vec![face(0.0, vec![0.0, 0.0])]], false).await;
        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert!(!outcome.known_person());
        assert_eq!(outcome.faces[0].distance, None);
        assert_eq!(store.list_unknown().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_recognize_without_faces() {
        let (pipeline, store, _) = pipeline(vec![vec![]], false).await;
        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert_eq!(outcome.total_faces, 0);
        assert_eq!(outcome.event_id, None);
        assert!(!outcome.known_person());
        assert!(store.list_events().await.unwrap().is_empty());
        assert!(store.list_unknown().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recognize_without_faces_recorded_when_configured() {
        let (pipeline, store, _) = pipeline(vec![vec![]], true).await;
        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        let event = store.get_event(&outcome.event_id.unwrap()).await.unwrap();
        assert_eq!(event.total_faces, 0);
    }

    #[tokio::test]
    async fn test_recognize_rejects_non_image() {
        let (pipeline, store, _) = pipeline(vec![], false).await;
        let err = pipeline.recognize(b"hello".to_vec()).await.unwrap_err();
        assert!(matches!(err, ServiceError::DetectionFailed(_)));
        assert!(store.list_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recognize_malformed_gallery_encoding() {
        let (pipeline, store, _) = pipeline(vec![vec![face(0.0, vec![0.0, 0.0])]], false).await;
        store
            .add_known_face("Odd", Embedding::new(vec![0.0, 0.0, 0.0]), png(4, 4))
            .await
            .unwrap();
        let err = pipeline.recognize(png(40, 30)).await.unwrap_err();
        assert!(matches!(err, ServiceError::MalformedEncoding(_)));
        assert!(store.list_events().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_promote_then_recognize() {
        let script = vec![vec![face(0.0, vec![3.0, 4.0])], vec![face(0.0, vec![3.1, 4.0])]];
        let (pipeline, store, _) = pipeline(script, false).await;

        pipeline.recognize(png(40, 30)).await.unwrap();
        let unknown_id = store.list_unknown().await.unwrap()[0].id.clone();
        let crop = store.unknown_image(&unknown_id, UnknownImage::Face).await.unwrap();

        let identity = pipeline.promote(&unknown_id, "  Bob ").await.unwrap();
        assert_eq!(identity.name, "Bob");
        assert_eq!(identity.image_count, 1);
        assert!(store.list_unknown().await.unwrap().is_empty());
        let filename = store.list_known_images("Bob").await.unwrap()[0].filename.clone();
        assert_eq!(store.known_image("Bob", &filename).await.unwrap(), crop);

        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert_eq!(outcome.names(), vec!["Bob".to_string()]);
    }

    #[tokio::test]
    async fn test_promote_validates_name() {
        let (pipeline, _, _) = pipeline(vec![], false).await;
        assert!(matches!(
            pipeline.promote("u1", "   ").await.unwrap_err(),
            ServiceError::Validation(_)
        ));
        assert!(matches!(
            pipeline.promote("u1", "Carol").await.unwrap_err(),
            ServiceError::NotFound(_)
        ));
    }

    #[tokio::test]
    async fn test_enroll_uses_first_face() {
        let script = vec![
            vec![face(0.0, vec![1.0, 1.0]), face(10.0, vec![9.0, 9.0])],
            vec![],
        ];
        let (pipeline, store, _) = pipeline(script, false).await;
        let identity = pipeline.enroll("Eve", png(40, 30)).await.unwrap();
        assert_eq!(identity.image_count, 1);
        assert_eq!(store.gallery().await.unwrap().entries()[0].encodings[0].values, vec![1.0, 1.0]);

        let err = pipeline.enroll("Eve", png(40, 30)).await.unwrap_err();
        assert!(matches!(err, ServiceError::Validation(_)));
    }

    #[tokio::test]
    async fn test_tolerance_change_applies_to_next_request() {
        let script = vec![vec![face(0.0, vec![0.4, 0.0])], vec![face(0.0, vec![0.4, 0.0])]];
        let (pipeline, store, settings) = pipeline(script, false).await;
        enroll_alice(&store).await;

        assert!(pipeline.recognize(png(40, 30)).await.unwrap().known_person());
        settings
            .update(crate::settings::SettingsUpdate {
                tolerance: Some(0.3),
                ..Default::default()
            })
            .await
            .unwrap();
        assert!(!pipeline.recognize(png(40, 30)).await.unwrap().known_person());
    }

    #[tokio::test]
    async fn test_webhook_fired_for_known_faces() {
        let (url, mut rx) = capture_server(Duration::ZERO).await;
        let script = vec![vec![face(0.0, vec![0.1, 0.0]), face(10.0, vec![7.0, 7.0])]];
        let (pipeline, store, settings) = pipeline(script, false).await;
        enroll_alice(&store).await;
        enable_webhook(&settings, &url).await;

        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        let query = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            query,
            format!(
                "known_person=true&name_persons=Alice&total_faces=2&event_id={}",
                outcome.event_id.unwrap()
            )
        );
    }

    #[tokio::test]
    async fn test_webhook_not_fired_without_known_faces() {
        let (url, mut rx) = capture_server(Duration::ZERO).await;
        let (pipeline, _, settings) = pipeline(vec![vec![face(0.0, vec![7.0, 7.0])]], false).await;
        enable_webhook(&settings, &url).await;

        pipeline.recognize(png(40, 30)).await.unwrap();
        assert!(tokio::time::timeout(Duration::from_millis(300), rx.recv()).await.is_err());
    }

    #[tokio::test]
    async fn test_slow_webhook_does_not_delay_response() {
        let (url, _rx) = capture_server(Duration::from_secs(10)).await;
        let (pipeline, store, settings) = pipeline(vec![vec![face(0.0, vec![0.1, 0.0])]], false).await;
        enroll_alice(&store).await;
        enable_webhook(&settings, &url).await;

        let started = Instant::now();
        let outcome = pipeline.recognize(png(40, 30)).await.unwrap();
        assert!(outcome.known_person());
        assert!(started.elapsed() < Duration::from_secs(2));
    }

    #[test]
    fn test_normalize_name() {
        assert_eq!(normalize_name("  Alice ").unwrap(), "Alice");
        assert!(normalize_name("").is_err());
        assert!(normalize_name("a/b").is_err());
    }

    #[test]
    fn test_response_style_from_str() {
        assert_eq!("Singular".parse::<ResponseStyle>().unwrap(), ResponseStyle::Singular);
        assert!("both".parse::<ResponseStyle>().is_err());
    }

    #[test]
    fn test_plural_response_json() {
        let response = RecognizeResponse::Plural {
            known_person: true,
            name_persons: vec!["Alice".into()],
        };
        assert_eq!(
            serde_json::to_value(&response).unwrap(),
            serde_json::json!({"known_person": true, "name_persons": ["Alice"]})
        );
    }
}
