mod api;
mod error;
mod state;
mod types;

use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::routing::{delete, get, post};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::limit::RequestBodyLimitLayer;

pub use self::state::AppState;

/// Build the HTTP API. Every route lives under `/api`.
pub fn create_app(state: Arc<AppState>, max_upload_bytes: usize) -> Router {
    let api = Router::new()
        .route("/health", get(api::health_handler))
        .route("/recognize", post(api::recognize_handler))
        .route("/recognize-all", post(api::recognize_all_handler))
        .route("/known-faces", get(api::list_known_handler).post(api::add_known_handler))
        .route("/known-faces/{name}", delete(api::delete_known_handler))
        .route("/known-faces/{name}/images", get(api::list_known_images_handler))
        .route(
            "/known-faces/{name}/image/{filename}",
            get(api::known_image_handler).delete(api::delete_known_image_handler),
        )
        .route("/unknown-faces", get(api::list_unknown_handler))
        .route("/unknown-faces/{id}", delete(api::delete_unknown_handler))
        .route("/unknown-faces/{id}/image", get(api::unknown_image_handler))
        .route("/unknown-faces/{id}/face", get(api::unknown_face_handler))
        .route("/unknown-faces/{id}/name", post(api::name_unknown_handler))
        .route("/recognition-history", get(api::list_history_handler))
        .route(
            "/recognition-history/{event_id}",
            get(api::get_event_handler).delete(api::delete_event_handler),
        )
        .route("/recognition-history/{event_id}/original", get(api::event_original_handler))
        .route("/recognition-history/{event_id}/face/{face_index}", get(api::event_face_handler))
        .route(
            "/recognition-history/{event_id}/face/{face_index}/add-to-known",
            post(api::event_face_to_known_handler),
        )
        .route(
            "/settings",
            get(api::get_settings_handler).post(api::update_settings_handler),
        );

    Router::new()
        .nest("/api", api)
        .layer(DefaultBodyLimit::disable())
        .layer(RequestBodyLimitLayer::new(max_upload_bytes))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
