use crate::pipeline::{Pipeline, ResponseStyle};
use crate::settings::SettingsHandle;
use crate::store::Store;
use std::sync::Arc;

/// Shared state behind every handler.
pub struct AppState {
    pub pipeline: Pipeline,
    pub store: Store,
    pub settings: SettingsHandle,
    pub response_style: ResponseStyle,
}

impl AppState {
    pub fn new(pipeline: Pipeline, store: Store, settings: SettingsHandle, response_style: ResponseStyle) -> Arc<Self> {
        Arc::new(AppState {
            pipeline,
            store,
            settings,
            response_style,
        })
    }
}
