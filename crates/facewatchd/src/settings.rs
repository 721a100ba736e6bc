//! Runtime-mutable settings: match tolerance and webhook target.

use crate::error::ServiceError;
use crate::store::Store;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Settings {
    pub webhook_url: String,
    pub webhook_enabled: bool,
    pub tolerance: f32,
}

impl Settings {
    pub const DEFAULT_TOLERANCE: f32 = 0.75;

    /// The URL to notify, if notifications are switched on and a URL is set.
    pub fn webhook_target(&self) -> Option<&str> {
        let url = self.webhook_url.trim();
        (self.webhook_enabled && !url.is_empty()).then_some(url)
    }

    pub fn validate(&self) -> Result<(), ServiceError> {
        if !self.tolerance.is_finite() || !(0.0..=1.0).contains(&self.tolerance) {
            return Err(ServiceError::Validation(format!(
                "tolerance must be between 0 and 1, got {}",
                self.tolerance
            )));
        }
        let url = self.webhook_url.trim();
        if !url.is_empty() {
            let parsed = Url::parse(url)
                .map_err(|e| ServiceError::Validation(format!("invalid webhook URL {url:?}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(ServiceError::Validation(format!(
                    "webhook URL must use http or https, got {:?}",
                    parsed.scheme()
                )));
            }
        }
        Ok(())
    }

    /// Overlay the fields present in `update` and validate the result.
    pub fn apply(&self, update: SettingsUpdate) -> Result<Settings, ServiceError> {
        let next = Settings {
            webhook_url: update
                .webhook_url
                .map(|url| url.trim().to_string())
                .unwrap_or_else(|| self.webhook_url.clone()),
            webhook_enabled: update.webhook_enabled.unwrap_or(self.webhook_enabled),
            tolerance: update.tolerance.unwrap_or(self.tolerance),
        };
        next.validate()?;
        Ok(next)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            webhook_url: String::new(),
            webhook_enabled: false,
            tolerance: Self::DEFAULT_TOLERANCE,
        }
    }
}

/// Partial settings body; absent fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SettingsUpdate {
    pub webhook_url: Option<String>,
    pub webhook_enabled: Option<bool>,
    pub tolerance: Option<f32>,
}

/// Shared, persisted settings.
///
/// Readers take a snapshot; an update is persisted before it becomes
/// visible, so a failed write leaves the previous settings in force.
#[derive(Clone)]
pub struct SettingsHandle {
    current: Arc<RwLock<Settings>>,
    store: Store,
}

impl SettingsHandle {
    /// Load persisted settings, seeding the store with `initial` on first run.
    pub async fn load(store: Store, initial: Settings) -> Result<Self, ServiceError> {
        let settings = match store.load_settings().await? {
            Some(saved) => saved,
            None => {
                if let Err(e) = initial.validate() {
                    tracing::warn!(error = %e, "invalid initial settings; using defaults");
                    Settings::default()
                } else {
                    initial
                }
            }
        };
        store.save_settings(&settings).await?;
        tracing::info!(
            tolerance = settings.tolerance,
            webhook_enabled = settings.webhook_enabled,
            webhook_configured = !settings.webhook_url.is_empty(),
            "settings loaded"
        );
        Ok(Self {
            current: Arc::new(RwLock::new(settings)),
            store,
        })
    }

    pub async fn current(&self) -> Settings {
        self.current.read().await.clone()
    }

    pub async fn update(&self, update: SettingsUpdate) -> Result<Settings, ServiceError> {
        let mut guard = self.current.write().await;
        let next = guard.apply(update)?;
        self.store.save_settings(&next).await?;
        *guard = next.clone();
        tracing::info!(
            tolerance = next.tolerance,
            webhook_enabled = next.webhook_enabled,
            webhook_configured = !next.webhook_url.is_empty(),
            "settings updated"
        );
        Ok(next)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_webhook_target_requires_enabled_and_url() {
        let mut settings = Settings::default();
        assert_eq!(settings.webhook_target(), None);
        settings.webhook_url = "http://hooks.local/face".into();
        assert_eq!(settings.webhook_target(), None);
        settings.webhook_enabled = true;
        assert_eq!(settings.webhook_target(), Some("http://hooks.local/face"));
        settings.webhook_url = "   ".into();
        assert_eq!(settings.webhook_target(), None);
    }

    #[test]
    fn test_apply_partial_update() {
        let settings = Settings::default();
        let next = settings
            .apply(SettingsUpdate {
                tolerance: Some(0.6),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(next.tolerance, 0.6);
        assert_eq!(next.webhook_url, "");
        assert!(!next.webhook_enabled);
    }

    #[test]
    fn test_apply_rejects_out_of_range_tolerance() {
        let settings = Settings::default();
        for bad in [-0.1, 1.5, f32::NAN] {
            let err = settings
                .apply(SettingsUpdate {
                    tolerance: Some(bad),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)));
        }
    }

    #[test]
    fn test_apply_rejects_bad_urls() {
        let settings = Settings::default();
        for bad in ["not a url", "ftp://example.com/hook"] {
            let err = settings
                .apply(SettingsUpdate {
                    webhook_url: Some(bad.into()),
                    ..Default::default()
                })
                .unwrap_err();
            assert!(matches!(err, ServiceError::Validation(_)));
        }
    }

    #[tokio::test]
    async fn test_update_persists_and_reloads() {
        let store = Store::open_in_memory().await.unwrap();
        let handle = SettingsHandle::load(store.clone(), Settings::default()).await.unwrap();
        handle
            .update(SettingsUpdate {
                webhook_url: Some("https://example.com/hook".into()),
                webhook_enabled: Some(true),
                tolerance: Some(0.5),
            })
            .await
            .unwrap();

        // Persisted settings win over the initial values on reload.
        let reloaded = SettingsHandle::load(store, Settings::default()).await.unwrap();
        let current = reloaded.current().await;
        assert_eq!(current.tolerance, 0.5);
        assert_eq!(current.webhook_target(), Some("https://example.com/hook"));
    }

    #[tokio::test]
    async fn test_failed_update_keeps_previous() {
        let store = Store::open_in_memory().await.unwrap();
        let handle = SettingsHandle::load(store, Settings::default()).await.unwrap();
        assert!(handle
            .update(SettingsUpdate {
                tolerance: Some(3.0),
                ..Default::default()
            })
            .await
            .is_err());
        assert_eq!(handle.current().await, Settings::default());
    }
}
