use crate::pipeline::ResponseStyle;
use crate::settings::Settings;
use crate::webhook::WebhookStyle;
use facewatch_core::Metric;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration, loaded from environment variables.
pub struct Config {
    /// Listen address for the HTTP API (default: 0.0.0.0:8000).
    pub bind_addr: String,
    /// Directory containing ONNX model files.
    pub model_dir: PathBuf,
    /// Path to the SQLite database file.
    pub db_path: PathBuf,
    /// Settings used when the database has none persisted yet.
    pub initial_settings: Settings,
    /// Distance metric used by the matcher.
    pub metric: Metric,
    /// Shape of the compatibility `/api/recognize` response.
    pub response_style: ResponseStyle,
    /// Query layout of webhook notifications.
    pub webhook_style: WebhookStyle,
    /// Per-request timeout for webhook delivery.
    pub webhook_timeout_secs: u64,
    /// Record a history event for uploads in which no face was found.
    pub record_empty_events: bool,
    /// Upper bound on a single detection call.
    pub detect_timeout_secs: u64,
    /// Maximum accepted request body, in bytes.
    pub max_upload_bytes: usize,
}

impl Config {
    /// Load configuration from `FACEWATCH_*` environment variables with defaults.
    pub fn from_env() -> Self {
        let model_dir = std::env::var("FACEWATCH_MODEL_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| facewatch_core::default_model_dir());

        let data_dir = std::env::var("XDG_DATA_HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
                PathBuf::from(home).join(".local/share")
            })
            .join("facewatch");

        let db_path = std::env::var("FACEWATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or_else(|_| data_dir.join("faces.db"));

        let initial_settings = Settings {
            webhook_url: std::env::var("FACEWATCH_WEBHOOK_URL").unwrap_or_default(),
            webhook_enabled: env_bool("FACEWATCH_WEBHOOK_ENABLED", false),
            tolerance: env_parse("FACEWATCH_TOLERANCE", Settings::DEFAULT_TOLERANCE),
        };

        Self {
            bind_addr: std::env::var("FACEWATCH_BIND").unwrap_or_else(|_| "0.0.0.0:8000".to_string()),
            model_dir,
            db_path,
            initial_settings,
            metric: env_parse("FACEWATCH_METRIC", Metric::default()),
            response_style: env_parse("FACEWATCH_RESPONSE_STYLE", ResponseStyle::default()),
            webhook_style: env_parse("FACEWATCH_WEBHOOK_STYLE", WebhookStyle::default()),
            webhook_timeout_secs: env_parse("FACEWATCH_WEBHOOK_TIMEOUT_SECS", 5),
            record_empty_events: env_bool("FACEWATCH_RECORD_EMPTY_EVENTS", false),
            detect_timeout_secs: env_parse("FACEWATCH_DETECT_TIMEOUT_SECS", 30),
            max_upload_bytes: env_parse::<usize>("FACEWATCH_MAX_UPLOAD_MB", 10) * 1024 * 1024,
        }
    }

    /// Path to the SCRFD detection model.
    pub fn scrfd_model_path(&self) -> String {
        self.model_dir
            .join(facewatch_core::SCRFD_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    /// Path to the ArcFace recognition model.
    pub fn arcface_model_path(&self) -> String {
        self.model_dir
            .join(facewatch_core::ARCFACE_MODEL_FILE)
            .to_string_lossy()
            .into_owned()
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_secs(self.webhook_timeout_secs)
    }

    pub fn detect_timeout(&self) -> Duration {
        Duration::from_secs(self.detect_timeout_secs)
    }
}

/// Parse `key`, falling back to `default` when unset or unparseable.
fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => raw.trim().parse().unwrap_or_else(|_| {
            tracing::warn!(key, value = %raw, "ignoring unparseable environment value");
            default
        }),
        Err(_) => default,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_parse_falls_back_on_garbage() {
        std::env::set_var("FACEWATCH_TEST_PARSE_GARBAGE", "not-a-number");
        assert_eq!(env_parse("FACEWATCH_TEST_PARSE_GARBAGE", 7u64), 7);
        std::env::set_var("FACEWATCH_TEST_PARSE_GOOD", " 12 ");
        assert_eq!(env_parse("FACEWATCH_TEST_PARSE_GOOD", 7u64), 12);
    }

    #[test]
    fn test_env_parse_enums() {
        std::env::set_var("FACEWATCH_TEST_METRIC", "cosine");
        assert_eq!(env_parse("FACEWATCH_TEST_METRIC", Metric::default()), Metric::Cosine);
        std::env::set_var("FACEWATCH_TEST_STYLE", "singular");
        assert_eq!(
            env_parse("FACEWATCH_TEST_STYLE", ResponseStyle::default()),
            ResponseStyle::Singular
        );
    }

    #[test]
    fn test_env_bool() {
        std::env::set_var("FACEWATCH_TEST_BOOL_ON", "True");
        std::env::set_var("FACEWATCH_TEST_BOOL_OFF", "0");
        assert!(env_bool("FACEWATCH_TEST_BOOL_ON", false));
        assert!(!env_bool("FACEWATCH_TEST_BOOL_OFF", true));
        assert!(env_bool("FACEWATCH_TEST_BOOL_UNSET", true));
    }
}
