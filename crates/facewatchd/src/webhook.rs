//! Best-effort HTTP notification when known people are recognized.

use crate::settings::Settings;
use reqwest::{Client, StatusCode};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;

#[derive(Error, Debug)]
pub enum NotifierError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook answered {0}")]
    Status(StatusCode),
}

/// Query-string layout of a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum WebhookStyle {
    /// `known_person=true&name_persons=a,b&total_faces=n&event_id=...`
    #[default]
    Query,
    /// `tag=a,b`
    Tag,
}

impl FromStr for WebhookStyle {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "query" => Ok(WebhookStyle::Query),
            "tag" => Ok(WebhookStyle::Tag),
            other => Err(format!("unknown webhook style {other:?} (expected query or tag)")),
        }
    }
}

impl fmt::Display for WebhookStyle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WebhookStyle::Query => "query",
            WebhookStyle::Tag => "tag",
        })
    }
}

/// What a notification reports about one recognition.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub names: Vec<String>,
    pub total_faces: usize,
    pub event_id: String,
}

#[derive(Clone)]
pub struct Notifier {
    client: Client,
    style: WebhookStyle,
}

impl Notifier {
    pub fn new(style: WebhookStyle, timeout: Duration) -> Result<Self, NotifierError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self { client, style })
    }

    pub fn query(&self, notification: &Notification) -> Vec<(&'static str, String)> {
        let names = notification.names.join(",");
        match self.style {
            WebhookStyle::Query => vec![
                ("known_person", "true".to_string()),
                ("name_persons", names),
                ("total_faces", notification.total_faces.to_string()),
                ("event_id", notification.event_id.clone()),
            ],
            WebhookStyle::Tag => vec![("tag", names)],
        }
    }

    /// Send `notification` in the background if `settings` has a webhook
    /// target. Never blocks the caller; failures are logged and dropped.
    pub fn notify(&self, settings: &Settings, notification: Notification) -> Option<JoinHandle<()>> {
        let url = settings.webhook_target()?.to_string();
        let query = self.query(&notification);
        let client = self.client.clone();

        Some(tokio::spawn(async move {
            match send(&client, &url, &query).await {
                Ok(status) => tracing::info!(
                    event_id = %notification.event_id,
                    names = ?notification.names,
                    status = status.as_u16(),
                    "webhook delivered"
                ),
                Err(e) => tracing::warn!(
                    event_id = %notification.event_id,
                    url = %url,
                    error = %e,
                    "webhook delivery failed"
                ),
            }
        }))
    }
}

async fn send(client: &Client, url: &str, query: &[(&str, String)]) -> Result<StatusCode, NotifierError> {
    let response = client.get(url).query(query).send().await?;
    let status = response.status();
    if !status.is_success() {
        return Err(NotifierError::Status(status));
    }
    Ok(status)
}
