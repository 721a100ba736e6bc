use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use reqwest::multipart::{Form, Part};
use reqwest::{Client, RequestBuilder, Url};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "facewatch", about = "facewatch face recognition CLI")]
struct Cli {
    /// Base URL of the facewatchd HTTP API
    #[arg(long, env = "FACEWATCH_SERVER", default_value = "http://127.0.0.1:8000")]
    server: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Recognize the faces in an image
    Recognize {
        image: PathBuf,
        /// Print one entry per detected face
        #[arg(long)]
        all: bool,
    },
    /// Manage the known-face library
    #[command(subcommand)]
    Known(KnownCommand),
    /// Review faces that matched nobody
    #[command(subcommand)]
    Unknown(UnknownCommand),
    /// Browse recognition history
    #[command(subcommand)]
    History(HistoryCommand),
    /// Show or change runtime settings
    #[command(subcommand)]
    Settings(SettingsCommand),
    /// Show daemon status
    Status,
}

#[derive(Subcommand)]
enum KnownCommand {
    /// List known people
    List,
    /// Enroll an image of a person
    Add { name: String, image: PathBuf },
    /// Remove a person and all of their images
    Remove { name: String },
    /// List a person's reference images
    Images { name: String },
    /// Remove one reference image
    RemoveImage { name: String, filename: String },
}

#[derive(Subcommand)]
enum UnknownCommand {
    List,
    /// Give an unknown face a name, adding it to the library
    Name { id: String, name: String },
    Remove { id: String },
    /// Download the face crop (or the full source image with --full)
    Save {
        id: String,
        output: PathBuf,
        #[arg(long)]
        full: bool,
    },
}

#[derive(Subcommand)]
enum HistoryCommand {
    List,
    Show { event_id: String },
    Remove { event_id: String },
    /// Add one face of a past event to the library
    Enroll {
        event_id: String,
        face_index: usize,
        name: String,
    },
}

#[derive(Subcommand)]
enum SettingsCommand {
    Show,
    Set {
        #[arg(long)]
        tolerance: Option<f32>,
        #[arg(long)]
        webhook_url: Option<String>,
        #[arg(long)]
        webhook_enabled: Option<bool>,
    },
}

/// Thin wrapper over the facewatchd API.
struct Api {
    client: Client,
    base: Url,
}

impl Api {
    fn new(server: &str) -> Result<Self> {
        let base = Url::parse(&format!("{}/api", server.trim_end_matches('/')))
            .with_context(|| format!("invalid server URL {server:?}"))?;
        if base.cannot_be_a_base() {
            bail!("invalid server URL {server:?}");
        }
        Ok(Self {
            client: Client::new(),
            base,
        })
    }

    /// Endpoint URL; each segment is percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Url {
        let mut url = self.base.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.extend(segments);
        }
        url
    }

    async fn json(&self, request: RequestBuilder) -> Result<Value> {
        let response = request.send().await.context("facewatchd unreachable")?;
        let status = response.status();
        let body: Value = response.json().await.unwrap_or(Value::Null);
        if !status.is_success() {
            match body.get("detail").and_then(Value::as_str) {
                Some(detail) => bail!("{status}: {detail}"),
                None => bail!("{status}"),
            }
        }
        Ok(body)
    }

    async fn get(&self, path: &[&str]) -> Result<Value> {
        self.json(self.client.get(self.url(path))).await
    }

    async fn delete(&self, path: &[&str]) -> Result<Value> {
        self.json(self.client.delete(self.url(path))).await
    }

    async fn post(&self, path: &[&str], body: Value) -> Result<Value> {
        self.json(self.client.post(self.url(path)).json(&body)).await
    }

    async fn upload(&self, path: &[&str], image: &Path, name: Option<&str>) -> Result<Value> {
        let bytes = tokio::fs::read(image)
            .await
            .with_context(|| format!("reading {}", image.display()))?;
        let file_name = image
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload".to_string());
        let mut form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));
        if let Some(name) = name {
            form = form.text("name", name.to_string());
        }
        self.json(self.client.post(self.url(path)).multipart(form)).await
    }

    async fn download(&self, path: &[&str], output: &Path) -> Result<usize> {
        let response = self.client.get(self.url(path)).send().await.context("facewatchd unreachable")?;
        let status = response.status();
        if !status.is_success() {
            bail!("{status}");
        }
        let bytes = response.bytes().await?;
        tokio::fs::write(output, &bytes)
            .await
            .with_context(|| format!("writing {}", output.display()))?;
        Ok(bytes.len())
    }
}

fn settings_update(tolerance: Option<f32>, webhook_url: Option<String>, webhook_enabled: Option<bool>) -> Value {
    let mut update = serde_json::Map::new();
    if let Some(tolerance) = tolerance {
        update.insert("tolerance".into(), json!(tolerance));
    }
    if let Some(url) = webhook_url {
        update.insert("webhook_url".into(), json!(url));
    }
    if let Some(enabled) = webhook_enabled {
        update.insert("webhook_enabled".into(), json!(enabled));
    }
    Value::Object(update)
}

fn print(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let api = Api::new(&cli.server)?;
    tracing::debug!(server = %cli.server, "using facewatchd");

    let value = match cli.command {
        Commands::Recognize { image, all } => {
            let endpoint = if all { "recognize-all" } else { "recognize" };
            api.upload(&[endpoint], &image, None).await?
        }
        Commands::Known(command) => match command {
            KnownCommand::List => api.get(&["known-faces"]).await?,
            KnownCommand::Add { name, image } => api.upload(&["known-faces"], &image, Some(&name)).await?,
            KnownCommand::Remove { name } => api.delete(&["known-faces", name.as_str()]).await?,
            KnownCommand::Images { name } => api.get(&["known-faces", name.as_str(), "images"]).await?,
            KnownCommand::RemoveImage { name, filename } => {
                api.delete(&["known-faces", name.as_str(), "image", filename.as_str()]).await?
            }
        },
        Commands::Unknown(command) => match command {
            UnknownCommand::List => api.get(&["unknown-faces"]).await?,
            UnknownCommand::Name { id, name } => {
                api.post(&["unknown-faces", id.as_str(), "name"], json!({ "name": name })).await?
            }
            UnknownCommand::Remove { id } => api.delete(&["unknown-faces", id.as_str()]).await?,
            UnknownCommand::Save { id, output, full } => {
                let kind = if full { "image" } else { "face" };
                let written = api.download(&["unknown-faces", id.as_str(), kind], &output).await?;
                json!({ "saved": output.display().to_string(), "bytes": written })
            }
        },
        Commands::History(command) => match command {
            HistoryCommand::List => api.get(&["recognition-history"]).await?,
            HistoryCommand::Show { event_id } => api.get(&["recognition-history", event_id.as_str()]).await?,
            HistoryCommand::Remove { event_id } => api.delete(&["recognition-history", event_id.as_str()]).await?,
            HistoryCommand::Enroll {
                event_id,
                face_index,
                name,
            } => {
                let index = face_index.to_string();
                api.post(
                    &["recognition-history", event_id.as_str(), "face", index.as_str(), "add-to-known"],
                    json!({ "name": name }),
                )
                .await?
            }
        },
        Commands::Settings(command) => match command {
            SettingsCommand::Show => api.get(&["settings"]).await?,
            SettingsCommand::Set {
                tolerance,
                webhook_url,
                webhook_enabled,
            } => {
                let update = settings_update(tolerance, webhook_url, webhook_enabled);
                if update.as_object().is_some_and(|o| o.is_empty()) {
                    bail!("nothing to change; pass --tolerance, --webhook-url or --webhook-enabled");
                }
                api.post(&["settings"], update).await?
            }
        },
        Commands::Status => api.get(&["health"]).await?,
    };

    print(&value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_history_enroll() {
        let cli = Cli::try_parse_from(["facewatch", "history", "enroll", "evt", "2", "Dana"]).unwrap();
        match cli.command {
            Commands::History(HistoryCommand::Enroll {
                event_id,
                face_index,
                name,
            }) => {
                assert_eq!(event_id, "evt");
                assert_eq!(face_index, 2);
                assert_eq!(name, "Dana");
            }
            _ => panic!("wrong command"),
        }
    }

    #[test]
    fn test_api_url_joins_base() {
        let api = Api::new("http://localhost:8000/").unwrap();
        assert_eq!(api.url(&["settings"]).as_str(), "http://localhost:8000/api/settings");
    }

    #[test]
    fn test_api_url_encodes_each_segment() {
        let api = Api::new("http://localhost:8000").unwrap();
        assert_eq!(
            api.url(&["known-faces", "Who?", "image", "a#1.png"]).as_str(),
            "http://localhost:8000/api/known-faces/Who%3F/image/a%231.png"
        );
        assert_eq!(
            api.url(&["known-faces", "100% / Bob"]).as_str(),
            "http://localhost:8000/api/known-faces/100%25%20%2F%20Bob"
        );
    }

    #[test]
    fn test_api_rejects_unusable_server() {
        assert!(Api::new("not a url").is_err());
    }

    #[test]
    fn test_settings_update_only_sets_given_fields() {
        assert_eq!(settings_update(Some(0.5), None, None), json!({"tolerance": 0.5}));
        assert_eq!(
            settings_update(None, Some("http://h".into()), Some(true)),
            json!({"webhook_url": "http://h", "webhook_enabled": true})
        );
    }
}
