use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use client_core::{ClientEvent, LiveClient, ModelClient};
use serde_json::Value;
use shared::domain::{Path, PathSegment};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Quiet period after an update before the model is printed again.
const SETTLE: Duration = Duration::from_millis(100);

#[derive(Parser, Debug)]
struct Cli {
    #[arg(long, default_value = "http://127.0.0.1:8443")]
    server_url: String,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a resolved model, and again whenever it changes.
    Watch {
        #[arg(default_value = "")]
        key: String,
        /// Exit after the first print.
        #[arg(long)]
        once: bool,
    },
    /// Fire the event at a path such as `/children/2/props/onPress`.
    Fire {
        path: String,
        /// JSON payload passed to the handler.
        #[arg(long)]
        payload: Option<String>,
        /// Zero waits forever.
        #[arg(long, default_value_t = 5000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();
    let cli = Cli::parse();

    let client = LiveClient::connect(&cli.server_url)
        .await
        .with_context(|| format!("failed to connect to {}", cli.server_url))?;

    match cli.command {
        Command::Watch { key, once } => watch(&client, key, once).await,
        Command::Fire {
            path,
            payload,
            timeout_ms,
        } => {
            let payload = match payload {
                Some(raw) => serde_json::from_str(&raw).context("payload is not valid JSON")?,
                None => Value::Null,
            };
            let timeout = (timeout_ms > 0).then(|| Duration::from_millis(timeout_ms));
            let response = client
                .send_event(parse_path(&path), payload, timeout)
                .await?;
            println!("{}", serde_json::to_string_pretty(&response)?);
            if !response.ok {
                bail!("event at '{path}' failed");
            }
            Ok(())
        }
    }
}

async fn watch(client: &dyn ModelClient, key: String, once: bool) -> Result<()> {
    let mut events = client.events();
    client.subscribe(vec![key.clone()]).await?;

    let mut dirty = false;
    loop {
        let next = if dirty {
            tokio::time::timeout(SETTLE, events.recv()).await.ok()
        } else {
            Some(events.recv().await)
        };
        match next {
            None => {
                let model = client.resolved(&key).await.to_value();
                println!("{}", serde_json::to_string_pretty(&model)?);
                if once {
                    return Ok(());
                }
                dirty = false;
            }
            Some(Ok(ClientEvent::Updated { .. })) => dirty = true,
            Some(Ok(ClientEvent::Error(message))) => warn!(%message, "server sent a bad frame"),
            Some(Err(RecvError::Lagged(skipped))) => {
                warn!(skipped, "fell behind on updates");
                dirty = true;
            }
            Some(Ok(ClientEvent::Closed)) | Some(Err(RecvError::Closed)) => {
                bail!("server closed the connection")
            }
        }
    }
}

/// Inverse of `display_path`: `key/field/0`, with the root key written as an
/// empty first segment.
fn parse_path(raw: &str) -> Path {
    raw.split('/')
        .map(|segment| match segment.parse::<usize>() {
            Ok(index) => PathSegment::Index(index),
            Err(_) => PathSegment::from(segment),
        })
        .collect()
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
