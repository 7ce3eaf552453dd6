use std::{collections::HashMap, fs, io, path::Path, str::FromStr};

use anyhow::Context;
use serde::Deserialize;

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Settings {
    pub server_bind: String,
    /// Used when `RUST_LOG` is not set.
    pub log_filter: String,
    pub event_log_capacity: usize,
    /// Upper bound for WebSocket frames and HTTP request bodies.
    pub max_frame_bytes: usize,
    pub seed_demo: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server_bind: "127.0.0.1:8443".into(),
            log_filter: "info".into(),
            event_log_capacity: 256,
            max_frame_bytes: 1024 * 1024,
            seed_demo: true,
        }
    }
}

pub fn load_settings() -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    settings.apply_file(Path::new("server.toml"))?;
    settings.apply_env(|name| std::env::var(name).ok())?;
    Ok(settings)
}

impl Settings {
    /// Applies a flat `key = "value"` table. A missing file is not an error.
    pub fn apply_file(&mut self, path: &Path) -> anyhow::Result<()> {
        let raw = match fs::read_to_string(path) {
            Ok(raw) => raw,
            Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(error) => {
                return Err(error)
                    .with_context(|| format!("failed to read '{}'", path.display()))
            }
        };
        let table = toml::from_str::<HashMap<String, String>>(&raw)
            .with_context(|| format!("invalid config file '{}'", path.display()))?;
        self.apply_table(&table)
    }

    pub fn apply_table(&mut self, table: &HashMap<String, String>) -> anyhow::Result<()> {
        if let Some(v) = table.get("bind_addr") {
            self.server_bind = v.clone();
        }
        if let Some(v) = table.get("log_filter") {
            self.log_filter = v.clone();
        }
        if let Some(v) = table.get("event_log_capacity") {
            self.event_log_capacity = parse("event_log_capacity", v)?;
        }
        if let Some(v) = table.get("max_frame_bytes") {
            self.max_frame_bytes = parse("max_frame_bytes", v)?;
        }
        if let Some(v) = table.get("seed_demo") {
            self.seed_demo = parse_flag("seed_demo", v)?;
        }
        Ok(())
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<()> {
        if let Some(v) = lookup("SERVER_BIND") {
            self.server_bind = v;
        }
        if let Some(v) = lookup("APP__BIND_ADDR") {
            self.server_bind = v;
        }
        if let Some(v) = lookup("APP__LOG_FILTER") {
            self.log_filter = v;
        }
        if let Some(v) = lookup("APP__EVENT_LOG_CAPACITY") {
            self.event_log_capacity = parse("APP__EVENT_LOG_CAPACITY", &v)?;
        }
        if let Some(v) = lookup("APP__MAX_FRAME_BYTES") {
            self.max_frame_bytes = parse("APP__MAX_FRAME_BYTES", &v)?;
        }
        if let Some(v) = lookup("APP__SEED_DEMO") {
            self.seed_demo = parse_flag("APP__SEED_DEMO", &v)?;
        }
        Ok(())
    }
}

fn parse<T>(name: &str, raw: &str) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    raw.trim()
        .parse()
        .with_context(|| format!("invalid value '{raw}' for {name}"))
}

fn parse_flag(name: &str, raw: &str) -> anyhow::Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => anyhow::bail!("invalid value '{raw}' for {name}"),
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
