use std::{fs, path::Path, time::Duration};

use serde::Deserialize;
use tracing::warn;

use crate::error::{ClientError, Result};

const SETTINGS_FILE: &str = "client.toml";

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientSettings {
    pub api_base_url: String,
    pub socket_url: String,
    pub database_url: String,
    pub reconnect_attempts: u32,
    pub reconnect_delay_ms: u64,
    pub heartbeat_interval_ms: u64,
    pub online_threshold_ms: u64,
    pub presence_tick_ms: u64,
    pub watch_initial_delay_ms: u64,
    pub history_page_size: u32,
    pub upload_chunk_bytes: usize,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:5000".into(),
            socket_url: "ws://localhost:3001/ws".into(),
            database_url: "sqlite://./data/client.db".into(),
            reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            heartbeat_interval_ms: 10_000,
            online_threshold_ms: 15_000,
            presence_tick_ms: 5_000,
            watch_initial_delay_ms: 500,
            history_page_size: 50,
            upload_chunk_bytes: 1024 * 1024,
        }
    }
}

impl ClientSettings {
    pub fn validate(&self) -> Result<()> {
        if self.online_threshold_ms <= self.heartbeat_interval_ms {
            return Err(ClientError::Config(format!(
                "online threshold ({} ms) must exceed the heartbeat interval ({} ms)",
                self.online_threshold_ms, self.heartbeat_interval_ms
            )));
        }
        if self.upload_chunk_bytes == 0 {
            return Err(ClientError::Config("upload chunk size must be non-zero".into()));
        }
        if self.presence_tick_ms == 0 {
            return Err(ClientError::Config("presence tick must be non-zero".into()));
        }
        Ok(())
    }

    pub fn reconnect_policy(&self) -> crate::connection::ReconnectPolicy {
        crate::connection::ReconnectPolicy {
            max_retries: self.reconnect_attempts,
            delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }

    pub fn presence_settings(&self) -> crate::presence::PresenceSettings {
        crate::presence::PresenceSettings {
            heartbeat_interval: Duration::from_millis(self.heartbeat_interval_ms),
            online_threshold: Duration::from_millis(self.online_threshold_ms),
            initial_watch_delay: Duration::from_millis(self.watch_initial_delay_ms),
        }
    }

    pub fn presence_tick(&self) -> Duration {
        Duration::from_millis(self.presence_tick_ms)
    }
}

pub fn load_settings() -> ClientSettings {
    load_settings_from(Path::new(SETTINGS_FILE))
}

pub fn load_settings_from(path: &Path) -> ClientSettings {
    let mut settings = match fs::read_to_string(path) {
        Ok(raw) => match toml::from_str::<ClientSettings>(&raw) {
            Ok(parsed) => parsed,
            Err(err) => {
                warn!(path = %path.display(), "config: ignoring unparsable settings file: {err}");
                ClientSettings::default()
            }
        },
        Err(_) => ClientSettings::default(),
    };

    apply_env_overrides(&mut settings);
    settings
}

fn apply_env_overrides(settings: &mut ClientSettings) {
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__SOCKET_URL") {
        settings.socket_url = v;
    }
    if let Ok(v) = std::env::var("APP__DATABASE_URL") {
        settings.database_url = v;
    }
    if let Some(v) = parse_env("APP__RECONNECT_ATTEMPTS") {
        settings.reconnect_attempts = v;
    }
    if let Some(v) = parse_env("APP__RECONNECT_DELAY_MS") {
        settings.reconnect_delay_ms = v;
    }
    if let Some(v) = parse_env("APP__HEARTBEAT_INTERVAL_MS") {
        settings.heartbeat_interval_ms = v;
    }
    if let Some(v) = parse_env("APP__ONLINE_THRESHOLD_MS") {
        settings.online_threshold_ms = v;
    }
}

fn parse_env<T: std::str::FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse::<T>() {
        Ok(parsed) => Some(parsed),
        Err(_) => {
            warn!(variable = name, "config: ignoring non-numeric override");
            None
        }
    }
}

#[cfg(test)]
#[path = "tests/config_tests.rs"]
mod tests;
