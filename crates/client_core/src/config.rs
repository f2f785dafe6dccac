use std::{fs, time::Duration};

use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub api_base_url: String,
    pub broker_url: String,
    pub reconnect_delay_secs: u64,
    pub keepalive_interval_secs: u64,
    pub request_timeout_secs: u64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_base_url: "http://localhost:8080/api".into(),
            broker_url: "ws://localhost:8080/api/ws".into(),
            reconnect_delay_secs: 5,
            keepalive_interval_secs: 4,
            request_timeout_secs: 10,
        }
    }
}

impl Settings {
    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.reconnect_delay_secs)
    }

    pub fn keepalive_interval(&self) -> Duration {
        Duration::from_secs(self.keepalive_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<toml::Value>(&raw) {
            if let Some(v) = file_cfg.get("api_base_url").and_then(|v| v.as_str()) {
                settings.api_base_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("broker_url").and_then(|v| v.as_str()) {
                settings.broker_url = v.to_string();
            }
            if let Some(v) = file_cfg.get("reconnect_delay_secs").and_then(|v| v.as_integer()) {
                settings.reconnect_delay_secs = v as u64;
            }
            if let Some(v) = file_cfg
                .get("keepalive_interval_secs")
                .and_then(|v| v.as_integer())
            {
                settings.keepalive_interval_secs = v as u64;
            }
            if let Some(v) = file_cfg
                .get("request_timeout_secs")
                .and_then(|v| v.as_integer())
            {
                settings.request_timeout_secs = v as u64;
            }
        }
    }

    if let Ok(v) = std::env::var("API_BASE_URL") {
        settings.api_base_url = v;
    }
    if let Ok(v) = std::env::var("APP__API_BASE_URL") {
        settings.api_base_url = v;
    }

    if let Ok(v) = std::env::var("BROKER_URL") {
        settings.broker_url = v;
    }
    if let Ok(v) = std::env::var("APP__BROKER_URL") {
        settings.broker_url = v;
    }

    if let Ok(v) = std::env::var("APP__RECONNECT_DELAY_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.reconnect_delay_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__KEEPALIVE_INTERVAL_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.keepalive_interval_secs = parsed;
        }
    }
    if let Ok(v) = std::env::var("APP__REQUEST_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.request_timeout_secs = parsed;
        }
    }

    settings
}
