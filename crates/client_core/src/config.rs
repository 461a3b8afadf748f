use std::{collections::HashMap, fs};

use serde::Deserialize;

/// Client endpoint settings: defaults, overridden by `client.toml`,
/// overridden by environment variables.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientSettings {
    /// REST gateway base, e.g. `http://127.0.0.1:3000/api`.
    pub api_url: String,
    /// Signaling WebSocket base; the identity is appended as a path segment.
    pub signaling_url: String,
    /// RPC middleware endpoint.
    pub rpc_url: String,
    /// Subscription push socket of the middleware.
    pub rpc_events_url: String,
    pub poll_interval_ms: u64,
}

impl Default for ClientSettings {
    fn default() -> Self {
        Self {
            api_url: "http://127.0.0.1:3000/api".into(),
            signaling_url: "ws://127.0.0.1:8888".into(),
            rpc_url: "http://127.0.0.1:10000/rpc".into(),
            rpc_events_url: "ws://127.0.0.1:10000/rpc/events".into(),
            poll_interval_ms: 2000,
        }
    }
}

pub fn load_settings() -> ClientSettings {
    let mut settings = ClientSettings::default();

    if let Ok(raw) = fs::read_to_string("client.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("api_url") {
                settings.api_url = v.clone();
            }
            if let Some(v) = file_cfg.get("signaling_url") {
                settings.signaling_url = v.clone();
            }
            if let Some(v) = file_cfg.get("rpc_url") {
                settings.rpc_url = v.clone();
            }
            if let Some(v) = file_cfg.get("rpc_events_url") {
                settings.rpc_events_url = v.clone();
            }
            if let Some(v) = file_cfg.get("poll_interval_ms") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.poll_interval_ms = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("CHAT_API_URL") {
        settings.api_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_SIGNALING_URL") {
        settings.signaling_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_RPC_URL") {
        settings.rpc_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_RPC_EVENTS_URL") {
        settings.rpc_events_url = v;
    }
    if let Ok(v) = std::env::var("CHAT_POLL_INTERVAL_MS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.poll_interval_ms = parsed;
        }
    }

    settings
}
