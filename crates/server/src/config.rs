use std::{collections::HashMap, fs};

use serde::Deserialize;
use shared::domain::SupervisorIdentity;

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub bind: String,
    /// Endpoint of the external session validator. When unset, controller
    /// sessions resolve against the static `dev_sessions` table instead.
    pub validator_url: Option<String>,
    pub dev_sessions: String,
    pub heartbeat_secs: u64,
    pub liveness_timeout_secs: u64,
    pub outbound_queue_depth: usize,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:8750".into(),
            validator_url: None,
            dev_sessions: String::new(),
            heartbeat_secs: 30,
            liveness_timeout_secs: 60,
            outbound_queue_depth: 64,
        }
    }
}

pub fn load_settings() -> Settings {
    let mut settings = Settings::default();

    if let Ok(raw) = fs::read_to_string("server.toml") {
        if let Ok(file_cfg) = toml::from_str::<HashMap<String, String>>(&raw) {
            if let Some(v) = file_cfg.get("bind") {
                settings.bind = v.clone();
            }
            if let Some(v) = file_cfg.get("validator_url") {
                settings.validator_url = Some(v.clone());
            }
            if let Some(v) = file_cfg.get("dev_sessions") {
                settings.dev_sessions = v.clone();
            }
            if let Some(v) = file_cfg.get("heartbeat_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.heartbeat_secs = parsed;
                }
            }
            if let Some(v) = file_cfg.get("liveness_timeout_secs") {
                if let Ok(parsed) = v.parse::<u64>() {
                    settings.liveness_timeout_secs = parsed;
                }
            }
            if let Some(v) = file_cfg.get("outbound_queue_depth") {
                if let Ok(parsed) = v.parse::<usize>() {
                    settings.outbound_queue_depth = parsed;
                }
            }
        }
    }

    if let Ok(v) = std::env::var("OPS_BIND") {
        settings.bind = v;
    }

    if let Ok(v) = std::env::var("OPS_VALIDATOR_URL") {
        settings.validator_url = Some(v);
    }

    if let Ok(v) = std::env::var("OPS_DEV_SESSIONS") {
        settings.dev_sessions = v;
    }

    if let Ok(v) = std::env::var("OPS_HEARTBEAT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.heartbeat_secs = parsed;
        }
    }

    if let Ok(v) = std::env::var("OPS_LIVENESS_TIMEOUT_SECS") {
        if let Ok(parsed) = v.parse::<u64>() {
            settings.liveness_timeout_secs = parsed;
        }
    }

    if let Ok(v) = std::env::var("OPS_QUEUE_DEPTH") {
        if let Ok(parsed) = v.parse::<usize>() {
            settings.outbound_queue_depth = parsed;
        }
    }

    settings
}

/// Parses the `dev_sessions` setting, a semicolon-separated list of
/// `sessionId=supervisorId:Display Name` entries. Malformed entries are
/// skipped so a typo in one session does not take the whole table down.
pub fn parse_dev_sessions(raw: &str) -> Vec<(String, SupervisorIdentity)> {
    raw.split(';')
        .filter_map(|entry| {
            let entry = entry.trim();
            if entry.is_empty() {
                return None;
            }
            let (session_id, rest) = entry.split_once('=')?;
            let (supervisor_id, name) = rest.split_once(':')?;
            let session_id = session_id.trim();
            let supervisor_id = supervisor_id.trim();
            let name = name.trim();
            if session_id.is_empty() || supervisor_id.is_empty() || name.is_empty() {
                return None;
            }
            Some((
                session_id.to_string(),
                SupervisorIdentity {
                    id: supervisor_id.into(),
                    name: name.to_string(),
                    permissions: Vec::new(),
                },
            ))
        })
        .collect()
}
