//! Chat configuration loaded from environment variables.
//!
//! Every setting has a default, so a session can be opened with zero
//! configuration.

use std::time::Duration;

use duet_media::{CallSettings, MediaConstraints};
use duet_shared::constants::{DEFAULT_EVENT_BUFFER, DEFAULT_MESSAGE_TTL_SECS, DEFAULT_STUN_SERVERS};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatConfig {
    /// STUN/TURN urls handed to every peer connection.
    /// Env: `DUET_ICE_SERVERS` (comma separated)
    /// Default: two public Google STUN servers.
    pub ice_servers: Vec<String>,

    /// Age at which unsaved messages are deleted in `24h` mode.
    /// Env: `DUET_MESSAGE_TTL_SECS`
    /// Default: 86400
    pub message_ttl: Duration,

    /// Capacity of the session event channel.
    /// Env: `DUET_EVENT_BUFFER`
    /// Default: 256
    pub event_buffer: usize,

    /// Env: `DUET_REQUEST_AUDIO` (true/false)
    pub request_audio: bool,

    /// Env: `DUET_REQUEST_VIDEO` (true/false)
    pub request_video: bool,
}

impl Default for ChatConfig {
    fn default() -> Self {
        Self {
            ice_servers: DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect(),
            message_ttl: Duration::from_secs(DEFAULT_MESSAGE_TTL_SECS),
            event_buffer: DEFAULT_EVENT_BUFFER,
            request_audio: true,
            request_video: true,
        }
    }
}

impl ChatConfig {
    /// Load configuration from environment variables, falling back to defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();

        if let Some(val) = lookup("DUET_ICE_SERVERS") {
            let servers = parse_list(&val);
            if servers.is_empty() {
                tracing::warn!(value = %val, "Empty DUET_ICE_SERVERS, using default");
            } else {
                config.ice_servers = servers;
            }
        }

        if let Some(val) = lookup("DUET_MESSAGE_TTL_SECS") {
            match val.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.message_ttl = Duration::from_secs(secs),
                _ => tracing::warn!(value = %val, "Invalid DUET_MESSAGE_TTL_SECS, using default"),
            }
        }

        if let Some(val) = lookup("DUET_EVENT_BUFFER") {
            match val.trim().parse::<usize>() {
                Ok(n) if n > 0 => config.event_buffer = n,
                _ => tracing::warn!(value = %val, "Invalid DUET_EVENT_BUFFER, using default"),
            }
        }

        if let Some(val) = lookup("DUET_REQUEST_AUDIO") {
            config.request_audio = val != "false" && val != "0";
        }

        if let Some(val) = lookup("DUET_REQUEST_VIDEO") {
            config.request_video = val != "false" && val != "0";
        }

        config
    }

    pub fn call_settings(&self) -> CallSettings {
        CallSettings {
            ice_servers: self.ice_servers.clone(),
            constraints: MediaConstraints {
                audio: self.request_audio,
                video: self.request_video,
            },
        }
    }

    pub fn message_ttl(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.message_ttl).unwrap_or_else(|_| chrono::Duration::days(1))
    }
}

fn parse_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
