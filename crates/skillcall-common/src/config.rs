//! Call subsystem configuration.
//!
//! Values come from three layers, later ones winning: built-in defaults, an optional JSON
//! file, and `SKILLCALL_*` environment variables.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub const ENV_SIGNALING_URL: &str = "SKILLCALL_SIGNALING_URL";
pub const ENV_ICE_SERVERS: &str = "SKILLCALL_ICE_SERVERS";
pub const ENV_NEGOTIATION_TIMEOUT_MS: &str = "SKILLCALL_NEGOTIATION_TIMEOUT_MS";
pub const ENV_MEDIA_ACQUIRE_TIMEOUT_MS: &str = "SKILLCALL_MEDIA_ACQUIRE_TIMEOUT_MS";
pub const ENV_GATHER_TIMEOUT_MS: &str = "SKILLCALL_GATHER_TIMEOUT_MS";
pub const ENV_AUTH_TIMEOUT_MS: &str = "SKILLCALL_AUTH_TIMEOUT_MS";
pub const ENV_RECONNECT_MAX_ATTEMPTS: &str = "SKILLCALL_RECONNECT_MAX_ATTEMPTS";
pub const ENV_RECONNECT_INITIAL_DELAY_MS: &str = "SKILLCALL_RECONNECT_INITIAL_DELAY_MS";
pub const ENV_RECONNECT_MAX_DELAY_MS: &str = "SKILLCALL_RECONNECT_MAX_DELAY_MS";

/// STUN/TURN server entry. TURN infrastructure itself is external.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl IceServer {
    pub fn stun(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }
}

/// Backoff parameters for signaling re-attachment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectSettings {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Attempts after a drop before giving up. Zero disables reconnection.
    pub max_attempts: u32,
    /// Randomize each delay into `[delay/2, delay]`.
    pub jitter: bool,
}

impl Default for ReconnectSettings {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 15_000,
            multiplier: 2.0,
            max_attempts: 6,
            jitter: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CallConfig {
    pub signaling_url: String,
    pub ice_servers: Vec<IceServer>,
    /// Bounds the Negotiating state.
    pub negotiation_timeout_ms: u64,
    /// Bounds media acquisition during Initiating.
    pub media_acquire_timeout_ms: u64,
    /// Bounds local candidate gathering before a description is shipped.
    pub gather_timeout_ms: u64,
    /// Bounds the relay's reply to the auth frame.
    pub auth_timeout_ms: u64,
    /// How often the elapsed call duration is republished while Active.
    pub duration_tick_ms: u64,
    pub reconnect: ReconnectSettings,
}

impl Default for CallConfig {
    fn default() -> Self {
        Self {
            signaling_url: "ws://127.0.0.1:8787/signal".to_string(),
            ice_servers: vec![IceServer::stun("stun:stun.l.google.com:19302")],
            negotiation_timeout_ms: 20_000,
            media_acquire_timeout_ms: 15_000,
            gather_timeout_ms: 5_000,
            auth_timeout_ms: 10_000,
            duration_tick_ms: 1_000,
            reconnect: ReconnectSettings::default(),
        }
    }
}

fn parse_var<T: std::str::FromStr>(name: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse::<T>()
        .map_err(|_| Error::config(format!("{name} has invalid value {raw:?}")))
}

impl CallConfig {
    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    pub fn media_acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.media_acquire_timeout_ms)
    }

    pub fn gather_timeout(&self) -> Duration {
        Duration::from_millis(self.gather_timeout_ms)
    }

    pub fn auth_timeout(&self) -> Duration {
        Duration::from_millis(self.auth_timeout_ms)
    }

    pub fn duration_tick(&self) -> Duration {
        Duration::from_millis(self.duration_tick_ms)
    }

    /// Defaults, then `path` (if any), then the process environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        tracing::debug!(
            path = ?path,
            signaling_url = %config.signaling_url,
            "loaded call configuration"
        );
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json(&text)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::config(format!("invalid config: {e}")))
    }

    /// Apply `SKILLCALL_*` overrides using `lookup` to read variables.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_SIGNALING_URL) {
            self.signaling_url = url.trim().to_string();
        }
        if let Some(raw) = lookup(ENV_ICE_SERVERS) {
            self.ice_servers = raw
                .split([',', ';'])
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(IceServer::stun)
                .collect();
        }
        if let Some(raw) = lookup(ENV_NEGOTIATION_TIMEOUT_MS) {
            self.negotiation_timeout_ms = parse_var(ENV_NEGOTIATION_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_MEDIA_ACQUIRE_TIMEOUT_MS) {
            self.media_acquire_timeout_ms = parse_var(ENV_MEDIA_ACQUIRE_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_GATHER_TIMEOUT_MS) {
            self.gather_timeout_ms = parse_var(ENV_GATHER_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_AUTH_TIMEOUT_MS) {
            self.auth_timeout_ms = parse_var(ENV_AUTH_TIMEOUT_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RECONNECT_MAX_ATTEMPTS) {
            self.reconnect.max_attempts = parse_var(ENV_RECONNECT_MAX_ATTEMPTS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RECONNECT_INITIAL_DELAY_MS) {
            self.reconnect.initial_delay_ms = parse_var(ENV_RECONNECT_INITIAL_DELAY_MS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_RECONNECT_MAX_DELAY_MS) {
            self.reconnect.max_delay_ms = parse_var(ENV_RECONNECT_MAX_DELAY_MS, &raw)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        let url = url::Url::parse(&self.signaling_url)
            .map_err(|e| Error::config(format!("invalid signaling URL: {e}")))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(Error::config(format!(
                "signaling URL must use ws:// or wss://, got {}://",
                url.scheme()
            )));
        }

        for server in &self.ice_servers {
            if server.urls.is_empty() {
                return Err(Error::config("ICE server entry without urls"));
            }
            for url in &server.urls {
                let lower = url.to_ascii_lowercase();
                if !(lower.starts_with("stun:")
                    || lower.starts_with("turn:")
                    || lower.starts_with("turns:"))
                {
                    return Err(Error::config(format!("unsupported ICE server url {url}")));
                }
            }
        }

        let timeouts = [
            ("negotiation_timeout_ms", self.negotiation_timeout_ms),
            ("media_acquire_timeout_ms", self.media_acquire_timeout_ms),
            ("gather_timeout_ms", self.gather_timeout_ms),
            ("auth_timeout_ms", self.auth_timeout_ms),
            ("duration_tick_ms", self.duration_tick_ms),
            ("reconnect.initial_delay_ms", self.reconnect.initial_delay_ms),
        ];
        if let Some((name, _)) = timeouts.iter().find(|(_, value)| *value == 0) {
            return Err(Error::config(format!("{name} must be greater than zero")));
        }

        if self.reconnect.max_delay_ms < self.reconnect.initial_delay_ms {
            return Err(Error::config(
                "reconnect.max_delay_ms must not be below reconnect.initial_delay_ms",
            ));
        }
        if !(self.reconnect.multiplier >= 1.0 && self.reconnect.multiplier.is_finite()) {
            return Err(Error::config("reconnect.multiplier must be a finite value >= 1.0"));
        }
        Ok(())
    }
}
