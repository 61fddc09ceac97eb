//! Persisted server connection settings.
//!
//! [`ServerConfig`] is stored as camelCase JSON and converted into a
//! [`ConnectConfig`] for the WebSocket client or a base URL for the HTTP
//! client.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::gateway::client::{ConnectConfig, GatewayDefaults};

pub const ENV_GATEWAY_URL: &str = "OPENCLAW_GATEWAY_URL";
pub const ENV_GATEWAY_TOKEN: &str = "OPENCLAW_GATEWAY_TOKEN";

/// Gateway port used when only a Tailscale address is configured.
pub const DEFAULT_GATEWAY_PORT: u16 = 18789;

/// How the gateway is reached. Informational except for `Tailscale`, which
/// may derive the URL from `tailscale_ip`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionType {
    #[default]
    Local,
    Tailscale,
    Vpn,
    Cloudflare,
    PublicNetwork,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default)]
    pub connection_type: ConnectionType,
    #[serde(default)]
    pub base_url: String,
    #[serde(default, with = "secret_token", skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<SecretString>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tailscale_ip: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_headers: BTreeMap<String, String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            connection_type: ConnectionType::Local,
            base_url: GatewayDefaults::URL.to_string(),
            auth_token: None,
            tailscale_ip: None,
            custom_headers: BTreeMap::new(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config json: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid gateway url `{0}`: expected ws, wss, http or https")]
    InvalidUrl(String),
}

impl ServerConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = serde_json::from_str(&text)?;
        debug!(event = "server_config_loaded", path = %path.display());
        Ok(config)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let text = serde_json::to_string_pretty(self)?;
        fs::write(path, text).map_err(|source| ConfigError::Write {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Applies `OPENCLAW_GATEWAY_URL` and `OPENCLAW_GATEWAY_TOKEN`.
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides_from(|name| std::env::var(name).ok())
    }

    pub fn with_overrides_from<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_GATEWAY_URL).filter(|value| !value.trim().is_empty()) {
            self.base_url = url.trim().to_string();
        }
        if let Some(token) = lookup(ENV_GATEWAY_TOKEN).filter(|value| !value.trim().is_empty()) {
            self.auth_token = Some(SecretString::new(token.trim().to_string()));
        }
        self
    }

    /// Configured base URL, falling back to the Tailscale address and then
    /// the local default. Trailing slashes are removed.
    pub fn base_url(&self) -> String {
        let configured = self.base_url.trim().trim_end_matches('/');
        if !configured.is_empty() {
            return configured.to_string();
        }
        match (self.connection_type, self.tailscale_ip.as_deref()) {
            (ConnectionType::Tailscale, Some(ip)) if !ip.trim().is_empty() => {
                format!("ws://{}:{DEFAULT_GATEWAY_PORT}", ip.trim())
            }
            _ => GatewayDefaults::URL.to_string(),
        }
    }

    /// WebSocket URL of the gateway (`http` maps to `ws`, `https` to `wss`).
    pub fn gateway_url(&self) -> Result<String, ConfigError> {
        let base = self.base_url();
        let (scheme, rest) = split_scheme(&base)?;
        let scheme = match scheme {
            "http" | "ws" => "ws",
            _ => "wss",
        };
        Ok(format!("{scheme}://{rest}"))
    }

    /// HTTP base URL of the gateway (`ws` maps to `http`, `wss` to `https`).
    pub fn http_base_url(&self) -> Result<String, ConfigError> {
        let base = self.base_url();
        let (scheme, rest) = split_scheme(&base)?;
        let scheme = match scheme {
            "http" | "ws" => "http",
            _ => "https",
        };
        Ok(format!("{scheme}://{rest}"))
    }

    pub fn connect_config(&self) -> Result<ConnectConfig, ConfigError> {
        let mut config = ConnectConfig::new(self.gateway_url()?);
        config.auth_token = self.auth_token.clone();
        config.headers = self.custom_headers.clone();
        Ok(config)
    }
}

fn split_scheme(url: &str) -> Result<(&str, &str), ConfigError> {
    let invalid = || ConfigError::InvalidUrl(url.to_string());
    let (scheme, rest) = url.split_once("://").ok_or_else(invalid)?;
    match scheme {
        "ws" | "wss" | "http" | "https" if !rest.is_empty() => Ok((scheme, rest)),
        _ => Err(invalid()),
    }
}

mod secret_token {
    use secrecy::{ExposeSecret, SecretString};
    use serde::{Deserialize, Deserializer, Serializer};

    pub(super) fn serialize<S>(
        token: &Option<SecretString>,
        serializer: S,
    ) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match token {
            Some(token) => serializer.serialize_str(token.expose_secret()),
            None => serializer.serialize_none(),
        }
    }

    pub(super) fn deserialize<'de, D>(deserializer: D) -> Result<Option<SecretString>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<String>::deserialize(deserializer)?
            .filter(|token| !token.is_empty())
            .map(SecretString::new))
    }
}

impl PartialEq for ServerConfig {
    fn eq(&self, other: &Self) -> bool {
        let tokens_match = match (&self.auth_token, &other.auth_token) {
            (Some(left), Some(right)) => left.expose_secret() == right.expose_secret(),
            (None, None) => true,
            _ => false,
        };
        tokens_match
            && self.connection_type == other.connection_type
            && self.base_url == other.base_url
            && self.tailscale_ip == other.tailscale_ip
            && self.custom_headers == other.custom_headers
    }
}
