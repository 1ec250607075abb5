use std::fs;
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::protocol::pairing::FALLBACK_PHONE_NUMBER;
use crate::protocol::version::DEFAULT_VERSION_URL;
use crate::socket::SocketOptions;
use crate::store::DEFAULT_MAX_MESSAGES_PER_CHAT;
use crate::supervisor::RetryPolicy;

/// Environment variable consulted for the owner number.
pub const OWNER_NUMBER_ENV: &str = "OWNER_NUMBER";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read settings file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid settings file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// User-editable settings file. Every key is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Settings {
    pub owner_number: Option<String>,
    pub bot_name: Option<String>,
    /// Milliseconds between store writes
    pub store_write_interval: Option<u64>,
    pub max_store_messages: Option<usize>,
    /// Answer everyone (true) or only groups and ourselves (false)
    pub public: Option<bool>,
}

impl Settings {
    /// Load settings; a missing file yields the defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::debug!("no settings file at {}, using defaults", path.display());
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Pick the owner number: explicit override, settings file, environment,
/// then the built-in fallback. Blank values are skipped.
pub fn resolve_owner_number(
    explicit: Option<&str>,
    settings: &Settings,
    env_value: Option<&str>,
) -> String {
    [explicit, settings.owner_number.as_deref(), env_value]
        .into_iter()
        .flatten()
        .map(str::trim)
        .find(|value| !value.is_empty())
        .unwrap_or(FALLBACK_PHONE_NUMBER)
        .to_string()
}

/// Runtime configuration of the gateway.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayConfig {
    /// Directory holding credentials and signal keys.
    pub session_dir: PathBuf,
    /// JSON file backing the message store.
    pub store_path: PathBuf,
    /// Directory served as static files next to the pairing endpoints.
    pub static_dir: PathBuf,
    /// WebSocket endpoint of the protocol client bridge.
    pub bridge_endpoint: String,
    /// Where to look up the current web client version; `None` skips the lookup.
    pub version_url: Option<String>,
    pub version_timeout: Duration,
    /// Bind address of the pairing endpoint; `None` disables it.
    pub http_addr: Option<SocketAddr>,
    pub bot_name: String,
    pub owner_number: String,
    pub public: bool,
    pub store_write_interval: Duration,
    pub max_store_messages: usize,
    pub memory_ceiling_mb: u64,
    pub memory_sample_interval: Duration,
    pub retry: RetryPolicy,
    /// Delay before requesting a pairing code on an unregistered session.
    pub pairing_delay: Duration,
    pub print_qr_in_terminal: bool,
    pub socket: SocketOptions,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            session_dir: "./session".into(),
            store_path: "./baileys_store.json".into(),
            static_dir: "./public".into(),
            bridge_endpoint: "ws://127.0.0.1:8787".into(),
            version_url: Some(DEFAULT_VERSION_URL.into()),
            version_timeout: Duration::from_secs(10),
            http_addr: None,
            bot_name: "KRISHIRAN MD".into(),
            owner_number: FALLBACK_PHONE_NUMBER.into(),
            public: true,
            store_write_interval: Duration::from_secs(10),
            max_store_messages: DEFAULT_MAX_MESSAGES_PER_CHAT,
            memory_ceiling_mb: 400,
            memory_sample_interval: Duration::from_secs(30),
            retry: RetryPolicy::default(),
            pairing_delay: Duration::from_secs(3),
            print_qr_in_terminal: true,
            socket: SocketOptions::default(),
        }
    }
}

impl GatewayConfig {
    /// Defaults overlaid with the settings file and the resolved owner number.
    pub fn from_settings(
        settings: &Settings,
        owner_override: Option<&str>,
        env_owner: Option<&str>,
    ) -> Self {
        let mut config = Self {
            owner_number: resolve_owner_number(owner_override, settings, env_owner),
            ..Self::default()
        };
        if let Some(name) = &settings.bot_name {
            config.bot_name = name.clone();
        }
        if let Some(ms) = settings.store_write_interval.filter(|ms| *ms > 0) {
            config.store_write_interval = Duration::from_millis(ms);
        }
        if let Some(max) = settings.max_store_messages.filter(|max| *max > 0) {
            config.max_store_messages = max;
        }
        if let Some(public) = settings.public {
            config.public = public;
        }
        config
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = dir.into();
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_static_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.static_dir = dir.into();
        self
    }

    pub fn with_bridge_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.bridge_endpoint = endpoint.into();
        self
    }

    /// Override the version lookup URL; `None` always uses the built-in version.
    pub fn with_version_url(mut self, url: Option<String>) -> Self {
        self.version_url = url;
        self
    }

    pub fn with_http_addr(mut self, addr: Option<SocketAddr>) -> Self {
        self.http_addr = addr;
        self
    }

    pub fn with_memory_ceiling_mb(mut self, ceiling: u64) -> Self {
        self.memory_ceiling_mb = ceiling;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_pairing_delay(mut self, delay: Duration) -> Self {
        self.pairing_delay = delay;
        self
    }

    pub fn with_terminal_qr(mut self, enabled: bool) -> Self {
        self.print_qr_in_terminal = enabled;
        self
    }
}
