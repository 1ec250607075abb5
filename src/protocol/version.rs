//! Lookup of the current WhatsApp Web client version.
//!
//! The server rejects clients advertising a version that is too old, so the
//! version is fetched before every connection attempt. When the lookup fails
//! the built-in version is used.

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Published version document of the multi-device web client.
pub const DEFAULT_VERSION_URL: &str =
    "https://raw.githubusercontent.com/WhiskeySockets/Baileys/master/src/Defaults/baileys-version.json";

/// Version used when the lookup fails.
pub const DEFAULT_VERSION: [u32; 3] = [2, 3000, 1_015_901_307];

#[derive(Debug, Error)]
pub enum VersionError {
    #[error("version request failed: {0}")]
    Request(#[from] Box<ureq::Error>),
    #[error("malformed version document: {0}")]
    Body(#[from] std::io::Error),
    #[error("version lookup task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Client version advertised to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaVersion {
    pub version: [u32; 3],
    /// False when the built-in fallback was used
    pub is_latest: bool,
}

impl Default for WaVersion {
    fn default() -> Self {
        Self {
            version: DEFAULT_VERSION,
            is_latest: false,
        }
    }
}

impl fmt::Display for WaVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [major, minor, patch] = self.version;
        write!(f, "{major}.{minor}.{patch}")
    }
}

#[derive(Debug, Deserialize)]
struct VersionDocument {
    version: [u32; 3],
}

/// Blocking lookup; returns an error instead of falling back.
pub fn try_fetch_version(url: &str, timeout: Duration) -> Result<WaVersion, VersionError> {
    let doc: VersionDocument = ureq::get(url)
        .timeout(timeout)
        .call()
        .map_err(Box::new)?
        .into_json()?;
    Ok(WaVersion {
        version: doc.version,
        is_latest: true,
    })
}

/// Fetch the latest version, falling back to [`DEFAULT_VERSION`] on failure.
pub async fn fetch_latest_version(url: &str, timeout: Duration) -> WaVersion {
    let owned = url.to_string();
    let result = tokio::task::spawn_blocking(move || try_fetch_version(&owned, timeout))
        .await
        .map_err(VersionError::from)
        .and_then(|inner| inner);

    match result {
        Ok(version) => {
            log::debug!("latest web version is {version}");
            version
        }
        Err(err) => {
            let fallback = WaVersion::default();
            log::warn!("could not fetch latest web version ({err}), using {fallback}");
            fallback
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_document_parsing() {
        let doc: VersionDocument =
            serde_json::from_str(r#"{"version":[2,3000,1023223821]}"#).unwrap();
        assert_eq!(doc.version, [2, 3000, 1_023_223_821]);
    }

    #[test]
    fn test_display() {
        let version = WaVersion {
            version: [2, 3000, 7],
            is_latest: true,
        };
        assert_eq!(version.to_string(), "2.3000.7");
    }

    #[tokio::test]
    async fn test_fallback_when_unreachable() {
        let url = "http://127.0.0.1:9/version.json";
        let version = fetch_latest_version(url, Duration::from_secs(2)).await;
        assert!(!version.is_latest);
        assert_eq!(version.version, DEFAULT_VERSION);
    }
}
