//! Multi-file authentication state.
//!
//! Credentials live in `creds.json` inside the session directory and every
//! signal key is kept in its own `<category>-<id>.json` file, so a key update
//! rewrites one small file instead of the whole session.

use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde_json::Value;
use thiserror::Error;

use crate::store::write_atomic;
use crate::types::{Credentials, KeysUpdate};

const CREDS_FILE: &str = "creds.json";
const CORRUPT_CREDS_FILE: &str = "creds.json.corrupt";

#[derive(Debug, Error)]
pub enum AuthStateError {
    #[error("session directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to access session file: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed session file: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// File-backed auth state rooted at a session directory.
#[derive(Debug, Clone)]
pub struct MultiFileAuthState {
    dir: PathBuf,
}

impl MultiFileAuthState {
    /// Open the session directory, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, AuthStateError> {
        let dir = dir.into();
        if dir.exists() && !dir.is_dir() {
            return Err(AuthStateError::Directory {
                source: std::io::Error::new(ErrorKind::AlreadyExists, "not a directory"),
                path: dir,
            });
        }
        fs::create_dir_all(&dir).map_err(|source| AuthStateError::Directory {
            path: dir.clone(),
            source,
        })?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Load stored credentials, or fresh unregistered ones on first start.
    ///
    /// An unreadable `creds.json` is moved aside to `creds.json.corrupt` and
    /// the session starts over with a new pairing.
    pub fn load(&self) -> Result<Credentials, AuthStateError> {
        let path = self.dir.join(CREDS_FILE);
        let contents = match fs::read_to_string(&path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => {
                log::info!("no stored credentials in {}, starting fresh", self.dir.display());
                return Ok(Credentials::default());
            }
            Err(err) => return Err(err.into()),
        };
        match serde_json::from_str(&contents) {
            Ok(creds) => Ok(creds),
            Err(err) => {
                let quarantine = self.dir.join(CORRUPT_CREDS_FILE);
                log::warn!(
                    "malformed {} ({err}), moving it to {} and starting fresh",
                    path.display(),
                    quarantine.display()
                );
                fs::rename(&path, &quarantine)?;
                Ok(Credentials::default())
            }
        }
    }

    /// Persist credentials after a `creds.update`.
    pub fn save_creds(&self, creds: &Credentials) -> Result<(), AuthStateError> {
        let serialized = serde_json::to_vec_pretty(creds)?;
        write_atomic(&self.dir.join(CREDS_FILE), &serialized)?;
        Ok(())
    }

    /// Apply a batch of key writes and deletions.
    pub fn apply_keys(&self, update: &KeysUpdate) -> Result<(), AuthStateError> {
        for entry in &update.keys {
            let path = self.key_path(&entry.category, &entry.id);
            match &entry.value {
                Some(value) => write_atomic(&path, &serde_json::to_vec(value)?)?,
                None => match fs::remove_file(&path) {
                    Ok(()) => {}
                    Err(err) if err.kind() == ErrorKind::NotFound => {}
                    Err(err) => return Err(err.into()),
                },
            }
        }
        Ok(())
    }

    /// Read a single key, `None` if it was never written.
    pub fn read_key(&self, category: &str, id: &str) -> Result<Option<Value>, AuthStateError> {
        match fs::read_to_string(self.key_path(category, id)) {
            Ok(contents) => Ok(Some(serde_json::from_str(&contents)?)),
            Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    fn key_path(&self, category: &str, id: &str) -> PathBuf {
        self.dir.join(key_file_name(category, id))
    }
}

/// File name for a key, with path separators and colons made filesystem-safe.
fn key_file_name(category: &str, id: &str) -> String {
    format!("{category}-{id}.json")
        .replace('/', "__")
        .replace(':', "-")
}
