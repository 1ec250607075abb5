//! Storage module for session and message persistence.
//!
//! - `auth` keeps credentials and signal keys in a session directory
//! - `messages` keeps recent messages, contacts and chats in one JSON file

mod auth;
mod messages;

pub use auth::*;
pub use messages::*;

use std::fs;
use std::io;
use std::path::Path;

/// Write a file by writing a sibling temp file and renaming it over the target.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}
