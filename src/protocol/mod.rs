//! Protocol-level helpers used around the connection: client version lookup
//! and the pairing flow.

pub mod pairing;
pub mod version;

pub use pairing::{
    format_pairing_code, normalize_phone_number, render_qr_terminal, PhoneNumber, QRError,
};
pub use version::{fetch_latest_version, WaVersion};
