use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle of the connection to the protocol client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Open,
    Closed,
}

/// Point-in-time copy of the shared state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSnapshot {
    pub connection: ConnectionState,
    pub registered: bool,
    /// Latest QR payload of the current attempt
    pub qr: Option<String>,
    /// Latest pairing code, formatted for display
    pub pairing_code: Option<String>,
    /// When any of the above last changed
    pub updated_at: Option<DateTime<Utc>>,
}

/// State shared between the supervisor and the pairing endpoint.
///
/// The supervisor is the only writer. QR payloads and pairing codes are kept
/// apart: they belong to two different linking flows.
#[derive(Debug, Clone, Default)]
pub struct GatewayState {
    inner: Arc<RwLock<StatusSnapshot>>,
}

impl GatewayState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        self.read().clone()
    }

    pub fn qr(&self) -> Option<String> {
        self.read().qr.clone()
    }

    pub fn pairing_code(&self) -> Option<String> {
        self.read().pairing_code.clone()
    }

    /// Record a new QR payload, superseding the previous one.
    pub fn set_qr(&self, qr: impl Into<String>) {
        self.update(|state| state.qr = Some(qr.into()));
    }

    pub fn set_pairing_code(&self, code: impl Into<String>) {
        self.update(|state| state.pairing_code = Some(code.into()));
    }

    pub fn set_registered(&self, registered: bool) {
        self.update(|state| state.registered = registered);
    }

    /// Update the connection state. Opening a connection retires the pairing
    /// artifacts of the attempt.
    pub fn set_connection(&self, connection: ConnectionState) {
        self.update(|state| {
            state.connection = connection;
            if connection == ConnectionState::Open {
                state.qr = None;
                state.pairing_code = None;
            }
        });
    }

    fn update(&self, apply: impl FnOnce(&mut StatusSnapshot)) {
        let mut state = self.write();
        apply(&mut state);
        state.updated_at = Some(Utc::now());
    }

    fn read(&self) -> RwLockReadGuard<'_, StatusSnapshot> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StatusSnapshot> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_latest_qr_wins() {
        let state = GatewayState::new();
        assert_eq!(state.qr(), None);
        state.set_qr("first");
        state.set_qr("second");
        assert_eq!(state.qr().as_deref(), Some("second"));
    }

    #[test]
    fn test_qr_and_pairing_code_are_separate() {
        let state = GatewayState::new();
        state.set_qr("2@qr-payload");
        assert_eq!(state.pairing_code(), None);
        state.set_pairing_code("ABCD-1234");
        assert_eq!(state.qr().as_deref(), Some("2@qr-payload"));
    }

    #[test]
    fn test_open_clears_artifacts() {
        let state = GatewayState::new();
        state.set_qr("qr");
        state.set_pairing_code("ABCD-1234");
        state.set_connection(ConnectionState::Open);
        let snapshot = state.snapshot();
        assert_eq!(snapshot.connection, ConnectionState::Open);
        assert_eq!(snapshot.qr, None);
        assert_eq!(snapshot.pairing_code, None);
    }

    #[test]
    fn test_clones_share_state() {
        let state = GatewayState::new();
        let other = state.clone();
        assert_eq!(state.snapshot().updated_at, None);
        other.set_registered(true);
        let snapshot = state.snapshot();
        assert!(snapshot.registered);
        assert!(snapshot.updated_at.is_some());
    }
}
