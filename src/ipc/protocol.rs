//! Session messages exchanged between the controller and the tunnel service
//!
//! Events flow from the service to observers; commands flow from a controller
//! to the service. Events have a JSON wire form for out-of-process transports:
//!
//! ```text
//! {"event":"connected"}
//! {"event":"status_report","state":2,"lastConfigName":"office"}
//! ```
//!
//! Unknown event tags decode to [`SessionEvent::Unknown`] so older observers
//! keep working against newer services.

use super::bus::Endpoint;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Invalid session state ordinal: {0}")]
    InvalidState(u8),
    #[error("Malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Lifecycle state of a tunnel session, carried on the wire as its ordinal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "u8", try_from = "u8")]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
    Error,
}

impl SessionState {
    pub const ALL: [SessionState; 5] = [
        SessionState::Disconnected,
        SessionState::Connecting,
        SessionState::Connected,
        SessionState::Disconnecting,
        SessionState::Error,
    ];

    /// Whether an on/off indicator should show "on"
    pub fn is_active(self) -> bool {
        matches!(
            self,
            SessionState::Connecting | SessionState::Connected | SessionState::Disconnecting
        )
    }
}

impl From<SessionState> for u8 {
    fn from(state: SessionState) -> Self {
        match state {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Connected => 2,
            SessionState::Disconnecting => 3,
            SessionState::Error => 4,
        }
    }
}

impl TryFrom<u8> for SessionState {
    type Error = ProtocolError;

    fn try_from(ordinal: u8) -> Result<Self, ProtocolError> {
        SessionState::ALL
            .get(ordinal as usize)
            .copied()
            .ok_or(ProtocolError::InvalidState(ordinal))
    }
}

/// Body of a status report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub state: SessionState,
    #[serde(default)]
    pub last_config_name: Option<String>,
}

impl StatusPayload {
    pub fn new(state: SessionState, last_config_name: Option<String>) -> Self {
        Self {
            state,
            last_config_name,
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Event broadcast by the tunnel service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum SessionEvent {
    Connected,
    Disconnected,
    StatusReport(StatusPayload),
    Registered,
    #[serde(other)]
    Unknown,
}

impl SessionEvent {
    pub fn encode(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn decode(raw: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(raw)?)
    }
}

/// Command sent by a controller to the tunnel service
#[derive(Debug, Clone)]
pub enum ServiceCommand {
    /// Subscribe `reply_to` to session events
    RegisterObserver(Endpoint<SessionEvent>),
    RequestStatus,
    /// Start the tunnel; `None` reuses the last successful profile
    Connect { profile: Option<String> },
    Disconnect,
}
