//! Error taxonomy shared across the control plane

use crate::config::ConfigError;
use crate::engine::EngineError;
use crate::ipc::TransportError;
use crate::loader::LoadError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VpnError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Engine error: {0}")]
    Engine(#[from] EngineError),
    #[error("Load error: {0}")]
    Load(#[from] LoadError),
}

impl VpnError {
    /// Whether the process cannot tunnel at all after this error
    pub fn is_fatal(&self) -> bool {
        matches!(self, VpnError::Load(_))
    }
}
