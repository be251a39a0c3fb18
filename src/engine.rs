//! Native tunnel engine collaborator
//!
//! The engine does the actual packet work. The control plane only hands it
//! the interface directives for a session and a callback that keeps the
//! engine's own control socket out of the tunnel.

use crate::vpn::InterfaceDirective;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

/// Keeps a socket out of the tunnel; returns false if that failed
pub type ProtectFn = Arc<dyn Fn(i32) -> bool + Send + Sync>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Tunnel establishment failed: {0}")]
    EstablishFailed(String),
}

pub trait TunnelEngine: Send {
    /// Native library the engine needs loaded before use
    fn library(&self) -> Option<&str> {
        None
    }

    /// Bring the tunnel up
    ///
    /// # Arguments
    /// * `directives` - Interface directives, to be applied in order
    /// * `protect` - Callback excluding a socket from the tunnel
    fn establish(
        &mut self,
        directives: &[InterfaceDirective],
        protect: &ProtectFn,
    ) -> Result<(), EngineError>;

    fn shutdown(&mut self);
}

/// A protect callback that accepts every socket
pub fn protect_nothing() -> ProtectFn {
    Arc::new(|_| true)
}

/// Engine that logs what it would apply
///
/// Used by `vpnctl simulate` and in tests.
#[derive(Debug, Default)]
pub struct DryRunEngine {
    applied: Vec<InterfaceDirective>,
    up: bool,
    fail_with: Option<String>,
}

impl DryRunEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Engine whose every establish attempt fails with `reason`
    pub fn failing(reason: impl Into<String>) -> Self {
        Self {
            fail_with: Some(reason.into()),
            ..Self::default()
        }
    }

    pub fn applied(&self) -> &[InterfaceDirective] {
        &self.applied
    }

    pub fn is_up(&self) -> bool {
        self.up
    }
}

impl TunnelEngine for DryRunEngine {
    fn establish(
        &mut self,
        directives: &[InterfaceDirective],
        protect: &ProtectFn,
    ) -> Result<(), EngineError> {
        if let Some(reason) = &self.fail_with {
            return Err(EngineError::EstablishFailed(reason.clone()));
        }
        if !protect(-1) {
            return Err(EngineError::EstablishFailed(
                "control socket could not be protected".to_string(),
            ));
        }

        for directive in directives {
            debug!("apply {}", directive);
        }
        info!("Dry run: {} interface directives applied", directives.len());
        self.applied = directives.to_vec();
        self.up = true;
        Ok(())
    }

    fn shutdown(&mut self) {
        if self.up {
            info!("Dry run: tunnel down");
        }
        self.up = false;
        self.applied.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dry_run_records_directives() {
        let mut engine = DryRunEngine::new();
        let directives = vec![
            InterfaceDirective::SetMtu(1280),
            InterfaceDirective::SetBlocking(false),
        ];

        engine.establish(&directives, &protect_nothing()).unwrap();
        assert!(engine.is_up());
        assert_eq!(engine.applied(), &directives[..]);

        engine.shutdown();
        assert!(!engine.is_up());
        assert!(engine.applied().is_empty());
    }

    #[test]
    fn test_dry_run_honours_protect_result() {
        let mut engine = DryRunEngine::new();
        let refuse: ProtectFn = Arc::new(|_| false);

        let result = engine.establish(&[], &refuse);
        assert!(matches!(result, Err(EngineError::EstablishFailed(_))));
        assert!(!engine.is_up());
    }

    #[test]
    fn test_failing_engine() {
        let mut engine = DryRunEngine::failing("no route to gateway");
        let err = engine.establish(&[], &protect_nothing()).unwrap_err();
        assert_eq!(
            err.to_string(),
            "Tunnel establishment failed: no route to gateway"
        );
    }

    #[test]
    fn test_default_engine_needs_no_library() {
        assert!(DryRunEngine::new().library().is_none());
    }
}
