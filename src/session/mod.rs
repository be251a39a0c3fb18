//! UI-side session control
//!
//! The [`SessionCoordinator`] tracks a background tunnel service that starts,
//! stops and dies independently of the controller. It talks to the service
//! through a [`ServiceControl`] implementation, which reports binding progress
//! back through a [`BindingHandle`].

pub mod coordinator;

pub use coordinator::{
    CoordinatorHandle, Input, SessionCoordinator, SessionSettings, TileView, UserNotice,
};

use crate::ipc::{Endpoint, ServiceCommand, TransportError};
use tokio::sync::mpsc;

/// Control surface of the background tunnel service
pub trait ServiceControl: Send {
    /// Ask for the service to be started (no-op if it already runs)
    fn start_service(&mut self) -> Result<(), TransportError>;

    /// Begin binding; completion is reported through `binding`
    fn bind(&mut self, binding: BindingHandle) -> Result<(), TransportError>;

    fn unbind(&mut self);
}

/// Posts binding lifecycle changes onto the coordinator's input queue
#[derive(Debug, Clone)]
pub struct BindingHandle {
    inputs: mpsc::UnboundedSender<Input>,
}

impl BindingHandle {
    pub(crate) fn new(inputs: mpsc::UnboundedSender<Input>) -> Self {
        Self { inputs }
    }

    /// The service is bound and accepts commands on `endpoint`
    pub fn connected(&self, endpoint: Endpoint<ServiceCommand>) -> Result<(), TransportError> {
        self.post(Input::TransportReady(endpoint))
    }

    /// The service endpoint went away without an unbind
    pub fn disconnected(&self) -> Result<(), TransportError> {
        self.post(Input::TransportLost)
    }

    /// The binding itself is no longer usable
    pub fn binding_died(&self) -> Result<(), TransportError> {
        self.post(Input::BindingDied)
    }

    fn post(&self, input: Input) -> Result<(), TransportError> {
        self.inputs
            .send(input)
            .map_err(|_| TransportError::EndpointTerminated)
    }
}
