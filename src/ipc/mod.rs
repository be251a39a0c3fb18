//! Message plumbing between the session controller and the tunnel service

pub mod bus;
pub mod protocol;

pub use bus::{
    ChannelNotice, DEFAULT_ENDPOINT_CAPACITY, DeliveryError, Endpoint, SessionChannel,
    SubscriberId,
};
pub use protocol::{ProtocolError, ServiceCommand, SessionEvent, SessionState, StatusPayload};

use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Failed to bind to tunnel service: {0}")]
    BindFailed(String),
    #[error("Failed to start tunnel service: {0}")]
    ServiceStart(String),
    #[error("Tunnel service did not answer within {0:?}")]
    BindTimeout(Duration),
    #[error("Tunnel service endpoint terminated")]
    EndpointTerminated,
    #[error("Delivery to {0} failed")]
    DeliveryFailed(SubscriberId),
}
