// Error types shared across the control core

use crate::registry::PortId;
use crate::transport::TransportError;

/// Errors surfaced by hub operations.
///
/// Configuration errors (`InvalidPort`, `InvalidArgument`) are detected at the
/// call boundary and never reach the control loop. `ActuatorIo` propagates a
/// transport failure; the component that sees it forces the actuator to coast.
#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("port index {0} is out of the configured range")]
    InvalidPort(u8),

    #[error("no motor attached to port {0}")]
    NotAttached(PortId),

    #[error("actuator I/O failed: {0}")]
    ActuatorIo(#[from] TransportError),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("not supported on this build: {0}")]
    NotSupported(&'static str),
}

pub type Result<T> = std::result::Result<T, HubError>;
