// Real-time motor control core for a robotics hub
//
// A fixed-period scheduler drives closed-loop motor controllers and
// synchronized drivebases over a pluggable transport, with battery-aware
// duty limiting. Foreground callers issue commands through the `Hub`
// registry; the control loop runs as one background task.

pub mod battery;
pub mod config;
pub mod error;
pub mod motor;
pub mod registry;
pub mod runtime;
pub mod transport;

pub use error::{HubError, Result};
pub use registry::{Hub, PortId};
