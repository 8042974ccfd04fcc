// Motor control stack
//
// Provides:
// - H-bridge actuator driver with the passivity state machine
// - Trapezoidal/unbounded trajectory generation
// - Cascaded position/speed feedback with anti-windup
// - The per-motor servo controller and the two-wheel drivebase

pub mod drivebase;
pub mod hbridge;
pub mod pid;
pub mod servo;
pub mod trajectory;

pub use drivebase::{Drivebase, DriveSettings};
pub use hbridge::{Direction, HBridge, Passivity};
pub use pid::PidGains;
pub use servo::{Completion, ControlSettings, RunMode, Servo, ServoStatus, StopAction};
pub use trajectory::{Reference, Trajectory};
