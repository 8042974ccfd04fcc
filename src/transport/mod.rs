// Hardware interfaces consumed by the control core
//
// The control core never talks to a device directly; it goes through these
// traits. The serial implementation drives the real motor bus, the mock backs
// tests and `--sim` runs.

pub mod mock;
pub mod serial;

pub use mock::{MockAdc, MockMotor};
pub use serial::SerialBus;

/// Passive drive modes an actuator can be parked in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PassiveMode {
    /// High impedance, motor freewheels
    Coast,
    /// Terminals shorted, motor resists rotation
    Brake,
}

/// Errors from the transport/driver layer.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("serial port error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("timeout waiting for a reply from device {id}")]
    Timeout { id: u8 },

    #[error("invalid frame from device {id}: {reason}")]
    InvalidFrame { id: u8, reason: String },

    #[error("checksum mismatch in reply from device {id}")]
    ChecksumMismatch { id: u8 },

    #[error("device {id} reported fault status 0x{status:02X}")]
    DeviceFault { id: u8, status: u8 },

    #[error("port is offline after an I/O fault: {0}")]
    PortDown(String),
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// One physical motor port: encoder readback and duty output.
///
/// All calls must complete within one control tick's I/O budget or fail;
/// implementations never block indefinitely.
pub trait MotorPort: Send {
    /// Raw encoder count since power-on (never reset in hardware).
    fn read_encoder_count(&mut self) -> Result<i32>;

    /// Raw encoder rate in counts per second.
    fn read_encoder_rate(&mut self) -> Result<i32>;

    /// Apply a duty command in raw steps (sign is direction).
    fn write_duty(&mut self, steps: i16) -> Result<()>;

    /// Park the actuator in a passive mode.
    fn set_passive_mode(&mut self, mode: PassiveMode) -> Result<()>;
}

/// Analog sensing channels plus the battery type detect pin.
pub trait AdcReader: Send {
    /// Read a raw ADC channel (12-bit, 0..=4095).
    fn read_channel(&mut self, channel: u8) -> Result<u16>;

    /// Battery chemistry detect input: high means alkaline.
    fn read_type_pin(&mut self) -> Result<bool>;
}
