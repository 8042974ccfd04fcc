// Framed serial protocol for the hub motor bus
//
// Request format:  [0xFF, 0xFD, ID, Length, Opcode, Params..., Checksum]
// Response format: [0xFF, 0xFD, ID, Length, Status, Params..., Checksum]
//
// Length counts opcode/status + params + checksum. The checksum is the
// complement of the byte sum over everything after the header.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serialport::SerialPort;
use tracing::debug;

use super::{AdcReader, MotorPort, PassiveMode, Result, TransportError};

/// Default serial configuration for the hub bus
pub const DEFAULT_BAUDRATE: u32 = 115_200;
pub const DEFAULT_TIMEOUT_MS: u64 = 10;

/// Packet header bytes
const HEADER: [u8; 2] = [0xFF, 0xFD];

/// Device id carrying the ADC/sense block (motor ports use their port index)
const SENSE_DEVICE_ID: u8 = 0x20;

/// Instruction set
#[repr(u8)]
#[derive(Debug, Clone, Copy)]
pub enum Opcode {
    Probe = 0x01,
    ReadCount = 0x10,
    ReadRate = 0x11,
    WriteDuty = 0x20,
    SetPassive = 0x21,
    ReadAdc = 0x30,
    ReadTypePin = 0x31,
}

struct BusInner {
    port: Box<dyn SerialPort>,
}

/// Shared serial bus for all motor ports and the sense block.
///
/// The bus is one physical channel: every transaction takes the bus lock, so
/// concurrent callers never interleave frames destructively.
#[derive(Clone)]
pub struct SerialBus {
    inner: Arc<Mutex<BusInner>>,
}

impl SerialBus {
    /// Open a new connection to the hub bus
    pub fn open(port_name: &str) -> Result<Self> {
        Self::open_with_baudrate(port_name, DEFAULT_BAUDRATE)
    }

    /// Open with custom baudrate
    pub fn open_with_baudrate(port_name: &str, baudrate: u32) -> Result<Self> {
        let port = serialport::new(port_name, baudrate)
            .timeout(Duration::from_millis(DEFAULT_TIMEOUT_MS))
            .open()?;

        Ok(Self {
            inner: Arc::new(Mutex::new(BusInner { port })),
        })
    }

    /// Check whether a device answers on the bus
    pub fn probe(&self, id: u8) -> Result<bool> {
        match self.transact(id, Opcode::Probe, &[]) {
            Ok(_) => Ok(true),
            Err(TransportError::Timeout { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Hand out a motor port handle, parked in coast.
    ///
    /// The actuator is driven to coast before the handle is returned so a
    /// freshly opened port never inherits a stale duty command.
    pub fn open_motor_port(&self, id: u8) -> Result<SerialMotorPort> {
        let mut handle = SerialMotorPort {
            bus: self.inner.clone(),
            id,
        };
        handle.set_passive_mode(PassiveMode::Coast)?;
        Ok(handle)
    }

    /// Hand out a handle for the ADC/sense block
    pub fn open_adc(&self) -> SerialAdc {
        SerialAdc {
            bus: self.inner.clone(),
        }
    }

    fn transact(&self, id: u8, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
        transact(&mut self.lock(), id, opcode, params)
    }

    fn lock(&self) -> MutexGuard<'_, BusInner> {
        // A poisoned bus lock only means another thread panicked mid-frame;
        // the next transaction resynchronizes on the header.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Calculate checksum for a frame (excluding header)
fn checksum(data: &[u8]) -> u8 {
    let sum: u16 = data.iter().map(|&b| b as u16).sum();
    (!sum & 0xFF) as u8
}

/// Build a frame with header and checksum
fn build_frame(id: u8, opcode: Opcode, params: &[u8]) -> Vec<u8> {
    let length = (params.len() + 2) as u8; // opcode + params + checksum
    let mut frame = Vec::with_capacity(6 + params.len());

    frame.extend_from_slice(&HEADER);
    frame.push(id);
    frame.push(length);
    frame.push(opcode as u8);
    frame.extend_from_slice(params);

    // Checksum over id, length, opcode, params
    let checksum_data = &frame[2..];
    frame.push(checksum(checksum_data));

    frame
}

fn transact(bus: &mut BusInner, id: u8, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
    let frame = build_frame(id, opcode, params);
    debug!("bus tx: device={} opcode={:?} len={}", id, opcode, frame.len());
    bus.port.write_all(&frame)?;
    bus.port.flush()?;
    read_response(bus, id)
}

/// Read a response frame, returning its parameter bytes
fn read_response(bus: &mut BusInner, expected_id: u8) -> Result<Vec<u8>> {
    let mut header = [0u8; 2];
    bus.port.read_exact(&mut header).map_err(|e| {
        if e.kind() == std::io::ErrorKind::TimedOut {
            TransportError::Timeout { id: expected_id }
        } else {
            TransportError::Io(e)
        }
    })?;

    if header != HEADER {
        return Err(TransportError::InvalidFrame {
            id: expected_id,
            reason: format!("invalid header: {:02X?}", header),
        });
    }

    let mut id_length = [0u8; 2];
    bus.port.read_exact(&mut id_length)?;
    let id = id_length[0];
    let length = id_length[1] as usize;

    if id != expected_id {
        return Err(TransportError::InvalidFrame {
            id: expected_id,
            reason: format!("id mismatch: expected {}, got {}", expected_id, id),
        });
    }
    if length < 2 {
        return Err(TransportError::InvalidFrame {
            id,
            reason: format!("length {} too short", length),
        });
    }

    // Remaining bytes: status + params + checksum
    let mut remaining = vec![0u8; length];
    bus.port.read_exact(&mut remaining)?;

    let mut checksum_data = vec![id, length as u8];
    checksum_data.extend_from_slice(&remaining[..remaining.len() - 1]);
    let expected_checksum = checksum(&checksum_data);
    let received_checksum = remaining[remaining.len() - 1];

    if expected_checksum != received_checksum {
        return Err(TransportError::ChecksumMismatch { id });
    }

    let status = remaining[0];
    if status != 0 {
        return Err(TransportError::DeviceFault { id, status });
    }

    Ok(remaining[1..remaining.len() - 1].to_vec())
}

/// Encode a signed duty value to sign-magnitude format.
/// Bit 15 = sign (1 = negative), bits 0-14 = magnitude.
fn encode_sign_magnitude(value: i16) -> u16 {
    if value >= 0 {
        value as u16
    } else {
        0x8000 | (-(value as i32) as u16)
    }
}

fn params_to_i32(id: u8, params: &[u8]) -> Result<i32> {
    let bytes: [u8; 4] = params.try_into().map_err(|_| TransportError::InvalidFrame {
        id,
        reason: format!("expected 4 bytes, got {}", params.len()),
    })?;
    Ok(i32::from_le_bytes(bytes))
}

/// Handle for one motor port on the shared bus
pub struct SerialMotorPort {
    bus: Arc<Mutex<BusInner>>,
    id: u8,
}

impl SerialMotorPort {
    fn transact(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        transact(&mut bus, self.id, opcode, params)
    }
}

impl MotorPort for SerialMotorPort {
    fn read_encoder_count(&mut self) -> Result<i32> {
        let params = self.transact(Opcode::ReadCount, &[])?;
        params_to_i32(self.id, &params)
    }

    fn read_encoder_rate(&mut self) -> Result<i32> {
        let params = self.transact(Opcode::ReadRate, &[])?;
        params_to_i32(self.id, &params)
    }

    fn write_duty(&mut self, steps: i16) -> Result<()> {
        let raw = encode_sign_magnitude(steps);
        self.transact(Opcode::WriteDuty, &raw.to_le_bytes())?;
        Ok(())
    }

    fn set_passive_mode(&mut self, mode: PassiveMode) -> Result<()> {
        let param = match mode {
            PassiveMode::Coast => 0u8,
            PassiveMode::Brake => 1u8,
        };
        self.transact(Opcode::SetPassive, &[param])?;
        Ok(())
    }
}

/// Handle for the ADC/sense block on the shared bus
pub struct SerialAdc {
    bus: Arc<Mutex<BusInner>>,
}

impl SerialAdc {
    fn transact(&mut self, opcode: Opcode, params: &[u8]) -> Result<Vec<u8>> {
        let mut bus = self.bus.lock().unwrap_or_else(|e| e.into_inner());
        transact(&mut bus, SENSE_DEVICE_ID, opcode, params)
    }
}

impl AdcReader for SerialAdc {
    fn read_channel(&mut self, channel: u8) -> Result<u16> {
        let params = self.transact(Opcode::ReadAdc, &[channel])?;
        if params.len() < 2 {
            return Err(TransportError::InvalidFrame {
                id: SENSE_DEVICE_ID,
                reason: format!("expected 2 bytes, got {}", params.len()),
            });
        }
        Ok(u16::from_le_bytes([params[0], params[1]]))
    }

    fn read_type_pin(&mut self) -> Result<bool> {
        let params = self.transact(Opcode::ReadTypePin, &[])?;
        Ok(params.first().copied().unwrap_or(0) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checksum() {
        // ID=1, Length=4, Opcode=WriteDuty, two param bytes
        let data = [1u8, 4, 0x20, 0x10, 0x27];
        // ~(1+4+0x20+0x10+0x27) = ~0x5C = 0xA3
        assert_eq!(checksum(&data), 0xA3);
    }

    #[test]
    fn test_build_frame() {
        let frame = build_frame(2, Opcode::Probe, &[]);
        // Header (2) + ID (1) + Length (1) + Opcode (1) + Checksum (1)
        assert_eq!(frame.len(), 6);
        assert_eq!(frame[0], 0xFF);
        assert_eq!(frame[1], 0xFD);
        assert_eq!(frame[2], 2); // ID
        assert_eq!(frame[3], 2); // opcode + checksum
        assert_eq!(frame[4], 0x01); // Probe
        assert_eq!(frame[5], checksum(&frame[2..5]));
    }

    #[test]
    fn test_sign_magnitude_encoding() {
        assert_eq!(encode_sign_magnitude(0), 0);
        assert_eq!(encode_sign_magnitude(100), 100);
        assert_eq!(encode_sign_magnitude(-100), 0x8064);
        assert_eq!(encode_sign_magnitude(-1), 0x8001);
        assert_eq!(encode_sign_magnitude(-10_000), 0x8000 | 10_000);
    }

    #[test]
    fn test_params_to_i32() {
        assert_eq!(params_to_i32(0, &(-360i32).to_le_bytes()).unwrap(), -360);
        assert!(params_to_i32(0, &[1, 2]).is_err());
    }
}
