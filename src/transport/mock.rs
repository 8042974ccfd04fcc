// In-memory transport for tests and simulated runs
//
// `MockMotor` exposes the same `MotorPort` surface as the serial bus, records
// every write, and optionally integrates an ideal plant (rate proportional to
// duty) so closed-loop code can be exercised without hardware.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::config::DUTY_STEPS;

use super::{AdcReader, MotorPort, PassiveMode, Result, TransportError};

/// Free-running rate of the simulated motor at full duty, in counts/s
pub const MOCK_FREE_RATE: f64 = 1000.0;

#[derive(Debug, Default)]
struct MockMotorState {
    position: f64, // counts, fractional
    rate: i32,     // counts/s
    duty: i16,     // last raw duty written
    passive: Option<PassiveMode>,
    duty_writes: Vec<i16>,
    fail_writes: bool,
    fail_reads: bool,
    simulate: bool,
}

/// Shared-state mock motor; clone it to keep a test-side handle while the
/// port handle is owned by the actuator driver.
#[derive(Clone, Default)]
pub struct MockMotor {
    state: Arc<Mutex<MockMotorState>>,
}

impl MockMotor {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mock that behaves as an ideal plant when `advance` is called
    pub fn simulated() -> Self {
        let mock = Self::new();
        mock.lock().simulate = true;
        mock
    }

    /// Port handle to hand to an actuator driver
    pub fn port(&self) -> MockMotorPort {
        MockMotorPort {
            state: self.state.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockMotorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_count(&self, count: i32) {
        self.lock().position = count as f64;
    }

    pub fn set_rate(&self, rate: i32) {
        self.lock().rate = rate;
    }

    pub fn count(&self) -> i32 {
        self.lock().position.round() as i32
    }

    pub fn rate(&self) -> i32 {
        self.lock().rate
    }

    pub fn last_duty(&self) -> i16 {
        self.lock().duty
    }

    pub fn duty_writes(&self) -> Vec<i16> {
        self.lock().duty_writes.clone()
    }

    pub fn passive_mode(&self) -> Option<PassiveMode> {
        self.lock().passive
    }

    pub fn fail_writes(&self, fail: bool) {
        self.lock().fail_writes = fail;
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }

    /// Step the ideal plant: rate follows duty linearly, position integrates.
    pub fn advance(&self, dt: Duration) {
        let mut state = self.lock();
        if !state.simulate {
            return;
        }
        state.rate = if state.passive.is_some() {
            0
        } else {
            (state.duty as f64 * MOCK_FREE_RATE / DUTY_STEPS as f64).round() as i32
        };
        state.position += state.rate as f64 * dt.as_secs_f64();
    }
}

/// `MotorPort` handle backed by a `MockMotor`
pub struct MockMotorPort {
    state: Arc<Mutex<MockMotorState>>,
}

impl MockMotorPort {
    fn lock(&self) -> MutexGuard<'_, MockMotorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl MotorPort for MockMotorPort {
    fn read_encoder_count(&mut self) -> Result<i32> {
        let state = self.lock();
        if state.fail_reads {
            return Err(TransportError::Timeout { id: 0 });
        }
        Ok(state.position.round() as i32)
    }

    fn read_encoder_rate(&mut self) -> Result<i32> {
        let state = self.lock();
        if state.fail_reads {
            return Err(TransportError::Timeout { id: 0 });
        }
        Ok(state.rate)
    }

    fn write_duty(&mut self, steps: i16) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(TransportError::Timeout { id: 0 });
        }
        state.duty = steps;
        state.passive = None;
        state.duty_writes.push(steps);
        Ok(())
    }

    fn set_passive_mode(&mut self, mode: PassiveMode) -> Result<()> {
        let mut state = self.lock();
        if state.fail_writes {
            return Err(TransportError::Timeout { id: 0 });
        }
        state.duty = 0;
        state.passive = Some(mode);
        Ok(())
    }
}

/// Mock ADC with settable channels and battery type pin
#[derive(Clone)]
pub struct MockAdc {
    state: Arc<Mutex<MockAdcState>>,
}

struct MockAdcState {
    channels: Vec<u16>,
    type_pin: bool,
    fail_reads: bool,
}

impl MockAdc {
    pub fn new(channels: &[u16], type_pin: bool) -> Self {
        Self {
            state: Arc::new(Mutex::new(MockAdcState {
                channels: channels.to_vec(),
                type_pin,
                fail_reads: false,
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, MockAdcState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn set_channel(&self, channel: u8, raw: u16) {
        let mut state = self.lock();
        let idx = channel as usize;
        if idx < state.channels.len() {
            state.channels[idx] = raw;
        }
    }

    pub fn fail_reads(&self, fail: bool) {
        self.lock().fail_reads = fail;
    }
}

impl AdcReader for MockAdc {
    fn read_channel(&mut self, channel: u8) -> Result<u16> {
        let state = self.lock();
        if state.fail_reads {
            return Err(TransportError::Timeout { id: 0 });
        }
        state
            .channels
            .get(channel as usize)
            .copied()
            .ok_or(TransportError::Timeout { id: 0 })
    }

    fn read_type_pin(&mut self) -> Result<bool> {
        Ok(self.lock().type_pin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plant_tracks_duty() {
        let mock = MockMotor::simulated();
        let mut port = mock.port();

        port.write_duty(DUTY_STEPS as i16).unwrap();
        mock.advance(Duration::from_secs(1));

        assert_eq!(mock.rate(), MOCK_FREE_RATE as i32);
        assert_eq!(mock.count(), MOCK_FREE_RATE as i32);
    }

    #[test]
    fn test_passive_stops_plant() {
        let mock = MockMotor::simulated();
        let mut port = mock.port();

        port.write_duty(5000).unwrap();
        mock.advance(Duration::from_millis(500));
        port.set_passive_mode(PassiveMode::Coast).unwrap();
        let before = mock.count();
        mock.advance(Duration::from_millis(500));

        assert_eq!(mock.rate(), 0);
        assert_eq!(mock.count(), before);
    }

    #[test]
    fn test_scripted_write_failure() {
        let mock = MockMotor::new();
        let mut port = mock.port();

        mock.fail_writes(true);
        assert!(port.write_duty(100).is_err());
        mock.fail_writes(false);
        assert!(port.write_duty(100).is_ok());
        assert_eq!(mock.duty_writes(), vec![100]);
    }
}
