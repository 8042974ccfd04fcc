// Port-indexed registry of attached motors and bound drivebases
//
// Lookups return fallible handles: a detached port is a typed outcome, not a
// stale slot reference. The scheduler fans its tick out through here.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use serde::Serialize;
use tracing::{info, warn};

use crate::battery::BatteryState;
use crate::config::MAX_MOTOR_PORTS;
use crate::error::{HubError, Result};
use crate::motor::drivebase::Drivebase;
use crate::motor::hbridge::Direction;
use crate::motor::servo::Servo;
use crate::transport::{MotorPort, PassiveMode};

/// Validated identifier of one physical motor port (A..F)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PortId(u8);

impl PortId {
    pub fn new(index: u8) -> Result<Self> {
        if index < MAX_MOTOR_PORTS {
            Ok(Self(index))
        } else {
            Err(HubError::InvalidPort(index))
        }
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", (b'A' + self.0) as char)
    }
}

impl FromStr for PortId {
    type Err = HubError;

    fn from_str(s: &str) -> Result<Self> {
        let bytes = s.as_bytes();
        match bytes {
            [c @ b'A'..=b'Z'] => Self::new(c - b'A'),
            [c @ b'a'..=b'z'] => Self::new(c - b'a'),
            _ => s
                .parse::<u8>()
                .map_err(|_| HubError::InvalidArgument(format!("unrecognized port '{}'", s)))
                .and_then(Self::new),
        }
    }
}

impl Serialize for PortId {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

/// Owner of every attached motor and active drivebase
pub struct Hub {
    slots: RwLock<Vec<Option<Arc<Servo>>>>,
    drivebases: RwLock<Vec<Arc<Drivebase>>>,
}

impl Default for Hub {
    fn default() -> Self {
        Self {
            slots: RwLock::new(vec![None; MAX_MOTOR_PORTS as usize]),
            drivebases: RwLock::new(Vec::new()),
        }
    }
}

impl Hub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a motor on `port`, coasted. Replaces any previous attachment.
    pub fn attach_motor(
        &self,
        port: PortId,
        transport: Box<dyn MotorPort>,
        direction: Direction,
        gear_ratio: f32,
    ) -> Result<Arc<Servo>> {
        let servo = Servo::attach(port, transport, direction, gear_ratio)?;
        let previous = {
            let mut slots = self.slots_mut();
            slots[port.index()].replace(servo.clone())
        };
        if let Some(previous) = previous {
            warn!("port {}: replacing an attached motor", port);
            self.unbind_drivebase_of(&previous);
            previous.halt(PassiveMode::Coast);
        }
        Ok(servo)
    }

    /// Detach the motor on `port`, driving it to coast first.
    pub fn detach_motor(&self, port: PortId) -> Result<()> {
        let servo = {
            let mut slots = self.slots_mut();
            slots[port.index()].take()
        }
        .ok_or(HubError::NotAttached(port))?;

        self.unbind_drivebase_of(&servo);
        servo.halt(PassiveMode::Coast);
        info!("port {}: motor detached", port);
        Ok(())
    }

    /// Fallible handle to the motor on `port`
    pub fn motor(&self, port: PortId) -> Result<Arc<Servo>> {
        self.slots()[port.index()]
            .clone()
            .ok_or(HubError::NotAttached(port))
    }

    /// Bind two attached motors as a drivebase, claiming both.
    pub fn attach_drivebase(
        &self,
        left: PortId,
        right: PortId,
        wheel_diameter_mm: f32,
        axle_track_mm: f32,
    ) -> Result<Arc<Drivebase>> {
        let left = self.motor(left)?;
        let right = self.motor(right)?;
        let drivebase = Drivebase::new(left, right, wheel_diameter_mm, axle_track_mm)?;
        self.drivebases_mut().push(drivebase.clone());
        Ok(drivebase)
    }

    /// Unbind a drivebase and return its wheels to independent control
    pub fn release_drivebase(&self, drivebase: &Arc<Drivebase>) -> Result<()> {
        let mut drivebases = self.drivebases_mut();
        let before = drivebases.len();
        drivebases.retain(|d| !Arc::ptr_eq(d, drivebase));
        if drivebases.len() == before {
            return Err(HubError::InvalidArgument(
                "drivebase is not bound to this hub".to_string(),
            ));
        }
        drop(drivebases);
        drivebase.release_wheels();
        Ok(())
    }

    /// One scheduler tick: active drivebases first, then every servo not
    /// owned by one.
    pub(crate) fn tick(&self, now: Instant, battery: &BatteryState) {
        for drivebase in self.drivebases().iter() {
            drivebase.tick(now, battery);
        }
        for servo in self.slots().iter().flatten() {
            servo.tick(now, battery);
        }
    }

    /// Force every attached actuator into a passive mode; used at teardown.
    pub fn stop_all(&self, mode: PassiveMode) {
        for servo in self.slots().iter().flatten() {
            servo.halt(mode);
        }
        info!("all motors stopped");
    }

    fn unbind_drivebase_of(&self, servo: &Arc<Servo>) {
        let bound = {
            let mut drivebases = self.drivebases_mut();
            let mut bound = None;
            drivebases.retain(|d| {
                let (left, right) = d.wheels();
                if Arc::ptr_eq(left, servo) || Arc::ptr_eq(right, servo) {
                    bound = Some(d.clone());
                    false
                } else {
                    true
                }
            });
            bound
        };
        if let Some(drivebase) = bound {
            warn!("port {}: releasing the drivebase it was bound to", servo.port_id());
            drivebase.release_wheels();
        }
    }

    fn slots(&self) -> RwLockReadGuard<'_, Vec<Option<Arc<Servo>>>> {
        self.slots.read().unwrap_or_else(|e| e.into_inner())
    }

    fn slots_mut(&self) -> RwLockWriteGuard<'_, Vec<Option<Arc<Servo>>>> {
        self.slots.write().unwrap_or_else(|e| e.into_inner())
    }

    fn drivebases(&self) -> RwLockReadGuard<'_, Vec<Arc<Drivebase>>> {
        self.drivebases.read().unwrap_or_else(|e| e.into_inner())
    }

    fn drivebases_mut(&self) -> RwLockWriteGuard<'_, Vec<Arc<Drivebase>>> {
        self.drivebases.write().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::motor::servo::StopAction;
    use crate::transport::MockMotor;

    #[test]
    fn test_port_id_validation() {
        assert!(PortId::new(0).is_ok());
        assert!(PortId::new(MAX_MOTOR_PORTS - 1).is_ok());
        assert!(matches!(
            PortId::new(MAX_MOTOR_PORTS),
            Err(HubError::InvalidPort(_))
        ));
    }

    #[test]
    fn test_port_id_parses_letters_and_digits() {
        assert_eq!("A".parse::<PortId>().unwrap(), PortId(0));
        assert_eq!("f".parse::<PortId>().unwrap(), PortId(5));
        assert_eq!("2".parse::<PortId>().unwrap(), PortId(2));
        assert!("G".parse::<PortId>().is_err());
        assert!("AB".parse::<PortId>().is_err());
        assert_eq!(PortId(1).to_string(), "B");
    }

    #[test]
    fn test_lookup_of_detached_port_is_typed() {
        let hub = Hub::new();
        let port = PortId::new(3).unwrap();
        assert!(matches!(hub.motor(port), Err(HubError::NotAttached(_))));
    }

    #[test]
    fn test_attach_coasts_and_registers() {
        let hub = Hub::new();
        let port = PortId::new(0).unwrap();
        let mock = MockMotor::new();

        hub.attach_motor(port, Box::new(mock.port()), Direction::Clockwise, 1.0)
            .unwrap();

        assert_eq!(mock.passive_mode(), Some(PassiveMode::Coast));
        assert!(hub.motor(port).is_ok());
    }

    #[test]
    fn test_detach_coasts_and_clears_slot() {
        let hub = Hub::new();
        let port = PortId::new(0).unwrap();
        let mock = MockMotor::new();

        let servo = hub
            .attach_motor(port, Box::new(mock.port()), Direction::Clockwise, 1.0)
            .unwrap();
        servo.dc(50.0).unwrap();

        hub.detach_motor(port).unwrap();
        assert_eq!(mock.passive_mode(), Some(PassiveMode::Coast));
        assert!(matches!(hub.motor(port), Err(HubError::NotAttached(_))));
        assert!(matches!(hub.detach_motor(port), Err(HubError::NotAttached(_))));
    }

    #[test]
    fn test_detach_releases_bound_drivebase() {
        let hub = Hub::new();
        let left_port = PortId::new(0).unwrap();
        let right_port = PortId::new(1).unwrap();
        let left_mock = MockMotor::new();
        let right_mock = MockMotor::new();

        hub.attach_motor(left_port, Box::new(left_mock.port()), Direction::Clockwise, 1.0)
            .unwrap();
        hub.attach_motor(
            right_port,
            Box::new(right_mock.port()),
            Direction::Counterclockwise,
            1.0,
        )
        .unwrap();
        hub.attach_drivebase(left_port, right_port, 56.0, 120.0).unwrap();

        let right = hub.motor(right_port).unwrap();
        assert!(right.run(100.0).is_err());

        hub.detach_motor(left_port).unwrap();
        // The partner wheel is commandable again
        assert!(right.run(100.0).is_ok());
    }

    #[test]
    fn test_release_drivebase_restores_direct_control() {
        let hub = Hub::new();
        let left_port = PortId::new(0).unwrap();
        let right_port = PortId::new(1).unwrap();

        hub.attach_motor(
            left_port,
            Box::new(MockMotor::new().port()),
            Direction::Clockwise,
            1.0,
        )
        .unwrap();
        hub.attach_motor(
            right_port,
            Box::new(MockMotor::new().port()),
            Direction::Clockwise,
            1.0,
        )
        .unwrap();

        let drivebase = hub.attach_drivebase(left_port, right_port, 56.0, 120.0).unwrap();
        let left = hub.motor(left_port).unwrap();
        assert!(matches!(
            left.run_target(200.0, 90.0, StopAction::Coast),
            Err(HubError::InvalidArgument(_))
        ));

        hub.release_drivebase(&drivebase).unwrap();
        assert!(left.run_target(200.0, 90.0, StopAction::Coast).is_ok());
        // Releasing twice is an error
        assert!(hub.release_drivebase(&drivebase).is_err());
    }

    #[test]
    fn test_stop_all_parks_every_motor() {
        let hub = Hub::new();
        let mocks: Vec<MockMotor> = (0..3).map(|_| MockMotor::new()).collect();
        for (i, mock) in mocks.iter().enumerate() {
            let servo = hub
                .attach_motor(
                    PortId::new(i as u8).unwrap(),
                    Box::new(mock.port()),
                    Direction::Clockwise,
                    1.0,
                )
                .unwrap();
            servo.dc(30.0).unwrap();
        }

        hub.stop_all(PassiveMode::Coast);
        for mock in &mocks {
            assert_eq!(mock.passive_mode(), Some(PassiveMode::Coast));
        }
    }
}
